//! Pluggable marshalling of invocation frames.

use bytes::Bytes;

use crate::error::Result;
use crate::invocation::InvocationRequest;
use crate::invocation::InvocationResponse;

/// Encodes requests and responses to transport frames.
pub trait Codec: Send + Sync + 'static {
    /// Codec name for logging.
    fn name(&self) -> &'static str;

    /// Encode a request.
    fn encode_request(&self, request: &InvocationRequest) -> Result<Bytes>;

    /// Decode a request.
    fn decode_request(&self, frame: &[u8]) -> Result<InvocationRequest>;

    /// Encode a response.
    fn encode_response(&self, response: &InvocationResponse) -> Result<Bytes>;

    /// Decode a response.
    fn decode_response(&self, frame: &[u8]) -> Result<InvocationResponse>;
}

/// JSON frames via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode_request(&self, request: &InvocationRequest) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(request)?))
    }

    fn decode_request(&self, frame: &[u8]) -> Result<InvocationRequest> {
        Ok(serde_json::from_slice(frame)?)
    }

    fn encode_response(&self, response: &InvocationResponse) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(response)?))
    }

    fn decode_response(&self, frame: &[u8]) -> Result<InvocationResponse> {
        Ok(serde_json::from_slice(frame)?)
    }
}
