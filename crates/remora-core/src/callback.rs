//! Callbacks delivered from a server to a client-side handler.

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::invocation::Metadata;
use crate::invocation::Payload;

/// Metadata key set on the handshake callback a push-mode server handler
/// sends right after it is created.
pub const HANDSHAKE_METADATA_KEY: &str = "remora.handshake";

/// One asynchronous notification from a server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Callback {
    /// Application payload.
    pub payload: Payload,
    /// Metadata attached by the server.
    #[serde(default)]
    pub metadata: Metadata,
    /// True for the handshake sent when a push-mode handler is created.
    #[serde(default)]
    pub handshake: bool,
}

impl Callback {
    /// Application callback with no metadata.
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            metadata: Metadata::new(),
            handshake: false,
        }
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Handshake callback for a freshly created push-mode handler.
    pub fn handshake(listener_id: &str) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert(HANDSHAKE_METADATA_KEY.to_string(), listener_id.to_string());
        Self {
            payload: Payload::Null,
            metadata,
            handshake: true,
        }
    }
}

/// Client-side receiver of callbacks.
#[async_trait]
pub trait InvokerCallbackHandler: Send + Sync {
    /// Handle one callback. Errors are logged by the delivering side.
    async fn handle_callback(&self, callback: Callback) -> anyhow::Result<()>;
}
