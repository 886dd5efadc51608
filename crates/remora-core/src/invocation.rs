//! Invocation model: the tagged request variants exchanged between a client
//! invoker and a server invoker, and the typed response.
//!
//! Control traffic (lease pings, disconnects, listener management, polling)
//! travels as explicit [`InvocationKind`] variants, never inferred from the
//! payload content.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

use crate::callback::Callback;
use crate::locator::InvokerLocator;

/// Application payload carried by an invocation.
pub type Payload = serde_json::Value;

/// Mutable string metadata attached to requests and responses.
pub type Metadata = BTreeMap<String, String>;

/// One request from a client invoker to a server invoker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    /// Logical client session that issued the request.
    pub session_id: String,
    /// Target subsystem; `None` selects the sole registered handler.
    pub subsystem: Option<String>,
    /// What the request asks the server to do.
    pub kind: InvocationKind,
    /// Request metadata (per-call overrides, handler scratch space).
    #[serde(default)]
    pub request_metadata: Metadata,
}

impl InvocationRequest {
    /// Build an application invocation.
    pub fn invoke(session_id: impl Into<String>, subsystem: Option<String>, payload: Payload) -> Self {
        Self::new(session_id, subsystem, InvocationKind::Invoke { payload })
    }

    /// Build a request of any kind with empty metadata.
    pub fn new(session_id: impl Into<String>, subsystem: Option<String>, kind: InvocationKind) -> Self {
        Self {
            session_id: session_id.into(),
            subsystem,
            kind,
            request_metadata: Metadata::new(),
        }
    }

    /// Attach request metadata.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.request_metadata = metadata;
        self
    }

    /// Short label of the request kind for logs and timeout errors.
    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Tagged request variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InvocationKind {
    /// Application call routed to a subsystem handler.
    Invoke {
        /// Application payload.
        payload: Payload,
    },
    /// Batched lease refresh for every logical client behind one connection.
    LeasePing {
        /// Logical clients and the period each pings at.
        clients: Vec<LeaseEntry>,
    },
    /// Explicit disconnect of one logical client.
    Disconnect {
        /// Session whose lease ends.
        session_id: String,
    },
    /// Register a callback listener for the requesting session.
    AddListener {
        /// Client-generated listener id.
        listener_id: String,
        /// Where push callbacks are delivered; `None` for pull mode.
        callback_locator: Option<InvokerLocator>,
        /// Push (`true`) or pull (`false`) delivery.
        push: bool,
    },
    /// Remove a callback listener.
    RemoveListener {
        /// Listener to remove.
        listener_id: String,
    },
    /// Drain queued pull-mode callbacks.
    PollCallbacks {
        /// Listener whose queue is drained.
        listener_id: String,
    },
    /// Server to client delivery over the secondary connection.
    PushCallback {
        /// Target listener on the client.
        listener_id: String,
        /// The callback.
        callback: Callback,
    },
}

impl InvocationKind {
    /// Short label of the variant.
    pub fn name(&self) -> &'static str {
        match self {
            InvocationKind::Invoke { .. } => "invoke",
            InvocationKind::LeasePing { .. } => "lease ping",
            InvocationKind::Disconnect { .. } => "disconnect",
            InvocationKind::AddListener { .. } => "add listener",
            InvocationKind::RemoveListener { .. } => "remove listener",
            InvocationKind::PollCallbacks { .. } => "poll callbacks",
            InvocationKind::PushCallback { .. } => "push callback",
        }
    }
}

/// A logical client refreshed by a lease ping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseEntry {
    /// Logical client session id.
    pub session_id: String,
    /// Period the client pings at, in milliseconds.
    pub period_ms: u64,
}

/// Server answer to a lease ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseAck {
    /// Whether the server tracks leases at all.
    pub leasing_enabled: bool,
    /// Lease period the server advertises, in milliseconds.
    pub lease_period_ms: u64,
}

/// One server response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationResponse {
    /// Handler result or typed remote failure.
    pub result: Result<Payload, RemoteError>,
    /// Metadata the handler chose to return.
    #[serde(default)]
    pub return_metadata: Metadata,
}

impl InvocationResponse {
    /// Successful response.
    pub fn ok(payload: Payload) -> Self {
        Self {
            result: Ok(payload),
            return_metadata: Metadata::new(),
        }
    }

    /// Failed response.
    pub fn err(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            result: Err(RemoteError {
                kind,
                message: message.into(),
            }),
            return_metadata: Metadata::new(),
        }
    }

    /// Attach return metadata.
    pub fn with_return_metadata(mut self, metadata: Metadata) -> Self {
        self.return_metadata = metadata;
        self
    }
}

/// Failure reported by the server side of an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Classification.
    pub kind: RemoteErrorKind,
    /// Human readable message.
    pub message: String,
}

/// Classification of a [`RemoteError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// The handler returned an error.
    HandlerFailed,
    /// The handler panicked.
    HandlerPanicked,
    /// No handler is registered for the requested subsystem.
    NoHandler,
    /// Several handlers are registered and the request named none.
    AmbiguousSubsystem,
    /// The listener id is not registered.
    UnknownListener,
    /// The server refused the request (stopped, bad callback locator, ...).
    Rejected,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RemoteErrorKind::HandlerFailed => "handler failed",
            RemoteErrorKind::HandlerPanicked => "handler panicked",
            RemoteErrorKind::NoHandler => "no handler",
            RemoteErrorKind::AmbiguousSubsystem => "ambiguous subsystem",
            RemoteErrorKind::UnknownListener => "unknown listener",
            RemoteErrorKind::Rejected => "rejected",
        };
        f.write_str(label)
    }
}

/// Callback handed to a client's dispatcher by a push delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushedCallback {
    /// Target listener on the client.
    pub listener_id: String,
    /// The callback.
    pub callback: Callback,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_kind_is_tagged_on_the_wire() {
        let ping = InvocationRequest::new(
            "$invoker$",
            None,
            InvocationKind::LeasePing {
                clients: vec![LeaseEntry {
                    session_id: "a".to_string(),
                    period_ms: 3000,
                }],
            },
        );
        let encoded = serde_json::to_value(&ping).unwrap();
        assert_eq!(encoded["kind"]["type"], json!("lease_ping"));
        assert_eq!(encoded["kind"]["clients"][0]["period_ms"], json!(3000));

        let invoke = InvocationRequest::invoke("s", Some("echo".to_string()), json!("ping"));
        let encoded = serde_json::to_value(&invoke).unwrap();
        assert_eq!(encoded["kind"]["type"], json!("invoke"));
        assert_eq!(encoded["kind"]["payload"], json!("ping"));
    }

    #[test]
    fn test_missing_metadata_defaults_to_empty() {
        let raw = json!({
            "session_id": "s",
            "subsystem": null,
            "kind": {"type": "poll_callbacks", "listener_id": "l"},
        });
        let request: InvocationRequest = serde_json::from_value(raw).unwrap();
        assert!(request.request_metadata.is_empty());
        assert_eq!(request.kind_name(), "poll callbacks");
    }

    #[test]
    fn test_error_response_carries_kind() {
        let response = InvocationResponse::err(RemoteErrorKind::NoHandler, "no handler for 'x'");
        let err = response.result.unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::NoHandler);
        assert_eq!(err.kind.to_string(), "no handler");
    }
}
