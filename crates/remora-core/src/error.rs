//! Error types shared by every remora crate.
//!
//! The taxonomy separates connection failures, timeouts, remote handler
//! failures and configuration problems so callers can react to each
//! class differently. Lease expiry is not an error: it is delivered to
//! `ConnectionListener`s instead.

use snafu::Snafu;

use crate::invocation::RemoteErrorKind;

/// Result alias used throughout remora.
pub type Result<T, E = RemotingError> = std::result::Result<T, E>;

/// Errors raised by a transport connection provider.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
    /// Nothing is listening at the address (connection refused).
    #[snafu(display("no endpoint listening at {address}"))]
    Unreachable {
        /// Address that refused the connection.
        address: String,
    },

    /// The connection was closed by either side.
    #[snafu(display("connection to {address} closed"))]
    Closed {
        /// Address of the closed connection.
        address: String,
    },

    /// Another endpoint is already bound to the address.
    #[snafu(display("address {address} already bound"))]
    AddressInUse {
        /// Contested address.
        address: String,
    },

    /// The endpoint could not produce a response frame.
    #[snafu(display("endpoint at {address} rejected the frame: {reason}"))]
    Rejected {
        /// Address of the rejecting endpoint.
        address: String,
        /// Why no response was produced.
        reason: String,
    },
}

/// Configuration value errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// A configuration value could not be parsed or is out of range.
    #[snafu(display("invalid configuration for {key}: '{value}' ({reason})"))]
    InvalidValue {
        /// Configuration key.
        key: String,
        /// Offending raw value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A TOML configuration document could not be parsed.
    #[snafu(display("failed to parse configuration: {source}"))]
    Parse {
        /// The underlying error.
        source: toml::de::Error,
    },
}

/// Errors surfaced to callers of the remoting API.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum RemotingError {
    /// A transport connection could not be established or was lost.
    #[snafu(display("connection to {locator} failed: {source}"))]
    ConnectionFailed {
        /// Locator URI of the remote endpoint.
        locator: String,
        /// The transport failure.
        source: TransportError,
    },

    /// Lease establishment failed while connecting; the client stays disconnected.
    #[snafu(display("lease setup with {locator} failed: {source}"))]
    LeaseSetupFailed {
        /// Locator URI of the remote endpoint.
        locator: String,
        /// What went wrong during the initial lease ping.
        source: Box<RemotingError>,
    },

    /// An operation did not complete within its timeout.
    #[snafu(display("{operation} timed out after {timeout_ms}ms"))]
    Timeout {
        /// Description of the operation.
        operation: String,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The remote side reported a failure (handler error, missing handler, ...).
    #[snafu(display("remote {kind}: {message}"))]
    Remote {
        /// Classification of the remote failure.
        kind: RemoteErrorKind,
        /// Message produced by the server.
        message: String,
    },

    /// Operation requires a connected client or a started server.
    #[snafu(display("not connected: {reason}"))]
    NotConnected {
        /// Why the operation was refused.
        reason: String,
    },

    /// Conflicting or unusable configuration (duplicate binding, missing locator, ...).
    #[snafu(display("configuration error: {reason}"))]
    Configuration {
        /// What is wrong.
        reason: String,
    },

    /// A configuration value could not be resolved.
    #[snafu(display("{source}"))]
    InvalidConfig {
        /// The underlying error.
        source: ConfigError,
    },

    /// A locator URI could not be parsed.
    #[snafu(display("invalid locator '{input}': {reason}"))]
    InvalidLocator {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// No connection provider is registered for the locator's transport.
    #[snafu(display("no transport registered for '{transport}'"))]
    UnknownTransport {
        /// Transport name from the locator.
        transport: String,
    },

    /// Encoding or decoding a frame failed.
    #[snafu(display("codec error: {source}"))]
    Codec {
        /// The underlying error.
        source: serde_json::Error,
    },
}

impl RemotingError {
    /// Returns true for failures to establish or keep a connection.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            RemotingError::ConnectionFailed { .. }
                | RemotingError::LeaseSetupFailed { .. }
                | RemotingError::NotConnected { .. }
        )
    }

    /// Returns true if the operation timed out.
    pub fn is_timeout(&self) -> bool {
        matches!(self, RemotingError::Timeout { .. })
    }

    /// Returns the remote failure classification, if this error came from the server.
    pub fn remote_kind(&self) -> Option<RemoteErrorKind> {
        match self {
            RemotingError::Remote { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<ConfigError> for RemotingError {
    fn from(source: ConfigError) -> Self {
        RemotingError::InvalidConfig { source }
    }
}

impl From<serde_json::Error> for RemotingError {
    fn from(source: serde_json::Error) -> Self {
        RemotingError::Codec { source }
    }
}
