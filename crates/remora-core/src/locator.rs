//! Invoker locators: `transport://host:port/path?param=value&...`.
//!
//! A locator identifies a server endpoint. Combined with the pooling
//! signature ([`LocatorKey`]) it also identifies a shared client invoker:
//! two locators with the same transport, host, port and path share one
//! invoker unless `useAllParams=true` asks for parameters to count too.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

use crate::error::RemotingError;
use crate::error::Result;

/// Address, transport and parameters of a remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvokerLocator {
    transport: String,
    host: String,
    port: u16,
    path: String,
    params: BTreeMap<String, String>,
}

/// Canonical pooling signature of a locator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocatorKey(String);

impl LocatorKey {
    /// The signature as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocatorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl InvokerLocator {
    /// Create a locator without path or parameters.
    pub fn new(transport: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            transport: transport.into(),
            host: host.into(),
            port,
            path: String::new(),
            params: BTreeMap::new(),
        }
    }

    /// Parse a locator URI.
    ///
    /// # Errors
    ///
    /// Returns `InvalidLocator` if the transport, host or port is missing or
    /// malformed, or a query parameter has an empty name.
    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = |reason: &str| RemotingError::InvalidLocator {
            input: uri.to_string(),
            reason: reason.to_string(),
        };

        let (transport, rest) = uri.split_once("://").ok_or_else(|| invalid("missing '://'"))?;
        if transport.is_empty() {
            return Err(invalid("empty transport"));
        }
        if !transport.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) {
            return Err(invalid("transport contains invalid characters"));
        }

        let (before_query, query) = match rest.split_once('?') {
            Some((head, query)) => (head, Some(query)),
            None => (rest, None),
        };
        let (authority, path) = match before_query.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (before_query, ""),
        };

        let (host, port) = authority.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let port = port.parse::<u16>().map_err(|_| invalid("port is not a number in 0..=65535"))?;

        let mut params = BTreeMap::new();
        if let Some(query) = query {
            for pair in query.split('&').filter(|pair| !pair.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                if key.is_empty() {
                    return Err(invalid("empty parameter name"));
                }
                params.insert(key.to_string(), value.to_string());
            }
        }

        Ok(Self {
            transport: transport.to_ascii_lowercase(),
            host: host.to_string(),
            port,
            path: path.trim_matches('/').to_string(),
            params,
        })
    }

    /// Set the path component.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into().trim_matches('/').to_string();
        self
    }

    /// Add or replace a query parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Transport name (`local`, `socket`, ...).
    pub fn transport(&self) -> &str {
        &self.transport
    }

    /// Host name or address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port number.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Path without leading or trailing slashes (may be empty).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Query parameter value.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// All query parameters.
    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// `host:port`, the address a transport binds or connects to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Locator rendered back to URI form.
    pub fn uri(&self) -> String {
        self.to_string()
    }

    /// Canonical pooling signature.
    ///
    /// Transport, host, port and path always participate. Parameters only
    /// participate when `use_all_params` is set.
    pub fn key(&self, use_all_params: bool) -> LocatorKey {
        let mut key = format!(
            "{}://{}:{}/{}",
            self.transport,
            self.host.to_ascii_lowercase(),
            self.port,
            self.path
        );
        if use_all_params && !self.params.is_empty() {
            key.push('?');
            key.push_str(&render_query(&self.params));
        }
        LocatorKey(key)
    }
}

fn render_query(params: &BTreeMap<String, String>) -> String {
    params.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("&")
}

impl fmt::Display for InvokerLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}/{}", self.transport, self.host, self.port, self.path)?;
        if !self.params.is_empty() {
            write!(f, "?{}", render_query(&self.params))?;
        }
        Ok(())
    }
}

impl FromStr for InvokerLocator {
    type Err = RemotingError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
