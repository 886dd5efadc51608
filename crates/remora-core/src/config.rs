//! Configuration: process defaults, per-invoker maps and resolution.
//!
//! Three layers feed every setting:
//!
//! 1. [`RemotingConfig`] - process defaults (TOML document or `REMORA_*`
//!    environment variables).
//! 2. [`Configuration`] - string map passed when a client or connector is
//!    created.
//! 3. Locator query parameters.
//!
//! Locator parameters win over the configuration map, which wins over the
//! process defaults. Per-call metadata may additionally override `timeout`.
//! The callback timeout has its own precedence, see
//! [`crate::verified::resolve_callback_timeout`].

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;

use crate::constants::DEFAULT_CALLBACK_POLL_PERIOD_MS;
use crate::constants::DEFAULT_CALLBACK_STORE_MAX;
use crate::constants::DEFAULT_CONNECT_TIMEOUT_MS;
use crate::constants::DEFAULT_INVOCATION_TIMEOUT_MS;
use crate::constants::DEFAULT_INVOKER_DESTRUCTION_DELAY_MS;
use crate::constants::DEFAULT_LEASE_PERIOD_MS;
use crate::constants::DEFAULT_LEASE_PING_TIMEOUT_MS;
use crate::constants::DEFAULT_MAX_POOL_SIZE;
use crate::constants::DEFAULT_POOL_WAIT_TIMEOUT_MS;
use crate::constants::MAX_CALLBACK_STORE_LIMIT;
use crate::constants::MAX_POOL_SIZE_LIMIT;
use crate::constants::MIN_LEASE_PERIOD_MS;
use crate::error::ConfigError;
use crate::error::ParseSnafu;
use crate::locator::InvokerLocator;

/// Recognised configuration keys (locator parameters and map entries).
pub mod keys {
    /// Per-invocation timeout in milliseconds.
    pub const TIMEOUT: &str = "timeout";
    /// Transport connect timeout in milliseconds.
    pub const CONNECT_TIMEOUT: &str = "connectTimeout";
    /// Push callback invocation timeout in milliseconds.
    pub const CALLBACK_TIMEOUT: &str = "callbackTimeout";
    /// Bound for teardown paths in milliseconds.
    pub const DISCONNECT_TIMEOUT: &str = "disconnectTimeout";
    /// Delay before a released invoker is destroyed, in milliseconds.
    pub const INVOKER_DESTRUCTION_DELAY: &str = "invokerDestructionDelay";
    /// Client lease ping period in milliseconds.
    pub const CLIENT_LEASE_PERIOD: &str = "clientLeasePeriod";
    /// Server lease period in milliseconds.
    pub const LEASE_PERIOD: &str = "leasePeriod";
    /// Request leasing when the client connects.
    pub const ENABLE_LEASE: &str = "enableLease";
    /// Timeout of one lease ping round trip in milliseconds.
    pub const LEASE_PING_TIMEOUT: &str = "leasePingTimeout";
    /// Maximum pooled physical connections per client invoker.
    pub const MAX_POOL_SIZE: &str = "maxPoolSize";
    /// Wait for a pooled connection in milliseconds.
    pub const POOL_WAIT_TIMEOUT: &str = "poolWaitTimeout";
    /// Pull-mode poll period in milliseconds.
    pub const CALLBACK_POLL_PERIOD: &str = "callbackPollPeriod";
    /// Maximum queued pull-mode callbacks per handler.
    pub const CALLBACK_STORE_MAX: &str = "callbackStoreMax";
    /// Include locator parameters in the invoker pooling signature.
    pub const USE_ALL_PARAMS: &str = "useAllParams";
    /// Socket factory class, carried through for transports.
    pub const SOCKET_FACTORY_CLASS_NAME: &str = "socketFactoryClassName";
    /// Pass every socket factory parameter through, carried for transports.
    pub const USE_ALL_SOCKET_FACTORY_PARAMS: &str = "useAllSocketFactoryParams";
}

/// Process-wide defaults for every remoting setting.
///
/// Loaded from a TOML document with [`RemotingConfig::from_toml_str`] or from
/// `REMORA_*` environment variables with [`RemotingConfig::load`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemotingConfig {
    /// Per-invocation timeout.
    pub invocation_timeout_ms: u64,
    /// Transport connect timeout.
    pub connect_timeout_ms: u64,
    /// Bound for teardown paths; `None` keeps the normal timeouts.
    pub disconnect_timeout_ms: Option<u64>,
    /// Delay before a released invoker is destroyed.
    pub invoker_destruction_delay_ms: u64,
    /// Lease period a server advertises once leasing is enabled.
    pub lease_period_ms: u64,
    /// Timeout of one lease ping round trip.
    pub lease_ping_timeout_ms: u64,
    /// Maximum pooled physical connections per client invoker.
    pub max_pool_size: u32,
    /// Wait for a pooled connection.
    pub pool_wait_timeout_ms: u64,
    /// Pull-mode poll period.
    pub callback_poll_period_ms: u64,
    /// Maximum queued pull-mode callbacks per handler.
    pub callback_store_max: u32,
}

impl Default for RemotingConfig {
    fn default() -> Self {
        Self {
            invocation_timeout_ms: DEFAULT_INVOCATION_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            disconnect_timeout_ms: None,
            invoker_destruction_delay_ms: DEFAULT_INVOKER_DESTRUCTION_DELAY_MS,
            lease_period_ms: DEFAULT_LEASE_PERIOD_MS,
            lease_ping_timeout_ms: DEFAULT_LEASE_PING_TIMEOUT_MS,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            pool_wait_timeout_ms: DEFAULT_POOL_WAIT_TIMEOUT_MS,
            callback_poll_period_ms: DEFAULT_CALLBACK_POLL_PERIOD_MS,
            callback_store_max: DEFAULT_CALLBACK_STORE_MAX,
        }
    }
}

impl RemotingConfig {
    /// Load defaults and apply `REMORA_*` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document; missing fields keep their defaults.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input).context(ParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `REMORA_*` environment variables.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        macro_rules! apply_override {
            ($field:ident, $env:literal, $parser:ident) => {
                if let Some(val) = $parser($env)? {
                    self.$field = val;
                }
            };
        }

        apply_override!(invocation_timeout_ms, "REMORA_INVOCATION_TIMEOUT_MS", env_u64);
        apply_override!(connect_timeout_ms, "REMORA_CONNECT_TIMEOUT_MS", env_u64);
        apply_override!(invoker_destruction_delay_ms, "REMORA_INVOKER_DESTRUCTION_DELAY_MS", env_u64);
        apply_override!(lease_period_ms, "REMORA_LEASE_PERIOD_MS", env_u64);
        apply_override!(lease_ping_timeout_ms, "REMORA_LEASE_PING_TIMEOUT_MS", env_u64);
        apply_override!(max_pool_size, "REMORA_MAX_POOL_SIZE", env_u32);
        apply_override!(pool_wait_timeout_ms, "REMORA_POOL_WAIT_TIMEOUT_MS", env_u64);
        apply_override!(callback_poll_period_ms, "REMORA_CALLBACK_POLL_PERIOD_MS", env_u64);
        apply_override!(callback_store_max, "REMORA_CALLBACK_STORE_MAX", env_u32);
        if let Some(val) = env_u64("REMORA_DISCONNECT_TIMEOUT_MS")? {
            self.disconnect_timeout_ms = Some(val);
        }

        Ok(())
    }

    /// Check bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_pool_size(self.max_pool_size)?;
        check_lease_period(keys::LEASE_PERIOD, self.lease_period_ms)?;
        check_store_max(self.callback_store_max)?;
        Ok(())
    }
}

fn env_u64(name: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => parse_u64(name, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

fn env_u32(name: &str) -> Result<Option<u32>, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => parse_u32(name, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_u64(key: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse::<u64>().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_u32(key: &str, raw: &str) -> Result<u32, ConfigError> {
    raw.trim().parse::<u32>().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

fn check_pool_size(value: u32) -> Result<u32, ConfigError> {
    if value == 0 || value > MAX_POOL_SIZE_LIMIT {
        return Err(ConfigError::InvalidValue {
            key: keys::MAX_POOL_SIZE.to_string(),
            value: value.to_string(),
            reason: format!("must be in 1..={MAX_POOL_SIZE_LIMIT}"),
        });
    }
    Ok(value)
}

fn check_lease_period(key: &str, value: u64) -> Result<u64, ConfigError> {
    if value < MIN_LEASE_PERIOD_MS {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: format!("must be at least {MIN_LEASE_PERIOD_MS}ms"),
        });
    }
    Ok(value)
}

fn check_store_max(value: u32) -> Result<u32, ConfigError> {
    if value == 0 || value > MAX_CALLBACK_STORE_LIMIT {
        return Err(ConfigError::InvalidValue {
            key: keys::CALLBACK_STORE_MAX.to_string(),
            value: value.to_string(),
            reason: format!("must be in 1..={MAX_CALLBACK_STORE_LIMIT}"),
        });
    }
    Ok(value)
}

/// String-keyed override map supplied when a client or connector is created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration(BTreeMap<String, String>);

impl Configuration {
    /// Empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.0.insert(key.into(), value.to_string());
        self
    }

    /// Insert or replace a value.
    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) -> Option<String> {
        self.0.insert(key.into(), value.to_string())
    }

    /// Raw value for a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Iterate over entries.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Parse a millisecond value, if present.
    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        self.get(key).map(|raw| parse_u64(key, raw)).transpose()
    }
}

impl From<BTreeMap<String, String>> for Configuration {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

/// Looks a key up in locator parameters first, then the configuration map.
#[derive(Debug, Clone, Copy)]
pub struct SettingSource<'a> {
    locator: &'a InvokerLocator,
    config: &'a Configuration,
}

impl<'a> SettingSource<'a> {
    /// Combine a locator and a configuration map.
    pub fn new(locator: &'a InvokerLocator, config: &'a Configuration) -> Self {
        Self { locator, config }
    }

    /// Raw value by precedence: locator parameter, then configuration map.
    pub fn raw(&self, key: &str) -> Option<&'a str> {
        self.locator.param(key).or_else(|| self.config.get(key))
    }

    /// Millisecond value by precedence, if present.
    pub fn u64(&self, key: &str) -> Result<Option<u64>, ConfigError> {
        self.raw(key).map(|raw| parse_u64(key, raw)).transpose()
    }

    /// Count value by precedence, if present.
    pub fn u32(&self, key: &str) -> Result<Option<u32>, ConfigError> {
        self.raw(key).map(|raw| parse_u32(key, raw)).transpose()
    }

    /// Boolean value by precedence, if present.
    pub fn bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        self.raw(key).map(|raw| parse_bool(key, raw)).transpose()
    }
}

/// Fully resolved settings of one client invoker or server invoker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokerSettings {
    /// Per-invocation timeout.
    pub timeout: Duration,
    /// Transport connect timeout.
    pub connect_timeout: Duration,
    /// Bound for teardown paths; `None` keeps the normal timeouts.
    pub disconnect_timeout: Option<Duration>,
    /// Delay before a released invoker is destroyed.
    pub invoker_destruction_delay: Duration,
    /// Client lease period override; `None` follows the server.
    pub client_lease_period: Option<Duration>,
    /// Server lease period, if explicitly configured.
    pub lease_period: Option<Duration>,
    /// Request leasing on connect.
    pub enable_lease: bool,
    /// Timeout of one lease ping round trip.
    pub lease_ping_timeout: Duration,
    /// Maximum pooled physical connections.
    pub max_pool_size: u32,
    /// Wait for a pooled connection.
    pub pool_wait_timeout: Duration,
    /// Pull-mode poll period.
    pub callback_poll_period: Duration,
    /// Maximum queued pull-mode callbacks per handler.
    pub callback_store_max: u32,
    /// Include locator parameters in the pooling signature.
    pub use_all_params: bool,
}

impl InvokerSettings {
    /// Resolve every setting for `locator` with `config` over `defaults`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` for unparseable or out-of-range values.
    pub fn resolve(
        locator: &InvokerLocator,
        config: &Configuration,
        defaults: &RemotingConfig,
    ) -> Result<Self, ConfigError> {
        let source = SettingSource::new(locator, config);
        let ms = Duration::from_millis;

        let client_lease_period = source
            .u64(keys::CLIENT_LEASE_PERIOD)?
            .map(|v| check_lease_period(keys::CLIENT_LEASE_PERIOD, v))
            .transpose()?
            .map(ms);
        let lease_period =
            source.u64(keys::LEASE_PERIOD)?.map(|v| check_lease_period(keys::LEASE_PERIOD, v)).transpose()?.map(ms);

        Ok(Self {
            timeout: ms(source.u64(keys::TIMEOUT)?.unwrap_or(defaults.invocation_timeout_ms)),
            connect_timeout: ms(source.u64(keys::CONNECT_TIMEOUT)?.unwrap_or(defaults.connect_timeout_ms)),
            disconnect_timeout: source.u64(keys::DISCONNECT_TIMEOUT)?.or(defaults.disconnect_timeout_ms).map(ms),
            invoker_destruction_delay: ms(source
                .u64(keys::INVOKER_DESTRUCTION_DELAY)?
                .unwrap_or(defaults.invoker_destruction_delay_ms)),
            client_lease_period,
            lease_period,
            enable_lease: source.bool(keys::ENABLE_LEASE)?.unwrap_or(false),
            lease_ping_timeout: ms(source.u64(keys::LEASE_PING_TIMEOUT)?.unwrap_or(defaults.lease_ping_timeout_ms)),
            max_pool_size: check_pool_size(source.u32(keys::MAX_POOL_SIZE)?.unwrap_or(defaults.max_pool_size))?,
            pool_wait_timeout: ms(source.u64(keys::POOL_WAIT_TIMEOUT)?.unwrap_or(defaults.pool_wait_timeout_ms)),
            callback_poll_period: ms(source
                .u64(keys::CALLBACK_POLL_PERIOD)?
                .unwrap_or(defaults.callback_poll_period_ms)
                .max(MIN_LEASE_PERIOD_MS)),
            callback_store_max: check_store_max(
                source.u32(keys::CALLBACK_STORE_MAX)?.unwrap_or(defaults.callback_store_max),
            )?,
            use_all_params: source.bool(keys::USE_ALL_PARAMS)?.unwrap_or(false),
        })
    }

    /// Timeout for a teardown step: the disconnect timeout if set, else `normal`.
    pub fn teardown_timeout(&self, normal: Duration) -> Duration {
        self.disconnect_timeout.unwrap_or(normal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locator(uri: &str) -> InvokerLocator {
        InvokerLocator::parse(uri).unwrap()
    }

    #[test]
    fn test_defaults_apply_without_overrides() {
        let settings =
            InvokerSettings::resolve(&locator("local://server:1/"), &Configuration::new(), &RemotingConfig::default())
                .unwrap();

        assert_eq!(settings.timeout, Duration::from_millis(DEFAULT_INVOCATION_TIMEOUT_MS));
        assert_eq!(settings.invoker_destruction_delay, Duration::ZERO);
        assert_eq!(settings.disconnect_timeout, None);
        assert!(!settings.enable_lease);
        assert!(!settings.use_all_params);
    }

    #[test]
    fn test_locator_params_win_over_configuration_map() {
        let config = Configuration::new().with(keys::TIMEOUT, 500).with(keys::INVOKER_DESTRUCTION_DELAY, 10);
        let settings = InvokerSettings::resolve(
            &locator("local://server:1/?timeout=250"),
            &config,
            &RemotingConfig::default(),
        )
        .unwrap();

        assert_eq!(settings.timeout, Duration::from_millis(250));
        assert_eq!(settings.invoker_destruction_delay, Duration::from_millis(10));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let defaults = RemotingConfig::default();
        let bad_number = Configuration::new().with(keys::TIMEOUT, "soon");
        assert!(InvokerSettings::resolve(&locator("local://server:1/"), &bad_number, &defaults).is_err());

        let bad_pool = Configuration::new().with(keys::MAX_POOL_SIZE, 0);
        assert!(InvokerSettings::resolve(&locator("local://server:1/"), &bad_pool, &defaults).is_err());

        let bad_bool = Configuration::new().with(keys::ENABLE_LEASE, "maybe");
        assert!(InvokerSettings::resolve(&locator("local://server:1/"), &bad_bool, &defaults).is_err());

        assert!(InvokerSettings::resolve(&locator("local://server:1/?clientLeasePeriod=1"), &Configuration::new(), &defaults).is_err());
    }

    #[test]
    fn test_teardown_timeout_prefers_disconnect_timeout() {
        let settings = InvokerSettings::resolve(
            &locator("local://server:1/?disconnectTimeout=0"),
            &Configuration::new(),
            &RemotingConfig::default(),
        )
        .unwrap();
        assert_eq!(settings.teardown_timeout(Duration::from_secs(30)), Duration::ZERO);
    }

    #[test]
    fn test_toml_partial_document_keeps_defaults() {
        let config = RemotingConfig::from_toml_str("invocation_timeout_ms = 1500\nlease_period_ms = 2000\n").unwrap();
        assert_eq!(config.invocation_timeout_ms, 1500);
        assert_eq!(config.lease_period_ms, 2000);
        assert_eq!(config.max_pool_size, DEFAULT_MAX_POOL_SIZE);

        assert!(RemotingConfig::from_toml_str("max_pool_size = 0").is_err());
        assert!(RemotingConfig::from_toml_str("invocation_timeout_ms = \"x\"").is_err());
    }
}
