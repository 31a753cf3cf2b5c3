//! Coding parameters and offload client configuration.
//!
//! Settings are read through the [`ConfigSource`] trait so callers can back
//! them with a TOML file, an in-memory table, or their own store. Nothing
//! here is global: a resolved [`OffloadConfig`] is handed to each
//! dispatcher at construction.

use std::path::Path;
use std::time::Duration;

use toml::{Table, Value};

use crate::error::ConfigError;
use crate::pattern::MAX_UNITS;

/// `(data_units, parity_units)` pairs with a matching compute bitstream.
///
/// RS(10,4) is reserved: the decoder bitstream exists but encode does not.
pub const SUPPORTED_CONFIGURATIONS: &[(usize, usize)] = &[(3, 2), (6, 3)];

/// Recognized configuration keys.
pub mod keys {
    /// Compute endpoints (string list). Required in live mode.
    pub const ENDPOINTS: &str = "offload.endpoints";
    /// `host:port` of the request broker.
    pub const PROVIDER_ADDR: &str = "offload.provider-addr";
    /// Upper bound on waiting for a reply, in milliseconds.
    pub const RECEIVE_TIMEOUT_MILLIS: &str = "offload.receive-timeout-millis";
    /// Upper bound on establishing a session, in milliseconds.
    pub const CONNECT_TIMEOUT_MILLIS: &str = "offload.connect-timeout-millis";
    /// Ask the broker to persist requests.
    pub const PERSISTENT_DELIVERY: &str = "offload.persistent-delivery";
    /// Request priority, 0 (lowest) to 9.
    pub const MESSAGE_PRIORITY: &str = "offload.message-priority";
    /// Request time-to-live in milliseconds; 0 never expires.
    pub const MESSAGE_TTL_MILLIS: &str = "offload.message-ttl-millis";
    /// Set to false to code every call locally.
    pub const ENABLED: &str = "offload.enabled";
    /// Test mode: answer every request from an in-memory loopback.
    pub const MOCK: &str = "offload.mock";

    /// Every key, in display order.
    pub const ALL: &[&str] = &[
        ENDPOINTS,
        PROVIDER_ADDR,
        RECEIVE_TIMEOUT_MILLIS,
        CONNECT_TIMEOUT_MILLIS,
        PERSISTENT_DELIVERY,
        MESSAGE_PRIORITY,
        MESSAGE_TTL_MILLIS,
        ENABLED,
        MOCK,
    ];
}

/// Default broker address.
pub const DEFAULT_PROVIDER_ADDR: &str = "127.0.0.1:61616";
/// Default receive timeout.
pub const DEFAULT_RECEIVE_TIMEOUT_MILLIS: u64 = 10_000;
/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT_MILLIS: u64 = 5_000;
/// Default request priority.
pub const DEFAULT_MESSAGE_PRIORITY: u64 = 4;
/// Highest request priority.
pub const MAX_MESSAGE_PRIORITY: u64 = 9;

/// Number of data and parity units per stripe.
///
/// Only constructible for a supported pair; immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodingConfiguration {
    data_units: usize,
    parity_units: usize,
}

impl CodingConfiguration {
    /// Validate `(data_units, parity_units)`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::TooManyUnits`] beyond 16 units,
    /// [`ConfigError::UnsupportedConfiguration`] for pairs outside
    /// [`SUPPORTED_CONFIGURATIONS`].
    pub fn new(data_units: usize, parity_units: usize) -> Result<Self, ConfigError> {
        let total = data_units + parity_units;
        if total > MAX_UNITS {
            return Err(ConfigError::TooManyUnits {
                total,
                max: MAX_UNITS,
            });
        }
        if !SUPPORTED_CONFIGURATIONS.contains(&(data_units, parity_units)) {
            return Err(ConfigError::UnsupportedConfiguration {
                data_units,
                parity_units,
            });
        }
        Ok(Self {
            data_units,
            parity_units,
        })
    }

    /// Number of data units (k).
    pub fn data_units(&self) -> usize {
        self.data_units
    }

    /// Number of parity units (p).
    pub fn parity_units(&self) -> usize {
        self.parity_units
    }

    /// `k + p`.
    pub fn all_units(&self) -> usize {
        self.data_units + self.parity_units
    }
}

/// Typed, key-addressed configuration lookup.
pub trait ConfigSource {
    /// Unsigned integer at `key`, or `default` when absent.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidValue`] if the key holds something else.
    fn get_uint(&self, key: &str, default: u64) -> Result<u64, ConfigError>;

    /// Boolean at `key`, or `default` when absent.
    fn get_bool(&self, key: &str, default: bool) -> Result<bool, ConfigError>;

    /// String at `key`, or `None` when absent.
    fn get_string(&self, key: &str) -> Result<Option<String>, ConfigError>;

    /// String list at `key`, or `None` when absent.
    ///
    /// A single string is accepted and split on commas.
    fn get_string_list(&self, key: &str) -> Result<Option<Vec<String>>, ConfigError>;
}

/// [`ConfigSource`] over a TOML table. Dotted keys walk nested tables.
#[derive(Debug, Clone, Default)]
pub struct ConfigTable {
    root: Table,
}

impl ConfigTable {
    /// An empty table: every lookup returns its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document.
    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            root: s.parse::<Table>()?,
        })
    }

    /// Read and parse a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Set `key`, creating intermediate tables as needed.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        let mut parts: Vec<&str> = key.split('.').collect();
        let Some(leaf) = parts.pop() else { return };

        let mut table = &mut self.root;
        for part in parts {
            let entry = table
                .entry(part.to_string())
                .or_insert_with(|| Value::Table(Table::new()));
            if !entry.is_table() {
                *entry = Value::Table(Table::new());
            }
            let Value::Table(next) = entry else { return };
            table = next;
        }
        table.insert(leaf.to_string(), value.into());
    }

    /// Builder form of [`set`](Self::set).
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    fn lookup(&self, key: &str) -> Option<&Value> {
        let mut parts = key.split('.');
        let mut value = self.root.get(parts.next()?)?;
        for part in parts {
            value = value.as_table()?.get(part)?;
        }
        Some(value)
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.into(),
    }
}

impl ConfigSource for ConfigTable {
    fn get_uint(&self, key: &str, default: u64) -> Result<u64, ConfigError> {
        match self.lookup(key) {
            None => Ok(default),
            Some(Value::Integer(i)) => {
                u64::try_from(*i).map_err(|_| invalid(key, format!("{i} is negative")))
            }
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map_err(|_| invalid(key, format!("{s:?} is not an unsigned integer"))),
            Some(other) => Err(invalid(key, format!("expected integer, got {}", other.type_str()))),
        }
    }

    fn get_bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.lookup(key) {
            None => Ok(default),
            Some(Value::Boolean(b)) => Ok(*b),
            Some(Value::String(s)) => s
                .trim()
                .parse()
                .map_err(|_| invalid(key, format!("{s:?} is not a boolean"))),
            Some(other) => Err(invalid(key, format!("expected boolean, got {}", other.type_str()))),
        }
    }

    fn get_string(&self, key: &str) -> Result<Option<String>, ConfigError> {
        match self.lookup(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(invalid(key, format!("expected string, got {}", other.type_str()))),
        }
    }

    fn get_string_list(&self, key: &str) -> Result<Option<Vec<String>>, ConfigError> {
        match self.lookup(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect(),
            )),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .map(String::from)
                        .ok_or_else(|| invalid(key, "list entries must be strings"))
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(other) => Err(invalid(key, format!("expected list, got {}", other.type_str()))),
        }
    }
}

/// Per-request delivery hints forwarded to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryOptions {
    /// Ask the broker to persist the request.
    pub persistent: bool,
    /// Priority, 0 to 9.
    pub priority: u8,
    /// Time-to-live in milliseconds; 0 never expires.
    pub time_to_live_ms: u32,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self {
            persistent: false,
            priority: DEFAULT_MESSAGE_PRIORITY as u8,
            time_to_live_ms: 0,
        }
    }
}

/// Resolved offload client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffloadConfig {
    /// When false, every call is coded locally and no channel is opened.
    pub enabled: bool,
    /// Use the in-memory loopback channel instead of the live transport.
    pub mock: bool,
    /// Broker `host:port`.
    pub provider_addr: String,
    /// Compute endpoints; one is picked per session.
    pub endpoints: Vec<String>,
    /// Bound on each `receive`.
    pub receive_timeout: Duration,
    /// Bound on session setup.
    pub connect_timeout: Duration,
    /// Delivery hints for every request.
    pub delivery: DeliveryOptions,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mock: false,
            provider_addr: DEFAULT_PROVIDER_ADDR.to_string(),
            endpoints: Vec::new(),
            receive_timeout: Duration::from_millis(DEFAULT_RECEIVE_TIMEOUT_MILLIS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MILLIS),
            delivery: DeliveryOptions::default(),
        }
    }
}

impl OffloadConfig {
    /// Settings for a mock-mode session.
    pub fn mock() -> Self {
        Self {
            mock: true,
            ..Self::default()
        }
    }

    /// Resolve and validate settings from `source`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingKey`] if live mode is selected without
    /// endpoints, [`ConfigError::InvalidValue`] for out-of-range values.
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self, ConfigError> {
        let enabled = source.get_bool(keys::ENABLED, true)?;
        let mock = source.get_bool(keys::MOCK, false)?;

        let endpoints = source.get_string_list(keys::ENDPOINTS)?.unwrap_or_default();
        if enabled && !mock && endpoints.is_empty() {
            return Err(ConfigError::MissingKey(keys::ENDPOINTS.to_string()));
        }

        let provider_addr = source
            .get_string(keys::PROVIDER_ADDR)?
            .unwrap_or_else(|| DEFAULT_PROVIDER_ADDR.to_string());

        let receive_ms =
            source.get_uint(keys::RECEIVE_TIMEOUT_MILLIS, DEFAULT_RECEIVE_TIMEOUT_MILLIS)?;
        if receive_ms == 0 {
            return Err(invalid(keys::RECEIVE_TIMEOUT_MILLIS, "must be greater than zero"));
        }
        let connect_ms =
            source.get_uint(keys::CONNECT_TIMEOUT_MILLIS, DEFAULT_CONNECT_TIMEOUT_MILLIS)?;
        if connect_ms == 0 {
            return Err(invalid(keys::CONNECT_TIMEOUT_MILLIS, "must be greater than zero"));
        }

        let priority = source.get_uint(keys::MESSAGE_PRIORITY, DEFAULT_MESSAGE_PRIORITY)?;
        if priority > MAX_MESSAGE_PRIORITY {
            return Err(invalid(
                keys::MESSAGE_PRIORITY,
                format!("{priority} exceeds {MAX_MESSAGE_PRIORITY}"),
            ));
        }
        let ttl = source.get_uint(keys::MESSAGE_TTL_MILLIS, 0)?;
        let time_to_live_ms = u32::try_from(ttl)
            .map_err(|_| invalid(keys::MESSAGE_TTL_MILLIS, format!("{ttl} does not fit in 32 bits")))?;

        Ok(Self {
            enabled,
            mock,
            provider_addr,
            endpoints,
            receive_timeout: Duration::from_millis(receive_ms),
            connect_timeout: Duration::from_millis(connect_ms),
            delivery: DeliveryOptions {
                persistent: source.get_bool(keys::PERSISTENT_DELIVERY, false)?,
                priority: priority as u8,
                time_to_live_ms,
            },
        })
    }
}
