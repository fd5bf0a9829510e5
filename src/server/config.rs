//! Gateway configuration.
//!
//! Each population (Base devices, Client apps) has its own listener and
//! tunables. Every field is optional in the JSON file; missing fields fall
//! back to the population's defaults.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::AuthPolicy;
use crate::core::{
    ConfigError, DEFAULT_AUTH_TIMEOUT, DEFAULT_AUTH_WINDOW, DEFAULT_BACKOFF_INITIAL,
    DEFAULT_BACKOFF_MAX, DEFAULT_BASE_AUTH_ATTEMPTS, DEFAULT_BASE_KEEPALIVE, DEFAULT_BASE_PORT,
    DEFAULT_CLIENT_AUTH_ATTEMPTS, DEFAULT_CLIENT_KEEPALIVE, DEFAULT_CLIENT_PORT,
    DEFAULT_MAX_LINE_BYTES, DEFAULT_OUT_OF_SYNC_MAX, DEFAULT_SENDER_BATCH,
    DEFAULT_SENDER_INTERVAL, DEFAULT_WRITE_TIMEOUT,
};
use crate::sync::DeliveryConfig;

/// How the random first block of outbound Base frames is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IvMode {
    /// Fresh bytes from the OS RNG for every frame.
    #[default]
    Random,
    /// Last ciphertext block of the previous frame sent or received on the
    /// session.
    Chained,
}

/// Settings for one population's listener and connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PopulationConfig {
    /// Listen address.
    pub bind_addr: SocketAddr,
    /// Concurrent connections accepted; excess sockets are closed.
    pub max_connections: usize,
    /// Keep-alive probe period.
    pub keepalive_ms: u64,
    /// Time allowed from connect to authenticated.
    pub auth_timeout_ms: u64,
    /// Delivery loop tick.
    pub sender_interval_ms: u64,
    /// Failed logins tolerated per window and remote address.
    pub max_auth_attempts: u32,
    /// Failed-login counting window.
    pub auth_window_minutes: u64,
    /// First backoff pause.
    pub backoff_initial_ms: u64,
    /// Backoff ceiling.
    pub backoff_max_ms: u64,
    /// Out-of-sync events tolerated before flush-and-close.
    pub out_of_sync_max: u32,
    /// Longest accepted Client line.
    pub max_line_bytes: usize,
    /// Outbound IV selection (Base only).
    pub iv_mode: IvMode,
    /// Longest a single socket write may stall.
    pub write_timeout_ms: u64,
}

impl PopulationConfig {
    /// Defaults for the Base device listener.
    pub fn base() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_BASE_PORT)),
            max_connections: 1000,
            keepalive_ms: millis(DEFAULT_BASE_KEEPALIVE),
            auth_timeout_ms: millis(DEFAULT_AUTH_TIMEOUT),
            sender_interval_ms: millis(DEFAULT_SENDER_INTERVAL),
            max_auth_attempts: DEFAULT_BASE_AUTH_ATTEMPTS,
            auth_window_minutes: DEFAULT_AUTH_WINDOW.as_secs() / 60,
            backoff_initial_ms: millis(DEFAULT_BACKOFF_INITIAL),
            backoff_max_ms: millis(DEFAULT_BACKOFF_MAX),
            out_of_sync_max: DEFAULT_OUT_OF_SYNC_MAX,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            iv_mode: IvMode::Random,
            write_timeout_ms: millis(DEFAULT_WRITE_TIMEOUT),
        }
    }

    /// Defaults for the Client app listener.
    pub fn client() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_CLIENT_PORT)),
            max_connections: 3000,
            keepalive_ms: millis(DEFAULT_CLIENT_KEEPALIVE),
            max_auth_attempts: DEFAULT_CLIENT_AUTH_ATTEMPTS,
            ..Self::base()
        }
    }

    /// Set the listen address.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the connection limit.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the keep-alive period.
    pub fn with_keepalive(mut self, period: Duration) -> Self {
        self.keepalive_ms = millis(period);
        self
    }

    /// Set the authentication timeout.
    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout_ms = millis(timeout);
        self
    }

    /// Set the delivery loop tick.
    pub fn with_sender_interval(mut self, interval: Duration) -> Self {
        self.sender_interval_ms = millis(interval);
        self
    }

    /// Set the failed-login budget.
    pub fn with_auth_attempts(mut self, limit: u32, window_minutes: u64) -> Self {
        self.max_auth_attempts = limit;
        self.auth_window_minutes = window_minutes;
        self
    }

    /// Set the backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial_ms = millis(initial);
        self.backoff_max_ms = millis(max);
        self
    }

    /// Set the out-of-sync threshold.
    pub fn with_out_of_sync_max(mut self, max: u32) -> Self {
        self.out_of_sync_max = max;
        self
    }

    /// Set the Client line limit.
    pub fn with_max_line_bytes(mut self, max: usize) -> Self {
        self.max_line_bytes = max;
        self
    }

    /// Set the outbound IV mode.
    pub fn with_iv_mode(mut self, mode: IvMode) -> Self {
        self.iv_mode = mode;
        self
    }

    /// Set the socket write timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout_ms = millis(timeout);
        self
    }

    /// Keep-alive period.
    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }

    /// Authentication timeout.
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    /// Delivery loop tick.
    pub fn sender_interval(&self) -> Duration {
        Duration::from_millis(self.sender_interval_ms)
    }

    /// Socket write timeout.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Failed-login budget for the authenticators.
    pub fn auth_policy(&self) -> AuthPolicy {
        AuthPolicy {
            attempt_limit: self.max_auth_attempts,
            window: Duration::from_secs(self.auth_window_minutes.saturating_mul(60)),
        }
    }

    /// Tunables for the delivery engine.
    pub fn delivery(&self) -> DeliveryConfig {
        DeliveryConfig {
            out_of_sync_max: self.out_of_sync_max,
            backoff_initial: Duration::from_millis(self.backoff_initial_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            sender_batch: DEFAULT_SENDER_BATCH,
        }
    }

    /// Reject values the gateway cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.sender_interval_ms == 0, "sender_interval_ms"),
            (self.auth_timeout_ms == 0, "auth_timeout_ms"),
            (self.keepalive_ms == 0, "keepalive_ms"),
            (self.backoff_initial_ms == 0, "backoff_initial_ms"),
            (self.max_connections == 0, "max_connections"),
            (self.max_line_bytes == 0, "max_line_bytes"),
            (self.write_timeout_ms == 0, "write_timeout_ms"),
        ];
        match checks.iter().find(|&&(bad, _)| bad) {
            Some(&(_, field)) => Err(ConfigError::Invalid {
                field,
                reason: "must be greater than zero",
            }),
            None => Ok(()),
        }
    }
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self::base()
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Both listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "GatewayFile")]
pub struct GatewayConfig {
    /// Base device listener.
    pub base: PopulationConfig,
    /// Client app listener.
    pub client: PopulationConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base: PopulationConfig::base(),
            client: PopulationConfig::client(),
        }
    }
}

impl GatewayConfig {
    /// Load and validate a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Parse and validate JSON text.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate both populations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.base.validate()?;
        self.client.validate()
    }
}

// On-disk shape: every field optional, merged over the population defaults.

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct GatewayFile {
    base: PopulationFile,
    client: PopulationFile,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct PopulationFile {
    bind_addr: Option<SocketAddr>,
    max_connections: Option<usize>,
    keepalive_ms: Option<u64>,
    auth_timeout_ms: Option<u64>,
    sender_interval_ms: Option<u64>,
    max_auth_attempts: Option<u32>,
    auth_window_minutes: Option<u64>,
    backoff_initial_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    out_of_sync_max: Option<u32>,
    max_line_bytes: Option<usize>,
    iv_mode: Option<IvMode>,
    write_timeout_ms: Option<u64>,
}

impl PopulationFile {
    fn merge(self, defaults: PopulationConfig) -> PopulationConfig {
        PopulationConfig {
            bind_addr: self.bind_addr.unwrap_or(defaults.bind_addr),
            max_connections: self.max_connections.unwrap_or(defaults.max_connections),
            keepalive_ms: self.keepalive_ms.unwrap_or(defaults.keepalive_ms),
            auth_timeout_ms: self.auth_timeout_ms.unwrap_or(defaults.auth_timeout_ms),
            sender_interval_ms: self.sender_interval_ms.unwrap_or(defaults.sender_interval_ms),
            max_auth_attempts: self.max_auth_attempts.unwrap_or(defaults.max_auth_attempts),
            auth_window_minutes: self
                .auth_window_minutes
                .unwrap_or(defaults.auth_window_minutes),
            backoff_initial_ms: self.backoff_initial_ms.unwrap_or(defaults.backoff_initial_ms),
            backoff_max_ms: self.backoff_max_ms.unwrap_or(defaults.backoff_max_ms),
            out_of_sync_max: self.out_of_sync_max.unwrap_or(defaults.out_of_sync_max),
            max_line_bytes: self.max_line_bytes.unwrap_or(defaults.max_line_bytes),
            iv_mode: self.iv_mode.unwrap_or(defaults.iv_mode),
            write_timeout_ms: self.write_timeout_ms.unwrap_or(defaults.write_timeout_ms),
        }
    }
}

impl From<GatewayFile> for GatewayConfig {
    fn from(file: GatewayFile) -> Self {
        Self {
            base: file.base.merge(PopulationConfig::base()),
            client: file.client.merge(PopulationConfig::client()),
        }
    }
}
