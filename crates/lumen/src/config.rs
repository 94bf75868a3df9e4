//! Configuration
//!
//! Settings come from three layers, later ones overriding earlier ones:
//!
//! 1. built-in defaults
//! 2. a TOML file (`lumen.toml` unless given explicitly)
//! 3. `LUMEN_` environment variables, `__` separating sections
//!    (`LUMEN_TRANSPORT__PORT=1884`)
//!
//! ```toml
//! [transport]
//! host = "127.0.0.1"
//! port = 1883
//! keepalive = 60
//! base_topic = "zigbee2mqtt"
//!
//! [runtime]
//! virtual_time = false
//! skip_initial_query = false
//! report_delay_tolerance_ms = 1000
//! synchronous_listeners = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use tracing::info;

use lumen_runtime::Runtime;

use crate::client::ClientOptions;
use crate::transport::ConnectOptions;

/// File read by [`LumenConfig::load`]
pub const DEFAULT_CONFIG_FILE: &str = "lumen.toml";

/// Prefix of configuration environment variables
pub const ENV_PREFIX: &str = "LUMEN_";

/// Errors loading or writing configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Extract(#[from] figment::Error),

    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Top-level configuration (lumen.toml)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LumenConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// Broker connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds
    #[serde(default = "default_keepalive")]
    pub keepalive: u64,
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_keepalive() -> u64 {
    60
}

fn default_base_topic() -> String {
    crate::device::DEFAULT_BASE_TOPIC.to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            keepalive: default_keepalive(),
            base_topic: default_base_topic(),
            username: None,
            password: None,
        }
    }
}

/// Loop and device behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Run timers on a self-advancing virtual clock
    #[serde(default)]
    pub virtual_time: bool,
    #[serde(default)]
    pub skip_initial_query: bool,
    #[serde(default = "default_report_delay_tolerance_ms")]
    pub report_delay_tolerance_ms: u64,
    #[serde(default)]
    pub synchronous_listeners: bool,
}

fn default_report_delay_tolerance_ms() -> u64 {
    1000
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            virtual_time: false,
            skip_initial_query: false,
            report_delay_tolerance_ms: default_report_delay_tolerance_ms(),
            synchronous_listeners: false,
        }
    }
}

impl LumenConfig {
    /// Load from [`DEFAULT_CONFIG_FILE`] in the working directory and the
    /// environment
    pub fn load() -> ConfigResult<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from `path` and the environment; a missing file means defaults
    pub fn load_from(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let config = Figment::from(Serialized::defaults(LumenConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Write as TOML, creating parent directories
    pub fn write(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        let contents = self.to_toml()?;
        let io_error = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_error)?;
        }
        std::fs::write(path, contents).map_err(io_error)?;

        info!("Wrote configuration to {}", path.display());
        Ok(())
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            host: self.transport.host.clone(),
            port: self.transport.port,
            keepalive: Duration::from_secs(self.transport.keepalive),
            username: self.transport.username.clone(),
            password: self.transport.password.clone(),
        }
    }

    pub fn report_delay_tolerance(&self) -> Duration {
        Duration::from_millis(self.runtime.report_delay_tolerance_ms)
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            connect: self.connect_options(),
            base_topic: self.transport.base_topic.clone(),
            skip_initial_query: self.runtime.skip_initial_query,
            report_delay_tolerance: self.report_delay_tolerance(),
            synchronous_listeners: self.runtime.synchronous_listeners,
        }
    }

    /// A runtime on the configured clock
    pub fn build_runtime(&self) -> Runtime {
        if self.runtime.virtual_time {
            Runtime::new_virtual()
        } else {
            Runtime::new()
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
