//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Command-line flags** — `-i`, `-h`, `-p`, `-a` (applied by `main` via
//!    [`Config::apply_overrides`])
//! 2. **Environment variables** — `RTTY_IFNAME`, `RTTY_HOST`, `RTTY_PORT`,
//!    `RTTY_AUTO_RECONNECT`
//! 3. **Config file** — path via `--config <path>`, or `rtty.toml` in CWD
//! 4. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! host = "rtty.example.com"
//! port = 5912
//! path = "/ws/device"
//!
//! [device]
//! ifname = "eth0"
//!
//! [agent]
//! auto_reconnect = true
//! connect_timeout_secs = 5
//! reconnect_delay_secs = 5
//! keepalive_interval_secs = 10
//! reap_timeout_ms = 3000
//! max_data_bytes = 1048576
//! # login = "/bin/login"     # skip the $PATH lookup
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// File looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "rtty.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the management server lives.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server host name or address. Required (file, env or `-h`).
    pub host: Option<String>,
    /// Server port. Required (file, env or `-p`).
    pub port: Option<u16>,
    /// WebSocket path on the server (default `/ws/device`).
    #[serde(default = "default_path")]
    pub path: String,
}

/// Which network interface provides the device identity.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceConfig {
    /// Interface whose hardware address identifies this device. Required.
    pub ifname: Option<String>,
}

/// Connection and session tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Keep reconnecting instead of exiting when the server goes away (default false).
    #[serde(default)]
    pub auto_reconnect: bool,
    /// Upper bound on a single connect attempt in seconds (default 5).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Fixed delay between reconnect attempts in seconds (default 5).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Seconds between keepalive pings (default 10).
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    /// How long teardown waits for a terminated login process (default 3000).
    #[serde(default = "default_reap_timeout")]
    pub reap_timeout_ms: u64,
    /// Largest decoded inbound `data` payload accepted (default 1 MiB).
    #[serde(default = "default_max_data_bytes")]
    pub max_data_bytes: usize,
    /// Explicit login program. When unset, `login` is searched in `$PATH`.
    pub login: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Values taken from the command line. `None`/`false` leaves the lower layers alone.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub ifname: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub auto_reconnect: bool,
}

fn default_path() -> String {
    "/ws/device".to_string()
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_keepalive_interval() -> u64 {
    10
}
fn default_reap_timeout() -> u64 {
    3000
}
fn default_max_data_bytes() -> usize {
    1024 * 1024
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            path: default_path(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: false,
            connect_timeout_secs: default_connect_timeout(),
            reconnect_delay_secs: default_reconnect_delay(),
            keepalive_interval_secs: default_keepalive_interval(),
            reap_timeout_ms: default_reap_timeout(),
            max_data_bytes: default_max_data_bytes(),
            login: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist and parse. Otherwise
    /// `rtty.toml` in the current directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Parse a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `RTTY_*` environment overrides, looked up through `var`.
    pub fn apply_env(
        &mut self,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(ifname) = var("RTTY_IFNAME") {
            self.device.ifname = Some(ifname);
        }
        if let Some(host) = var("RTTY_HOST") {
            self.server.host = Some(host);
        }
        if let Some(port) = var("RTTY_PORT") {
            let port = port.trim().parse().map_err(|e| ConfigError::Invalid {
                field: "RTTY_PORT",
                reason: format!("{port:?}: {e}"),
            })?;
            self.server.port = Some(port);
        }
        if let Some(flag) = var("RTTY_AUTO_RECONNECT") {
            self.agent.auto_reconnect = parse_flag(&flag).ok_or(ConfigError::Invalid {
                field: "RTTY_AUTO_RECONNECT",
                reason: format!("{flag:?} is not a boolean"),
            })?;
        }
        Ok(())
    }

    /// Apply command-line values on top of everything else.
    pub fn apply_overrides(&mut self, overrides: Overrides) {
        if let Some(ifname) = overrides.ifname {
            self.device.ifname = Some(ifname);
        }
        if let Some(host) = overrides.host {
            self.server.host = Some(host);
        }
        if let Some(port) = overrides.port {
            self.server.port = Some(port);
        }
        if overrides.auto_reconnect {
            self.agent.auto_reconnect = true;
        }
    }

    /// Reject values the agent cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("agent.connect_timeout_secs", self.agent.connect_timeout_secs),
            ("agent.reconnect_delay_secs", self.agent.reconnect_delay_secs),
            (
                "agent.keepalive_interval_secs",
                self.agent.keepalive_interval_secs,
            ),
            ("agent.reap_timeout_ms", self.agent.reap_timeout_ms),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if self.agent.max_data_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "agent.max_data_bytes",
                reason: "must be greater than zero".into(),
            });
        }
        if self.server.port == Some(0) {
            return Err(ConfigError::Invalid {
                field: "server.port",
                reason: "must be greater than zero".into(),
            });
        }
        if !self.server.path.starts_with('/') {
            return Err(ConfigError::Invalid {
                field: "server.path",
                reason: format!("{:?} must start with '/'", self.server.path),
            });
        }
        Ok(())
    }

    /// Explicit login program, if configured.
    pub fn login_override(&self) -> Option<PathBuf> {
        self.agent.login.as_deref().map(PathBuf::from)
    }
}

impl AgentConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn reap_timeout(&self) -> Duration {
        Duration::from_millis(self.reap_timeout_ms)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
