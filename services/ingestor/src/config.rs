//! Ingestor configuration loading.
//!
//! TOML is the config source; CLI flags may override the listen address and
//! table path.  Without a config file every field takes its default.
//!
//! # Required fields
//! - `schema_version = 1` (only when a config file is given)
//!
//! # Example
//! ```toml
//! schema_version = 1
//!
//! [listen]
//! port = 20486
//!
//! [storage]
//! table_path = "/var/lib/freezer-monitor/freezer.csv"
//!
//! [flush]
//! mode = "daily"
//! ```

use crate::retention::RetentionPolicy;
use crate::scheduler::FlushSchedule;
use chrono::TimeDelta;
use serde::Deserialize;
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 20486;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 1024 * 1024;
pub const DEFAULT_TABLE_PATH: &str = "/var/lib/freezer-monitor/freezer.csv";
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub listen: ListenConfig,
    pub storage: StorageConfig,
    pub retention: RetentionPolicy,
    pub flush: FlushSchedule,
}

#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
    /// Per-call receive and accept timeout; bounds how long a stop request
    /// can go unnoticed.
    pub idle_timeout: Duration,
    pub max_frame_bytes: u32,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub table_path: PathBuf,
    pub lock_timeout: Duration,
}

impl ListenConfig {
    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            listen: ListenConfig {
                host: default_host(),
                port: DEFAULT_PORT,
                idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
                max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            },
            storage: StorageConfig {
                table_path: PathBuf::from(DEFAULT_TABLE_PATH),
                lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            },
            retention: RetentionPolicy::days(DEFAULT_RETENTION_DAYS, true),
            flush: FlushSchedule::Interval(Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS)),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    schema_version: Option<u32>,
    listen: Option<RawListenConfig>,
    storage: Option<RawStorageConfig>,
    retention: Option<RawRetentionConfig>,
    flush: Option<RawFlushConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawListenConfig {
    host: Option<String>,
    port: Option<u16>,
    idle_timeout_ms: Option<u64>,
    max_frame_bytes: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStorageConfig {
    table_path: Option<String>,
    lock_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRetentionConfig {
    days: Option<u32>,
    keep_unparsable: Option<bool>,
    future_skew_secs: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFlushConfig {
    mode: Option<String>,
    interval_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from a TOML file.
pub fn load_config_from_path(path: &Path) -> Result<ServiceConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load config from a TOML string, filling unset fields with defaults.
pub fn load_config_from_str(toml_str: &str) -> Result<ServiceConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let listen = raw.listen.unwrap_or_default();
    let idle_timeout_ms = positive(
        "listen.idle_timeout_ms",
        listen.idle_timeout_ms.unwrap_or(DEFAULT_IDLE_TIMEOUT_MS),
    )?;
    let max_frame_bytes = listen.max_frame_bytes.unwrap_or(DEFAULT_MAX_FRAME_BYTES);
    if max_frame_bytes == 0 {
        return Err(ConfigError::InvalidValue(
            "listen.max_frame_bytes must be greater than 0".to_owned(),
        ));
    }
    let host = match listen.host {
        Some(h) if h.trim().is_empty() => {
            return Err(ConfigError::InvalidValue(
                "listen.host must not be empty".to_owned(),
            ));
        }
        Some(h) => h,
        None => default_host(),
    };

    let storage = raw.storage.unwrap_or_default();
    let table_path = match storage.table_path {
        Some(p) if p.trim().is_empty() => {
            return Err(ConfigError::InvalidValue(
                "storage.table_path must not be empty".to_owned(),
            ));
        }
        Some(p) => PathBuf::from(p),
        None => PathBuf::from(DEFAULT_TABLE_PATH),
    };
    let lock_timeout_ms = positive(
        "storage.lock_timeout_ms",
        storage.lock_timeout_ms.unwrap_or(DEFAULT_LOCK_TIMEOUT_MS),
    )?;

    let retention = raw.retention.unwrap_or_default();
    let days = retention.days.unwrap_or(DEFAULT_RETENTION_DAYS);
    if days == 0 {
        return Err(ConfigError::InvalidValue(
            "retention.days must be greater than 0".to_owned(),
        ));
    }

    let flush = raw.flush.unwrap_or_default();
    let schedule = match flush.mode.as_deref().unwrap_or("interval") {
        "interval" => {
            let secs = positive(
                "flush.interval_secs",
                flush.interval_secs.unwrap_or(DEFAULT_FLUSH_INTERVAL_SECS),
            )?;
            FlushSchedule::Interval(Duration::from_secs(secs))
        }
        "daily" => {
            if flush.interval_secs.is_some() {
                return Err(ConfigError::InvalidValue(
                    "flush.interval_secs cannot be combined with mode = \"daily\"".to_owned(),
                ));
            }
            FlushSchedule::DailyAtMidnight
        }
        other => {
            return Err(ConfigError::InvalidValue(format!(
                "flush.mode must be \"interval\" or \"daily\", got \"{}\"",
                other
            )));
        }
    };

    Ok(ServiceConfig {
        listen: ListenConfig {
            host,
            port: listen.port.unwrap_or(DEFAULT_PORT),
            idle_timeout: Duration::from_millis(idle_timeout_ms),
            max_frame_bytes,
        },
        storage: StorageConfig {
            table_path,
            lock_timeout: Duration::from_millis(lock_timeout_ms),
        },
        retention: RetentionPolicy::days(days, retention.keep_unparsable.unwrap_or(true))
            .with_future_skew(TimeDelta::seconds(i64::from(
                retention.future_skew_secs.unwrap_or(0),
            ))),
        flush: schedule,
    })
}

fn positive(field: &str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue(format!(
            "{} must be greater than 0",
            field
        )));
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Default host
// ---------------------------------------------------------------------------

/// The local machine's IPv4 address as resolved from its hostname, or
/// `127.0.0.1` if the hostname does not resolve.
pub fn default_host() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .and_then(|name| {
            (name.as_str(), 0)
                .to_socket_addrs()
                .ok()?
                .find(std::net::SocketAddr::is_ipv4)
        })
        .map_or_else(|| "127.0.0.1".to_owned(), |addr| addr.ip().to_string())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
