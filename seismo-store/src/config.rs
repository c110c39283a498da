//! Configuration loading (§6): the five option groups — Database,
//! Admission, Feed, Server, Retention — loaded from an optional TOML/ini
//! file, environment variables (`SEISMO_*`), and finally CLI flags, in that
//! increasing order of precedence. Grounded in the `config`-crate layering
//! `cli/src/config.rs` uses for the teacher's own CLI configuration, and in
//! `humantime` for the duration-valued options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::admission::BufferSizing;

fn humantime_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn opt_humantime_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    raw.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
        .transpose()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: u16,
    pub name: Option<String>,
    pub schema: Option<String>,
    pub application: String,
    pub read_only: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            user: None,
            password: None,
            host: "127.0.0.1".to_string(),
            port: 5432,
            name: None,
            schema: None,
            application: "uWaveServer".to_string(),
            read_only: false,
        }
    }
}

impl From<&DatabaseConfig> for crate::db::Credentials {
    fn from(cfg: &DatabaseConfig) -> Self {
        crate::db::Credentials {
            user: cfg.user.clone(),
            password: cfg.password.clone(),
            host: cfg.host.clone(),
            port: cfg.port,
            database_name: cfg.name.clone(),
            schema: cfg.schema.clone(),
            application_name: cfg.application.clone(),
            read_only: cfg.read_only,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    #[serde(deserialize_with = "humantime_duration")]
    pub max_future_time: Duration,
    #[serde(deserialize_with = "humantime_duration")]
    pub max_expired_time: Duration,
    /// Fixed buffer size, when set, takes precedence over
    /// `circular_buffer_duration`.
    pub circular_buffer_size: Option<usize>,
    #[serde(deserialize_with = "opt_humantime_duration")]
    pub circular_buffer_duration: Option<Duration>,
    #[serde(deserialize_with = "humantime_duration")]
    pub log_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        AdmissionConfig {
            max_future_time: Duration::from_secs(60),
            max_expired_time: Duration::from_secs(3600),
            circular_buffer_size: None,
            circular_buffer_duration: Some(Duration::from_secs(3600)),
            log_interval: Duration::from_secs(60),
        }
    }
}

impl AdmissionConfig {
    pub fn buffer_sizing(&self) -> BufferSizing {
        match self.circular_buffer_size {
            Some(n) => BufferSizing::Fixed(n),
            None => BufferSizing::BufferDuration(
                self.circular_buffer_duration
                    .unwrap_or(Duration::from_secs(3600)),
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub address: String,
    pub port: u16,
    pub stream_selectors: Vec<String>,
    pub state_file: Option<String>,
    #[serde(deserialize_with = "humantime_duration")]
    pub state_file_update_interval: Duration,
    pub record_size: usize,
    #[serde(deserialize_with = "humantime_duration")]
    pub network_timeout: Duration,
    #[serde(deserialize_with = "humantime_duration")]
    pub reconnect_delay: Duration,
    pub max_queue_size: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        FeedConfig {
            address: "127.0.0.1".to_string(),
            port: 18000,
            stream_selectors: Vec::new(),
            state_file: None,
            state_file_update_interval: Duration::from_secs(30),
            record_size: 512,
            network_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(10),
            max_queue_size: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub thread_count: usize,
    /// Gap tolerance under which same-stream packets are merged into one
    /// trace before being rendered as miniSEED records (§4.H).
    #[serde(deserialize_with = "humantime_duration")]
    pub trace_merge_tolerance: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_address: "0.0.0.0".to_string(),
            port: 8090,
            thread_count: 4,
            trace_merge_tolerance: seismo_formats::DEFAULT_TRACE_MERGE_TOLERANCE,
        }
    }
}

/// Oldest packet age the writer accepts (§4.E step 2, §6). A plain
/// `Duration` sourced from configuration rather than the original's fragile
/// `drop_after` substring parse — see DESIGN.md Open Question (a).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    #[serde(deserialize_with = "humantime_duration")]
    pub retention_duration: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        RetentionConfig {
            // "large, e.g., one year" per spec.md §6.
            retention_duration: Duration::from_secs(365 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub admission: AdmissionConfig,
    pub feed: FeedConfig,
    pub server: ServerConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("loading configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Layers an optional TOML/ini file under environment variables prefixed
/// `SEISMO_` (double-underscore nested, e.g. `SEISMO_DATABASE__HOST`),
/// mirroring the teacher's `config`-crate layering in
/// `cli/src/config.rs::load_cli_config`.
pub fn load(config_file: Option<&str>) -> Result<AppConfig, ConfigError> {
    let mut builder = config::Config::builder();
    if let Some(path) = config_file {
        builder = builder.add_source(config::File::with_name(path));
    }
    builder = builder.add_source(
        config::Environment::with_prefix("SEISMO")
            .separator("__")
            .try_parsing(true),
    );
    Ok(builder.build()?.try_deserialize()?)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_load_without_any_source() {
        let cfg = load(None).unwrap();
        assert_eq!(cfg.server.port, 8090);
        assert_eq!(cfg.database.port, 5432);
        assert_eq!(cfg.retention.retention_duration, Duration::from_secs(365 * 24 * 3600));
    }

    #[test]
    fn buffer_sizing_prefers_fixed_size_over_duration() {
        let mut admission = AdmissionConfig::default();
        admission.circular_buffer_size = Some(500);
        assert!(matches!(admission.buffer_sizing(), BufferSizing::Fixed(500)));
    }
}
