//! Startup configuration: an optional TOML file overlaid by environment
//! variables, validated as a whole before anything connects.

use serde::Deserialize;
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::session::ReconnectPolicy;

/// Read when `RELAY_CONFIG` is unset and the file exists.
const DEFAULT_CONFIG_PATH: &str = "relay.toml";

const DEFAULT_BROKER_PORT: u16 = 1883;
const DEFAULT_CLIENT_ID: &str = "microgrid-relay";
const DEFAULT_TOPIC: &str = "/+/+";
const DEFAULT_KEEP_ALIVE_SEC: u64 = 30;
const DEFAULT_RECONNECT_DELAY_SEC: u64 = 5;
const DEFAULT_HTTP_HOST: &str = "0.0.0.0";
const DEFAULT_HTTP_PORT: u16 = 8000;
const DEFAULT_STALENESS_SEC: u64 = 15;

/// rumqttc rejects keep-alive intervals shorter than this.
const MIN_KEEP_ALIVE_SEC: u64 = 5;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("config validation failed ({} error(s)):\n  - {}", .0.len(), .0.join("\n  - "))]
    Invalid(Vec<String>),
}

// ---------------------------------------------------------------------------
// Config file structure
// ---------------------------------------------------------------------------

/// Every key is optional; environment variables and defaults fill the gaps.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub broker_host: Option<String>,
    pub broker_port: Option<u16>,
    pub client_id: Option<String>,
    pub topics: Option<Vec<String>>,
    pub keep_alive_seconds: Option<u64>,
    pub reconnect_delay_seconds: Option<u64>,
    pub reconnect_max_delay_seconds: Option<u64>,
    pub http_host: Option<String>,
    pub http_port: Option<u16>,
    pub staleness_threshold_seconds: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub mqtt: MqttSettings,
    pub http: HttpSettings,
    pub staleness_threshold: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub topics: Vec<String>,
    pub keep_alive: Duration,
    pub reconnect: ReconnectPolicy,
}

impl MqttSettings {
    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpSettings {
    pub host: String,
    pub port: u16,
}

impl HttpSettings {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Settings {
    /// Merge file values with environment overrides (looked up through
    /// `env`) and validate. Reports every violation, not just the first.
    pub fn resolve(
        file: FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        let host = env("MQTT_HOST").or(file.broker_host).unwrap_or_default();
        let port = pick(&env, "MQTT_PORT", file.broker_port, &mut errors)
            .unwrap_or(DEFAULT_BROKER_PORT);
        let client_id = env("MQTT_CLIENT_ID")
            .or(file.client_id)
            .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string());
        let topics = env("MQTT_TOPICS")
            .map(|s| split_list(&s))
            .or(file.topics)
            .unwrap_or_else(|| vec![DEFAULT_TOPIC.to_string()]);
        let keep_alive = pick(&env, "MQTT_KEEP_ALIVE", file.keep_alive_seconds, &mut errors)
            .unwrap_or(DEFAULT_KEEP_ALIVE_SEC);
        let reconnect_delay = pick(
            &env,
            "RECONNECT_DELAY_SECONDS",
            file.reconnect_delay_seconds,
            &mut errors,
        )
        .unwrap_or(DEFAULT_RECONNECT_DELAY_SEC);
        let reconnect_max = pick(
            &env,
            "RECONNECT_MAX_DELAY_SECONDS",
            file.reconnect_max_delay_seconds,
            &mut errors,
        );
        let http_host = env("HTTP_HOST")
            .or(file.http_host)
            .unwrap_or_else(|| DEFAULT_HTTP_HOST.to_string());
        let http_port =
            pick(&env, "HTTP_PORT", file.http_port, &mut errors).unwrap_or(DEFAULT_HTTP_PORT);
        let staleness = pick(
            &env,
            "STALENESS_THRESHOLD_SECONDS",
            file.staleness_threshold_seconds,
            &mut errors,
        )
        .unwrap_or(DEFAULT_STALENESS_SEC);

        // ── Broker ──────────────────────────────────────────────────
        if host.trim().is_empty() {
            errors.push("broker_host is required (set MQTT_HOST or broker_host)".to_string());
        }
        if port == 0 {
            errors.push("broker_port must be non-zero".to_string());
        }
        if client_id.trim().is_empty() {
            errors.push("client_id is empty".to_string());
        }
        if topics.is_empty() {
            errors.push("at least one topic filter is required".to_string());
        }
        if topics.iter().any(|t| t.trim().is_empty()) {
            errors.push("topic filters must not be empty".to_string());
        }
        if keep_alive < MIN_KEEP_ALIVE_SEC {
            errors.push(format!(
                "keep_alive_seconds must be at least {MIN_KEEP_ALIVE_SEC}, got {keep_alive}"
            ));
        }

        // ── Reconnect policy ────────────────────────────────────────
        if reconnect_delay == 0 {
            errors.push("reconnect_delay_seconds must be positive, got 0".to_string());
        }
        if let Some(max) = reconnect_max {
            if max < reconnect_delay {
                errors.push(format!(
                    "reconnect_max_delay_seconds ({max}) is below reconnect_delay_seconds ({reconnect_delay})"
                ));
            }
        }

        // ── HTTP + staleness ────────────────────────────────────────
        if http_host.trim().is_empty() {
            errors.push("http_host is empty".to_string());
        }
        if http_port == 0 {
            errors.push("http_port must be non-zero".to_string());
        }
        if staleness == 0 {
            errors.push("staleness_threshold_seconds must be positive, got 0".to_string());
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        let base = Duration::from_secs(reconnect_delay);
        let reconnect = match reconnect_max {
            Some(max) => ReconnectPolicy::Exponential {
                base,
                max: Duration::from_secs(max),
            },
            None => ReconnectPolicy::Fixed(base),
        };

        Ok(Self {
            mqtt: MqttSettings {
                host,
                port,
                client_id,
                topics,
                keep_alive: Duration::from_secs(keep_alive),
                reconnect,
            },
            http: HttpSettings {
                host: http_host,
                port: http_port,
            },
            staleness_threshold: Duration::from_secs(staleness),
        })
    }
}

/// Environment value if set (recording a parse failure), else the file value.
fn pick<T: FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    var: &str,
    file: Option<T>,
    errors: &mut Vec<String>,
) -> Option<T> {
    match env(var) {
        Some(raw) => match raw.trim().parse() {
            Ok(v) => Some(v),
            Err(_) => {
                errors.push(format!("{var}: invalid value '{raw}'"));
                None
            }
        },
        None => file,
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file.
pub fn read_file(path: &str) -> Result<FileConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_string(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_string(),
        source,
    })
}

/// Resolve settings from `RELAY_CONFIG` (or `relay.toml` when present) and
/// the process environment.
pub fn load() -> Result<Settings, ConfigError> {
    let file = match env::var("RELAY_CONFIG") {
        Ok(path) => read_file(&path)?,
        Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => read_file(DEFAULT_CONFIG_PATH)?,
        Err(_) => FileConfig::default(),
    };
    let settings = Settings::resolve(file, |key| env::var(key).ok())?;

    tracing::info!(
        broker = %settings.mqtt.broker_addr(),
        topics = ?settings.mqtt.topics,
        http = %settings.http.addr(),
        staleness_sec = settings.staleness_threshold.as_secs(),
        "config loaded"
    );

    Ok(settings)
}

// ===========================================================================
// Tests
// ===========================================================================
