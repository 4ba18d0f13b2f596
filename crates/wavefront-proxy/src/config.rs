// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Proxy configuration.
//!
//! Settings are layered, later sources overriding earlier ones:
//!
//! 1. built-in defaults
//! 2. the YAML file named by `WF_CONFIG`, when set
//! 3. `WF_`-prefixed environment variables (`WF_TOKEN`, `WF_PUSH_LISTENER_PORTS`, ...)
//!
//! ```yaml
//! token: 0e1f2a3b-4c5d-6e7f-8091-a2b3c4d5e6f7
//! server: https://metrics.example.com/api
//! push_listener_ports: "2878,2879"
//! opentsdb_ports: ""
//! flush_threads: 4
//! ```
//!
//! The loaded [`ProxyConfig`] is immutable and handed to each component explicitly.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{error, warn};

use points::constants::{
    DEFAULT_AGENT_REPORT_INTERVAL, DEFAULT_FLUSH_INTERVAL_MS, DEFAULT_FLUSH_MAX_POINTS,
    DEFAULT_FLUSH_THREADS, DEFAULT_MAX_CONNECTIONS, DEFAULT_MEMORY_BUFFER_LIMIT,
    DEFAULT_OPENTSDB_PORT, DEFAULT_PUSH_LISTENER_PORT, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_RETRY_ATTEMPTS, DEFAULT_SHUTDOWN_GRACE_PERIOD,
};
use points::util::parse_ports;

pub const ENV_PREFIX: &str = "WF_";
pub const CONFIG_FILE_ENV: &str = "WF_CONFIG";
const DEFAULT_ID_FILE: &str = ".wavefront_id";
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, thiserror::Error)]
#[allow(clippy::module_name_repetitions)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Parse(#[from] Box<figment::Error>),
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("invalid value for `{key}`: {value}")]
    Invalid { key: &'static str, value: String },
    #[error("could not resolve the local hostname: {0}")]
    Hostname(#[source] std::io::Error),
}

/// Raw settings as they appear in the YAML file and environment
#[derive(Debug, PartialEq, Deserialize)]
#[serde(default)]
struct RawConfig {
    #[serde(deserialize_with = "deserialize_string_or_int")]
    token: Option<String>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    server: Option<String>,
    #[serde(deserialize_with = "deserialize_string_or_int")]
    hostname: Option<String>,
    #[serde(deserialize_with = "deserialize_ports")]
    push_listener_ports: String,
    #[serde(deserialize_with = "deserialize_ports")]
    opentsdb_ports: String,
    flush_threads: usize,
    push_flush_interval: u64,
    push_flush_max_points: usize,
    push_memory_buffer_limit: usize,
    id_file: PathBuf,
    log_level: String,
    max_connections: usize,
    retry_attempts: u32,
    request_timeout_secs: u64,
    agent_report_interval_secs: u64,
    shutdown_grace_period_ms: u64,
}

impl Default for RawConfig {
    fn default() -> Self {
        RawConfig {
            token: None,
            server: None,
            hostname: None,
            push_listener_ports: DEFAULT_PUSH_LISTENER_PORT.to_string(),
            opentsdb_ports: DEFAULT_OPENTSDB_PORT.to_string(),
            flush_threads: DEFAULT_FLUSH_THREADS,
            push_flush_interval: DEFAULT_FLUSH_INTERVAL_MS,
            push_flush_max_points: DEFAULT_FLUSH_MAX_POINTS,
            push_memory_buffer_limit: DEFAULT_MEMORY_BUFFER_LIMIT,
            id_file: PathBuf::from(DEFAULT_ID_FILE),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
            agent_report_interval_secs: DEFAULT_AGENT_REPORT_INTERVAL.as_secs(),
            shutdown_grace_period_ms: u64::try_from(DEFAULT_SHUTDOWN_GRACE_PERIOD.as_millis())
                .unwrap_or(u64::MAX),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
#[allow(clippy::module_name_repetitions)]
pub struct ProxyConfig {
    pub token: String,
    pub server: String,
    pub hostname: String,
    pub push_listener_ports: Vec<u16>,
    pub opentsdb_ports: Vec<u16>,
    pub flush_threads: usize,
    pub push_flush_interval: Duration,
    pub push_flush_max_points: usize,
    pub push_memory_buffer_limit: usize,
    pub id_file: PathBuf,
    pub log_level: String,
    pub max_connections: usize,
    pub retry_attempts: u32,
    pub request_timeout: Duration,
    pub agent_report_interval: Duration,
    pub shutdown_grace_period: Duration,
}

impl ProxyConfig {
    /// Loads defaults, the optional `WF_CONFIG` file and `WF_` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let file = std::env::var(CONFIG_FILE_ENV).ok().map(PathBuf::from);
        Self::load_from(file.as_deref())
    }

    pub fn load_from(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new();
        if let Some(path) = file {
            if !path.exists() {
                warn!("Config file {} does not exist, ignoring", path.display());
            }
            figment = figment.merge(Yaml::file(path));
        }
        // WF_CONFIG names the file, it is not a setting
        figment = figment.merge(Env::prefixed(ENV_PREFIX).ignore(&["config"]));

        let raw: RawConfig = figment.extract().map_err(Box::new)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let token = raw.token.ok_or(ConfigError::Missing("token"))?;
        let server = raw.server.ok_or(ConfigError::Missing("server"))?;
        if !server.starts_with("http://") && !server.starts_with("https://") {
            return Err(ConfigError::Invalid {
                key: "server",
                value: server,
            });
        }

        let hostname = match raw.hostname {
            Some(hostname) => hostname,
            None => resolve_hostname()?,
        };

        let push_listener_ports =
            parse_ports(&raw.push_listener_ports).ok_or(ConfigError::Invalid {
                key: "push_listener_ports",
                value: raw.push_listener_ports.clone(),
            })?;
        let opentsdb_ports = parse_ports(&raw.opentsdb_ports).ok_or(ConfigError::Invalid {
            key: "opentsdb_ports",
            value: raw.opentsdb_ports.clone(),
        })?;

        for (key, value) in [
            ("flush_threads", raw.flush_threads),
            ("push_flush_max_points", raw.push_flush_max_points),
            ("max_connections", raw.max_connections),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    value: value.to_string(),
                });
            }
        }
        if raw.push_flush_interval == 0 {
            return Err(ConfigError::Invalid {
                key: "push_flush_interval",
                value: "0".to_string(),
            });
        }

        Ok(ProxyConfig {
            token,
            server,
            hostname,
            push_listener_ports,
            opentsdb_ports,
            flush_threads: raw.flush_threads,
            push_flush_interval: Duration::from_millis(raw.push_flush_interval),
            push_flush_max_points: raw.push_flush_max_points,
            push_memory_buffer_limit: raw.push_memory_buffer_limit,
            id_file: raw.id_file,
            log_level: raw.log_level.to_lowercase(),
            max_connections: raw.max_connections,
            retry_attempts: raw.retry_attempts.max(1),
            request_timeout: Duration::from_secs(raw.request_timeout_secs),
            agent_report_interval: Duration::from_secs(raw.agent_report_interval_secs.max(1)),
            shutdown_grace_period: Duration::from_millis(raw.shutdown_grace_period_ms),
        })
    }
}

fn resolve_hostname() -> Result<String, ConfigError> {
    let hostname = hostname::get().map_err(ConfigError::Hostname)?;
    Ok(hostname.to_string_lossy().into_owned())
}

fn deserialize_string_or_int<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => {
            if s.trim().is_empty() {
                Ok(None)
            } else {
                Ok(Some(s.trim().to_string()))
            }
        }
        Value::Number(n) => Ok(Some(n.to_string())),
        _ => {
            error!("Failed to parse value, expected a string or an integer, ignoring");
            Ok(None)
        }
    }
}

/// Accepts `"2878,2879"`, a bare `2878` or a YAML list of ports
fn deserialize_ports<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Array(ports) => Ok(ports
            .iter()
            .map(|p| match p {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(",")),
        Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected a port list, got {other}"
        ))),
    }
}
