//! Process configuration read from the environment.
//!
//! Every key is optional except where noted; missing keys fall back to the
//! defaults below. Malformed values are rejected rather than silently ignored.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use pulse_ai::{ProviderKind, ProviderTimeouts};
use pulse_observability::{LogConfig, LogFormat};

use crate::jobs::JobExecutorConfig;
use crate::streaming::StreamerConfig;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// API key and optional endpoint override of one provider.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderCredentials {
    pub api_key: String,
    pub base_url: Option<String>,
}

impl std::fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProviderSettings {
    pub openai: Option<ProviderCredentials>,
    pub anthropic: Option<ProviderCredentials>,
    pub google: Option<ProviderCredentials>,
    /// Register the offline scripted backend for every provider without a key.
    pub scripted: bool,
}

impl ProviderSettings {
    pub fn credentials(&self, kind: ProviderKind) -> Option<&ProviderCredentials> {
        match kind {
            ProviderKind::OpenAi => self.openai.as_ref(),
            ProviderKind::Anthropic => self.anthropic.as_ref(),
            ProviderKind::Google => self.google.as_ref(),
        }
    }
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    /// HS256 secret for bearer tokens. `None` means the dev default is used.
    pub jwt_secret: Option<String>,
    /// Shared secret of the media workers (`X-Worker-Token`).
    pub worker_token: Option<String>,
    /// Postgres when set, in-memory stores otherwise.
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub providers: ProviderSettings,
    pub timeouts: ProviderTimeouts,
    pub streamer: StreamerConfig,
    pub executor: JobExecutorConfig,
    pub log: LogConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            jwt_secret: None,
            worker_token: None,
            database_url: None,
            database_max_connections: DEFAULT_MAX_CONNECTIONS,
            providers: ProviderSettings::default(),
            timeouts: ProviderTimeouts::default(),
            streamer: StreamerConfig::default(),
            executor: JobExecutorConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "<redacted>");
        f.debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("jwt_secret", &redact(&self.jwt_secret))
            .field("worker_token", &redact(&self.worker_token))
            .field("database_url", &redact(&self.database_url))
            .field("database_max_connections", &self.database_max_connections)
            .field("providers", &self.providers)
            .field("timeouts", &self.timeouts)
            .field("streamer", &self.streamer)
            .field("executor", &self.executor)
            .field("log", &self.log)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Blank values count as missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let bind_addr = parse_or(&get, "BIND_ADDR", DEFAULT_BIND_ADDR.parse().ok())?
            .unwrap_or(defaults.bind_addr);

        let credentials = |key: &'static str, url: &'static str| {
            get(key).map(|api_key| ProviderCredentials {
                api_key,
                base_url: get(url),
            })
        };
        let providers = ProviderSettings {
            openai: credentials("OPENAI_API_KEY", "OPENAI_BASE_URL"),
            anthropic: credentials("ANTHROPIC_API_KEY", "ANTHROPIC_BASE_URL"),
            google: credentials("GOOGLE_API_KEY", "GOOGLE_BASE_URL"),
            scripted: parse_or(&get, "PULSE_SCRIPTED_PROVIDER", None)?.unwrap_or(false),
        };

        let timeouts = ProviderTimeouts {
            chat: secs(&get, "CHAT_TIMEOUT_SECS")?.unwrap_or(defaults.timeouts.chat),
        };

        let mut streamer = defaults.streamer;
        if let Some(interval) = secs(&get, "STATUS_POLL_INTERVAL_SECS")? {
            streamer = streamer.with_poll_interval(interval);
        }
        if let Some(attempts) = parse_or::<u32, _>(&get, "STATUS_POLL_MAX_ATTEMPTS", None)? {
            streamer = streamer.with_max_attempts(attempts);
        }

        let mut executor = defaults.executor;
        if let Some(max) = parse_or::<usize, _>(&get, "JOB_MAX_CONCURRENT", None)? {
            executor = executor.with_max_concurrent(max);
        }
        if let Some(timeout) = secs(&get, "JOB_TIMEOUT_SECS")? {
            executor = executor.with_timeout(timeout);
        }

        let mut log = defaults.log;
        if let Some(format) = get("LOG_FORMAT") {
            let format = LogFormat::from_str(&format).map_err(|_| ConfigError::Invalid {
                key: "LOG_FORMAT",
                value: format.clone(),
            })?;
            log = log.with_format(format);
        }
        if let Some(level) = get("LOG_LEVEL") {
            log = log.with_level(level);
        }

        Ok(Self {
            bind_addr,
            jwt_secret: get("JWT_SECRET"),
            worker_token: get("WORKER_TOKEN"),
            database_url: get("DATABASE_URL"),
            database_max_connections: parse_or(&get, "DATABASE_MAX_CONNECTIONS", None)?
                .unwrap_or(defaults.database_max_connections),
            providers,
            timeouts,
            streamer,
            executor,
            log,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, fallback: Option<T>) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(fallback),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

fn secs<G>(get: &G, key: &'static str) -> Result<Option<Duration>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match parse_or::<u64, _>(get, key, None)? {
        Some(0) => Err(ConfigError::Invalid {
            key,
            value: "0".to_string(),
        }),
        other => Ok(other.map(Duration::from_secs)),
    }
}
