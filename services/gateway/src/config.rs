use std::net::SocketAddr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub log_level: Level,

    // Speech services
    pub speech_region: String,
    pub speech_key: String,
    pub default_tts_voice: String,
    pub stt_locales: Vec<String>,

    // Relay (ICE) overrides; when unset the relay token endpoint is used
    pub ice_server_url: Option<String>,
    pub ice_server_url_remote: Option<String>,
    pub ice_server_username: Option<String>,
    pub ice_server_password: Option<String>,

    // Chat service
    pub openai_api_key: String,
    pub openai_api_base: Option<String>,
    pub chat_model: String,
    pub system_prompt: String,

    // Session lifecycle
    pub auto_reconnect: bool,
    pub reconnect_staleness: Duration,
    pub ready_grace: Duration,
    pub idle_disconnect: bool,
    pub idle_switch_after: Duration,
    pub session_max_idle: Duration,
    pub repeat_speaking_sentence_after_reconnection: bool,

    // Connection pool
    pub pool_capacity: usize,
    pub pool_stale_after: Duration,
    pub negotiation_timeout: Duration,
    pub connect_retry_attempts: u32,
    pub connect_retry_backoff: Duration,

    // Streaming chat relay
    pub chat_quiet_period: Duration,

    // Detector cadence
    pub status_poll_interval: Duration,
    pub freeze_probe_interval: Duration,
    pub idle_sweep_interval: Duration,
    pub prewarm_interval: Duration,
}

fn var(name: &str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingVar(name.to_string()))
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), raw)),
        Err(_) => Ok(default),
    }
}

fn secs_var(name: &str, default_secs: u64) -> Result<Duration, ConfigError> {
    parse_var(name, default_secs).map(Duration::from_secs)
}

fn millis_var(name: &str, default_ms: u64) -> Result<Duration, ConfigError> {
    parse_var(name, default_ms).map(Duration::from_millis)
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let speech_region = var("SPEECH_REGION")?;
        let speech_key = var("SPEECH_KEY")?;
        let default_tts_voice = std::env::var("DEFAULT_TTS_VOICE")
            .unwrap_or_else(|_| "en-US-JennyMultilingualV2Neural".to_string());
        let stt_locales = std::env::var("STT_LOCALES")
            .unwrap_or_else(|_| "en-US".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        if stt_locales.is_empty() {
            return Err(ConfigError::InvalidValue(
                "STT_LOCALES".to_string(),
                "at least one locale is required".to_string(),
            ));
        }

        let ice_server_url = std::env::var("ICE_SERVER_URL").ok();
        let ice_server_url_remote = std::env::var("ICE_SERVER_URL_REMOTE").ok();
        let ice_server_username = std::env::var("ICE_SERVER_USERNAME").ok();
        let ice_server_password = std::env::var("ICE_SERVER_PASSWORD").ok();
        // A custom relay is all-or-nothing: a URL without credentials cannot
        // be handed to a client.
        if ice_server_url.is_some()
            && (ice_server_username.is_none() || ice_server_password.is_none())
        {
            return Err(ConfigError::MissingVar(
                "ICE_SERVER_USERNAME and ICE_SERVER_PASSWORD must be set with ICE_SERVER_URL"
                    .to_string(),
            ));
        }

        let openai_api_key = var("OPENAI_API_KEY")?;
        let openai_api_base = std::env::var("OPENAI_API_BASE").ok();
        let chat_model = std::env::var("CHAT_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());
        let system_prompt = std::env::var("SYSTEM_PROMPT")
            .unwrap_or_else(|_| "You are a helpful voice assistant.".to_string());

        let pool_capacity = parse_var("POOL_CAPACITY", 2usize)?;
        if pool_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "POOL_CAPACITY".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            bind_address,
            log_level,
            speech_region,
            speech_key,
            default_tts_voice,
            stt_locales,
            ice_server_url,
            ice_server_url_remote,
            ice_server_username,
            ice_server_password,
            openai_api_key,
            openai_api_base,
            chat_model,
            system_prompt,
            auto_reconnect: parse_var("AUTO_RECONNECT", true)?,
            reconnect_staleness: secs_var("RECONNECT_STALENESS_SECS", 300)?,
            ready_grace: secs_var("READY_GRACE_SECS", 5)?,
            idle_disconnect: parse_var("IDLE_DISCONNECT", false)?,
            idle_switch_after: secs_var("IDLE_SWITCH_SECS", 120)?,
            session_max_idle: secs_var("SESSION_MAX_IDLE_SECS", 1800)?,
            repeat_speaking_sentence_after_reconnection: parse_var(
                "REPEAT_SPEAKING_SENTENCE",
                true,
            )?,
            pool_capacity,
            pool_stale_after: secs_var("POOL_STALE_SECS", 300)?,
            negotiation_timeout: secs_var("NEGOTIATION_TIMEOUT_SECS", 15)?,
            connect_retry_attempts: parse_var("CONNECT_RETRY_ATTEMPTS", 10u32)?,
            connect_retry_backoff: millis_var("CONNECT_RETRY_BACKOFF_MS", 500)?,
            chat_quiet_period: millis_var("CHAT_QUIET_PERIOD_MS", 1000)?,
            status_poll_interval: secs_var("STATUS_POLL_SECS", 5)?,
            freeze_probe_interval: secs_var("FREEZE_PROBE_SECS", 10)?,
            idle_sweep_interval: secs_var("IDLE_SWEEP_SECS", 30)?,
            prewarm_interval: secs_var("PREWARM_INTERVAL_SECS", 5)?,
        })
    }
}
