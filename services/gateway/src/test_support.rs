//! Shared fixtures for unit tests.

use crate::config::Config;
use std::sync::Arc;
use std::time::Duration;

/// A fully populated config with fast timings for tests. The closure tweaks
/// whatever the test under hand cares about.
pub(crate) fn test_config(adjust: impl FnOnce(&mut Config)) -> Arc<Config> {
    let mut config = Config {
        bind_address: "127.0.0.1:0".parse().expect("valid test address"),
        log_level: tracing::Level::INFO,
        speech_region: "westus2".into(),
        speech_key: "test-speech-key".into(),
        default_tts_voice: "en-US-JennyMultilingualV2Neural".into(),
        stt_locales: vec!["en-US".into()],
        ice_server_url: None,
        ice_server_url_remote: None,
        ice_server_username: None,
        ice_server_password: None,
        openai_api_key: "test-openai-key".into(),
        openai_api_base: None,
        chat_model: "gpt-4o".into(),
        system_prompt: "You are a helpful voice assistant.".into(),
        auto_reconnect: true,
        reconnect_staleness: Duration::from_secs(300),
        ready_grace: Duration::from_secs(5),
        idle_disconnect: false,
        idle_switch_after: Duration::from_secs(120),
        session_max_idle: Duration::from_secs(1800),
        repeat_speaking_sentence_after_reconnection: true,
        pool_capacity: 2,
        pool_stale_after: Duration::from_secs(300),
        negotiation_timeout: Duration::from_secs(15),
        connect_retry_attempts: 5,
        connect_retry_backoff: Duration::from_millis(10),
        chat_quiet_period: Duration::from_millis(100),
        status_poll_interval: Duration::from_secs(5),
        freeze_probe_interval: Duration::from_secs(10),
        idle_sweep_interval: Duration::from_secs(30),
        prewarm_interval: Duration::from_secs(5),
    };
    adjust(&mut config);
    Arc::new(config)
}
