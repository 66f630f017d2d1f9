//! Token refresh for the speech and relay services.
//!
//! The synthesis service authenticates with a short-lived speech token and
//! hands out relay (ICE) credentials through a separate token endpoint. Both
//! are refreshed by background loops: the speech token roughly every nine
//! minutes (it expires at ten), the relay token daily. A failed refresh keeps
//! the previous value and retries on the next tick.

use crate::config::Config;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

const SPEECH_TOKEN_REFRESH: Duration = Duration::from_secs(60 * 9);
const RELAY_TOKEN_REFRESH: Duration = Duration::from_secs(60 * 60 * 24);

/// A TURN/STUN server entry handed to clients for media negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, serde::Serialize)]
pub struct IceServer {
    #[serde(rename = "Urls")]
    pub urls: Vec<String>,
    #[serde(rename = "Username")]
    pub username: String,
    #[serde(rename = "Password")]
    pub credential: String,
}

/// Shared cache of the current speech and relay tokens.
#[derive(Clone)]
pub struct TokenCache {
    http: reqwest::Client,
    config: Arc<Config>,
    speech_token: Arc<RwLock<Option<String>>>,
    relay_token: Arc<RwLock<Option<IceServer>>>,
}

impl TokenCache {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            speech_token: Arc::new(RwLock::new(None)),
            relay_token: Arc::new(RwLock::new(None)),
        }
    }

    /// The current speech token, if a refresh has succeeded yet.
    pub fn speech_token(&self) -> Option<String> {
        self.speech_token.read().expect("token lock poisoned").clone()
    }

    /// Relay credentials for a new negotiation. A statically configured relay
    /// takes precedence over the token endpoint.
    pub fn ice_server(&self) -> Option<IceServer> {
        if let (Some(url), Some(username), Some(credential)) = (
            &self.config.ice_server_url,
            &self.config.ice_server_username,
            &self.config.ice_server_password,
        ) {
            let url = self
                .config
                .ice_server_url_remote
                .as_ref()
                .unwrap_or(url)
                .clone();
            return Some(IceServer {
                urls: vec![url],
                username: username.clone(),
                credential: credential.clone(),
            });
        }
        self.relay_token.read().expect("token lock poisoned").clone()
    }

    async fn refresh_speech_token(&self) -> Result<()> {
        let url = format!(
            "https://{}.api.cognitive.microsoft.com/sts/v1.0/issueToken",
            self.config.speech_region
        );
        let token = self
            .http
            .post(&url)
            .header("Ocp-Apim-Subscription-Key", &self.config.speech_key)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        *self.speech_token.write().expect("token lock poisoned") = Some(token);
        Ok(())
    }

    async fn refresh_relay_token(&self) -> Result<()> {
        let url = format!(
            "https://{}.tts.speech.microsoft.com/cognitiveservices/avatar/relay/token/v1",
            self.config.speech_region
        );
        let server: IceServer = self
            .http
            .get(&url)
            .header("Ocp-Apim-Subscription-Key", &self.config.speech_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("Relay token response was not valid JSON")?;
        *self.relay_token.write().expect("token lock poisoned") = Some(server);
        Ok(())
    }

    /// Spawns the two refresh loops. Each performs an immediate first refresh
    /// so the gateway is usable as soon as the loops have run once.
    pub fn spawn_refresh_tasks(&self) {
        let cache = self.clone();
        tokio::spawn(async move {
            loop {
                match cache.refresh_speech_token().await {
                    Ok(()) => info!("Speech token refreshed."),
                    Err(e) => warn!(error = ?e, "Speech token refresh failed; will retry."),
                }
                tokio::time::sleep(SPEECH_TOKEN_REFRESH).await;
            }
        });

        let cache = self.clone();
        tokio::spawn(async move {
            loop {
                match cache.refresh_relay_token().await {
                    Ok(()) => info!("Relay token refreshed."),
                    Err(e) => warn!(error = ?e, "Relay token refresh failed; will retry."),
                }
                tokio::time::sleep(RELAY_TOKEN_REFRESH).await;
            }
        });
    }
}
