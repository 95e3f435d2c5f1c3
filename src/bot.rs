// outpost: Chat bot front - long-poll loop against the Telegram bot API

use crate::error::{OutpostError, OutpostResult};
use crate::pipeline::{Command, CommandPipeline};
use crate::ratelimit::RateLimiter;
use crate::ringlog::DaemonLogger;
use crate::supervisor::SharedState;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on command execution for the bot front
const BOT_COMMAND_TIMEOUT_SEC: u64 = 30;
/// Long-poll duration requested from the API
const LONG_POLL_SEC: u64 = 30;
/// Pause between polls after an API failure
const RETRY_DELAY_SEC: u64 = 5;
/// Per-chat message ceiling per second
const PER_CHAT_LIMIT: u32 = 5;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TelegramBotConfig {
    #[serde(rename = "AuthorizationToken", default)]
    pub authorization_token: String,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    chat: Chat,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

/// Telegram bot front. Keeps only an in-memory last-seen update id; every
/// text message goes through the command pipeline and the combined text is
/// sent back as the reply.
pub struct TelegramBot {
    config: TelegramBotConfig,
    pipeline: Arc<CommandPipeline>,
    rate_limit: Arc<RateLimiter>,
    client: reqwest::Client,
    logger: DaemonLogger,
    shared: SharedState,
}

impl TelegramBot {
    pub fn new(
        config: TelegramBotConfig,
        pipeline: Arc<CommandPipeline>,
        shared: SharedState,
    ) -> OutpostResult<Self> {
        if config.authorization_token.is_empty() {
            return Err(OutpostError::ConfigError(
                "TelegramBot.AuthorizationToken must not be empty".to_string(),
            ));
        }
        let logger = DaemonLogger::new("TELEGRAM", "", shared.logs.clone());
        let rate_limit = Arc::new(RateLimiter::new(PER_CHAT_LIMIT, logger.clone()));
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(LONG_POLL_SEC + 10))
            .build()
            .map_err(|err| OutpostError::ConfigError(err.to_string()))?;
        Ok(Self {
            config,
            pipeline,
            rate_limit,
            client,
            logger,
            shared,
        })
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "https://api.telegram.org/bot{}/{}",
            self.config.authorization_token, method
        )
    }

    /// Poll for updates and block the caller. A failing identity check is
    /// how a bad token surfaces, so it aborts straight away.
    pub async fn start_and_block(&self) -> OutpostResult<()> {
        let identity = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|err| OutpostError::NetworkError(format!("getMe failed - {}", err)))?;
        if !identity.status().is_success() {
            return Err(OutpostError::NetworkError(format!(
                "getMe replied with status {}",
                identity.status()
            )));
        }
        self.logger.info("start_and_block", "", "going to poll for messages");
        let mut shutdown = self.shared.subscribe_shutdown();
        let mut offset: i64 = 0;
        loop {
            if self.shared.is_locked_down() {
                return Err(OutpostError::EmergencyLockDown);
            }
            let poll = self.poll_once(offset);
            let updates = tokio::select! {
                _ = shutdown.changed() => return self.shared.exit_status(),
                updates = poll => updates,
            };
            match updates {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        self.handle_update(update).await;
                    }
                }
                Err(err) => {
                    self.logger
                        .warning("start_and_block", "", &format!("poll failed - {}", err));
                    tokio::time::sleep(Duration::from_secs(RETRY_DELAY_SEC)).await;
                }
            }
        }
    }

    async fn poll_once(&self, offset: i64) -> OutpostResult<Vec<Update>> {
        let response = self
            .client
            .get(self.api_url("getUpdates"))
            .query(&[("offset", offset.to_string()), ("timeout", LONG_POLL_SEC.to_string())])
            .send()
            .await
            .map_err(|err| OutpostError::NetworkError(err.to_string()))?;
        let envelope: ApiEnvelope<Vec<Update>> = response
            .json()
            .await
            .map_err(|err| OutpostError::NetworkError(err.to_string()))?;
        if !envelope.ok {
            return Err(OutpostError::NetworkError(
                "getUpdates replied ok=false".to_string(),
            ));
        }
        Ok(envelope.result.unwrap_or_default())
    }

    async fn handle_update(&self, update: Update) {
        let Some(message) = update.message else {
            return;
        };
        let Some(text) = message.text else {
            return;
        };
        let chat_id = message.chat.id;
        if !self.rate_limit.add(&chat_id.to_string(), false) {
            return;
        }
        let (_, result) = self
            .pipeline
            .transform(Command::new(text, BOT_COMMAND_TIMEOUT_SEC, "telegram"))
            .await;
        let reply = serde_json::json!({
            "chat_id": chat_id,
            "text": result.combined_text,
        });
        if let Err(err) = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&reply)
            .send()
            .await
        {
            self.logger.warning(
                "handle_update",
                &chat_id.to_string(),
                &format!("failed to send reply - {}", err),
            );
        }
    }
}
