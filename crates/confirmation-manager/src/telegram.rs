//! Chat-bot channel over the Telegram Bot API.
//!
//! Prompts go out as inline-keyboard messages; button presses come back as
//! callback queries carrying `confirm:{id}:{action}` payloads, consumed by
//! the long-poll listener and routed into the pending-confirmation map.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};

use crate::types::ConfirmationOption;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("chat channel not configured")]
    NotConfigured,
    #[error("chat request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("chat API error: {0}")]
    Api(String),
}

#[derive(Clone)]
pub struct TelegramChannel {
    client: Client,
    base_url: String,
    token: String,
    chat_id: String,
}

impl TelegramChannel {
    pub fn new(token: &str, chat_id: &str) -> Option<Self> {
        if token.is_empty() || chat_id.is_empty() {
            return None;
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .ok()?;
        Some(Self {
            client,
            base_url: "https://api.telegram.org".to_string(),
            token: token.to_string(),
            chat_id: chat_id.to_string(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.base_url, self.token)
    }

    async fn call(&self, method: &str, payload: Value) -> Result<Value, ChatError> {
        let response = self.client.post(self.method_url(method)).json(&payload).send().await?;
        let status = response.status();
        let body: Value = response.json().await?;
        if !status.is_success() || body.get("ok").and_then(Value::as_bool) != Some(true) {
            return Err(ChatError::Api(body.to_string()));
        }
        Ok(body)
    }

    /// Send the prompt with its inline keyboard; returns the message id used
    /// later to edit the resolution in.
    pub async fn send_prompt(
        &self,
        confirmation_id: &str,
        text: &str,
        options: &[ConfirmationOption],
    ) -> Result<i64, ChatError> {
        let buttons: Vec<Value> = options
            .iter()
            .map(|opt| {
                let label = if opt.is_default {
                    format!("{} (default)", opt.label)
                } else {
                    opt.label.clone()
                };
                json!({
                    "text": label,
                    "callback_data": format!("confirm:{confirmation_id}:{}", opt.action.as_str()),
                })
            })
            .collect();
        let rows: Vec<Vec<Value>> = buttons.chunks(2).map(|row| row.to_vec()).collect();

        let body = self
            .call(
                "sendMessage",
                json!({
                    "chat_id": self.chat_id,
                    "text": text,
                    "parse_mode": "HTML",
                    "reply_markup": { "inline_keyboard": rows },
                }),
            )
            .await?;

        body.pointer("/result/message_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| ChatError::Api("missing message_id".to_string()))
    }

    /// Replace the prompt with its resolution and drop the keyboard so late
    /// taps have nothing to press.
    pub async fn edit_resolution(&self, message_id: i64, text: &str) -> Result<(), ChatError> {
        self.call(
            "editMessageText",
            json!({
                "chat_id": self.chat_id,
                "message_id": message_id,
                "text": text,
                "parse_mode": "HTML",
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<(), ChatError> {
        self.call(
            "answerCallbackQuery",
            json!({ "callback_query_id": callback_id, "text": text }),
        )
        .await?;
        Ok(())
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<Value>, ChatError> {
        let body = self
            .call(
                "getUpdates",
                json!({ "offset": offset, "timeout": 25, "allowed_updates": ["callback_query"] }),
            )
            .await?;
        Ok(body.get("result").and_then(Value::as_array).cloned().unwrap_or_default())
    }
}

/// Long-poll loop feeding button presses into the handler. The handler
/// returns a short acknowledgement text for the tap.
pub fn spawn_update_listener<F>(
    channel: TelegramChannel,
    handler: Arc<F>,
) -> tokio::task::JoinHandle<()>
where
    F: Fn(&str) -> String + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut offset: i64 = 0;
        loop {
            match channel.get_updates(offset).await {
                Ok(updates) => {
                    for update in updates {
                        if let Some(id) = update.get("update_id").and_then(Value::as_i64) {
                            offset = offset.max(id + 1);
                        }
                        let Some(callback) = update.get("callback_query") else { continue };
                        let data = callback.get("data").and_then(Value::as_str).unwrap_or("");
                        let ack = handler(data);
                        if let Some(callback_id) = callback.get("id").and_then(Value::as_str) {
                            if let Err(e) = channel.answer_callback(callback_id, &ack).await {
                                tracing::warn!(error = %e, "failed to answer callback query");
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "telegram poll failed, backing off");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_requires_token_and_chat() {
        assert!(TelegramChannel::new("", "123").is_none());
        assert!(TelegramChannel::new("tok", "").is_none());
        assert!(TelegramChannel::new("tok", "123").is_some());
    }
}
