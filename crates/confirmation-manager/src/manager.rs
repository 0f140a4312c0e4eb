use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::dialog::DialogChannel;
use crate::telegram::TelegramChannel;
use crate::types::{
    default_action, ConfirmationAction, ConfirmationOption, ConfirmationResult, ConfirmationType,
    ResponseSource,
};

struct PendingEntry {
    responder: oneshot::Sender<ConfirmationAction>,
}

/// Dual-channel confirmation manager.
///
/// Every request fans out to the native dialog and the chat bot at once,
/// plus a timeout task; the first resolution wins and the losing channel is
/// cancelled (subprocess killed, chat message edited to show the outcome).
/// If a channel errors the other keeps running; if every channel errors the
/// caller-marked default is taken with source `error`.
pub struct ConfirmationManager {
    chat: Option<TelegramChannel>,
    dialog: Option<DialogChannel>,
    default_timeout: Duration,
    pending: DashMap<String, PendingEntry>,
}

enum ChannelOutcome {
    Resolved { action: ConfirmationAction, source: ResponseSource },
    Failed,
}

impl ConfirmationManager {
    pub fn new(
        chat: Option<TelegramChannel>,
        dialog: Option<DialogChannel>,
        default_timeout: Duration,
    ) -> Self {
        tracing::info!(
            chat = chat.is_some(),
            dialog = dialog.is_some(),
            timeout_secs = default_timeout.as_secs(),
            "confirmation manager initialized"
        );
        Self { chat, dialog, default_timeout, pending: DashMap::new() }
    }

    /// Resolve a chat button press (`confirm:{id}:{action}`). Returns the
    /// acknowledgement text shown to the user; late presses on resolved
    /// confirmations are answered as expired.
    pub fn handle_chat_callback(&self, data: &str) -> String {
        let mut parts = data.split(':');
        let (Some("confirm"), Some(id), Some(action_str)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return "Unrecognized action".to_string();
        };
        let Some(action) = ConfirmationAction::parse(action_str) else {
            tracing::warn!(action = action_str, "invalid action in chat callback");
            return "Invalid action".to_string();
        };
        match self.pending.remove(id) {
            Some((_, entry)) => {
                let _ = entry.responder.send(action);
                tracing::info!(confirmation_id = id, action = action.as_str(), "chat response received");
                format!("Selected: {}", action.as_str().replace('_', " "))
            }
            None => "Confirmation expired or already resolved".to_string(),
        }
    }

    pub async fn request_confirmation(
        &self,
        confirmation_type: ConfirmationType,
        context: &BTreeMap<String, String>,
        options: &[ConfirmationOption],
        timeout: Option<Duration>,
    ) -> ConfirmationResult {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let confirmation_id = Uuid::new_v4().to_string()[..8].to_string();
        let fallback = default_action(options);
        let started = Instant::now();

        tracing::info!(
            confirmation_id = %confirmation_id,
            kind = confirmation_type.as_str(),
            timeout_secs = timeout.as_secs(),
            "confirmation requested"
        );

        let (tx, mut rx) = mpsc::channel::<ChannelOutcome>(4);
        let mut active_channels = 0usize;
        let mut tasks = Vec::new();
        // Outbound chat message id, shared so the cleanup path can edit the
        // prompt even when another channel won the race.
        let chat_message_slot: Arc<std::sync::Mutex<Option<i64>>> =
            Arc::new(std::sync::Mutex::new(None));

        // Chat channel: send the prompt, then wait for the callback routed
        // through the pending map.
        if let Some(chat) = self.chat.clone() {
            active_channels += 1;
            let (responder, receiver) = oneshot::channel();
            self.pending.insert(confirmation_id.clone(), PendingEntry { responder });

            let text = format_chat_prompt(confirmation_type, context, timeout);
            let chat_options = options.to_vec();
            let id = confirmation_id.clone();
            let tx = tx.clone();
            let slot = chat_message_slot.clone();
            tasks.push(tokio::spawn(async move {
                let message_id = match chat.send_prompt(&id, &text, &chat_options).await {
                    Ok(message_id) => message_id,
                    Err(e) => {
                        tracing::error!(error = %e, "chat channel failed");
                        let _ = tx.send(ChannelOutcome::Failed).await;
                        return;
                    }
                };
                *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(message_id);
                match receiver.await {
                    Ok(action) => {
                        let _ = tx
                            .send(ChannelOutcome::Resolved {
                                action,
                                source: ResponseSource::Chat,
                            })
                            .await;
                    }
                    Err(_) => {
                        // Race resolved elsewhere; nothing to report.
                    }
                }
            }));
        }

        // Dialog channel: modal subprocess.
        if let Some(dialog) = self.dialog.clone() {
            active_channels += 1;
            let title = "Trading Confirmation".to_string();
            let message = format_dialog_message(confirmation_type, context, timeout);
            let dialog_options = options.to_vec();
            let tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                match dialog.present(&title, &message, &dialog_options, timeout).await {
                    Ok(action) => {
                        let _ = tx
                            .send(ChannelOutcome::Resolved {
                                action,
                                source: ResponseSource::Dialog,
                            })
                            .await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "dialog channel failed");
                        let _ = tx.send(ChannelOutcome::Failed).await;
                    }
                }
            }));
        }
        drop(tx);

        if active_channels == 0 {
            tracing::warn!("no confirmation channels configured, taking default");
            return ConfirmationResult {
                action: fallback,
                confirmation_id,
                source: ResponseSource::None,
                response_time_seconds: 0.0,
            };
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut failures = 0usize;

        let result = loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                // Timeout: the default option wins.
                Err(_) => {
                    break ConfirmationResult {
                        action: fallback,
                        confirmation_id: confirmation_id.clone(),
                        source: ResponseSource::Timeout,
                        response_time_seconds: started.elapsed().as_secs_f64(),
                    };
                }
                Ok(Some(ChannelOutcome::Resolved { action, source })) => {
                    break ConfirmationResult {
                        action,
                        confirmation_id: confirmation_id.clone(),
                        source,
                        response_time_seconds: started.elapsed().as_secs_f64(),
                    };
                }
                Ok(Some(ChannelOutcome::Failed)) => {
                    failures += 1;
                    if failures == active_channels {
                        break ConfirmationResult {
                            action: fallback,
                            confirmation_id: confirmation_id.clone(),
                            source: ResponseSource::Error,
                            response_time_seconds: started.elapsed().as_secs_f64(),
                        };
                    }
                }
                Ok(None) => {
                    break ConfirmationResult {
                        action: fallback,
                        confirmation_id: confirmation_id.clone(),
                        source: ResponseSource::Error,
                        response_time_seconds: started.elapsed().as_secs_f64(),
                    };
                }
            }
        };

        // Cancel the losing channel: abort tasks (killing the dialog
        // subprocess), drop the pending entry, edit the chat prompt.
        for task in &tasks {
            task.abort();
        }
        self.pending.remove(&confirmation_id);

        if let Some(chat) = &self.chat {
            let message_id = *chat_message_slot.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(message_id) = message_id {
                let text = format_resolution(confirmation_type, &result);
                if let Err(e) = chat.edit_resolution(message_id, &text).await {
                    tracing::warn!(error = %e, "failed to edit chat resolution");
                }
            }
        }

        tracing::info!(
            confirmation_id = %result.confirmation_id,
            action = result.action.as_str(),
            source = ?result.source,
            response_secs = result.response_time_seconds,
            "confirmation resolved"
        );
        result
    }
}

fn format_chat_prompt(
    kind: ConfirmationType,
    context: &BTreeMap<String, String>,
    timeout: Duration,
) -> String {
    let mut lines = vec![format!("<b>{}</b>", kind.as_str().replace('_', " ").to_uppercase()), String::new()];
    for (key, value) in context {
        lines.push(format!("<b>{}:</b> {}", escape_html(key), escape_html(value)));
    }
    lines.push(String::new());
    lines.push(format!("Timeout: auto-select default in {}s", timeout.as_secs()));
    lines.join("\n")
}

fn format_dialog_message(
    kind: ConfirmationType,
    context: &BTreeMap<String, String>,
    timeout: Duration,
) -> String {
    let mut parts = vec![format!("[{}]", kind.as_str().replace('_', " ").to_uppercase())];
    for (key, value) in context {
        parts.push(format!("{key}: {value}"));
    }
    parts.push(format!("Timeout: {}s", timeout.as_secs()));
    parts.join("\n")
}

fn format_resolution(kind: ConfirmationType, result: &ConfirmationResult) -> String {
    format!(
        "[RESOLVED] <b>{}</b>\n\nAction: <b>{}</b>\nSource: {:?}\nResponse time: {:.1}s",
        kind.as_str().replace('_', " ").to_uppercase(),
        result.action.as_str().replace('_', " "),
        result.source,
        result.response_time_seconds,
    )
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::validation_options;

    fn context() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("instrument".to_string(), "BANK_NIFTY".to_string()),
            ("reason".to_string(), "signal_stale".to_string()),
        ])
    }

    #[tokio::test]
    async fn no_channels_returns_default_immediately() {
        let manager = ConfirmationManager::new(None, None, Duration::from_secs(1));
        let result = manager
            .request_confirmation(
                ConfirmationType::ValidationFailed,
                &context(),
                &validation_options(),
                None,
            )
            .await;
        assert_eq!(result.action, ConfirmationAction::Reject);
        assert_eq!(result.source, ResponseSource::None);
    }

    #[tokio::test]
    async fn dialog_resolution_wins_over_timeout() {
        // `echo` returns instantly; its output matches the default label.
        let dialog = DialogChannel::new("echo");
        let manager = ConfirmationManager::new(None, dialog, Duration::from_secs(30));
        let result = manager
            .request_confirmation(
                ConfirmationType::SlippageExceeded,
                &context(),
                &validation_options(),
                Some(Duration::from_secs(30)),
            )
            .await;
        assert_eq!(result.source, ResponseSource::Dialog);
        assert!(result.response_time_seconds < 10.0);
    }

    #[tokio::test]
    async fn failing_dialog_falls_back_to_default_with_error_source() {
        // Nonexistent command: the only channel errors out.
        let dialog = DialogChannel::new("/nonexistent/dialog-binary");
        let manager = ConfirmationManager::new(None, dialog, Duration::from_secs(5));
        let result = manager
            .request_confirmation(
                ConfirmationType::OrderFailed,
                &context(),
                &validation_options(),
                Some(Duration::from_secs(5)),
            )
            .await;
        assert_eq!(result.action, ConfirmationAction::Reject);
        assert_eq!(result.source, ResponseSource::Error);
    }

    #[tokio::test]
    async fn chat_callback_resolves_pending_entry() {
        let manager = Arc::new(ConfirmationManager::new(None, None, Duration::from_secs(1)));

        // Register a pending entry by hand, as the chat task would.
        let (responder, receiver) = oneshot::channel();
        manager.pending.insert("abc12345".to_string(), PendingEntry { responder });

        let ack = manager.handle_chat_callback("confirm:abc12345:execute_anyway");
        assert!(ack.starts_with("Selected"));
        assert_eq!(receiver.await.unwrap(), ConfirmationAction::ExecuteAnyway);

        // Second press: already resolved.
        let ack = manager.handle_chat_callback("confirm:abc12345:reject");
        assert_eq!(ack, "Confirmation expired or already resolved");
    }

    #[tokio::test]
    async fn malformed_callbacks_are_rejected() {
        let manager = ConfirmationManager::new(None, None, Duration::from_secs(1));
        assert_eq!(manager.handle_chat_callback("nope"), "Unrecognized action");
        assert_eq!(manager.handle_chat_callback("confirm:id:launch_missiles"), "Invalid action");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_takes_default() {
        use std::os::unix::fs::PermissionsExt;

        // A dialog stub that never answers: the manager-level timeout wins.
        let stub = std::env::temp_dir().join("confirm-dialog-slow-stub.sh");
        std::fs::write(&stub, "#!/bin/sh\nsleep 100\n").unwrap();
        std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();

        let dialog = DialogChannel::new(stub.to_str().unwrap());
        let manager = ConfirmationManager::new(None, dialog, Duration::from_millis(100));
        let result = manager
            .request_confirmation(
                ConfirmationType::ValidationFailed,
                &context(),
                &validation_options(),
                Some(Duration::from_millis(100)),
            )
            .await;
        assert_eq!(result.action, ConfirmationAction::Reject);
        assert_eq!(result.source, ResponseSource::Timeout);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dialog_button_press_wins_race() {
        use std::os::unix::fs::PermissionsExt;

        // A dialog stub that immediately "presses" Execute Anyway.
        let stub = std::env::temp_dir().join("confirm-dialog-press-stub.sh");
        std::fs::write(
            &stub,
            "#!/bin/sh\necho 'button returned:Execute Anyway, gave up:false'\n",
        )
        .unwrap();
        std::fs::set_permissions(&stub, std::fs::Permissions::from_mode(0o755)).unwrap();

        let dialog = DialogChannel::new(stub.to_str().unwrap());
        let manager = ConfirmationManager::new(None, dialog, Duration::from_secs(30));
        let result = manager
            .request_confirmation(
                ConfirmationType::ValidationFailed,
                &context(),
                &validation_options(),
                None,
            )
            .await;
        assert_eq!(result.action, ConfirmationAction::ExecuteAnyway);
        assert_eq!(result.source, ResponseSource::Dialog);
    }
}
