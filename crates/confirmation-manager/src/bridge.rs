//! Blocking bridge for callers outside the async runtime.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::manager::ConfirmationManager;
use crate::types::{
    default_action, ConfirmationAction, ConfirmationOption, ConfirmationResult, ConfirmationType,
    ResponseSource,
};

/// Schedules the confirmation race on the runtime and blocks the calling
/// thread with a deadline slightly past the confirmation timeout, so a hung
/// channel can never wedge the caller.
pub struct SyncConfirmationBridge {
    manager: Arc<ConfirmationManager>,
    handle: tokio::runtime::Handle,
}

const BRIDGE_SLACK: Duration = Duration::from_secs(15);

impl SyncConfirmationBridge {
    pub fn new(manager: Arc<ConfirmationManager>, handle: tokio::runtime::Handle) -> Self {
        Self { manager, handle }
    }

    pub fn request_confirmation(
        &self,
        confirmation_type: ConfirmationType,
        context: BTreeMap<String, String>,
        options: Vec<ConfirmationOption>,
        timeout: Duration,
    ) -> ConfirmationResult {
        let fallback = default_action(&options);
        let (tx, rx) = std::sync::mpsc::channel();
        let manager = self.manager.clone();

        self.handle.spawn(async move {
            let result = manager
                .request_confirmation(confirmation_type, &context, &options, Some(timeout))
                .await;
            let _ = tx.send(result);
        });

        match rx.recv_timeout(timeout + BRIDGE_SLACK) {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("confirmation bridge timed out waiting for the async race");
                ConfirmationResult {
                    action: fallback,
                    confirmation_id: "bridge-timeout".to_string(),
                    source: ResponseSource::Timeout,
                    response_time_seconds: (timeout + BRIDGE_SLACK).as_secs_f64(),
                }
            }
        }
    }
}

/// Fallback used when the bridge cannot reach the manager at all.
pub fn error_result(options: &[ConfirmationOption]) -> ConfirmationResult {
    ConfirmationResult {
        action: options
            .iter()
            .find(|o| o.is_default)
            .map(|o| o.action)
            .unwrap_or(ConfirmationAction::Cancel),
        confirmation_id: "error".to_string(),
        source: ResponseSource::Error,
        response_time_seconds: 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::validation_options;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bridge_resolves_on_a_blocking_thread() {
        let manager = Arc::new(ConfirmationManager::new(None, None, Duration::from_secs(1)));
        let bridge = SyncConfirmationBridge::new(manager, tokio::runtime::Handle::current());

        let result = tokio::task::spawn_blocking(move || {
            bridge.request_confirmation(
                ConfirmationType::ZeroLots,
                BTreeMap::new(),
                validation_options(),
                Duration::from_secs(1),
            )
        })
        .await
        .unwrap();

        // No channels configured: immediate default.
        assert_eq!(result.action, ConfirmationAction::Reject);
        assert_eq!(result.source, ResponseSource::None);
    }
}
