//! Native dialog channel: a modal prompt presented by a subprocess
//! (`osascript` on macOS by default; any command taking `-e <script>`
//! works). The race owner kills the process when another channel wins.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::types::{default_action, ConfirmationAction, ConfirmationOption};

#[derive(Debug, Clone)]
pub struct DialogChannel {
    command: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DialogError {
    #[error("dialog channel not configured")]
    NotConfigured,
    #[error("dialog subprocess failed: {0}")]
    Spawn(std::io::Error),
    #[error("dialog timed out")]
    Timeout,
}

impl DialogChannel {
    pub fn new(command: &str) -> Option<Self> {
        if command.is_empty() {
            return None;
        }
        Some(Self { command: command.to_string() })
    }

    fn build_script(
        &self,
        title: &str,
        message: &str,
        options: &[ConfirmationOption],
        timeout: Duration,
    ) -> String {
        let buttons = options
            .iter()
            .map(|o| format!("\"{}\"", o.label))
            .collect::<Vec<_>>()
            .join(", ");
        let default_label = options
            .iter()
            .find(|o| o.is_default)
            .or_else(|| options.first())
            .map(|o| o.label.clone())
            .unwrap_or_else(|| "OK".to_string());
        let escaped = message.replace('"', "\\\"");

        format!(
            "tell application \"System Events\"\n\
             display dialog \"{escaped}\" \
             with title \"{title}\" \
             buttons {{{buttons}}} \
             default button \"{default_label}\" \
             giving up after {} \
             with icon caution\n\
             end tell",
            timeout.as_secs()
        )
    }

    fn parse_result(output: &str, options: &[ConfirmationOption]) -> ConfirmationAction {
        if output.is_empty() || output.contains("gave up:true") {
            return default_action(options);
        }
        // Output shape: "button returned:Execute Anyway, gave up:false".
        if let Some(rest) = output.split("button returned:").nth(1) {
            let label = rest.split(',').next().unwrap_or("").trim();
            for opt in options {
                if opt.label == label {
                    return opt.action;
                }
            }
        }
        for opt in options {
            if output.contains(opt.label.as_str()) {
                return opt.action;
            }
        }
        default_action(options)
    }

    /// Present the dialog and wait for the operator's pick. The subprocess
    /// is killed when this future is dropped (race lost).
    pub async fn present(
        &self,
        title: &str,
        message: &str,
        options: &[ConfirmationOption],
        timeout: Duration,
    ) -> Result<ConfirmationAction, DialogError> {
        let mut parts = self.command.split_whitespace();
        let Some(program) = parts.next() else {
            return Err(DialogError::NotConfigured);
        };
        let script = self.build_script(title, message, options, timeout);

        let mut child = Command::new(program)
            .args(parts)
            .arg("-e")
            .arg(&script)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(DialogError::Spawn)?;

        let mut stdout = String::new();
        let wait = async {
            if let Some(mut pipe) = child.stdout.take() {
                let _ = pipe.read_to_string(&mut stdout).await;
            }
            let _ = child.wait().await;
        };

        // Generous buffer past the dialog's own give-up timer.
        match tokio::time::timeout(timeout + Duration::from_secs(10), wait).await {
            Ok(()) => Ok(Self::parse_result(stdout.trim(), options)),
            Err(_) => {
                let _ = child.kill().await;
                Err(DialogError::Timeout)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::validation_options;

    #[test]
    fn parse_button_returned() {
        let options = validation_options();
        assert_eq!(
            DialogChannel::parse_result("button returned:Execute Anyway, gave up:false", &options),
            ConfirmationAction::ExecuteAnyway
        );
        assert_eq!(
            DialogChannel::parse_result("button returned:Reject Signal, gave up:false", &options),
            ConfirmationAction::Reject
        );
    }

    #[test]
    fn gave_up_and_empty_take_default() {
        let options = validation_options();
        assert_eq!(
            DialogChannel::parse_result("button returned:, gave up:true", &options),
            ConfirmationAction::Reject
        );
        assert_eq!(DialogChannel::parse_result("", &options), ConfirmationAction::Reject);
    }

    #[test]
    fn unknown_button_falls_back_to_default() {
        let options = validation_options();
        assert_eq!(
            DialogChannel::parse_result("button returned:Whatever", &options),
            ConfirmationAction::Reject
        );
    }

    #[tokio::test]
    async fn subprocess_output_resolves_action() {
        // `echo` prints the script straight back; the parser falls through to
        // substring matching and picks the first option label it finds.
        let channel = DialogChannel::new("echo").unwrap();
        let options = validation_options();
        let action = channel
            .present("Confirm", "divergence too high", &options, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(action, ConfirmationAction::Reject);
    }
}
