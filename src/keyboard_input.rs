use crate::error::{LmConnectError, Result};
use crossterm::event::{self, Event, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use crossterm::tty::IsTty;
use std::time::Duration;
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Why a key wait returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyWait {
    Pressed,
    Cancelled,
    /// Standard input is not a terminal
    NoTerminal,
}

/// Single keypress wait on the controlling terminal
pub struct KeyboardInputHandler {
    cancellation_token: CancellationToken,
}

impl KeyboardInputHandler {
    pub fn new() -> Self {
        Self {
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn with_cancellation_token(cancellation_token: CancellationToken) -> Self {
        Self { cancellation_token }
    }

    /// Block until any key is pressed, the token is cancelled, or it turns out
    /// there is no terminal to read from
    pub async fn wait_for_any_key(&self) -> Result<KeyWait> {
        if !std::io::stdin().is_tty() {
            debug!("Standard input is not a terminal, not waiting for a key");
            return Ok(KeyWait::NoTerminal);
        }

        let cancellation_token = self.cancellation_token.clone();

        task::spawn_blocking(move || {
            // Raw mode delivers single key presses without waiting for Enter
            if let Err(e) = enable_raw_mode() {
                error!("Failed to enable raw mode for keyboard input: {}", e);
                return KeyWait::NoTerminal;
            }

            let outcome = loop {
                if cancellation_token.is_cancelled() {
                    break KeyWait::Cancelled;
                }

                match event::poll(Duration::from_millis(100)) {
                    Ok(true) => {
                        if let Ok(Event::Key(key_event)) = event::read() {
                            // Only handle key press events (not release)
                            if key_event.kind == KeyEventKind::Press {
                                debug!("Key pressed: {:?}", key_event.code);
                                break KeyWait::Pressed;
                            }
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!("Error polling for keyboard events: {}", e);
                        break KeyWait::NoTerminal;
                    }
                }
            };

            if let Err(e) = disable_raw_mode() {
                error!("Failed to disable raw mode: {}", e);
            }

            outcome
        })
        .await
        .map_err(|e| LmConnectError::system(format!("Keyboard task failed: {}", e)))
    }

}

impl Default for KeyboardInputHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stopped_handler_does_not_block() {
        let token = CancellationToken::new();
        token.cancel();
        let handler = KeyboardInputHandler::with_cancellation_token(token);

        let outcome = tokio::time::timeout(Duration::from_secs(2), handler.wait_for_any_key())
            .await
            .unwrap()
            .unwrap();

        // Under a test harness stdin is usually not a terminal
        assert!(matches!(outcome, KeyWait::Cancelled | KeyWait::NoTerminal));
    }
}
