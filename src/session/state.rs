use super::SessionController;
use crate::error::{LmConnectError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// Lifecycle of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Uninitialized,
    Authorizing,
    Discovering,
    AwaitingSelection,
    Connecting,
    Configuring,
    Streaming,
    Draining,
    Disconnecting,
    Closed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            (current, Failed) => !current.is_terminal(),
            (Uninitialized, Authorizing)
            | (Authorizing, Discovering)
            | (Discovering, AwaitingSelection)
            | (AwaitingSelection, Connecting)
            | (Connecting, Configuring)
            | (Configuring, Streaming)
            | (Connecting | Configuring | Streaming, Draining)
            | (Draining, Disconnecting)
            | (Disconnecting, Closed) => true,
            // Nothing to release before a device is chosen
            (Uninitialized | Authorizing | Discovering | AwaitingSelection, Closed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One recorded state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: SessionState,
    pub to: SessionState,
    pub at: DateTime<Utc>,
}

impl SessionController {
    pub(super) fn transition(&mut self, next: SessionState) -> Result<()> {
        let current = self.state;
        if !current.can_transition_to(next) {
            return Err(LmConnectError::session(format!(
                "invalid transition from {} to {}",
                current, next
            )));
        }

        self.state = next;
        self.history.push(StateTransition {
            from: current,
            to: next,
            at: Utc::now(),
        });
        debug!("Session state changed to: {:?}", next);
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Every transition taken so far, oldest first
    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    /// The states visited, starting with the initial one
    pub fn visited_states(&self) -> Vec<SessionState> {
        let mut states = vec![SessionState::Uninitialized];
        states.extend(self.history.iter().map(|t| t.to));
        states
    }
}
