mod completion;
mod controller;
mod dispatch;
mod state;
mod teardown;
mod types;

#[cfg(test)]
mod tests;

pub use completion::{CompletionWaiter, SessionCounters, ShotTracker};
pub use controller::SessionController;
pub use state::{SessionState, StateTransition};
pub use types::{CompletionOutcome, SessionOutcome, TeardownReport};
