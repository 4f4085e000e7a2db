use super::{SessionController, SessionState, TeardownReport};
use crate::device::PowerState;
use crate::events::EventCategory;
use tracing::{debug, error, info, warn};

impl SessionController {
    /// Release everything the session holds and close it.
    ///
    /// Safe to call at any point and any number of times; a session that is
    /// already closed or failed is left untouched.
    pub async fn teardown(&mut self) -> TeardownReport {
        self.teardown_into(SessionState::Closed).await
    }

    /// Tear down and finish in `final_state` (`Closed` or `Failed`)
    pub async fn teardown_into(&mut self, final_state: SessionState) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.state.is_terminal() {
            debug!("Session already {}, nothing to tear down", self.state);
            return report;
        }

        info!("Tearing down session from {}", self.state);

        if matches!(
            self.state,
            SessionState::Connecting | SessionState::Configuring | SessionState::Streaming
        ) {
            self.advance(SessionState::Draining);
        }

        if self.state == SessionState::Draining {
            if let Some(dispatcher) = self.dispatcher.take() {
                dispatcher.stop().await;
            }
            report.drain = Some(
                self.fetches
                    .drain(self.config.session.fetch_grace_period())
                    .await,
            );
            self.advance(SessionState::Disconnecting);
        }

        if self.state == SessionState::Disconnecting {
            self.release_device(&mut report).await;
        }

        let final_state = if final_state == SessionState::Failed {
            SessionState::Failed
        } else {
            SessionState::Closed
        };
        self.advance(final_state);
        self.waiter = None;

        self.log_summary();
        report
    }

    /// Restore power, detach every sink and disconnect, each best effort
    async fn release_device(&mut self, report: &mut TeardownReport) {
        let device = match &self.device {
            Some(device) => device.clone(),
            None => return,
        };

        if self.connected && self.power_raised && self.config.session.restore_power_state {
            match device.set_power_state(PowerState::Sleep).await {
                Ok(()) => {
                    report.power_restored = true;
                    debug!("{} returned to sleep", device.id());
                }
                Err(e) => warn!("Could not return {} to sleep: {}", device.id(), e),
            }
        }
        self.power_raised = false;

        for subscription in self.subscriptions.drain(..) {
            if device.unsubscribe(&subscription) {
                report.unsubscribed += 1;
            } else {
                debug!("Subscription {} was already removed", subscription.id);
            }
        }

        if self.connected {
            match device.disconnect().await {
                Ok(()) => {
                    report.disconnected = true;
                    info!("Disconnected from {}", device.id());
                }
                Err(e) => error!("Error disconnecting from {}: {}", device.id(), e),
            }
            self.connected = false;
        }
    }

    fn advance(&mut self, next: SessionState) {
        if let Err(e) = self.transition(next) {
            warn!("Teardown: {}", e);
        }
    }

    fn log_summary(&self) {
        let counters = &self.counters;
        let fetches = self.fetches.stats();
        let events = self.event_bus.metrics();

        info!(
            "Session {}: {}/{} shots ({} preliminary), {} state changes, {} configuration changes",
            self.state,
            counters.shots_received(),
            counters.target(),
            counters.preliminary_shots(),
            counters.state_changes(),
            counters.configuration_changes()
        );
        info!(
            "Auxiliary fetches: {} started, {} succeeded, {} not authorized, {} failed, {} cancelled",
            fetches.started(),
            fetches.succeeded(),
            fetches.unauthorized(),
            fetches.failed(),
            fetches.cancelled()
        );
        for category in EventCategory::ALL {
            debug!("  {} events: {}", category, events.count(category));
        }
        if events.undelivered > 0 {
            debug!("  undelivered events: {}", events.undelivered);
        }
    }
}
