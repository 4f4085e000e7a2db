use super::dispatch::{DispatcherHandle, EventDispatcher};
use super::{
    CompletionOutcome, CompletionWaiter, SessionCounters, SessionOutcome, SessionState,
    ShotTracker, StateTransition,
};
use crate::config::{Credentials, LmConnectConfig};
use crate::configuration::ConfigurationPlan;
use crate::device::{AuthorizationContext, LaunchMonitor, LaunchMonitorSdk};
use crate::error::{LmConnectError, Result};
use crate::events::{EventBus, EventCategory, EventSink, Subscription};
use crate::fetch::{AuxiliaryFetchManager, FetchStats};
use crate::selector::{DeviceSelector, SelectionInput};
use std::future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Slack added on top of the SDK's own discovery timeout
const DISCOVERY_GUARD: Duration = Duration::from_secs(2);

/// Drives one session from authorization to disconnect
pub struct SessionController {
    pub(super) config: LmConnectConfig,
    pub(super) sdk: Arc<dyn LaunchMonitorSdk>,
    pub(super) event_bus: Arc<EventBus>,
    pub(super) fetches: AuxiliaryFetchManager,
    pub(super) counters: Arc<SessionCounters>,
    pub(super) cancellation_token: CancellationToken,

    pub(super) state: SessionState,
    pub(super) history: Vec<StateTransition>,

    pub(super) authorization: Option<AuthorizationContext>,
    pub(super) device: Option<Arc<dyn LaunchMonitor>>,
    pub(super) connected: bool,
    pub(super) power_raised: bool,
    pub(super) subscriptions: Vec<Subscription>,
    pub(super) dispatcher: Option<DispatcherHandle>,
    pub(super) waiter: Option<CompletionWaiter>,
}

impl SessionController {
    pub fn new(config: LmConnectConfig, sdk: Arc<dyn LaunchMonitorSdk>) -> Self {
        let event_bus = if config.system.debug_events {
            EventBus::with_debug_logging(config.system.event_backlog_warning)
        } else {
            EventBus::new(config.system.event_backlog_warning)
        };
        let fetches = AuxiliaryFetchManager::from_config(&config.storage);
        let counters = Arc::new(SessionCounters::new(config.session.target_shots));

        Self {
            config,
            sdk,
            event_bus: Arc::new(event_bus),
            fetches,
            counters,
            cancellation_token: CancellationToken::new(),
            state: SessionState::Uninitialized,
            history: Vec::new(),
            authorization: None,
            device: None,
            connected: false,
            power_raised: false,
            subscriptions: Vec::new(),
            dispatcher: None,
            waiter: None,
        }
    }

    /// Use an external token, for instance one cancelled on Ctrl+C
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Replace the fetch manager built from the storage configuration
    pub fn with_fetch_manager(mut self, fetches: AuxiliaryFetchManager) -> Self {
        self.fetches = fetches;
        self
    }

    pub fn counters(&self) -> Arc<SessionCounters> {
        Arc::clone(&self.counters)
    }

    pub fn fetch_stats(&self) -> Arc<FetchStats> {
        self.fetches.stats()
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.event_bus)
    }

    pub fn authorization(&self) -> Option<&AuthorizationContext> {
        self.authorization.as_ref()
    }

    pub fn device(&self) -> Option<&Arc<dyn LaunchMonitor>> {
        self.device.as_ref()
    }

    /// Authenticate with the SDK. Failure is fatal for the run.
    pub async fn initialize(&mut self, credentials: &Credentials) -> Result<&AuthorizationContext> {
        self.transition(SessionState::Authorizing)?;
        info!("Initializing launch monitor SDK");

        let result = self
            .sdk
            .initialize(&credentials.account_id, &credentials.account_key)
            .await;
        let context = match result {
            Ok(context) if context.is_authorized() => context,
            Ok(_) => {
                error!("Could not initialize. Not authorized");
                self.transition(SessionState::Failed)?;
                return Err(LmConnectError::authorization("Could not initialize. Not authorized"));
            }
            Err(e) => {
                error!("Could not initialize: {}", e);
                self.transition(SessionState::Failed)?;
                return Err(match e {
                    e @ LmConnectError::Authorization { .. } => e,
                    other => LmConnectError::authorization(format!(
                        "Could not initialize: {}",
                        other
                    )),
                });
            }
        };

        for (name, value) in context.claims() {
            debug!("Claim {}: {}", name, value);
        }

        Ok(&*self.authorization.insert(context))
    }

    /// Search for launch monitors.
    ///
    /// An empty result closes the session; it is not an error.
    pub async fn discover_devices(&mut self) -> Result<Vec<Arc<dyn LaunchMonitor>>> {
        self.transition(SessionState::Discovering)?;

        let discovery_timeout = self.config.session.discovery_timeout();
        info!("Searching for launch monitors (timeout {:?})", discovery_timeout);

        let guard = discovery_timeout + DISCOVERY_GUARD;
        let result = timeout(guard, self.sdk.find_devices(discovery_timeout)).await;
        let devices = match result {
            Ok(Ok(devices)) => devices,
            Ok(Err(e)) => {
                error!("Device discovery failed: {}", e);
                self.transition(SessionState::Failed)?;
                return Err(e);
            }
            Err(_) => {
                warn!("Device discovery did not return within {:?}", guard);
                Vec::new()
            }
        };

        if devices.is_empty() {
            warn!("Could not find any Launch Monitors. Verify they are powered on");
            self.transition(SessionState::Closed)?;
        } else {
            info!("Found {} launch monitors", devices.len());
        }

        Ok(devices)
    }

    /// Let the operator pick a device. `None` closes the session.
    pub async fn select_device<I: SelectionInput>(
        &mut self,
        candidates: &[Arc<dyn LaunchMonitor>],
        selector: &mut DeviceSelector<I>,
    ) -> Result<Option<Arc<dyn LaunchMonitor>>> {
        self.transition(SessionState::AwaitingSelection)?;

        let ids: Vec<String> = candidates.iter().map(|d| d.id().to_string()).collect();
        let choice = match selector.select(&ids).await {
            Ok(choice) => choice,
            Err(e) => {
                self.transition(SessionState::Failed)?;
                return Err(e);
            }
        };

        match choice.and_then(|index| candidates.get(index)) {
            Some(device) => {
                info!("Selected launch monitor {}", device.id());
                Ok(Some(Arc::clone(device)))
            }
            None => {
                info!("Not connecting. Exiting");
                self.transition(SessionState::Closed)?;
                Ok(None)
            }
        }
    }

    /// Connect and apply the configuration plan.
    ///
    /// Every event category is attached before `connect` is issued. On failure
    /// whatever was established is torn down before the error is returned.
    pub async fn connect_and_configure(
        &mut self,
        device: Arc<dyn LaunchMonitor>,
        plan: &ConfigurationPlan,
    ) -> Result<()> {
        self.transition(SessionState::Connecting)?;
        self.device = Some(Arc::clone(&device));

        let (tracker, waiter) = ShotTracker::arm(Arc::clone(&self.counters));
        self.waiter = Some(waiter);

        // Receivers exist before any sink can deliver
        let streams = self.event_bus.subscribe();
        self.dispatcher = Some(
            EventDispatcher::new(streams, tracker, self.fetches.clone(), Arc::clone(&device))
                .spawn(),
        );

        for category in EventCategory::ALL {
            let sink = EventSink::new(&self.event_bus, category);
            self.subscriptions.push(device.subscribe(category, sink));
        }
        debug!("Attached {} subscriptions to {}", self.subscriptions.len(), device.id());

        info!("Connecting to {}", device.id());
        if let Err(e) = device.connect().await {
            error!("Could not connect to Launch Monitor {}: {}", device.id(), e);
            self.teardown_into(SessionState::Failed).await;
            return Err(e);
        }
        self.connected = true;

        if let Some(info) = device.device_information() {
            info!("Connected to {}", device.id());
            info!("  Model: {}", info.model_number);
            info!("  Serial: {}", info.serial_number);
            info!("  Software: {}", info.software_version);
            info!("  Firmware: {}", info.firmware_version);
            info!("  Hardware: {}", info.hardware_revision);
        }

        self.transition(SessionState::Configuring)?;
        self.power_raised = plan.activates_device();
        if let Err(e) = plan.apply(device.as_ref()).await {
            error!("Could not configure Launch Monitor {}: {}", device.id(), e);
            self.teardown_into(SessionState::Failed).await;
            return Err(e);
        }

        self.transition(SessionState::Streaming)?;
        info!(
            "Waiting for {} shots from {}",
            self.counters.target(),
            device.id()
        );
        Ok(())
    }

    /// Wait until the shot target is reached.
    ///
    /// Without a configured timeout this waits indefinitely; the cancellation
    /// token ends the wait early either way. Event delivery continues while
    /// waiting.
    pub async fn await_completion(&mut self) -> Result<CompletionOutcome> {
        if self.state != SessionState::Streaming {
            return Err(LmConnectError::session(format!(
                "cannot wait for shots while {}",
                self.state
            )));
        }

        let mut waiter = self
            .waiter
            .take()
            .ok_or_else(|| LmConnectError::session("completion already awaited"))?;

        let completion_timeout = self.config.session.completion_timeout();
        let deadline = async {
            match completion_timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => future::pending::<()>().await,
            }
        };

        let shots = || self.counters.shots_received();
        let outcome = tokio::select! {
            result = waiter.wait() => result?,
            _ = self.cancellation_token.cancelled() => {
                info!("Session cancelled");
                CompletionOutcome::Cancelled { shots: shots() }
            }
            _ = deadline => {
                warn!("Shot target not reached within {:?}", completion_timeout);
                CompletionOutcome::TimedOut { shots: shots() }
            }
        };

        info!("Session finished with {} shots", outcome.shots());
        Ok(outcome)
    }

    /// Run the whole session script.
    ///
    /// Authorization failures are returned as errors. Connection failures end
    /// the session and are reported in the outcome.
    pub async fn run<I: SelectionInput>(
        &mut self,
        credentials: &Credentials,
        selector: &mut DeviceSelector<I>,
        plan: &ConfigurationPlan,
    ) -> Result<SessionOutcome> {
        self.initialize(credentials).await?;

        let candidates = self.discover_devices().await?;
        if candidates.is_empty() {
            return Ok(SessionOutcome::NoDevicesFound);
        }

        let device = match self.select_device(&candidates, selector).await? {
            Some(device) => device,
            None => return Ok(SessionOutcome::SelectionAborted),
        };

        if let Err(e) = self.connect_and_configure(Arc::clone(&device), plan).await {
            if e.is_recoverable() {
                return Ok(SessionOutcome::ConnectionFailed {
                    device_id: device.id().to_string(),
                    error: e.to_string(),
                });
            }
            return Err(e);
        }

        match self.await_completion().await {
            Ok(outcome) => {
                self.teardown().await;
                Ok(SessionOutcome::Completed(outcome))
            }
            Err(e) => {
                error!("Session failed while streaming: {}", e);
                self.teardown_into(SessionState::Failed).await;
                Err(e)
            }
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.abort();
        }
    }
}
