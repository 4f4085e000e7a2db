use super::{SessionCounters, ShotTracker};
use crate::device::{DeviceState, LaunchMonitor};
use crate::events::{
    ConfigurationChangedEvent, EventStreams, PointCloudAvailableEvent, StateChangedEvent,
    VideoAvailableEvent,
};
use crate::fetch::AuxiliaryFetchManager;
use crate::shot::{ShotEvent, ShotReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DISPATCHER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Single consumer of every event category for one session
pub(crate) struct EventDispatcher {
    streams: EventStreams,
    handler: EventHandler,
}

struct EventHandler {
    tracker: ShotTracker,
    fetches: AuxiliaryFetchManager,
    device: Arc<dyn LaunchMonitor>,
    /// Set once the device has reported a connected state
    link_up: bool,
}

/// Running dispatcher task
pub(crate) struct DispatcherHandle {
    cancellation_token: CancellationToken,
    handle: JoinHandle<()>,
}

impl EventDispatcher {
    pub(crate) fn new(
        streams: EventStreams,
        tracker: ShotTracker,
        fetches: AuxiliaryFetchManager,
        device: Arc<dyn LaunchMonitor>,
    ) -> Self {
        Self {
            streams,
            handler: EventHandler {
                tracker,
                fetches,
                device,
                link_up: false,
            },
        }
    }

    pub(crate) fn spawn(self) -> DispatcherHandle {
        let cancellation_token = CancellationToken::new();
        let token = cancellation_token.clone();
        let handle = tokio::spawn(async move { self.run(token).await });

        DispatcherHandle {
            cancellation_token,
            handle,
        }
    }

    async fn run(mut self, cancellation_token: CancellationToken) {
        debug!("Event dispatcher started for {}", self.handler.device.id());

        loop {
            tokio::select! {
                biased;
                _ = cancellation_token.cancelled() => break,
                event = self.streams.state.recv() => match event {
                    Ok(event) => self.handler.on_state(event),
                    Err(_) => break,
                },
                event = self.streams.configuration.recv() => match event {
                    Ok(event) => self.handler.on_configuration(event),
                    Err(_) => break,
                },
                event = self.streams.shot.recv() => match event {
                    Ok(event) => self.handler.on_shot(event),
                    Err(_) => break,
                },
                event = self.streams.video.recv() => match event {
                    Ok(event) => self.handler.on_video_available(event),
                    Err(_) => break,
                },
                event = self.streams.point_cloud.recv() => match event {
                    Ok(event) => self.handler.on_point_cloud_available(event),
                    Err(_) => break,
                },
            }
        }

        debug!("Event dispatcher stopped for {}", self.handler.device.id());
    }
}

impl EventHandler {
    fn counters(&self) -> &SessionCounters {
        self.tracker.counters()
    }

    fn on_state(&mut self, event: StateChangedEvent) {
        info!("State changed {} ({})", event.state, event.device_id);
        self.counters().record_state(event.state);

        match event.state {
            DeviceState::Disconnected if !self.link_up => {
                debug!("{} reported Disconnected before connecting", event.device_id);
            }
            DeviceState::Disconnected => {
                self.link_up = false;
                if self.tracker.device_lost() {
                    warn!(
                        "{} disconnected after {} shots",
                        event.device_id,
                        self.counters().shots_received()
                    );
                }
            }
            DeviceState::Connecting | DeviceState::Error => {}
            _ => self.link_up = true,
        }
    }

    fn on_configuration(&self, event: ConfigurationChangedEvent) {
        info!(
            "Configuration changed, ID: {}, Value: {}",
            event.key, event.value
        );
        self.counters().record_configuration();
    }

    fn on_shot(&self, event: ShotEvent) {
        info!("{}", ShotReport::new(&event));

        if self.tracker.record(&event) {
            info!(
                "Received {} shots, target reached",
                self.counters().shots_received()
            );
        } else if event.is_final() {
            debug!(
                "Shot {}/{}",
                self.counters().shots_received(),
                self.counters().target()
            );
        }
    }

    fn on_video_available(&self, event: VideoAvailableEvent) {
        info!("Video available for shot {}", event.shot_id);
        self.fetches
            .fetch_video(Arc::clone(&self.device), event.shot_id);
    }

    fn on_point_cloud_available(&self, event: PointCloudAvailableEvent) {
        info!("Point cloud available for shot {}", event.shot_id);
        self.fetches
            .fetch_point_cloud(Arc::clone(&self.device), event.shot_id);
    }
}

impl DispatcherHandle {
    /// Cancel the loop and wait for it to exit
    pub(crate) async fn stop(self) {
        self.cancellation_token.cancel();

        match timeout(DISPATCHER_STOP_TIMEOUT, self.handle).await {
            Ok(Ok(())) => debug!("Event dispatcher joined"),
            Ok(Err(e)) => error!("Event dispatcher task failed: {}", e),
            Err(_) => warn!(
                "Event dispatcher did not stop within {:?}",
                DISPATCHER_STOP_TIMEOUT
            ),
        }
    }

    pub(crate) fn abort(&self) {
        self.cancellation_token.cancel();
    }
}
