use crate::config::SimulatorConfig;
use crate::configuration::{ConfigurationCommand, ConfigurationKey};
use crate::device::{
    DeviceInformation, DeviceState, LaunchMonitor, PointCloud, PointCloudPoint, PowerState,
    VideoStream,
};
use crate::error::{LmConnectError, Result};
use crate::events::{
    ConfigurationChangedEvent, EventCategory, EventSink, LaunchMonitorEvent,
    PointCloudAvailableEvent, StateChangedEvent, Subscription, VideoAvailableEvent,
};
use crate::fetch::FetchKind;
use crate::shot::{Metric, ShotEvent, ShotRecord, ShotType};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Launch monitor that lives entirely in memory
pub struct SimulatedDevice {
    shared: Arc<DeviceShared>,
    config: SimulatorConfig,
}

/// State reachable from both the device handle and its swing generator
struct DeviceShared {
    id: String,
    next_subscription: AtomicU64,
    swings: AtomicU64,
    emit_preliminary: bool,
    inner: Mutex<DeviceInner>,
}

struct DeviceInner {
    connected: bool,
    state: DeviceState,
    power_state: PowerState,
    sinks: BTreeMap<u64, EventSink>,
    applied: Vec<ConfigurationCommand>,
    attempted: Vec<ConfigurationKey>,
    connect_count: u32,
    disconnect_count: u32,
    fail_connection: bool,
    failing_keys: HashSet<ConfigurationKey>,
    dropped_link_keys: HashSet<ConfigurationKey>,
    announce_state: bool,
    video_authorized: bool,
    point_cloud_authorized: bool,
    fetch_latency: Duration,
    swing_token: Option<CancellationToken>,
}

impl SimulatedDevice {
    pub fn new<S: Into<String>>(id: S, config: SimulatorConfig) -> Self {
        let inner = DeviceInner {
            connected: false,
            state: DeviceState::Disconnected,
            power_state: PowerState::Sleep,
            sinks: BTreeMap::new(),
            applied: Vec::new(),
            attempted: Vec::new(),
            connect_count: 0,
            disconnect_count: 0,
            fail_connection: false,
            failing_keys: HashSet::new(),
            dropped_link_keys: HashSet::new(),
            announce_state: false,
            video_authorized: config.video_authorized,
            point_cloud_authorized: config.point_cloud_authorized,
            fetch_latency: Duration::ZERO,
            swing_token: None,
        };

        Self {
            shared: Arc::new(DeviceShared {
                id: id.into(),
                next_subscription: AtomicU64::new(1),
                swings: AtomicU64::new(0),
                emit_preliminary: config.emit_preliminary,
                inner: Mutex::new(inner),
            }),
            config,
        }
    }

    /// Make the next connect attempts fail
    pub fn fail_connection(&self) {
        self.shared.inner.lock().fail_connection = true;
    }

    /// Make every write of `key` fail
    pub fn fail_configuration(&self, key: ConfigurationKey) {
        self.shared.inner.lock().failing_keys.insert(key);
    }

    /// Make every write of `key` fail with a transport error
    pub fn drop_link_on(&self, key: ConfigurationKey) {
        self.shared.inner.lock().dropped_link_keys.insert(key);
    }

    /// Report the current state to every new state subscriber
    pub fn announce_state_on_subscribe(&self) {
        self.shared.inner.lock().announce_state = true;
    }

    pub fn deny_video(&self) {
        self.shared.inner.lock().video_authorized = false;
    }

    pub fn deny_point_cloud(&self) {
        self.shared.inner.lock().point_cloud_authorized = false;
    }

    /// Delay applied before every video or point cloud fetch
    pub fn set_fetch_latency(&self, latency: Duration) {
        self.shared.inner.lock().fetch_latency = latency;
    }

    /// Commands accepted so far, in order
    pub fn applied_configuration(&self) -> Vec<ConfigurationCommand> {
        self.shared.inner.lock().applied.clone()
    }

    /// Every key written, including rejected ones and power state changes
    pub fn attempted_keys(&self) -> Vec<ConfigurationKey> {
        self.shared.inner.lock().attempted.clone()
    }

    pub fn power_state(&self) -> PowerState {
        self.shared.inner.lock().power_state
    }

    pub fn state(&self) -> DeviceState {
        self.shared.inner.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.shared.inner.lock().connected
    }

    pub fn connect_count(&self) -> u32 {
        self.shared.inner.lock().connect_count
    }

    pub fn disconnect_count(&self) -> u32 {
        self.shared.inner.lock().disconnect_count
    }

    /// Sinks currently attached, optionally for one category
    pub fn subscriber_count(&self, category: Option<EventCategory>) -> usize {
        self.shared
            .inner
            .lock()
            .sinks
            .values()
            .filter(|sink| category.map_or(true, |c| sink.category() == c))
            .count()
    }

    pub fn next_shot_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Report a device state. Returns the number of sinks that delivered it.
    pub fn emit_state(&self, state: DeviceState) -> usize {
        self.shared.emit_state(state)
    }

    pub fn emit_shot(&self, shot_type: ShotType, shot_id: &str) -> usize {
        self.shared.emit_shot(shot_type, shot_id)
    }

    pub fn emit_video_available(&self, shot_id: &str) -> usize {
        self.shared.emit(LaunchMonitorEvent::VideoAvailable(VideoAvailableEvent {
            device_id: self.shared.id.clone(),
            shot_id: shot_id.to_string(),
            url: None,
        }))
    }

    pub fn emit_point_cloud_available(&self, shot_id: &str) -> usize {
        self.shared.emit(LaunchMonitorEvent::PointCloudAvailable(
            PointCloudAvailableEvent {
                device_id: self.shared.id.clone(),
                shot_id: shot_id.to_string(),
            },
        ))
    }

    /// One full swing: optional preliminary shot, flight shot, then the
    /// video and point cloud notifications. Returns the shot id.
    pub fn emit_swing(&self) -> String {
        self.shared.emit_swing()
    }

    fn start_swing_generator(&self) {
        let token = CancellationToken::new();
        if let Some(previous) = self.shared.inner.lock().swing_token.replace(token.clone()) {
            previous.cancel();
        }

        let shared = Arc::clone(&self.shared);
        let period = self.config.shot_interval().max(Duration::from_millis(1));
        info!("{} swinging every {:?}", shared.id, period);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        shared.emit_swing();
                    }
                }
            }
            debug!("Swing generator for {} stopped", shared.id);
        });
    }

    fn require_connected(&self, operation: &str) -> Result<()> {
        if self.shared.inner.lock().connected {
            Ok(())
        } else {
            Err(LmConnectError::connection(
                self.shared.id.as_str(),
                operation,
                "device is not connected",
            ))
        }
    }

    async fn simulate_latency(&self) {
        let latency = self.shared.inner.lock().fetch_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

impl DeviceShared {
    fn emit(&self, event: LaunchMonitorEvent) -> usize {
        let category = event.category();
        let sinks: Vec<EventSink> = self
            .inner
            .lock()
            .sinks
            .values()
            .filter(|sink| sink.category() == category)
            .cloned()
            .collect();

        sinks
            .iter()
            .filter(|sink| sink.deliver(event.clone()))
            .count()
    }

    fn emit_state(&self, state: DeviceState) -> usize {
        self.inner.lock().state = state;
        self.emit(LaunchMonitorEvent::StateChanged(StateChangedEvent {
            device_id: self.id.clone(),
            state,
            timestamp: Utc::now(),
        }))
    }

    fn emit_shot(&self, shot_type: ShotType, shot_id: &str) -> usize {
        let swing = self.swings.load(Ordering::Acquire);
        let shot = simulated_shot(&self.id, shot_id, shot_type, swing);
        self.emit(LaunchMonitorEvent::Shot(ShotEvent::new(shot_type, shot)))
    }

    fn emit_swing(&self) -> String {
        self.swings.fetch_add(1, Ordering::AcqRel);
        let shot_id = uuid::Uuid::new_v4().to_string();

        self.emit_state(DeviceState::Processing);
        if self.emit_preliminary {
            self.emit_shot(ShotType::Preliminary, &shot_id);
        }
        self.emit_shot(ShotType::Flight, &shot_id);
        self.emit(LaunchMonitorEvent::VideoAvailable(VideoAvailableEvent {
            device_id: self.id.clone(),
            shot_id: shot_id.clone(),
            url: None,
        }));
        self.emit(LaunchMonitorEvent::PointCloudAvailable(
            PointCloudAvailableEvent {
                device_id: self.id.clone(),
                shot_id: shot_id.clone(),
            },
        ));
        self.emit_state(DeviceState::Armed);

        shot_id
    }
}

/// Plausible driver numbers that drift a little from swing to swing
fn simulated_shot(device_id: &str, shot_id: &str, shot_type: ShotType, swing: u64) -> ShotRecord {
    let jitter = (swing % 7) as f64;
    let mut shot = ShotRecord::new(shot_id, device_id, Utc::now());

    shot.ball_speed = Some(Metric::measured(148.0 + jitter));
    shot.club_speed = Some(Metric::measured(102.0 + jitter * 0.5));
    shot.vertical_launch_angle = Some(Metric::measured(11.5 + jitter * 0.2));
    shot.horizontal_launch_angle = Some(Metric::measured(-1.2 + jitter * 0.3));

    if shot_type == ShotType::Preliminary {
        return shot;
    }

    shot.attack_angle = Some(Metric::measured(2.1));
    shot.club_path = Some(Metric::measured(1.4 - jitter * 0.2));
    shot.face_angle = Some(Metric::measured(0.6));
    shot.smash_factor = Some(Metric::calculated(1.45));
    shot.spin_axis = Some(Metric::measured(-3.0 + jitter));
    shot.spin_rate = Some(Metric::measured(2650.0 - jitter * 40.0));
    shot.apex = Some(Metric::calculated(31.0 + jitter));
    shot.carry_distance = Some(Metric::calculated(255.0 + jitter * 3.0));
    shot.side = Some(Metric::calculated(-4.0 + jitter));
    shot.side_total = Some(Metric::estimated(-6.5 + jitter));
    shot.total_distance = Some(Metric::estimated(280.0 + jitter * 3.5));
    shot
}

fn link_dropped() -> LmConnectError {
    LmConnectError::Io(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "link to device dropped",
    ))
}

#[async_trait]
impl LaunchMonitor for SimulatedDevice {
    fn id(&self) -> &str {
        &self.shared.id
    }

    fn device_information(&self) -> Option<DeviceInformation> {
        if !self.shared.inner.lock().connected {
            return None;
        }

        Some(DeviceInformation {
            software_version: "2.4.0".to_string(),
            firmware_version: "1.9.3".to_string(),
            hardware_revision: "C".to_string(),
            serial_number: format!("SIM{}", self.shared.id.replace('-', "")),
            model_number: "LM-SIM".to_string(),
        })
    }

    fn subscribe(&self, category: EventCategory, sink: EventSink) -> Subscription {
        let id = self.shared.next_subscription.fetch_add(1, Ordering::AcqRel);
        let announce = {
            let mut inner = self.shared.inner.lock();
            inner.sinks.insert(id, sink.clone());
            (inner.announce_state && category == EventCategory::State).then_some(inner.state)
        };
        debug!("{} attached {} subscription {}", self.shared.id, category, id);

        if let Some(state) = announce {
            sink.deliver(LaunchMonitorEvent::StateChanged(StateChangedEvent {
                device_id: self.shared.id.clone(),
                state,
                timestamp: Utc::now(),
            }));
        }
        Subscription::new(id, self.shared.id.as_str(), category)
    }

    fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.shared
            .inner
            .lock()
            .sinks
            .remove(&subscription.id)
            .is_some()
    }

    async fn connect(&self) -> Result<()> {
        {
            let mut inner = self.shared.inner.lock();
            if inner.connected {
                return Ok(());
            }
            inner.connect_count += 1;
            if inner.fail_connection {
                return Err(LmConnectError::connection(
                    self.shared.id.as_str(),
                    "connect",
                    "connection refused by device",
                ));
            }
        }

        self.shared.emit_state(DeviceState::Connecting);
        tokio::task::yield_now().await;

        let power_state = {
            let mut inner = self.shared.inner.lock();
            inner.connected = true;
            inner.power_state
        };

        // Connect reports its states before returning
        self.shared.emit_state(DeviceState::Connected);
        self.shared.emit_state(match power_state {
            PowerState::Sleep => DeviceState::Sleep,
            PowerState::Active => DeviceState::Ready,
        });

        if self.config.auto_swing {
            self.start_swing_generator();
        }

        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let token = {
            let mut inner = self.shared.inner.lock();
            if !inner.connected {
                return Ok(());
            }
            inner.connected = false;
            inner.disconnect_count += 1;
            inner.swing_token.take()
        };

        if let Some(token) = token {
            token.cancel();
        }

        self.shared.emit_state(DeviceState::Disconnected);
        Ok(())
    }

    async fn set_configuration(&self, command: &ConfigurationCommand) -> Result<()> {
        let key = command.key();
        self.shared.inner.lock().attempted.push(key);
        self.require_connected("set_configuration")?;

        {
            let mut inner = self.shared.inner.lock();
            if inner.dropped_link_keys.contains(&key) {
                return Err(link_dropped());
            }
            if inner.failing_keys.contains(&key) {
                warn!("{} rejected {}", self.shared.id, command);
                return Err(LmConnectError::connection(
                    self.shared.id.as_str(),
                    "set_configuration",
                    format!("device rejected {}", key),
                ));
            }
            inner.applied.push(command.clone());
        }

        self.shared
            .emit(LaunchMonitorEvent::ConfigurationChanged(ConfigurationChangedEvent {
                device_id: self.shared.id.clone(),
                key,
                value: command.value_string(),
            }));

        let armed = matches!(command, ConfigurationCommand::AutoArm(true))
            && self.power_state() == PowerState::Active;
        if armed {
            self.shared.emit_state(DeviceState::Armed);
        }

        Ok(())
    }

    async fn set_power_state(&self, state: PowerState) -> Result<()> {
        self.shared
            .inner
            .lock()
            .attempted
            .push(ConfigurationKey::PowerState);
        self.require_connected("set_power_state")?;

        {
            let mut inner = self.shared.inner.lock();
            if inner.dropped_link_keys.contains(&ConfigurationKey::PowerState) {
                return Err(link_dropped());
            }
            if inner.failing_keys.contains(&ConfigurationKey::PowerState) {
                return Err(LmConnectError::connection(
                    self.shared.id.as_str(),
                    "set_power_state",
                    format!("device refused power state {}", state),
                ));
            }
            inner.power_state = state;
        }

        self.shared.emit_state(match state {
            PowerState::Sleep => DeviceState::Sleep,
            PowerState::Active => DeviceState::Ready,
        });
        Ok(())
    }

    async fn get_point_cloud(&self, shot_id: &str) -> Result<PointCloud> {
        self.simulate_latency().await;
        if !self.shared.inner.lock().point_cloud_authorized {
            return Err(LmConnectError::not_authorized(shot_id, FetchKind::PointCloud));
        }

        let points = (0..self.config.point_cloud_points)
            .map(|i| {
                let t = i as f64 * 0.004;
                PointCloudPoint {
                    offset: t,
                    x: 68.0 * t,
                    y: 21.0 * t - 4.9 * t * t,
                    z: -1.1 * t,
                }
            })
            .collect();

        Ok(PointCloud {
            shot_id: shot_id.to_string(),
            points,
        })
    }

    async fn get_shot_video(&self, shot_id: &str) -> Result<VideoStream> {
        self.simulate_latency().await;
        if !self.shared.inner.lock().video_authorized {
            return Err(LmConnectError::not_authorized(shot_id, FetchKind::Video));
        }

        let chunks = self.config.video_chunks;
        let chunk_size = self.config.video_chunk_size.max(1);
        let stream = async_stream::stream! {
            for index in 0..chunks {
                yield Ok(Bytes::from(vec![(index % 251) as u8; chunk_size]));
                tokio::task::yield_now().await;
            }
        };

        Ok(stream.boxed())
    }
}
