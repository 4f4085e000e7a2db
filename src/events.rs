use crate::configuration::ConfigurationKey;
use crate::device::DeviceState;
use crate::error::EventBusError;
use crate::shot::ShotEvent;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Independent event streams a launch monitor can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    State,
    Configuration,
    Shot,
    VideoAvailable,
    PointCloudAvailable,
}

impl EventCategory {
    pub const ALL: [EventCategory; 5] = [
        EventCategory::State,
        EventCategory::Configuration,
        EventCategory::Shot,
        EventCategory::VideoAvailable,
        EventCategory::PointCloudAvailable,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::State => "state",
            EventCategory::Configuration => "configuration",
            EventCategory::Shot => "shot",
            EventCategory::VideoAvailable => "video_available",
            EventCategory::PointCloudAvailable => "point_cloud_available",
        }
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChangedEvent {
    pub device_id: String,
    pub state: DeviceState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationChangedEvent {
    pub device_id: String,
    pub key: ConfigurationKey,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoAvailableEvent {
    pub device_id: String,
    pub shot_id: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointCloudAvailableEvent {
    pub device_id: String,
    pub shot_id: String,
}

/// Any event a launch monitor pushes to the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LaunchMonitorEvent {
    StateChanged(StateChangedEvent),
    ConfigurationChanged(ConfigurationChangedEvent),
    Shot(ShotEvent),
    VideoAvailable(VideoAvailableEvent),
    PointCloudAvailable(PointCloudAvailableEvent),
}

impl LaunchMonitorEvent {
    pub fn category(&self) -> EventCategory {
        match self {
            LaunchMonitorEvent::StateChanged(_) => EventCategory::State,
            LaunchMonitorEvent::ConfigurationChanged(_) => EventCategory::Configuration,
            LaunchMonitorEvent::Shot(_) => EventCategory::Shot,
            LaunchMonitorEvent::VideoAvailable(_) => EventCategory::VideoAvailable,
            LaunchMonitorEvent::PointCloudAvailable(_) => EventCategory::PointCloudAvailable,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            LaunchMonitorEvent::StateChanged(e) => &e.device_id,
            LaunchMonitorEvent::ConfigurationChanged(e) => &e.device_id,
            LaunchMonitorEvent::Shot(e) => &e.shot.device_id,
            LaunchMonitorEvent::VideoAvailable(e) => &e.device_id,
            LaunchMonitorEvent::PointCloudAvailable(e) => &e.device_id,
        }
    }

    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            LaunchMonitorEvent::StateChanged(e) => format!("State changed {}", e.state),
            LaunchMonitorEvent::ConfigurationChanged(e) => {
                format!("Configuration changed, ID: {}, Value: {}", e.key, e.value)
            }
            LaunchMonitorEvent::Shot(e) => {
                format!("Shot {} ({})", e.shot.id, e.shot_type)
            }
            LaunchMonitorEvent::VideoAvailable(e) => match &e.url {
                Some(url) => format!("Video available for shot {}: {}", e.shot_id, url),
                None => format!("Video available for shot {}", e.shot_id),
            },
            LaunchMonitorEvent::PointCloudAvailable(e) => {
                format!("Point cloud available for shot {}", e.shot_id)
            }
        }
    }
}

/// Per-category counters for published events
#[derive(Debug, Clone, Default)]
pub struct EventMetrics {
    pub total_events: u64,
    pub events_by_category: HashMap<EventCategory, u64>,
    pub undelivered: u64,
    pub last_event_time: Option<DateTime<Utc>>,
}

impl EventMetrics {
    /// Record a delivered event
    pub fn record_event(&mut self, category: EventCategory) {
        self.total_events += 1;
        *self.events_by_category.entry(category).or_insert(0) += 1;
        self.last_event_time = Some(Utc::now());
    }

    /// Record an event nobody was listening for
    pub fn record_undelivered(&mut self) {
        self.undelivered += 1;
    }

    pub fn count(&self, category: EventCategory) -> u64 {
        self.events_by_category.get(&category).copied().unwrap_or(0)
    }
}

/// Typed multi-subscriber queues, one per event category.
///
/// Every subscriber gets its own unbounded queue, so a burst never evicts
/// events a slow consumer has not read yet. Publishing is synchronous so that
/// SDK callbacks can deliver without an async context.
pub struct EventBus {
    state: Topic<StateChangedEvent>,
    configuration: Topic<ConfigurationChangedEvent>,
    shot: Topic<ShotEvent>,
    video: Topic<VideoAvailableEvent>,
    point_cloud: Topic<PointCloudAvailableEvent>,
    debug_logging: bool,
    metrics: Mutex<EventMetrics>,
}

impl EventBus {
    /// Create a new event bus. `backlog_warning` is the queue depth at which a
    /// subscriber is reported as falling behind.
    pub fn new(backlog_warning: usize) -> Self {
        let backlog_warning = backlog_warning.max(1);
        Self {
            state: Topic::new(EventCategory::State, backlog_warning),
            configuration: Topic::new(EventCategory::Configuration, backlog_warning),
            shot: Topic::new(EventCategory::Shot, backlog_warning),
            video: Topic::new(EventCategory::VideoAvailable, backlog_warning),
            point_cloud: Topic::new(EventCategory::PointCloudAvailable, backlog_warning),
            debug_logging: false,
            metrics: Mutex::new(EventMetrics::default()),
        }
    }

    /// Create a new event bus with debug logging enabled
    pub fn with_debug_logging(backlog_warning: usize) -> Self {
        Self {
            debug_logging: true,
            ..Self::new(backlog_warning)
        }
    }

    /// Subscribe to every category at once
    pub fn subscribe(&self) -> EventStreams {
        EventStreams {
            state: self.state.subscribe(),
            configuration: self.configuration.subscribe(),
            shot: self.shot.subscribe(),
            video: self.video.subscribe(),
            point_cloud: self.point_cloud.subscribe(),
        }
    }

    pub fn subscribe_state(&self) -> EventReceiver<StateChangedEvent> {
        self.state.subscribe()
    }

    /// Publish an event to every subscriber of its category
    pub fn publish(&self, event: LaunchMonitorEvent) -> Result<usize, EventBusError> {
        let category = event.category();
        if self.debug_logging {
            debug!("Publishing event: {}", event.description());
        }

        let delivered = match event {
            LaunchMonitorEvent::StateChanged(e) => self.state.send(e),
            LaunchMonitorEvent::ConfigurationChanged(e) => self.configuration.send(e),
            LaunchMonitorEvent::Shot(e) => self.shot.send(e),
            LaunchMonitorEvent::VideoAvailable(e) => self.video.send(e),
            LaunchMonitorEvent::PointCloudAvailable(e) => self.point_cloud.send(e),
        };

        let mut metrics = self.metrics.lock();
        if delivered == 0 {
            metrics.record_undelivered();
            return Err(EventBusError::NoSubscribers {
                category: category.as_str(),
            });
        }

        metrics.record_event(category);
        Ok(delivered)
    }

    /// Get the number of active subscribers for a category
    pub fn subscriber_count(&self, category: EventCategory) -> usize {
        match category {
            EventCategory::State => self.state.receiver_count(),
            EventCategory::Configuration => self.configuration.receiver_count(),
            EventCategory::Shot => self.shot.receiver_count(),
            EventCategory::VideoAvailable => self.video.receiver_count(),
            EventCategory::PointCloudAvailable => self.point_cloud.receiver_count(),
        }
    }

    /// Snapshot of the publish counters
    pub fn metrics(&self) -> EventMetrics {
        self.metrics.lock().clone()
    }
}

/// Fan-out point for one category
struct Topic<T> {
    category: EventCategory,
    backlog_warning: usize,
    subscribers: Mutex<Vec<QueueHandle<T>>>,
}

struct QueueHandle<T> {
    sender: mpsc::UnboundedSender<T>,
    pending: Arc<AtomicUsize>,
}

impl<T: Clone> Topic<T> {
    fn new(category: EventCategory, backlog_warning: usize) -> Self {
        Self {
            category,
            backlog_warning,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn subscribe(&self) -> EventReceiver<T> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));
        self.subscribers.lock().push(QueueHandle {
            sender,
            pending: Arc::clone(&pending),
        });
        EventReceiver::new(receiver, pending, self.category.as_str())
    }

    /// Queue a copy for every live subscriber and return how many got one
    fn send(&self, event: T) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|queue| !queue.sender.is_closed());

        let mut delivered = 0;
        for queue in subscribers.iter() {
            if queue.sender.send(event.clone()).is_err() {
                continue;
            }
            delivered += 1;

            let depth = queue.pending.fetch_add(1, Ordering::AcqRel) + 1;
            if depth == self.backlog_warning {
                warn!(
                    "A {} subscriber has {} unread events queued",
                    self.category, depth
                );
            }
        }
        delivered
    }

    fn receiver_count(&self) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|queue| !queue.sender.is_closed())
            .count()
    }
}

/// Named receiving end of one subscriber queue
pub struct EventReceiver<T> {
    receiver: mpsc::UnboundedReceiver<T>,
    pending: Arc<AtomicUsize>,
    name: String,
}

impl<T> EventReceiver<T> {
    fn new<S: Into<String>>(
        receiver: mpsc::UnboundedReceiver<T>,
        pending: Arc<AtomicUsize>,
        name: S,
    ) -> Self {
        Self {
            receiver,
            pending,
            name: name.into(),
        }
    }

    /// Receive the next event, in publish order
    pub async fn recv(&mut self) -> Result<T, EventBusError> {
        match self.receiver.recv().await {
            Some(event) => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                Ok(event)
            }
            None => {
                debug!("Event bus closed for receiver '{}'", self.name);
                Err(EventBusError::ChannelClosed)
            }
        }
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<Option<T>, EventBusError> {
        match self.receiver.try_recv() {
            Ok(event) => {
                self.pending.fetch_sub(1, Ordering::AcqRel);
                Ok(Some(event))
            }
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(EventBusError::ChannelClosed),
        }
    }

    /// Events queued for this receiver and not read yet
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// One receiver per category, created together
pub struct EventStreams {
    pub state: EventReceiver<StateChangedEvent>,
    pub configuration: EventReceiver<ConfigurationChangedEvent>,
    pub shot: EventReceiver<ShotEvent>,
    pub video: EventReceiver<VideoAvailableEvent>,
    pub point_cloud: EventReceiver<PointCloudAvailableEvent>,
}

/// Delivery handle given to a device for one category.
///
/// Holds the bus weakly: once the session drops its bus, deliveries are
/// discarded.
#[derive(Clone)]
pub struct EventSink {
    bus: Weak<EventBus>,
    category: EventCategory,
}

impl EventSink {
    pub fn new(bus: &Arc<EventBus>, category: EventCategory) -> Self {
        Self {
            bus: Arc::downgrade(bus),
            category,
        }
    }

    pub fn category(&self) -> EventCategory {
        self.category
    }

    /// Whether the bus behind this sink is still alive
    pub fn is_attached(&self) -> bool {
        self.bus.strong_count() > 0
    }

    /// Deliver an event. Returns true when at least one receiver got it.
    pub fn deliver(&self, event: LaunchMonitorEvent) -> bool {
        if event.category() != self.category {
            warn!(
                "Sink for {} events refused a {} event",
                self.category,
                event.category()
            );
            return false;
        }

        match self.bus.upgrade() {
            Some(bus) => match bus.publish(event) {
                Ok(_) => true,
                Err(e) => {
                    debug!("Event not delivered: {}", e);
                    false
                }
            },
            None => {
                debug!("Event bus dropped, discarding {} event", self.category);
                false
            }
        }
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("category", &self.category)
            .field("attached", &self.is_attached())
            .finish()
    }
}

/// Handle returned by a device for an attached sink
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub id: u64,
    pub device_id: String,
    pub category: EventCategory,
}

impl Subscription {
    pub fn new<S: Into<String>>(id: u64, device_id: S, category: EventCategory) -> Self {
        Self {
            id,
            device_id: device_id.into(),
            category,
        }
    }
}
