//! Launch monitor SDK contract.
//!
//! The vendor connectivity layer is an external collaborator. Everything the
//! session needs from it is expressed by [`LaunchMonitorSdk`] (authorization and
//! discovery) and [`LaunchMonitor`] (one discovered device).

use crate::configuration::ConfigurationCommand;
use crate::error::Result;
use crate::events::{EventCategory, EventSink, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Byte stream of an encoded shot video
pub type VideoStream = BoxStream<'static, Result<Bytes>>;

/// Connection and readiness state reported by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    Disconnected,
    Connecting,
    Connected,
    Sleep,
    Ready,
    Armed,
    Processing,
    Error,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Power state requested from a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    Sleep,
    Active,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Identity and version details, populated once a device is connected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInformation {
    pub software_version: String,
    pub firmware_version: String,
    pub hardware_revision: String,
    pub serial_number: String,
    pub model_number: String,
}

/// Result of SDK initialization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationContext {
    is_authorized: bool,
    claims: BTreeMap<String, serde_json::Value>,
}

impl AuthorizationContext {
    pub fn new(is_authorized: bool, claims: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            is_authorized,
            claims,
        }
    }

    pub fn is_authorized(&self) -> bool {
        self.is_authorized
    }

    pub fn claims(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.claims
    }

    pub fn claim(&self, name: &str) -> Option<&serde_json::Value> {
        self.claims.get(name)
    }
}

/// One sample of a shot's point cloud
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointCloudPoint {
    pub offset: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl fmt::Display for PointCloudPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "offset {:.3}: ({:.3}, {:.3}, {:.3})",
            self.offset, self.x, self.y, self.z
        )
    }
}

/// Ordered point samples for one shot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointCloud {
    pub shot_id: String,
    pub points: Vec<PointCloudPoint>,
}

impl PointCloud {
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The first `count` points, for diagnostics
    pub fn preview(&self, count: usize) -> &[PointCloudPoint] {
        &self.points[..count.min(self.points.len())]
    }
}

/// Entry point of the vendor SDK
#[async_trait]
pub trait LaunchMonitorSdk: Send + Sync {
    /// Authenticate the account. Rejected credentials or an unreachable
    /// backend fail with an authorization error.
    async fn initialize(&self, account_id: &str, account_key: &str)
        -> Result<AuthorizationContext>;

    /// Search for launch monitors, waiting at most `timeout`
    async fn find_devices(&self, timeout: Duration) -> Result<Vec<Arc<dyn LaunchMonitor>>>;
}

/// A discovered launch monitor.
///
/// Subscriptions hand the device an [`EventSink`] that refers to the event bus
/// weakly, so the device never keeps the session alive.
#[async_trait]
pub trait LaunchMonitor: Send + Sync {
    fn id(&self) -> &str;

    /// Available after a successful connect
    fn device_information(&self) -> Option<DeviceInformation>;

    /// Attach a sink for one event category
    fn subscribe(&self, category: EventCategory, sink: EventSink) -> Subscription;

    /// Detach a sink. Returns false when the subscription was already removed.
    fn unsubscribe(&self, subscription: &Subscription) -> bool;

    async fn connect(&self) -> Result<()>;

    /// Disconnecting an already disconnected device is a no-op
    async fn disconnect(&self) -> Result<()>;

    async fn set_configuration(&self, command: &ConfigurationCommand) -> Result<()>;

    async fn set_power_state(&self, state: PowerState) -> Result<()>;

    async fn get_point_cloud(&self, shot_id: &str) -> Result<PointCloud>;

    async fn get_shot_video(&self, shot_id: &str) -> Result<VideoStream>;
}
