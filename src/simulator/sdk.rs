use super::SimulatedDevice;
use crate::config::SimulatorConfig;
use crate::device::{AuthorizationContext, LaunchMonitor, LaunchMonitorSdk};
use crate::error::{LmConnectError, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Discovery latency, capped by the caller's timeout
const DISCOVERY_DELAY: Duration = Duration::from_millis(50);

/// SDK entry point backed by simulated devices
pub struct SimulatedSdk {
    config: SimulatorConfig,
    devices: Vec<Arc<SimulatedDevice>>,
    reject_credentials: bool,
    backend_unreachable: bool,
    initialized: AtomicBool,
}

impl SimulatedSdk {
    /// Create `device_count` devices from the simulator configuration
    pub fn new(config: SimulatorConfig) -> Self {
        let devices = (1..=config.device_count)
            .map(|n| Arc::new(SimulatedDevice::new(format!("LM-SIM-{:03}", n), config.clone())))
            .collect();

        Self {
            config,
            devices,
            reject_credentials: false,
            backend_unreachable: false,
            initialized: AtomicBool::new(false),
        }
    }

    /// Replace the discovered devices
    pub fn with_devices(mut self, devices: Vec<Arc<SimulatedDevice>>) -> Self {
        self.devices = devices;
        self
    }

    /// Fail every initialization attempt
    pub fn reject_credentials(mut self) -> Self {
        self.reject_credentials = true;
        self
    }

    /// Fail initialization as if the licensing backend could not be reached
    pub fn backend_unreachable(mut self) -> Self {
        self.backend_unreachable = true;
        self
    }

    pub fn devices(&self) -> &[Arc<SimulatedDevice>] {
        &self.devices
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}

#[async_trait]
impl LaunchMonitorSdk for SimulatedSdk {
    async fn initialize(&self, account_id: &str, account_key: &str) -> Result<AuthorizationContext> {
        if self.backend_unreachable {
            return Err(LmConnectError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "licensing backend unreachable",
            )));
        }
        if self.reject_credentials || account_id.trim().is_empty() || account_key.trim().is_empty() {
            return Err(LmConnectError::authorization(format!(
                "credentials for account '{}' were rejected",
                account_id
            )));
        }

        let mut claims = BTreeMap::new();
        claims.insert("account_id".to_string(), json!(account_id));
        claims.insert("issued_at".to_string(), json!(Utc::now().to_rfc3339()));
        claims.insert("video".to_string(), json!(self.config.video_authorized));
        claims.insert(
            "point_cloud".to_string(),
            json!(self.config.point_cloud_authorized),
        );

        self.initialized.store(true, Ordering::Release);
        info!("Simulated SDK initialized for account {}", account_id);
        Ok(AuthorizationContext::new(true, claims))
    }

    async fn find_devices(&self, timeout: Duration) -> Result<Vec<Arc<dyn LaunchMonitor>>> {
        if !self.is_initialized() {
            return Err(LmConnectError::authorization("SDK has not been initialized"));
        }

        tokio::time::sleep(DISCOVERY_DELAY.min(timeout)).await;
        debug!("Simulated discovery found {} devices", self.devices.len());

        Ok(self
            .devices
            .iter()
            .map(|device| Arc::clone(device) as Arc<dyn LaunchMonitor>)
            .collect())
    }
}
