use crate::configuration::{Club, DataPoint, Location, PlayMode, ScreenLayout};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Environment variables consulted when the credentials are not configured
pub const ACCOUNT_ID_ENV: &str = "LMCONNECT_ACCOUNT_ID";
pub const ACCOUNT_KEY_ENV: &str = "LMCONNECT_ACCOUNT_KEY";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct LmConnectConfig {
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub simulator: SimulatorConfig,
    #[serde(default)]
    pub system: SystemConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct CredentialsConfig {
    /// Account identifier issued by the SDK vendor
    pub account_id: Option<String>,

    /// Account key issued by the SDK vendor
    pub account_key: Option<String>,
}

/// Resolved account credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub account_id: String,
    pub account_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("account_id", &self.account_id)
            .field("account_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionConfig {
    /// Final shots to observe before disconnecting
    #[serde(default = "default_target_shots")]
    pub target_shots: u32,

    /// Upper bound on device discovery
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_secs: u64,

    /// Optional bound on the shot wait; unset waits indefinitely
    #[serde(default)]
    pub completion_timeout_secs: Option<u64>,

    /// Time given to in-flight video and point cloud downloads at teardown
    #[serde(default = "default_fetch_grace_period")]
    pub fetch_grace_period_secs: u64,

    /// Put the device back to sleep at teardown if the session woke it
    #[serde(default = "default_restore_power_state")]
    pub restore_power_state: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DeviceConfig {
    /// Issue PowerState::Active before the other settings
    #[serde(default = "default_power_on")]
    pub power_on: bool,

    /// Let the device arm itself between shots
    #[serde(default = "default_auto_arm")]
    pub auto_arm: bool,

    #[serde(default = "default_club")]
    pub club: Club,

    #[serde(default = "default_location")]
    pub location: Location,

    /// Feet above sea level
    #[serde(default = "default_altitude")]
    pub altitude: i32,

    /// Degrees Fahrenheit
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    pub screen_layout: Option<ScreenLayout>,

    pub play_mode: Option<PlayMode>,

    #[serde(default)]
    pub data_points_hidden: Vec<DataPoint>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Directory for shot videos; defaults to the per-user application data directory
    pub video_directory: Option<String>,

    /// Download videos when the device announces them
    #[serde(default = "default_save_videos")]
    pub save_videos: bool,

    /// Download point clouds when the device announces them
    #[serde(default = "default_fetch_point_clouds")]
    pub fetch_point_clouds: bool,

    /// Number of point cloud samples logged per shot
    #[serde(default = "default_point_cloud_preview")]
    pub point_cloud_preview: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SimulatorConfig {
    /// Number of launch monitors discovered
    #[serde(default = "default_device_count")]
    pub device_count: u32,

    /// Generate swings automatically once connected
    #[serde(default = "default_auto_swing")]
    pub auto_swing: bool,

    /// Delay between generated swings
    #[serde(default = "default_shot_interval")]
    pub shot_interval_ms: u64,

    /// Emit a preliminary shot ahead of each flight
    #[serde(default = "default_emit_preliminary")]
    pub emit_preliminary: bool,

    #[serde(default = "default_video_authorized")]
    pub video_authorized: bool,

    #[serde(default = "default_point_cloud_authorized")]
    pub point_cloud_authorized: bool,

    /// Chunks per generated video
    #[serde(default = "default_video_chunks")]
    pub video_chunks: u32,

    /// Bytes per generated video chunk
    #[serde(default = "default_video_chunk_size")]
    pub video_chunk_size: usize,

    /// Samples per generated point cloud
    #[serde(default = "default_point_cloud_points")]
    pub point_cloud_points: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SystemConfig {
    /// Unread events queued for one subscriber before it is reported as falling behind
    #[serde(default = "default_event_backlog_warning")]
    pub event_backlog_warning: usize,

    /// Log every published event at debug level
    #[serde(default)]
    pub debug_events: bool,
}

impl LmConnectConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("lmconnect.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("session.target_shots", default_target_shots())?
            .set_default(
                "session.discovery_timeout_secs",
                default_discovery_timeout() as i64,
            )?
            .set_default(
                "session.fetch_grace_period_secs",
                default_fetch_grace_period() as i64,
            )?
            .set_default("session.restore_power_state", default_restore_power_state())?
            .set_default("device.power_on", default_power_on())?
            .set_default("device.auto_arm", default_auto_arm())?
            .set_default("device.altitude", default_altitude() as i64)?
            .set_default("device.temperature", default_temperature())?
            .set_default("storage.save_videos", default_save_videos())?
            .set_default("storage.fetch_point_clouds", default_fetch_point_clouds())?
            .set_default(
                "storage.point_cloud_preview",
                default_point_cloud_preview() as i64,
            )?
            .set_default("simulator.device_count", default_device_count())?
            .set_default("simulator.auto_swing", default_auto_swing())?
            .set_default("simulator.shot_interval_ms", default_shot_interval() as i64)?
            .set_default(
                "system.event_backlog_warning",
                default_event_backlog_warning() as i64,
            )?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // LMCONNECT_SESSION__TARGET_SHOTS=5 overrides session.target_shots
            .add_source(
                Environment::with_prefix("LMCONNECT")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: LmConnectConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session.discovery_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "Discovery timeout must be greater than 0".to_string(),
            ));
        }

        if self.session.completion_timeout_secs == Some(0) {
            return Err(ConfigError::Message(
                "Completion timeout must be greater than 0 when set".to_string(),
            ));
        }

        if self.system.event_backlog_warning == 0 {
            return Err(ConfigError::Message(
                "Event backlog warning must be greater than 0".to_string(),
            ));
        }

        if self.simulator.video_chunk_size == 0 {
            return Err(ConfigError::Message(
                "Simulator video chunk size must be greater than 0".to_string(),
            ));
        }

        if !(-1500..=15000).contains(&self.device.altitude) {
            return Err(ConfigError::Message(format!(
                "Altitude {} ft is outside the supported range",
                self.device.altitude
            )));
        }

        Ok(())
    }
}

impl CredentialsConfig {
    /// Resolve credentials from configuration, then from the environment.
    /// Missing credentials are a startup error.
    pub fn resolve(&self) -> Result<Credentials, ConfigError> {
        let account_id = non_empty(self.account_id.clone())
            .or_else(|| non_empty(std::env::var(ACCOUNT_ID_ENV).ok()))
            .ok_or_else(|| {
                ConfigError::Message(format!(
                    "Account ID missing: set credentials.account_id or {}",
                    ACCOUNT_ID_ENV
                ))
            })?;

        let account_key = non_empty(self.account_key.clone())
            .or_else(|| non_empty(std::env::var(ACCOUNT_KEY_ENV).ok()))
            .ok_or_else(|| {
                ConfigError::Message(format!(
                    "Account key missing: set credentials.account_key or {}",
                    ACCOUNT_KEY_ENV
                ))
            })?;

        Ok(Credentials {
            account_id,
            account_key,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl SessionConfig {
    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    pub fn completion_timeout(&self) -> Option<Duration> {
        self.completion_timeout_secs.map(Duration::from_secs)
    }

    pub fn fetch_grace_period(&self) -> Duration {
        Duration::from_secs(self.fetch_grace_period_secs)
    }
}

impl SimulatorConfig {
    /// Simulator that only emits what it is told to
    pub fn manual() -> Self {
        Self {
            auto_swing: false,
            ..Self::default()
        }
    }

    pub fn shot_interval(&self) -> Duration {
        Duration::from_millis(self.shot_interval_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_shots: default_target_shots(),
            discovery_timeout_secs: default_discovery_timeout(),
            completion_timeout_secs: None,
            fetch_grace_period_secs: default_fetch_grace_period(),
            restore_power_state: default_restore_power_state(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            power_on: default_power_on(),
            auto_arm: default_auto_arm(),
            club: default_club(),
            location: default_location(),
            altitude: default_altitude(),
            temperature: default_temperature(),
            screen_layout: None,
            play_mode: None,
            data_points_hidden: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            video_directory: None,
            save_videos: default_save_videos(),
            fetch_point_clouds: default_fetch_point_clouds(),
            point_cloud_preview: default_point_cloud_preview(),
        }
    }
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            device_count: default_device_count(),
            auto_swing: default_auto_swing(),
            shot_interval_ms: default_shot_interval(),
            emit_preliminary: default_emit_preliminary(),
            video_authorized: default_video_authorized(),
            point_cloud_authorized: default_point_cloud_authorized(),
            video_chunks: default_video_chunks(),
            video_chunk_size: default_video_chunk_size(),
            point_cloud_points: default_point_cloud_points(),
        }
    }
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            event_backlog_warning: default_event_backlog_warning(),
            debug_events: false,
        }
    }
}

// Default value functions
fn default_target_shots() -> u32 {
    100
}
fn default_discovery_timeout() -> u64 {
    10
}
fn default_fetch_grace_period() -> u64 {
    5
}
fn default_restore_power_state() -> bool {
    true
}

fn default_power_on() -> bool {
    true
}
fn default_auto_arm() -> bool {
    true
}
fn default_club() -> Club {
    Club::Driver
}
fn default_location() -> Location {
    Location::Screen
}
fn default_altitude() -> i32 {
    1100
}
fn default_temperature() -> f64 {
    70.0
}

fn default_save_videos() -> bool {
    true
}
fn default_fetch_point_clouds() -> bool {
    true
}
fn default_point_cloud_preview() -> usize {
    5
}

fn default_device_count() -> u32 {
    3
}
fn default_auto_swing() -> bool {
    true
}
fn default_shot_interval() -> u64 {
    2000
}
fn default_emit_preliminary() -> bool {
    true
}
fn default_video_authorized() -> bool {
    true
}
fn default_point_cloud_authorized() -> bool {
    true
}
fn default_video_chunks() -> u32 {
    8
}
fn default_video_chunk_size() -> usize {
    16 * 1024
}
fn default_point_cloud_points() -> usize {
    64
}

fn default_event_backlog_warning() -> usize {
    256
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = LmConnectConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.session.target_shots, 100);
        assert_eq!(config.session.completion_timeout(), None);
        assert_eq!(config.device.club, Club::Driver);
        assert_eq!(config.device.location, Location::Screen);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
[credentials]
account_id = "acme"
account_key = "secret"

[session]
target_shots = 5
completion_timeout_secs = 600

[device]
club = "Iron7"
location = "Range"
data_points_hidden = ["SpinAxis", "Apex"]
"#
        )
        .unwrap();

        let config = LmConnectConfig::load_from_file(file.path()).unwrap();

        assert_eq!(config.session.target_shots, 5);
        assert_eq!(
            config.session.completion_timeout(),
            Some(Duration::from_secs(600))
        );
        assert_eq!(config.session.discovery_timeout_secs, 10);
        assert_eq!(config.device.club, Club::Iron7);
        assert_eq!(config.device.location, Location::Range);
        assert_eq!(
            config.device.data_points_hidden,
            vec![DataPoint::SpinAxis, DataPoint::Apex]
        );
        assert_eq!(config.credentials.account_id.as_deref(), Some("acme"));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = LmConnectConfig::load_from_file("/nonexistent/lmconnect.toml").unwrap();
        assert_eq!(config.session.target_shots, 100);
        assert!(config.device.power_on);
    }

    #[test]
    fn test_config_validation() {
        let mut config = LmConnectConfig::default();

        config.system.event_backlog_warning = 0;
        assert!(config.validate().is_err());

        config.system.event_backlog_warning = 16;
        config.session.completion_timeout_secs = Some(0);
        assert!(config.validate().is_err());

        config.session.completion_timeout_secs = None;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_explicit_credentials_resolve() {
        let credentials = CredentialsConfig {
            account_id: Some(" acme ".to_string()),
            account_key: Some("secret".to_string()),
        }
        .resolve()
        .unwrap();

        assert_eq!(credentials.account_id, "acme");
        assert!(!format!("{:?}", credentials).contains("secret"));
    }

    #[test]
    fn test_blank_credentials_are_missing() {
        let result = CredentialsConfig {
            account_id: Some("acme".to_string()),
            account_key: Some("   ".to_string()),
        }
        .resolve();

        // Only passes when the fallback variable is unset in the test environment
        if std::env::var(ACCOUNT_KEY_ENV).is_err() {
            assert!(result.is_err());
        }
    }
}
