pub mod config;
pub mod configuration;
pub mod device;
pub mod error;
pub mod events;
pub mod fetch;
pub mod keyboard_input;
pub mod selector;
pub mod session;
pub mod shot;
pub mod simulator;
pub mod storage;

pub use config::{Credentials, LmConnectConfig};
pub use configuration::{ConfigurationCommand, ConfigurationKey, ConfigurationPlan, PlanStep};
pub use device::{
    AuthorizationContext, DeviceInformation, DeviceState, LaunchMonitor, LaunchMonitorSdk,
    PointCloud, PointCloudPoint, PowerState, VideoStream,
};
pub use error::{EventBusError, LmConnectError, Result};
pub use events::{
    EventBus, EventCategory, EventMetrics, EventReceiver, EventSink, EventStreams,
    LaunchMonitorEvent, Subscription,
};
pub use fetch::{AuxiliaryFetchManager, DrainReport, FetchKind, FetchStats};
pub use keyboard_input::{KeyWait, KeyboardInputHandler};
pub use selector::{ConsoleInput, DeviceSelector, ScriptedInput, SelectionInput};
pub use session::{
    CompletionOutcome, SessionController, SessionCounters, SessionOutcome, SessionState,
    ShotTracker,
};
pub use shot::{CalculationType, Metric, ShotEvent, ShotRecord, ShotReport, ShotType};
pub use simulator::{SimulatedDevice, SimulatedSdk};
pub use storage::VideoStorage;
