use crate::config::DeviceConfig;
use crate::device::{LaunchMonitor, PowerState};
use crate::error::{LmConnectError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error, info};

/// Settings a launch monitor accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigurationKey {
    PowerState,
    AutoArm,
    Club,
    Location,
    Altitude,
    Temperature,
    ScreenLayout,
    PlayMode,
    DataPointsHidden,
}

impl fmt::Display for ConfigurationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Club {
    Driver,
    Wood3,
    Wood5,
    Hybrid,
    Iron4,
    Iron5,
    Iron6,
    Iron7,
    Iron8,
    Iron9,
    PitchingWedge,
    SandWedge,
    LobWedge,
    Putter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
    Screen,
    Net,
    Range,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScreenLayout {
    Standard,
    Compact,
    Tiles,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayMode {
    Practice,
    Game,
}

/// Metrics that can be hidden on the device display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataPoint {
    AttackAngle,
    BallSpeed,
    ClubPath,
    ClubSpeed,
    FaceAngle,
    SmashFactor,
    SpinAxis,
    SpinRate,
    LaunchAngle,
    Apex,
    CarryDistance,
    TotalDistance,
}

/// A configuration key paired with a value of the matching type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigurationCommand {
    AutoArm(bool),
    Club(Club),
    Location(Location),
    /// Feet above sea level
    Altitude(i32),
    /// Degrees Fahrenheit
    Temperature(f64),
    ScreenLayout(ScreenLayout),
    PlayMode(PlayMode),
    DataPointsHidden(Vec<DataPoint>),
}

impl ConfigurationCommand {
    pub fn key(&self) -> ConfigurationKey {
        match self {
            ConfigurationCommand::AutoArm(_) => ConfigurationKey::AutoArm,
            ConfigurationCommand::Club(_) => ConfigurationKey::Club,
            ConfigurationCommand::Location(_) => ConfigurationKey::Location,
            ConfigurationCommand::Altitude(_) => ConfigurationKey::Altitude,
            ConfigurationCommand::Temperature(_) => ConfigurationKey::Temperature,
            ConfigurationCommand::ScreenLayout(_) => ConfigurationKey::ScreenLayout,
            ConfigurationCommand::PlayMode(_) => ConfigurationKey::PlayMode,
            ConfigurationCommand::DataPointsHidden(_) => ConfigurationKey::DataPointsHidden,
        }
    }

    /// Value rendered for logs and change notifications
    pub fn value_string(&self) -> String {
        match self {
            ConfigurationCommand::AutoArm(v) => v.to_string(),
            ConfigurationCommand::Club(v) => format!("{:?}", v),
            ConfigurationCommand::Location(v) => format!("{:?}", v),
            ConfigurationCommand::Altitude(v) => v.to_string(),
            ConfigurationCommand::Temperature(v) => format!("{:.1}", v),
            ConfigurationCommand::ScreenLayout(v) => format!("{:?}", v),
            ConfigurationCommand::PlayMode(v) => format!("{:?}", v),
            ConfigurationCommand::DataPointsHidden(v) => format!("{:?}", v),
        }
    }
}

impl fmt::Display for ConfigurationCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.key(), self.value_string())
    }
}

/// One entry of a configuration plan
#[derive(Debug, Clone, PartialEq)]
pub enum PlanStep {
    PowerState(PowerState),
    Configure(ConfigurationCommand),
}

impl PlanStep {
    pub fn key(&self) -> ConfigurationKey {
        match self {
            PlanStep::PowerState(_) => ConfigurationKey::PowerState,
            PlanStep::Configure(command) => command.key(),
        }
    }

    /// Device operation that carries out this step
    pub fn operation(&self) -> &'static str {
        match self {
            PlanStep::PowerState(_) => "set_power_state",
            PlanStep::Configure(_) => "set_configuration",
        }
    }
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanStep::PowerState(state) => write!(f, "PowerState = {}", state),
            PlanStep::Configure(command) => fmt::Display::fmt(command, f),
        }
    }
}

/// Ordered configuration applied after connecting.
///
/// Steps run strictly in order and the first failure aborts the rest. The plan
/// does not check device state: issuing `PowerState(Active)` ahead of settings
/// that need an awake device is up to whoever builds the plan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigurationPlan {
    steps: Vec<PlanStep>,
}

impl ConfigurationPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_power_state(mut self, state: PowerState) -> Self {
        self.steps.push(PlanStep::PowerState(state));
        self
    }

    pub fn with_command(mut self, command: ConfigurationCommand) -> Self {
        self.steps.push(PlanStep::Configure(command));
        self
    }

    /// Build the plan described by the `[device]` configuration section
    pub fn from_config(config: &DeviceConfig) -> Self {
        let mut plan = Self::new();

        if config.power_on {
            plan = plan.with_power_state(PowerState::Active);
        }

        plan = plan
            .with_command(ConfigurationCommand::AutoArm(config.auto_arm))
            .with_command(ConfigurationCommand::Club(config.club))
            .with_command(ConfigurationCommand::Location(config.location))
            .with_command(ConfigurationCommand::Altitude(config.altitude))
            .with_command(ConfigurationCommand::Temperature(config.temperature));

        if let Some(layout) = config.screen_layout {
            plan = plan.with_command(ConfigurationCommand::ScreenLayout(layout));
        }
        if let Some(mode) = config.play_mode {
            plan = plan.with_command(ConfigurationCommand::PlayMode(mode));
        }
        if !config.data_points_hidden.is_empty() {
            plan = plan.with_command(ConfigurationCommand::DataPointsHidden(
                config.data_points_hidden.clone(),
            ));
        }

        plan
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Whether the plan wakes the device
    pub fn activates_device(&self) -> bool {
        self.steps
            .iter()
            .any(|step| matches!(step, PlanStep::PowerState(PowerState::Active)))
    }

    /// Apply every step in order, awaiting each before issuing the next.
    ///
    /// A failing step aborts the plan. Whatever the device reported, the error
    /// comes back as a connection error carrying that step's key. Returns the
    /// number of steps applied.
    pub async fn apply(&self, device: &dyn LaunchMonitor) -> Result<usize> {
        info!(
            "Applying {} configuration steps to {}",
            self.steps.len(),
            device.id()
        );

        for (index, step) in self.steps.iter().enumerate() {
            debug!("Step {}/{}: {}", index + 1, self.steps.len(), step);

            let result = match step {
                PlanStep::PowerState(state) => device.set_power_state(*state).await,
                PlanStep::Configure(command) => device.set_configuration(command).await,
            };

            if let Err(e) = result {
                error!("Configuration step '{}' failed on {}: {}", step, device.id(), e);
                let e = match e {
                    e @ LmConnectError::Connection { .. } => e,
                    other => {
                        LmConnectError::connection(device.id(), step.operation(), other.to_string())
                    }
                };
                return Err(e.with_key(step.key()));
            }
        }

        info!("Configuration applied to {}", device.id());
        Ok(self.steps.len())
    }
}
