use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a metric value was derived by the launch monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CalculationType {
    Measured,
    Calculated,
    Estimated,
}

impl fmt::Display for CalculationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CalculationType::Measured => "Measured",
            CalculationType::Calculated => "Calculated",
            CalculationType::Estimated => "Estimated",
        };
        f.write_str(name)
    }
}

/// A metric value together with the tag describing how it was derived.
///
/// The tag only exists alongside a value, so a missing value can never leave
/// a stray tag behind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub value: f64,
    pub calculation: Option<CalculationType>,
}

impl Metric {
    pub fn new(value: f64, calculation: Option<CalculationType>) -> Self {
        Self { value, calculation }
    }

    pub fn measured(value: f64) -> Self {
        Self::new(value, Some(CalculationType::Measured))
    }

    pub fn calculated(value: f64) -> Self {
        Self::new(value, Some(CalculationType::Calculated))
    }

    pub fn estimated(value: f64) -> Self {
        Self::new(value, Some(CalculationType::Estimated))
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.value)?;
        if let Some(calculation) = self.calculation {
            write!(f, " ({})", calculation)?;
        }
        Ok(())
    }
}

/// Stage of a shot measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShotType {
    /// Club and launch data available right after impact
    Preliminary,
    /// Fully computed ball flight
    Flight,
    /// Flight data re-computed for normalized conditions
    Normalized,
}

impl ShotType {
    /// Only fully computed flights count toward session completion
    pub fn is_final(self) -> bool {
        matches!(self, ShotType::Flight)
    }

    /// Whether ball-flight metrics are meaningful for this stage
    pub fn has_ball_flight(self) -> bool {
        !matches!(self, ShotType::Preliminary)
    }
}

impl fmt::Display for ShotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ShotType::Preliminary => "Preliminary",
            ShotType::Flight => "Flight",
            ShotType::Normalized => "Normalized",
        };
        f.write_str(name)
    }
}

/// Measurement snapshot for one swing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotRecord {
    pub id: String,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,

    // Club and launch
    pub attack_angle: Option<Metric>,
    pub ball_speed: Option<Metric>,
    pub club_path: Option<Metric>,
    pub club_speed: Option<Metric>,
    pub face_angle: Option<Metric>,
    pub horizontal_launch_angle: Option<Metric>,
    pub smash_factor: Option<Metric>,

    // Ball flight
    pub spin_axis: Option<Metric>,
    pub spin_rate: Option<Metric>,
    pub vertical_launch_angle: Option<Metric>,
    pub apex: Option<Metric>,
    pub carry_distance: Option<Metric>,
    pub side: Option<Metric>,
    pub side_total: Option<Metric>,
    pub total_distance: Option<Metric>,
}

impl ShotRecord {
    /// Create a record with no metrics present
    pub fn new<I: Into<String>, D: Into<String>>(
        id: I,
        device_id: D,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            device_id: device_id.into(),
            timestamp,
            attack_angle: None,
            ball_speed: None,
            club_path: None,
            club_speed: None,
            face_angle: None,
            horizontal_launch_angle: None,
            smash_factor: None,
            spin_axis: None,
            spin_rate: None,
            vertical_launch_angle: None,
            apex: None,
            carry_distance: None,
            side: None,
            side_total: None,
            total_distance: None,
        }
    }

    /// Club and launch metrics in display order
    pub fn launch_metrics(&self) -> [(&'static str, Option<Metric>); 7] {
        [
            ("Attack Angle", self.attack_angle),
            ("Ball Speed", self.ball_speed),
            ("Club Path", self.club_path),
            ("Club Speed", self.club_speed),
            ("Face Angle", self.face_angle),
            ("Horizontal Launch Angle", self.horizontal_launch_angle),
            ("Smash Factor", self.smash_factor),
        ]
    }

    /// Ball-flight metrics in display order
    pub fn flight_metrics(&self) -> [(&'static str, Option<Metric>); 8] {
        [
            ("Spin Axis", self.spin_axis),
            ("Spin Rate", self.spin_rate),
            ("Vertical Launch Angle", self.vertical_launch_angle),
            ("Apex", self.apex),
            ("Carry Distance", self.carry_distance),
            ("Side", self.side),
            ("Side Total", self.side_total),
            ("Total Distance", self.total_distance),
        ]
    }

    /// Timestamp converted to the local time zone for display
    pub fn local_timestamp(&self) -> DateTime<Local> {
        self.timestamp.with_timezone(&Local)
    }
}

/// A shot notification from the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShotEvent {
    pub shot_type: ShotType,
    pub shot: ShotRecord,
}

impl ShotEvent {
    pub fn new(shot_type: ShotType, shot: ShotRecord) -> Self {
        Self { shot_type, shot }
    }

    pub fn is_final(&self) -> bool {
        self.shot_type.is_final()
    }
}

/// Human-readable dump of a shot event
pub struct ShotReport<'a> {
    event: &'a ShotEvent,
}

impl<'a> ShotReport<'a> {
    pub fn new(event: &'a ShotEvent) -> Self {
        Self { event }
    }
}

impl fmt::Display for ShotReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shot = &self.event.shot;
        writeln!(f, "Shot received - Type: {}", self.event.shot_type)?;
        writeln!(f, "  Shot Id: {}", shot.id)?;
        writeln!(f, "  Device Id: {}", shot.device_id)?;
        write!(
            f,
            "  Timestamp: {}",
            shot.local_timestamp().format("%Y-%m-%d %H:%M:%S%.3f")
        )?;

        for (label, metric) in shot.launch_metrics() {
            if let Some(metric) = metric {
                write!(f, "\n  {}: {}", label, metric)?;
            }
        }

        if self.event.shot_type.has_ball_flight() {
            for (label, metric) in shot.flight_metrics() {
                if let Some(metric) = metric {
                    write!(f, "\n  {}: {}", label, metric)?;
                }
            }
        }

        Ok(())
    }
}
