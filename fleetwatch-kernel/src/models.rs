//! Fleet data model
//!
//! Plain data shared by every component:
//! - `FleetUnit`: immutable registry entry built from configuration
//! - `ReachabilityRecord` / `StatusPayload` / `TelemetryRecord`: the three
//!   per-unit records held in shared fleet state
//! - `FaultIncident`: one persisted fault-code occurrence and its outcome

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// Lower-cased unit name, used as the key of every fleet map.
pub type UnitId = String;

/// Channels the motor controller publishes.
pub const PRIMARY_CHANNELS: [&str; 2] = ["motor1", "motor2"];

/// One monitored robot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetUnit {
    pub id: UnitId,
    /// Name as the upstream API knows it
    pub name: String,
    /// Network address used for the liveness probe and the remote channel
    pub address: String,
    pub telemetry_capable: bool,
}

impl FleetUnit {
    pub fn new(name: &str, address: &str, telemetry_capable: bool) -> Self {
        Self {
            id: name.to_lowercase(),
            name: name.to_string(),
            address: address.to_string(),
            telemetry_capable,
        }
    }
}

/// Latest liveness result. `reachable` stays `None` until the first probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReachabilityRecord {
    pub reachable: Option<bool>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_probe: Option<OffsetDateTime>,
}

impl ReachabilityRecord {
    pub fn probed(reachable: bool, at: OffsetDateTime) -> Self {
        Self {
            reachable: Some(reachable),
            last_probe: Some(at),
        }
    }

    /// Unknown counts as unreachable.
    pub fn is_reachable(&self) -> bool {
        self.reachable == Some(true)
    }
}

/// What engaged the software stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCause {
    /// Raised by the robot's own watchdog
    Software,
    ButtonPressed,
    BumperHit,
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopCause::Software => write!(f, "Software stop"),
            StopCause::ButtonPressed => write!(f, "Button pressed"),
            StopCause::BumperHit => write!(f, "Front bumper hit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "cause", rename_all = "snake_case")]
pub enum StopState {
    Released,
    Engaged(StopCause),
}

impl StopState {
    pub fn is_engaged(&self) -> bool {
        matches!(self, StopState::Engaged(_))
    }
}

/// Roller brush currents from the cleaning device status.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BrushCurrents {
    pub front: f64,
    pub rear: f64,
}

/// Coarse activity label shown next to each unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkingState {
    Offline,
    EStopEngaged,
    Charging,
    Cleaning,
    Navigation,
    Idle,
}

impl fmt::Display for WorkingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            WorkingState::Offline => "Offline",
            WorkingState::EStopEngaged => "E-Stop Engaged",
            WorkingState::Charging => "Charging",
            WorkingState::Cleaning => "Cleaning",
            WorkingState::Navigation => "Navigation",
            WorkingState::Idle => "Idle",
        };
        f.write_str(label)
    }
}

/// Full status reported by a unit that answered its status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitStatus {
    pub battery: Option<f64>,
    pub stop: StopState,
    /// Watchdog fault codes, in reported order
    pub fault_codes: Vec<String>,
    pub is_charging: bool,
    pub is_cleaning: bool,
    pub is_navigating: bool,
    pub brushes: Option<BrushCurrents>,
    /// Every field of the upstream status result, untouched
    pub fields: Map<String, Value>,
}

impl UnitStatus {
    pub fn working_state(&self) -> WorkingState {
        if self.stop.is_engaged() {
            WorkingState::EStopEngaged
        } else if self.is_charging {
            WorkingState::Charging
        } else if self.is_cleaning {
            WorkingState::Cleaning
        } else if self.is_navigating {
            WorkingState::Navigation
        } else {
            WorkingState::Idle
        }
    }
}

/// Status of one unit: either the full report or the reason it is missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusPayload {
    Degraded { reason: String },
    Full(UnitStatus),
}

impl Default for StatusPayload {
    fn default() -> Self {
        StatusPayload::Degraded {
            reason: "NA".to_string(),
        }
    }
}

impl StatusPayload {
    pub fn working_state(&self) -> WorkingState {
        match self {
            StatusPayload::Degraded { .. } => WorkingState::Offline,
            StatusPayload::Full(status) => status.working_state(),
        }
    }

    pub fn as_full(&self) -> Option<&UnitStatus> {
        match self {
            StatusPayload::Full(status) => Some(status),
            StatusPayload::Degraded { .. } => None,
        }
    }
}

/// Numeric fields of one motor channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorField {
    PosRad,
    PosOffset,
    VelRpm,
    VelRad,
    Current,
}

impl MotorField {
    pub const ALL: [MotorField; 5] = [
        MotorField::PosRad,
        MotorField::PosOffset,
        MotorField::VelRpm,
        MotorField::VelRad,
        MotorField::Current,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            MotorField::PosRad => "pos_rad",
            MotorField::PosOffset => "pos_offset",
            MotorField::VelRpm => "vel_rpm",
            MotorField::VelRad => "vel_rad",
            MotorField::Current => "current",
        }
    }
}

impl FromStr for MotorField {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MotorField::ALL
            .into_iter()
            .find(|field| field.as_str() == s)
            .ok_or(())
    }
}

/// Readings of one channel. Fields the unit did not report are absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelReadings(pub BTreeMap<MotorField, f64>);

impl ChannelReadings {
    pub fn zeroed() -> Self {
        Self(MotorField::ALL.into_iter().map(|f| (f, 0.0)).collect())
    }

    pub fn get(&self, field: MotorField) -> Option<f64> {
        self.0.get(&field).copied()
    }

    pub fn set(&mut self, field: MotorField, value: f64) {
        self.0.insert(field, value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Motor telemetry of one unit, keyed by channel name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub channels: BTreeMap<String, ChannelReadings>,
    /// Set on synthetic records produced by the opt-in fallback path
    #[serde(default)]
    pub simulated: bool,
}

impl TelemetryRecord {
    /// Placeholder used when no real record exists: both channels, all zero.
    pub fn zeroed() -> Self {
        Self {
            channels: PRIMARY_CHANNELS
                .iter()
                .map(|name| (name.to_string(), ChannelReadings::zeroed()))
                .collect(),
            simulated: false,
        }
    }

    /// Clearly synthetic, non-zero readings.
    pub fn simulated() -> Self {
        let sample = |values: [f64; 5]| {
            ChannelReadings(MotorField::ALL.into_iter().zip(values).collect())
        };
        let mut channels = BTreeMap::new();
        channels.insert("motor1".to_string(), sample([1.57, 0.05, 120.5, 12.6, 2.3]));
        channels.insert("motor2".to_string(), sample([2.14, 0.02, 135.2, 14.1, 2.7]));
        Self {
            channels,
            simulated: true,
        }
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelReadings> {
        self.channels.get(name)
    }

    pub fn get(&self, channel: &str, field: MotorField) -> Option<f64> {
        self.channel(channel).and_then(|c| c.get(field))
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn is_all_zero(&self) -> bool {
        self.channels
            .values()
            .flat_map(|c| c.0.values())
            .all(|v| *v == 0.0)
    }
}

/// How a fault code was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultOutcome {
    NotReleased,
    AutoReleased,
}

/// One logged fault-code occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultIncident {
    pub unit_id: UnitId,
    pub fault_code: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub outcome: FaultOutcome,
    /// Set when a release was attempted and the call failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_error: Option<String>,
}

impl FaultIncident {
    pub fn new(unit_id: &str, fault_code: &str, outcome: FaultOutcome) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            fault_code: fault_code.to_string(),
            timestamp: OffsetDateTime::now_utc(),
            outcome,
            release_error: None,
        }
    }

    pub fn release_failed(unit_id: &str, fault_code: &str, error: String) -> Self {
        Self {
            release_error: Some(error),
            ..Self::new(unit_id, fault_code, FaultOutcome::NotReleased)
        }
    }

    /// Operator-facing text, e.g. `[AUTO RELEASED] Error 1412`.
    pub fn label(&self) -> String {
        let tag = match self.outcome {
            FaultOutcome::AutoReleased => "AUTO RELEASED",
            FaultOutcome::NotReleased => "NOT RELEASED",
        };
        format!("[{}] Error {}", tag, self.fault_code)
    }
}
