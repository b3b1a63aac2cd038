//! Reachability prober
//!
//! One liveness check and one status query per unit, run side by side. The
//! status query never fails outward: any API problem turns into a degraded
//! payload carrying the reason reported by the "is online" operation.

use crate::api::{result_of, ApiError, ApiOperation, FleetApi};
use crate::channel::LivenessProbe;
use crate::models::{BrushCurrents, FleetUnit, StatusPayload, StopCause, StopState, UnitStatus};
use crate::recovery::extract_fault_codes;
use crate::state::ProbeOutcome;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::debug;

pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

const UNKNOWN_REASON: &str = "NA";

pub struct ReachabilityProber {
    liveness: Arc<dyn LivenessProbe>,
    api: Arc<dyn FleetApi>,
    ping_timeout: Duration,
}

impl ReachabilityProber {
    pub fn new(liveness: Arc<dyn LivenessProbe>, api: Arc<dyn FleetApi>) -> Self {
        Self {
            liveness,
            api,
            ping_timeout: DEFAULT_PING_TIMEOUT,
        }
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub async fn probe(&self, unit: &FleetUnit) -> ProbeOutcome {
        let (reachable, status) = tokio::join!(
            self.liveness.is_reachable(&unit.address, self.ping_timeout),
            self.query_status(unit),
        );
        debug!(unit = %unit.id, reachable, state = %status.working_state(), "probed");
        ProbeOutcome {
            unit_id: unit.id.clone(),
            reachable,
            status,
            probed_at: OffsetDateTime::now_utc(),
        }
    }

    pub async fn query_status(&self, unit: &FleetUnit) -> StatusPayload {
        match self.full_status(unit).await {
            Ok(status) => StatusPayload::Full(status),
            Err(e) => {
                debug!(unit = %unit.id, error = %e, "status query failed");
                StatusPayload::Degraded {
                    reason: self.offline_reason(unit).await,
                }
            }
        }
    }

    async fn full_status(&self, unit: &FleetUnit) -> Result<UnitStatus, ApiError> {
        let info = self.api.call(ApiOperation::GetStatus, &unit.name).await?;
        let info = result_of(ApiOperation::GetStatus.route(), &info)?;
        let device = self.api.call(ApiOperation::DeviceStatus, &unit.name).await?;
        let device = result_of(ApiOperation::DeviceStatus.route(), &device)?;
        build_status(info, &device).ok_or(ApiError::MissingField {
            route: ApiOperation::GetStatus.route(),
            field: "result",
        })
    }

    async fn offline_reason(&self, unit: &FleetUnit) -> String {
        match self.api.call(ApiOperation::IsOnline, &unit.name).await {
            Ok(body) => match body.get("message") {
                Some(Value::String(message)) => message.clone(),
                Some(other) if !other.is_null() => other.to_string(),
                _ => UNKNOWN_REASON.to_string(),
            },
            Err(_) => UNKNOWN_REASON.to_string(),
        }
    }
}

/// Combines the status result with the device status. `None` when the
/// status result is not an object.
pub fn build_status(info: Value, device: &Value) -> Option<UnitStatus> {
    let Value::Object(fields) = info else {
        return None;
    };

    let flag = |key: &str| fields.get(key).map(truthy).unwrap_or(false);
    let device_flag = |key: &str| device.get(key).map(truthy).unwrap_or(false);

    let stop = if device_flag("base_estop_engaged") {
        StopState::Engaged(StopCause::ButtonPressed)
    } else if device_flag("base_bumper_engaged") {
        StopState::Engaged(StopCause::BumperHit)
    } else if flag("soft_estop_engaged") {
        StopState::Engaged(StopCause::Software)
    } else {
        StopState::Released
    };

    let brushes = match (
        device.get("roller_front_brush_current").and_then(Value::as_f64),
        device.get("roller_rear_brush_current").and_then(Value::as_f64),
    ) {
        (Some(front), Some(rear)) => Some(BrushCurrents { front, rear }),
        _ => None,
    };

    Some(UnitStatus {
        battery: fields.get("battery_soc").and_then(Value::as_f64),
        stop,
        fault_codes: extract_fault_codes(fields.get("watch_doggo_error_rm")),
        is_charging: flag("is_charging"),
        is_cleaning: flag("is_cleaning"),
        is_navigating: flag("is_navigating"),
        brushes,
        fields,
    })
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Null => false,
    }
}
