/*!
Scripted fleet management API

Answers named operations from a per-unit script and records every call, so
tests can assert how often a stop release was issued.
*/

use async_trait::async_trait;
use fleetwatch_kernel::api::{ApiError, ApiOperation, FleetApi};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub enum ApiReply {
    Json(Value),
    /// Non-success HTTP status
    Status(u16),
    Timeout,
}

#[derive(Default)]
pub struct ScriptedFleetApi {
    replies: Mutex<HashMap<(ApiOperation, String), ApiReply>>,
    calls: Mutex<Vec<(ApiOperation, String)>>,
}

impl ScriptedFleetApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, op: ApiOperation, unit_name: &str, reply: ApiReply) {
        self.replies.lock().insert((op, unit_name.to_string()), reply);
    }

    /// Reports a released stop with no faults.
    pub fn healthy(&self, unit_name: &str) {
        self.set(ApiOperation::GetStatus, unit_name, ApiReply::Json(status_body(false, &[])));
        self.set(ApiOperation::DeviceStatus, unit_name, ApiReply::Json(device_body(false, false)));
        self.set(ApiOperation::ReleaseStop, unit_name, ApiReply::Json(json!({ "success": true })));
    }

    /// Reports a software stop with the given watchdog codes.
    pub fn engaged(&self, unit_name: &str, codes: &[&str]) {
        self.set(ApiOperation::GetStatus, unit_name, ApiReply::Json(status_body(true, codes)));
        self.set(ApiOperation::DeviceStatus, unit_name, ApiReply::Json(device_body(false, false)));
        self.set(ApiOperation::ReleaseStop, unit_name, ApiReply::Json(json!({ "success": true })));
    }

    pub fn calls(&self) -> Vec<(ApiOperation, String)> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self, op: ApiOperation, unit_name: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(o, u)| *o == op && u == unit_name)
            .count()
    }
}

#[async_trait]
impl FleetApi for ScriptedFleetApi {
    async fn call(&self, op: ApiOperation, unit_name: &str) -> Result<Value, ApiError> {
        self.calls.lock().push((op, unit_name.to_string()));
        let reply = self.replies.lock().get(&(op, unit_name.to_string())).cloned();
        match reply {
            Some(ApiReply::Json(body)) => Ok(body),
            Some(ApiReply::Status(status)) => Err(ApiError::Upstream {
                route: op.route(),
                status,
            }),
            Some(ApiReply::Timeout) => Err(ApiError::Timeout { route: op.route() }),
            None => Err(ApiError::Upstream {
                route: op.route(),
                status: 404,
            }),
        }
    }
}

/// `get status` response envelope.
pub fn status_body(soft_estop: bool, codes: &[&str]) -> Value {
    let errors: Vec<Value> = codes.iter().map(|c| json!({ "error_code": c })).collect();
    json!({
        "result": {
            "battery_soc": 87.0,
            "soft_estop_engaged": soft_estop,
            "is_charging": false,
            "is_cleaning": false,
            "is_navigating": false,
            "watch_doggo_error_rm": errors
        }
    })
}

/// `device status` response envelope.
pub fn device_body(button: bool, bumper: bool) -> Value {
    json!({
        "result": {
            "base_estop_engaged": button,
            "base_bumper_engaged": bumper,
            "roller_front_brush_current": 0.4,
            "roller_rear_brush_current": 0.5
        }
    })
}

/// `is online` response.
pub fn online_body(message: &str) -> Value {
    json!({ "message": message })
}
