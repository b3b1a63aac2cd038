//! Fault classifier and e-stop recovery controller
//!
//! When a unit reports an engaged stop, each watchdog fault code is handled in
//! reported order:
//!
//! - over-temperature codes are never released, always logged `not_released`
//! - other auto-recoverable codes release the stop while the unit's retry
//!   counter is below the ceiling; at the ceiling they are skipped
//! - every remaining code is manual-only and logged `not_released`
//!
//! The retry counter lives for the whole process and is never reset.
//!
//! Known limitation: codes are classified one at a time. A unit reporting an
//! over-temperature code together with a recoverable one (say 1416 and 1414)
//! still gets the recoverable code auto-released, even though the excluded
//! condition is present in the same batch.

use crate::api::{ApiOperation, FleetApi};
use crate::incidents::{IncidentLogError, IncidentStore};
use crate::models::{FaultIncident, FaultOutcome, FleetUnit, UnitId, UnitStatus};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

pub const AUTO_RECOVERABLE_CODES: [&str; 7] = ["1201", "1412", "1413", "1414", "1415", "1416", "1417"];
pub const OVERTEMP_EXCLUDED_CODES: [&str; 2] = ["1416", "1417"];
pub const DEFAULT_RETRY_CEILING: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    AutoRecoverable,
    OvertempExcluded,
    ManualOnly,
}

#[derive(Debug, Clone)]
pub struct FaultPolicy {
    pub auto_recoverable: BTreeSet<String>,
    /// Subset of `auto_recoverable` that is never released automatically
    pub overtemp_excluded: BTreeSet<String>,
    pub retry_ceiling: u32,
}

impl Default for FaultPolicy {
    fn default() -> Self {
        Self {
            auto_recoverable: AUTO_RECOVERABLE_CODES.iter().map(|c| c.to_string()).collect(),
            overtemp_excluded: OVERTEMP_EXCLUDED_CODES.iter().map(|c| c.to_string()).collect(),
            retry_ceiling: DEFAULT_RETRY_CEILING,
        }
    }
}

impl FaultPolicy {
    pub fn classify(&self, code: &str) -> FaultClass {
        if self.overtemp_excluded.contains(code) {
            FaultClass::OvertempExcluded
        } else if self.auto_recoverable.contains(code) {
            FaultClass::AutoRecoverable
        } else {
            FaultClass::ManualOnly
        }
    }
}

/// Codes from `watch_doggo_error_rm: [{"error_code": ...}]`, in order.
/// Integer codes are normalised to strings; malformed entries are dropped.
pub fn extract_fault_codes(errors: Option<&Value>) -> Vec<String> {
    let Some(Value::Array(entries)) = errors else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| match entry.get("error_code")? {
            Value::String(code) => Some(code.trim().to_string()),
            Value::Number(code) => Some(code.to_string()),
            _ => None,
        })
        .collect()
}

/// What one `handle` call did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub incidents: Vec<FaultIncident>,
    pub releases_issued: u32,
    /// Recoverable codes passed over because the ceiling was reached
    pub skipped_at_ceiling: Vec<String>,
}

pub struct RecoveryController {
    api: Arc<dyn FleetApi>,
    incidents: Arc<IncidentStore>,
    policy: FaultPolicy,
    retries: Mutex<HashMap<UnitId, u32>>,
}

impl RecoveryController {
    pub fn new(api: Arc<dyn FleetApi>, incidents: Arc<IncidentStore>) -> Self {
        Self::with_policy(api, incidents, FaultPolicy::default())
    }

    pub fn with_policy(
        api: Arc<dyn FleetApi>,
        incidents: Arc<IncidentStore>,
        policy: FaultPolicy,
    ) -> Self {
        Self {
            api,
            incidents,
            policy,
            retries: Mutex::new(HashMap::new()),
        }
    }

    pub fn retry_count(&self, unit_id: &str) -> u32 {
        self.retries.lock().get(unit_id).copied().unwrap_or(0)
    }

    /// Takes one attempt from the unit's budget. `None` at the ceiling.
    fn reserve_attempt(&self, unit_id: &str) -> Option<u32> {
        let mut retries = self.retries.lock();
        let count = retries.entry(unit_id.to_string()).or_insert(0);
        if *count >= self.policy.retry_ceiling {
            return None;
        }
        *count += 1;
        Some(*count)
    }

    /// Runs the recovery policy over a status with an engaged stop and
    /// persists the resulting incidents. A released stop is a no-op.
    pub async fn handle(
        &self,
        unit: &FleetUnit,
        status: &UnitStatus,
    ) -> Result<RecoveryReport, IncidentLogError> {
        let mut report = RecoveryReport::default();
        if !status.stop.is_engaged() {
            return Ok(report);
        }

        for code in &status.fault_codes {
            let incident = match self.policy.classify(code) {
                FaultClass::OvertempExcluded => {
                    warn!(unit = %unit.id, code = %code, "over-temperature, release stop manually");
                    FaultIncident::new(&unit.id, code, FaultOutcome::NotReleased)
                }
                FaultClass::ManualOnly => FaultIncident::new(&unit.id, code, FaultOutcome::NotReleased),
                FaultClass::AutoRecoverable => {
                    let Some(attempt) = self.reserve_attempt(&unit.id) else {
                        warn!(unit = %unit.id, code = %code, ceiling = self.policy.retry_ceiling, "retry ceiling reached, not releasing");
                        report.skipped_at_ceiling.push(code.clone());
                        continue;
                    };
                    report.releases_issued += 1;
                    match self.api.call(ApiOperation::ReleaseStop, &unit.name).await {
                        Ok(_) => {
                            info!(unit = %unit.id, code = %code, attempt, "stop auto-released");
                            FaultIncident::new(&unit.id, code, FaultOutcome::AutoReleased)
                        }
                        Err(e) => {
                            warn!(unit = %unit.id, code = %code, attempt, error = %e, "stop release failed");
                            FaultIncident::release_failed(&unit.id, code, e.to_string())
                        }
                    }
                }
            };
            report.incidents.push(incident);
        }

        self.incidents.append(&unit.id, &report.incidents).await?;
        Ok(report)
    }
}
