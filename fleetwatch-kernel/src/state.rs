//! Shared fleet state
//!
//! One readers-writer lock per data kind (reachability, status, telemetry),
//! never one lock across the whole fleet. Every registered unit has an entry
//! in each map from construction on; entries are replaced, never removed.

use crate::models::{
    FleetUnit, ReachabilityRecord, StatusPayload, TelemetryRecord, UnitId,
};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::debug;

pub type Shared<T> = Arc<RwLock<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(RwLock::new(value))
}

pub type ReachabilityMap = HashMap<UnitId, ReachabilityRecord>;
pub type StatusMap = HashMap<UnitId, StatusPayload>;
pub type TelemetryMap = HashMap<UnitId, TelemetryRecord>;

/// Result of probing one unit, merged by the status cycle.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub unit_id: UnitId,
    pub reachable: bool,
    pub status: StatusPayload,
    pub probed_at: OffsetDateTime,
}

/// Everything known about one unit at snapshot time.
#[derive(Debug, Clone, Serialize)]
pub struct UnitSnapshot {
    pub unit: FleetUnit,
    pub reachability: ReachabilityRecord,
    pub status: StatusPayload,
    pub telemetry: TelemetryRecord,
}

pub type FleetSnapshot = BTreeMap<UnitId, UnitSnapshot>;

pub struct FleetState {
    units: Vec<FleetUnit>,
    index: HashMap<UnitId, usize>,
    reachability: Shared<ReachabilityMap>,
    status: Shared<StatusMap>,
    telemetry: Shared<TelemetryMap>,
}

pub type SharedFleetState = Arc<FleetState>;

impl FleetState {
    /// Registers the fleet and default-populates every map.
    /// A repeated id keeps its first registration.
    pub fn new(units: Vec<FleetUnit>) -> Self {
        let mut registry = Vec::with_capacity(units.len());
        let mut index = HashMap::new();
        for unit in units {
            if index.contains_key(&unit.id) {
                debug!(unit = %unit.id, "duplicate unit ignored");
                continue;
            }
            index.insert(unit.id.clone(), registry.len());
            registry.push(unit);
        }

        let ids = registry.iter().map(|u| u.id.clone());
        let reachability = ids.clone().map(|id| (id, ReachabilityRecord::default())).collect();
        let status = ids.clone().map(|id| (id, StatusPayload::default())).collect();
        let telemetry = ids.map(|id| (id, TelemetryRecord::zeroed())).collect();

        Self {
            units: registry,
            index,
            reachability: new_state(reachability),
            status: new_state(status),
            telemetry: new_state(telemetry),
        }
    }

    pub fn units(&self) -> &[FleetUnit] {
        &self.units
    }

    pub fn unit(&self, id: &str) -> Option<&FleetUnit> {
        self.index.get(id).map(|&i| &self.units[i])
    }

    pub fn reachability(&self, id: &str) -> Option<ReachabilityRecord> {
        self.reachability.read().get(id).cloned()
    }

    pub fn status(&self, id: &str) -> Option<StatusPayload> {
        self.status.read().get(id).cloned()
    }

    pub fn telemetry(&self, id: &str) -> Option<TelemetryRecord> {
        self.telemetry.read().get(id).cloned()
    }

    pub fn is_reachable(&self, id: &str) -> bool {
        self.reachability
            .read()
            .get(id)
            .map(ReachabilityRecord::is_reachable)
            .unwrap_or(false)
    }

    pub fn all_reachability(&self) -> ReachabilityMap {
        self.reachability.read().clone()
    }

    pub fn all_status(&self) -> StatusMap {
        self.status.read().clone()
    }

    pub fn all_telemetry(&self) -> TelemetryMap {
        self.telemetry.read().clone()
    }

    /// Writes a whole status cycle. Unregistered ids are dropped.
    pub fn merge_probe_outcomes(&self, outcomes: Vec<ProbeOutcome>) {
        {
            let mut reachability = self.reachability.write();
            for outcome in &outcomes {
                if let Some(slot) = reachability.get_mut(&outcome.unit_id) {
                    *slot = ReachabilityRecord::probed(outcome.reachable, outcome.probed_at);
                }
            }
        }

        let mut status = self.status.write();
        for outcome in outcomes {
            if let Some(slot) = status.get_mut(&outcome.unit_id) {
                *slot = outcome.status;
            }
        }
    }

    /// Replaces a unit's telemetry if, and only if, the unit is
    /// telemetry-capable and currently reachable. Returns whether it was applied.
    pub fn set_telemetry(&self, id: &str, record: TelemetryRecord) -> bool {
        let capable = self.unit(id).map(|u| u.telemetry_capable).unwrap_or(false);
        if !capable || !self.is_reachable(id) {
            debug!(unit = %id, "telemetry update rejected");
            return false;
        }
        match self.telemetry.write().get_mut(id) {
            Some(slot) => {
                *slot = record;
                true
            }
            None => false,
        }
    }

    /// Units eligible for a telemetry fetch: capable and reachable right now.
    pub fn telemetry_candidates(&self) -> Vec<FleetUnit> {
        let reachability = self.reachability.read();
        self.units
            .iter()
            .filter(|u| u.telemetry_capable)
            .filter(|u| {
                reachability
                    .get(&u.id)
                    .map(ReachabilityRecord::is_reachable)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    pub fn online_units(&self) -> Vec<UnitId> {
        let reachability = self.reachability.read();
        self.units
            .iter()
            .filter(|u| {
                reachability
                    .get(&u.id)
                    .map(ReachabilityRecord::is_reachable)
                    .unwrap_or(false)
            })
            .map(|u| u.id.clone())
            .collect()
    }

    /// Consistent view across the three maps. Read locks are taken in a
    /// fixed order and held together only for the copy.
    pub fn snapshot(&self) -> FleetSnapshot {
        let reachability = self.reachability.read();
        let status = self.status.read();
        let telemetry = self.telemetry.read();

        self.units
            .iter()
            .map(|unit| {
                let snapshot = UnitSnapshot {
                    unit: unit.clone(),
                    reachability: reachability.get(&unit.id).cloned().unwrap_or_default(),
                    status: status.get(&unit.id).cloned().unwrap_or_default(),
                    telemetry: telemetry
                        .get(&unit.id)
                        .cloned()
                        .unwrap_or_else(TelemetryRecord::zeroed),
                };
                (unit.id.clone(), snapshot)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MotorField;

    fn fleet() -> FleetState {
        FleetState::new(vec![
            FleetUnit::new("base1", "10.0.0.1", true),
            FleetUnit::new("base2", "10.0.0.2", false),
        ])
    }

    fn outcome(id: &str, reachable: bool) -> ProbeOutcome {
        ProbeOutcome {
            unit_id: id.to_string(),
            reachable,
            status: StatusPayload::default(),
            probed_at: OffsetDateTime::now_utc(),
        }
    }

    fn reading(value: f64) -> TelemetryRecord {
        let mut record = TelemetryRecord::zeroed();
        if let Some(channel) = record.channels.get_mut("motor1") {
            channel.set(MotorField::Current, value);
        }
        record
    }

    #[test]
    fn test_every_unit_is_default_populated() {
        let state = fleet();
        for id in ["base1", "base2"] {
            assert_eq!(state.reachability(id), Some(ReachabilityRecord::default()));
            assert_eq!(state.status(id), Some(StatusPayload::default()));
            assert_eq!(state.telemetry(id), Some(TelemetryRecord::zeroed()));
        }
        assert_eq!(state.snapshot().len(), 2);
    }

    #[test]
    fn test_duplicate_registration_keeps_first() {
        let state = FleetState::new(vec![
            FleetUnit::new("base1", "10.0.0.1", true),
            FleetUnit::new("BASE1", "10.0.0.9", false),
        ]);
        assert_eq!(state.units().len(), 1);
        assert_eq!(state.unit("base1").map(|u| u.address.as_str()), Some("10.0.0.1"));
    }

    #[test]
    fn test_telemetry_requires_reachable_and_capable() {
        let state = fleet();
        assert!(!state.set_telemetry("base1", reading(1.0)), "unknown reachability");

        state.merge_probe_outcomes(vec![outcome("base1", true), outcome("base2", true)]);
        assert!(state.set_telemetry("base1", reading(1.0)));
        assert!(!state.set_telemetry("base2", reading(1.0)), "not telemetry-capable");
        assert_eq!(state.telemetry("base2"), Some(TelemetryRecord::zeroed()));

        state.merge_probe_outcomes(vec![outcome("base1", false)]);
        assert!(!state.set_telemetry("base1", reading(2.0)));
        assert_eq!(
            state.telemetry("base1").and_then(|t| t.get("motor1", MotorField::Current)),
            Some(1.0)
        );
    }

    #[test]
    fn test_candidates_and_online_units() {
        let state = fleet();
        assert!(state.telemetry_candidates().is_empty());

        state.merge_probe_outcomes(vec![outcome("base1", true), outcome("base2", true)]);
        let candidates: Vec<_> = state.telemetry_candidates().into_iter().map(|u| u.id).collect();
        assert_eq!(candidates, vec!["base1".to_string()]);
        assert_eq!(state.online_units().len(), 2);
    }

    #[test]
    fn test_merge_ignores_unregistered_units() {
        let state = fleet();
        state.merge_probe_outcomes(vec![outcome("ghost", true)]);
        assert!(state.reachability("ghost").is_none());
        assert_eq!(state.all_status().len(), 2);
    }
}
