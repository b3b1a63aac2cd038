//! Assembly of the monitoring core and the surface it exposes to a
//! presentation layer: fleet state reads, scheduler lifecycle, incident log.

use crate::api::FleetApi;
use crate::channel::{LivenessProbe, RemoteChannel};
use crate::config::FleetConfig;
use crate::incidents::{IncidentLog, IncidentLogError, IncidentStore};
use crate::prober::ReachabilityProber;
use crate::recovery::{FaultPolicy, RecoveryController};
use crate::scheduler::{FleetScheduler, SchedulerConfig, MAX_PARALLEL_FETCHES};
use crate::state::{FleetSnapshot, FleetState, SharedFleetState};
use std::sync::Arc;
use time::Date;

/// External capabilities the core runs on.
#[derive(Clone)]
pub struct Collaborators {
    pub api: Arc<dyn FleetApi>,
    pub channel: Arc<dyn RemoteChannel>,
    pub liveness: Arc<dyn LivenessProbe>,
}

pub struct FleetKernel {
    state: SharedFleetState,
    incidents: Arc<IncidentStore>,
    recovery: Arc<RecoveryController>,
    scheduler: Arc<FleetScheduler>,
}

impl FleetKernel {
    /// Builds the registry from `config` and wires every component.
    /// `incidents` must already know the unit ids it should pre-populate.
    pub fn assemble(
        config: &FleetConfig,
        incidents: Arc<IncidentStore>,
        collaborators: Collaborators,
    ) -> Self {
        Self::assemble_with_policy(config, incidents, collaborators, FaultPolicy::default())
    }

    pub fn assemble_with_policy(
        config: &FleetConfig,
        incidents: Arc<IncidentStore>,
        collaborators: Collaborators,
        policy: FaultPolicy,
    ) -> Self {
        let system = &config.system;
        let state: SharedFleetState = Arc::new(FleetState::new(config.units()));

        let prober = ReachabilityProber::new(collaborators.liveness, collaborators.api.clone())
            .with_ping_timeout(system.ping_timeout());
        let recovery = Arc::new(RecoveryController::with_policy(
            collaborators.api,
            incidents.clone(),
            policy,
        ));
        let scheduler_config = SchedulerConfig {
            status_interval: system.status_interval(),
            telemetry_interval: system.telemetry_interval(),
            command_timeout: system.ssh_command_timeout(),
            allow_simulated_telemetry: system.allow_simulated_telemetry,
            max_parallel_fetches: MAX_PARALLEL_FETCHES,
        };
        let scheduler = Arc::new(FleetScheduler::new(
            state.clone(),
            prober,
            recovery.clone(),
            collaborators.channel,
            scheduler_config,
        ));

        Self {
            state,
            incidents,
            recovery,
            scheduler,
        }
    }

    pub fn state(&self) -> &SharedFleetState {
        &self.state
    }

    pub fn scheduler(&self) -> &Arc<FleetScheduler> {
        &self.scheduler
    }

    pub fn recovery(&self) -> &Arc<RecoveryController> {
        &self.recovery
    }

    pub fn incidents(&self) -> &Arc<IncidentStore> {
        &self.incidents
    }

    pub fn start_scheduler(&self) -> bool {
        self.scheduler.start()
    }

    pub fn stop_scheduler(&self) {
        self.scheduler.stop();
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    pub fn snapshot(&self) -> FleetSnapshot {
        self.state.snapshot()
    }

    pub async fn incident_log(&self, date: Date) -> Result<IncidentLog, IncidentLogError> {
        self.incidents.load_day(date).await
    }
}
