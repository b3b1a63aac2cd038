//! Fleet scheduler
//!
//! Two independent periodic cycles:
//! - status: probe every unit one after the other, run recovery on engaged
//!   stops, then merge the whole batch into fleet state
//! - telemetry: fetch from capable, reachable units through a small bounded
//!   worker pool and wait for the batch before sleeping again
//!
//! Each cycle sleeps *after* its tick completes, so a slow tick delays only
//! its own next run. `stop()` clears the running flag and cancels the sleeps;
//! an in-flight tick is allowed to finish.

use crate::channel::RemoteChannel;
use crate::models::{FleetUnit, StatusPayload, UnitId, UnitStatus};
use crate::prober::ReachabilityProber;
use crate::recovery::RecoveryController;
use crate::state::SharedFleetState;
use crate::telemetry::{FetchResult, TelemetryFetcher, DEFAULT_COMMAND_TIMEOUT};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const MAX_PARALLEL_FETCHES: usize = 3;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub status_interval: Duration,
    pub telemetry_interval: Duration,
    pub command_timeout: Duration,
    /// Opt-in synthetic telemetry for units that keep failing. Off in production.
    pub allow_simulated_telemetry: bool,
    pub max_parallel_fetches: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            status_interval: Duration::from_secs(1),
            telemetry_interval: Duration::from_secs(1),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            allow_simulated_telemetry: false,
            max_parallel_fetches: MAX_PARALLEL_FETCHES,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusCycleReport {
    pub probed: usize,
    pub reachable: usize,
    /// Units whose engaged stop went through the recovery controller
    pub recoveries: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryBatch {
    pub attempted: usize,
    pub updated: usize,
    pub simulated: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Fetched, but the unit was no longer reachable when the result landed
    pub discarded: usize,
    pub elapsed: Duration,
}

pub struct FleetScheduler {
    state: SharedFleetState,
    prober: ReachabilityProber,
    recovery: Arc<RecoveryController>,
    fetchers: HashMap<UnitId, Arc<TelemetryFetcher>>,
    config: SchedulerConfig,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FleetScheduler {
    pub fn new(
        state: SharedFleetState,
        prober: ReachabilityProber,
        recovery: Arc<RecoveryController>,
        channel: Arc<dyn RemoteChannel>,
        config: SchedulerConfig,
    ) -> Self {
        let fetchers = state
            .units()
            .iter()
            .filter(|u| u.telemetry_capable)
            .map(|u| {
                let fetcher = TelemetryFetcher::new(u.clone(), channel.clone())
                    .with_command_timeout(config.command_timeout);
                (u.id.clone(), Arc::new(fetcher))
            })
            .collect();

        Self {
            state,
            prober,
            recovery,
            fetchers,
            config,
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> &SharedFleetState {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Cycle tasks not yet joined by `shutdown`.
    pub fn pending_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn fetcher(&self, unit_id: &str) -> Option<&Arc<TelemetryFetcher>> {
        self.fetchers.get(unit_id)
    }

    /// Spawns both cycles. Their first tick runs immediately.
    /// Returns `false` if the scheduler was already running.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();

        let status = self.spawn_cycle("status", self.config.status_interval, token.clone(), |s| async move {
            s.run_status_cycle().await;
        });
        let telemetry = self.spawn_cycle("telemetry", self.config.telemetry_interval, token, |s| async move {
            s.run_telemetry_cycle().await;
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(status);
        tasks.push(telemetry);
        info!(
            units = self.state.units().len(),
            status_every = ?self.config.status_interval,
            telemetry_every = ?self.config.telemetry_interval,
            "scheduler started"
        );
        true
    }

    /// No cycle re-arms after this; in-flight ticks finish on their own.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("scheduler stopping");
        }
        self.cancel.lock().cancel();
    }

    /// Stops and waits for both cycle tasks to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "cycle task ended abnormally");
            }
        }
        info!("scheduler stopped");
    }

    fn spawn_cycle<F, Fut>(
        self: &Arc<Self>,
        name: &'static str,
        interval: Duration,
        token: CancellationToken,
        tick: F,
    ) -> JoinHandle<()>
    where
        F: Fn(Arc<Self>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            while scheduler.is_running() && !token.is_cancelled() {
                tick(Arc::clone(&scheduler)).await;
                if !scheduler.is_running() {
                    break;
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!(cycle = name, "cycle exited");
        })
    }

    /// One status tick over the whole fleet.
    pub async fn run_status_cycle(&self) -> StatusCycleReport {
        let started = Instant::now();
        let mut outcomes = Vec::with_capacity(self.state.units().len());
        let mut recoveries = 0;

        for unit in self.state.units() {
            let outcome = self.prober.probe(unit).await;
            if let StatusPayload::Full(status) = &outcome.status {
                if status.stop.is_engaged() {
                    recoveries += 1;
                    self.recover(unit, status).await;
                }
            }
            outcomes.push(outcome);
        }

        let report = StatusCycleReport {
            probed: outcomes.len(),
            reachable: outcomes.iter().filter(|o| o.reachable).count(),
            recoveries,
            elapsed: started.elapsed(),
        };
        self.state.merge_probe_outcomes(outcomes);
        info!(online = ?self.state.online_units(), "status cycle done");
        report
    }

    async fn recover(&self, unit: &FleetUnit, status: &UnitStatus) {
        match self.recovery.handle(unit, status).await {
            Ok(report) => debug!(
                unit = %unit.id,
                incidents = report.incidents.len(),
                releases = report.releases_issued,
                "recovery pass"
            ),
            Err(e) => error!(unit = %unit.id, error = %e, "failed to persist incidents"),
        }
    }

    /// One telemetry tick: bounded fan-out over the current candidates.
    pub async fn run_telemetry_cycle(&self) -> TelemetryBatch {
        let started = Instant::now();
        let mut batch = TelemetryBatch::default();

        let candidates = self.state.telemetry_candidates();
        if candidates.is_empty() {
            debug!("no telemetry candidates, skipping cycle");
            return batch;
        }

        let workers = self.config.max_parallel_fetches.clamp(1, candidates.len());
        let permits = Arc::new(Semaphore::new(workers));
        let allow_simulated = self.config.allow_simulated_telemetry;
        let mut set = JoinSet::new();

        for unit in &candidates {
            let Some(fetcher) = self.fetchers.get(&unit.id).cloned() else {
                continue;
            };
            let permits = Arc::clone(&permits);
            batch.attempted += 1;
            set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let result = fetcher.fetch_result().await;
                let fallback = match &result {
                    FetchResult::Failed(_) => fetcher.simulated_fallback(allow_simulated),
                    _ => None,
                };
                (fetcher.unit().id.clone(), result, fallback)
            });
        }

        while let Some(joined) = set.join_next().await {
            let (unit_id, result, fallback) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "telemetry task failed");
                    batch.failed += 1;
                    continue;
                }
            };
            let record = match (result, fallback) {
                (FetchResult::Fetched(record), _) => record,
                (FetchResult::Failed(_), Some(simulated)) => {
                    batch.simulated += 1;
                    simulated
                }
                (FetchResult::Failed(_), None) => {
                    batch.failed += 1;
                    continue;
                }
                (FetchResult::Skipped, _) => {
                    batch.skipped += 1;
                    continue;
                }
            };
            if self.state.set_telemetry(&unit_id, record) {
                batch.updated += 1;
            } else {
                batch.discarded += 1;
            }
        }

        batch.elapsed = started.elapsed();
        if batch.failed > 0 {
            warn!(failed = batch.failed, attempted = batch.attempted, "telemetry failures this cycle");
        }
        info!(
            "updated motor data for {}/{} units in {:.2}s",
            batch.updated,
            batch.attempted,
            batch.elapsed.as_secs_f64()
        );
        batch
    }
}
