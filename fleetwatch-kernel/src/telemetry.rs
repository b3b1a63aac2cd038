//! Motor telemetry fetcher
//!
//! Reads the aggregated motor topic from one unit over the remote channel and
//! parses the line-oriented `rostopic echo` output:
//!
//! ```text
//! motor1:
//!   pos_rad: 1.5
//!   current: 0.3
//! motor2:
//!   ...
//! ```
//!
//! Transport failures are counted per unit. Once the count reaches
//! [`FAILURE_CEILING`] the next fetch is skipped without touching the network
//! and the count starts over.

use crate::channel::{ChannelError, RemoteChannel};
use crate::models::{ChannelReadings, FleetUnit, MotorField, TelemetryRecord, PRIMARY_CHANNELS};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const MOTOR_READ_COMMAND: &str = "source /opt/ros/noetic/setup.bash && \
     source ~/catkin_ws/devel/setup.bash && \
     rostopic echo -n 1 /flexa_motor_controller/motor_agg_info";

pub const FAILURE_CEILING: u32 = 10;
/// Failures needed before the simulated fallback may kick in
pub const SIMULATION_THRESHOLD: u32 = 5;
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(20);

/// Parses `rostopic echo` output. Fields a channel did not report stay absent.
pub fn parse_motor_output(output: &str) -> TelemetryRecord {
    let mut record = TelemetryRecord::default();
    let mut current: Option<String> = None;

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("[INFO]") {
            continue;
        }

        if line.to_lowercase().starts_with("motor") {
            let name = line
                .split(':')
                .next()
                .unwrap_or(line)
                .trim()
                .to_lowercase();
            if !PRIMARY_CHANNELS.contains(&name.as_str()) {
                warn!(channel = %name, "unexpected motor channel");
            }
            record.channels.insert(name.clone(), ChannelReadings::default());
            current = Some(name);
            continue;
        }

        let Some(channel) = current.as_ref() else {
            continue;
        };
        let Some((key, value)) = line.split_once(':') else {
            debug!(line, "malformed telemetry line");
            continue;
        };

        let key = key.trim().to_lowercase();
        let Ok(field) = MotorField::from_str(&key) else {
            warn!(channel = %channel, field = %key, "unexpected telemetry field");
            continue;
        };

        let value = value.trim();
        let number = value.parse::<f64>().unwrap_or_else(|_| {
            warn!(channel = %channel, field = %key, value, "unparseable value, using 0.0");
            0.0
        });
        if let Some(readings) = record.channels.get_mut(channel) {
            readings.set(field, number);
        }
    }

    record
}

/// Why a fetch produced nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFailure {
    Timeout,
    /// stderr reported a refused or timed out connection
    Connection(String),
    EmptyOutput,
    /// Any other stderr output. Not counted toward the ceiling.
    Command(String),
    Unparseable,
    Spawn(String),
}

impl FetchFailure {
    pub fn counts_toward_ceiling(&self) -> bool {
        !matches!(self, FetchFailure::Command(_))
    }
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchFailure::Timeout => write!(f, "timeout"),
            FetchFailure::Connection(e) => write!(f, "connection error: {}", e),
            FetchFailure::EmptyOutput => write!(f, "no data received"),
            FetchFailure::Command(e) => write!(f, "command error: {}", e),
            FetchFailure::Unparseable => write!(f, "no motor data in output"),
            FetchFailure::Spawn(e) => write!(f, "spawn failed: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult {
    Fetched(TelemetryRecord),
    Failed(FetchFailure),
    /// Circuit open: no remote call was made this cycle.
    Skipped,
}

/// Telemetry reader bound to one unit. Holds the unit's failure counter.
pub struct TelemetryFetcher {
    unit: FleetUnit,
    channel: Arc<dyn RemoteChannel>,
    command_timeout: Duration,
    failures: AtomicU32,
}

impl TelemetryFetcher {
    pub fn new(unit: FleetUnit, channel: Arc<dyn RemoteChannel>) -> Self {
        Self {
            unit,
            channel,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            failures: AtomicU32::new(0),
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn unit(&self) -> &FleetUnit {
        &self.unit
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    pub async fn fetch_result(&self) -> FetchResult {
        let id = &self.unit.id;
        if self.failures.load(Ordering::SeqCst) >= FAILURE_CEILING {
            self.failures.store(0, Ordering::SeqCst);
            warn!(unit = %id, "failure ceiling reached, skipping this cycle");
            return FetchResult::Skipped;
        }

        let result = match self
            .channel
            .execute(&self.unit.address, MOTOR_READ_COMMAND, self.command_timeout)
            .await
        {
            Ok(output) => {
                let stderr = output.stderr.trim();
                if !stderr.is_empty() {
                    if stderr.contains("Connection refused") || stderr.contains("Connection timed out") {
                        Err(FetchFailure::Connection(stderr.to_string()))
                    } else {
                        Err(FetchFailure::Command(stderr.to_string()))
                    }
                } else if output.stdout.trim().is_empty() {
                    Err(FetchFailure::EmptyOutput)
                } else {
                    let record = parse_motor_output(&output.stdout);
                    if record.is_empty() {
                        Err(FetchFailure::Unparseable)
                    } else {
                        Ok(record)
                    }
                }
            }
            Err(ChannelError::Timeout(_)) => Err(FetchFailure::Timeout),
            Err(ChannelError::Spawn(e)) => Err(FetchFailure::Spawn(e.to_string())),
        };

        match result {
            Ok(record) => {
                self.failures.store(0, Ordering::SeqCst);
                log_readings(id, &record);
                FetchResult::Fetched(record)
            }
            Err(failure) => {
                if failure.counts_toward_ceiling() {
                    let count = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
                    error!(unit = %id, attempt = count, max = FAILURE_CEILING, "telemetry fetch failed: {}", failure);
                } else {
                    error!(unit = %id, "telemetry fetch failed: {}", failure);
                }
                FetchResult::Failed(failure)
            }
        }
    }

    /// `None` on failure or skip.
    pub async fn fetch(&self) -> Option<TelemetryRecord> {
        match self.fetch_result().await {
            FetchResult::Fetched(record) => Some(record),
            FetchResult::Failed(_) | FetchResult::Skipped => None,
        }
    }

    /// Like [`fetch`](Self::fetch), but once enough failures have piled up and
    /// the caller opted in, returns a synthetic record flagged `simulated`.
    pub async fn fetch_or_simulate(&self, allow_simulated: bool) -> Option<TelemetryRecord> {
        match self.fetch().await {
            Some(record) => Some(record),
            None => self.simulated_fallback(allow_simulated),
        }
    }

    /// Synthetic record for a unit that has failed at least
    /// [`SIMULATION_THRESHOLD`] times in a row. Never without opt-in.
    pub fn simulated_fallback(&self, allow_simulated: bool) -> Option<TelemetryRecord> {
        if !allow_simulated {
            return None;
        }
        let failures = self.failure_count();
        if failures < SIMULATION_THRESHOLD {
            return None;
        }
        warn!(unit = %self.unit.id, failures, "serving simulated telemetry");
        Some(TelemetryRecord::simulated())
    }
}

fn log_readings(unit: &str, record: &TelemetryRecord) {
    let non_zero: Vec<&str> = [MotorField::PosRad, MotorField::VelRpm, MotorField::Current]
        .into_iter()
        .filter(|field| {
            record
                .channels
                .values()
                .any(|c| c.get(*field).is_some_and(|v| v != 0.0))
        })
        .map(MotorField::as_str)
        .collect();

    if non_zero.is_empty() {
        warn!(unit, "returned ALL ZEROS for motor values");
    } else {
        info!(unit, fields = %non_zero.join(", "), "non-zero motor values");
    }
}
