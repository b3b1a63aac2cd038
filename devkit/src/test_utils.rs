/*!
Test harness for the fleetwatch kernel

Builds a fully wired `FleetKernel` over scripted collaborators and a
temporary log directory:
- fleet registry from `unit(...)` calls
- millisecond intervals and timeouts
- helpers to script healthy/engaged units and wait on conditions
*/

use crate::api_stub::ScriptedFleetApi;
use crate::channel_stub::{Reply, ScriptedChannel, ScriptedProbe};
use anyhow::{Context, Result};
use fleetwatch_kernel::config::{FleetConfig, SystemConf, UnitConf};
use fleetwatch_kernel::incidents::IncidentStore;
use fleetwatch_kernel::recovery::FaultPolicy;
use fleetwatch_kernel::{Collaborators, FleetKernel};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Sample `rostopic echo` output with non-zero readings on both channels.
pub const MOTOR_SAMPLE: &str = "motor1: \n  pos_rad: 96853.57\n  pos_offset: -0.0007\n  \
     vel_rpm: 0.0\n  vel_rad: 0.0\n  current: 0.338\nmotor2: \n  pos_rad: 97109.83\n  \
     pos_offset: -0.0008\n  vel_rpm: -0.2\n  vel_rad: -0.02\n  current: 0.605";

/// Installs a test-writer subscriber once per test binary.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .try_init()
        .ok();
}

pub struct TestHarness {
    pub api: Arc<ScriptedFleetApi>,
    pub channel: Arc<ScriptedChannel>,
    pub probe: Arc<ScriptedProbe>,
    pub kernel: FleetKernel,
    pub config: FleetConfig,
    // dropped last: removes the log directory
    _dir: TempDir,
}

impl TestHarness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    pub fn log_dir(&self) -> &std::path::Path {
        &self.config.system.log_dir
    }

    /// Marks the unit reachable and scripts a healthy status plus motor output.
    pub fn bring_online(&self, name: &str) {
        let address = self.address_of(name);
        self.probe.set_reachable(&address, true);
        self.api.healthy(name);
        self.channel.set_default(&address, Reply::stdout(MOTOR_SAMPLE));
    }

    pub fn take_offline(&self, name: &str) {
        let address = self.address_of(name);
        self.probe.set_reachable(&address, false);
    }

    pub fn address_of(&self, name: &str) -> String {
        self.config
            .fleet
            .values()
            .find(|u| u.name == name)
            .and_then(|u| u.ip.clone())
            .unwrap_or_default()
    }
}

pub struct HarnessBuilder {
    units: Vec<(String, String, bool)>,
    system: SystemConf,
    policy: FaultPolicy,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        let system = SystemConf {
            update_interval: 0.02,
            motor_update_interval: 0.02,
            ping_timeout_secs: 0.05,
            ssh_connect_timeout_secs: 0.1,
            ssh_command_timeout_secs: 0.2,
            api_timeout_secs: 0.1,
            ..SystemConf::default()
        };
        Self {
            units: Vec::new(),
            system,
            policy: FaultPolicy::default(),
        }
    }
}

impl HarnessBuilder {
    pub fn unit(mut self, name: &str, address: &str, has_motors: bool) -> Self {
        self.units.push((name.to_string(), address.to_string(), has_motors));
        self
    }

    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.system.ssh_command_timeout_secs = timeout.as_secs_f64();
        self.system.ssh_connect_timeout_secs = self
            .system
            .ssh_connect_timeout_secs
            .min(timeout.as_secs_f64());
        self
    }

    pub fn allow_simulated_telemetry(mut self, allow: bool) -> Self {
        self.system.allow_simulated_telemetry = allow;
        self
    }

    pub fn policy(mut self, policy: FaultPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> Result<TestHarness> {
        init_tracing();
        let dir = TempDir::new().context("creating harness directory")?;

        let mut config = FleetConfig {
            system: self.system,
            ..FleetConfig::default()
        };
        config.system.log_dir = dir.path().join("logs");
        for (name, address, has_motors) in self.units {
            config.fleet.insert(
                name.clone(),
                UnitConf {
                    name,
                    ip: Some(address),
                    has_motors,
                },
            );
        }
        config.validate().context("harness configuration")?;

        let unit_ids = config.units().into_iter().map(|u| u.id).collect();
        let incidents = Arc::new(IncidentStore::new(config.system.log_dir.clone(), unit_ids));

        let api = Arc::new(ScriptedFleetApi::new());
        let channel = Arc::new(ScriptedChannel::new());
        let probe = Arc::new(ScriptedProbe::new());

        let kernel = FleetKernel::assemble_with_policy(
            &config,
            incidents,
            Collaborators {
                api: api.clone(),
                channel: channel.clone(),
                liveness: probe.clone(),
            },
            self.policy,
        );

        Ok(TestHarness {
            api,
            channel,
            probe,
            kernel,
            config,
            _dir: dir,
        })
    }
}

/// Polls `condition` every 10ms until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
