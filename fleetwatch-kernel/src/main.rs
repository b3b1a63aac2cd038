/**
 * FLEETWATCH - entry point
 *
 * ROLE: load .env and the fleet file, wire the real collaborators (ssh, ping,
 * HTTP fleet API) into the kernel, run the scheduler until Ctrl-C.
 */

use anyhow::{Context, Result};
use fleetwatch_kernel::api::{ApiSettings, HttpFleetApi};
use fleetwatch_kernel::channel::{PingProbe, SshChannel, SshCredentials};
use fleetwatch_kernel::config::load_config;
use fleetwatch_kernel::incidents::IncidentStore;
use fleetwatch_kernel::{Collaborators, FleetKernel};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fleetwatch=info")),
        )
        .init();

    let config = load_config().await.context("loading fleet configuration")?;
    let units = config.units();
    if units.is_empty() {
        warn!("fleet is empty, nothing to monitor");
    }
    let system = &config.system;

    let incidents = Arc::new(IncidentStore::new(
        system.log_dir.clone(),
        units.iter().map(|u| u.id.clone()).collect(),
    ));

    let api = HttpFleetApi::new(ApiSettings::from_env(), system.api_timeout())
        .context("building fleet API client")?
        .with_incident_log(incidents.clone());

    let mut ssh = SshChannel::new(SshCredentials::from_env(), system.ssh_connect_timeout());
    if let Some(options) = &system.ssh_options {
        ssh = ssh.with_options(options).context("parsing ssh_options")?;
    }

    let kernel = FleetKernel::assemble(
        &config,
        incidents,
        Collaborators {
            api: Arc::new(api),
            channel: Arc::new(ssh),
            liveness: Arc::new(PingProbe),
        },
    );

    info!(units = units.len(), log_dir = %system.log_dir.display(), "fleetwatch starting");
    kernel.start_scheduler();

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutdown requested");
    kernel.shutdown().await;
    Ok(())
}
