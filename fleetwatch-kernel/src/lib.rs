//! Fleetwatch kernel
//!
//! Monitors a fleet of mobile robots (reachability, status, motor telemetry)
//! and auto-recovers software emergency stops under a bounded retry policy.

pub mod api;
pub mod channel;
pub mod config;
pub mod incidents;
pub mod kernel;
pub mod models;
pub mod prober;
pub mod recovery;
pub mod scheduler;
pub mod state;
pub mod telemetry;

pub use kernel::{Collaborators, FleetKernel};
pub use state::{FleetSnapshot, FleetState, SharedFleetState};
