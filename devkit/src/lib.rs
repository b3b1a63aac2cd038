/*!
# Fleetwatch DevKit - test doubles for the monitoring kernel

Lets the kernel run end to end without robots, ssh or the fleet API:
- scripted remote channel and liveness probe
- scripted named-operation fleet API with response builders
- `TestHarness` wiring a full kernel over a temporary log directory
*/

pub mod api_stub;
pub mod channel_stub;
pub mod test_utils;

pub use api_stub::{ApiReply, ScriptedFleetApi};
pub use channel_stub::{RecordedCall, Reply, ScriptedChannel, ScriptedProbe};
pub use test_utils::{wait_until, TestHarness, MOTOR_SAMPLE};
