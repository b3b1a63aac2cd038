use fleetwatch_devkit::{Reply, ScriptedChannel, MOTOR_SAMPLE};
use fleetwatch_kernel::models::{FleetUnit, MotorField};
use fleetwatch_kernel::telemetry::{
    FetchFailure, FetchResult, TelemetryFetcher, MOTOR_READ_COMMAND,
};
use std::sync::Arc;
use std::time::Duration;

fn fetcher(channel: &Arc<ScriptedChannel>, timeout: Duration) -> TelemetryFetcher {
    TelemetryFetcher::new(FleetUnit::new("base8", "192.168.1.108", true), channel.clone())
        .with_command_timeout(timeout)
}

#[tokio::test]
async fn test_fetch_issues_motor_read_with_timeout() {
    let channel = Arc::new(ScriptedChannel::new());
    channel.set_default("192.168.1.108", Reply::stdout(MOTOR_SAMPLE));

    let record = fetcher(&channel, Duration::from_secs(20)).fetch().await.unwrap();
    assert_eq!(record.get("motor1", MotorField::Current), Some(0.338));
    assert_eq!(record.get("motor2", MotorField::VelRad), Some(-0.02));
    assert!(!record.simulated);

    let calls = channel.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].command, MOTOR_READ_COMMAND);
    assert_eq!(calls[0].timeout, Duration::from_secs(20));
}

#[tokio::test]
async fn test_hung_channel_times_out_and_counts() {
    let channel = Arc::new(ScriptedChannel::new());
    channel.set_delay("192.168.1.108", Duration::from_secs(60));
    let fetcher = fetcher(&channel, Duration::from_millis(50));

    assert_eq!(
        fetcher.fetch_result().await,
        FetchResult::Failed(FetchFailure::Timeout)
    );
    assert_eq!(fetcher.failure_count(), 1);
}

#[tokio::test]
async fn test_connection_timed_out_counts() {
    let channel = Arc::new(ScriptedChannel::new());
    channel.queue(
        "192.168.1.108",
        Reply::Stderr("ssh: connect to host 192.168.1.108 port 22: Connection timed out".into()),
    );
    channel.queue("192.168.1.108", Reply::stdout(MOTOR_SAMPLE));
    let fetcher = fetcher(&channel, Duration::from_secs(1));

    assert!(fetcher.fetch().await.is_none());
    assert_eq!(fetcher.failure_count(), 1);
    assert!(fetcher.fetch().await.is_some());
    assert_eq!(fetcher.failure_count(), 0);
}

#[tokio::test]
async fn test_simulation_waits_for_threshold() {
    let channel = Arc::new(ScriptedChannel::new());
    channel.set_default("192.168.1.108", Reply::refused());
    let fetcher = fetcher(&channel, Duration::from_secs(1));

    let mut results = Vec::new();
    for _ in 0..5 {
        results.push(fetcher.fetch_or_simulate(true).await);
    }
    assert!(results[..4].iter().all(Option::is_none));
    let last = results[4].as_ref().unwrap();
    assert!(last.simulated);
    assert_eq!(last.get("motor1", MotorField::VelRpm), Some(120.5));
}
