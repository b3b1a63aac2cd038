use fleetwatch_devkit::api_stub::online_body;
use fleetwatch_devkit::{wait_until, ApiReply, Reply, TestHarness};
use fleetwatch_kernel::api::ApiOperation;
use fleetwatch_kernel::models::{MotorField, StatusPayload, TelemetryRecord, WorkingState};
use std::time::{Duration, Instant};

fn fleet(capable: usize, plain: usize) -> TestHarness {
    let mut builder = TestHarness::builder();
    for i in 0..capable {
        builder = builder.unit(&format!("base{}", i), &format!("10.0.0.{}", i + 1), true);
    }
    for i in 0..plain {
        builder = builder.unit(&format!("plain{}", i), &format!("10.0.1.{}", i + 1), false);
    }
    builder.build().unwrap()
}

#[tokio::test]
async fn test_state_is_populated_before_first_probe() {
    let h = fleet(2, 1);
    let snapshot = h.kernel.snapshot();

    assert_eq!(snapshot.len(), 3);
    for unit in snapshot.values() {
        assert_eq!(unit.reachability.reachable, None);
        assert_eq!(unit.status, StatusPayload::Degraded { reason: "NA".into() });
        assert_eq!(unit.status.working_state(), WorkingState::Offline);
        assert_eq!(unit.telemetry, TelemetryRecord::zeroed());
    }
}

#[tokio::test]
async fn test_status_cycle_merges_reachability_and_status() {
    let h = fleet(1, 1);
    h.bring_online("base0");
    h.api.set(ApiOperation::IsOnline, "plain0", ApiReply::Json(online_body("Robot is offline")));

    let report = h.kernel.scheduler().run_status_cycle().await;
    assert_eq!(report.probed, 2);
    assert_eq!(report.reachable, 1);

    let state = h.kernel.state();
    assert!(state.is_reachable("base0"));
    assert!(!state.is_reachable("plain0"));
    assert!(state.reachability("plain0").unwrap().last_probe.is_some());

    let status = state.status("base0").unwrap();
    assert_eq!(status.working_state(), WorkingState::Idle);
    assert_eq!(status.as_full().and_then(|s| s.battery), Some(87.0));
    assert_eq!(
        state.status("plain0"),
        Some(StatusPayload::Degraded { reason: "Robot is offline".into() })
    );
    assert_eq!(state.online_units(), vec!["base0".to_string()]);
}

#[tokio::test]
async fn test_status_timeout_degrades_to_na() {
    let h = fleet(1, 0);
    h.api.set(ApiOperation::GetStatus, "base0", ApiReply::Timeout);
    h.api.set(ApiOperation::IsOnline, "base0", ApiReply::Status(502));

    h.kernel.scheduler().run_status_cycle().await;
    assert_eq!(
        h.kernel.state().status("base0"),
        Some(StatusPayload::Degraded { reason: "NA".into() })
    );
}

#[tokio::test]
async fn test_plain_units_keep_zeroed_telemetry() {
    let h = fleet(1, 2);
    for name in ["base0", "plain0", "plain1"] {
        h.bring_online(name);
    }
    let scheduler = h.kernel.scheduler();

    for _ in 0..4 {
        scheduler.run_status_cycle().await;
        let batch = scheduler.run_telemetry_cycle().await;
        assert_eq!(batch.attempted, 1);
        assert_eq!(batch.updated, 1);
    }

    let state = h.kernel.state();
    assert_eq!(state.telemetry("plain0"), Some(TelemetryRecord::zeroed()));
    assert_eq!(state.telemetry("plain1"), Some(TelemetryRecord::zeroed()));
    assert_eq!(h.channel.call_count(&h.address_of("plain0")), 0);
    assert_eq!(
        state.telemetry("base0").and_then(|t| t.get("motor2", MotorField::Current)),
        Some(0.605)
    );
}

#[tokio::test]
async fn test_unreachable_units_are_not_fetched() {
    let h = fleet(2, 0);
    h.bring_online("base0");
    h.bring_online("base1");
    h.take_offline("base1");

    let scheduler = h.kernel.scheduler();
    scheduler.run_status_cycle().await;
    let batch = scheduler.run_telemetry_cycle().await;

    assert_eq!(batch.attempted, 1);
    assert_eq!(h.channel.call_count(&h.address_of("base1")), 0);
    assert_eq!(h.kernel.state().telemetry("base1"), Some(TelemetryRecord::zeroed()));
}

#[tokio::test]
async fn test_empty_candidate_set_skips_cycle() {
    let h = fleet(2, 0);
    let batch = h.kernel.scheduler().run_telemetry_cycle().await;
    assert_eq!(batch.attempted, 0);
    assert!(h.channel.calls().is_empty());
}

#[tokio::test]
async fn test_fan_out_is_bounded_to_three() {
    let h = fleet(6, 0);
    for i in 0..6 {
        let name = format!("base{}", i);
        h.bring_online(&name);
        h.channel.set_delay(&h.address_of(&name), Duration::from_millis(50));
    }
    let scheduler = h.kernel.scheduler();
    scheduler.run_status_cycle().await;

    let batch = scheduler.run_telemetry_cycle().await;
    assert_eq!(batch.attempted, 6);
    assert_eq!(batch.updated, 6);
    assert_eq!(h.channel.max_in_flight(), 3);
}

#[tokio::test]
async fn test_pool_shrinks_to_candidate_count() {
    let h = fleet(2, 0);
    for name in ["base0", "base1"] {
        h.bring_online(name);
        h.channel.set_delay(&h.address_of(name), Duration::from_millis(30));
    }
    let scheduler = h.kernel.scheduler();
    scheduler.run_status_cycle().await;
    scheduler.run_telemetry_cycle().await;
    assert!(h.channel.max_in_flight() <= 2);
}

#[tokio::test]
async fn test_hung_unit_is_bounded_by_command_timeout() {
    let h = TestHarness::builder()
        .unit("base0", "10.0.0.1", true)
        .unit("base1", "10.0.0.2", true)
        .command_timeout(Duration::from_millis(100))
        .build()
        .unwrap();
    h.bring_online("base0");
    h.bring_online("base1");
    h.channel.set_delay("10.0.0.2", Duration::from_secs(30));

    let scheduler = h.kernel.scheduler();
    scheduler.run_status_cycle().await;

    let started = Instant::now();
    let batch = scheduler.run_telemetry_cycle().await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(batch.updated, 1);
    assert_eq!(batch.failed, 1);
    assert_eq!(scheduler.fetcher("base1").unwrap().failure_count(), 1);
}

#[tokio::test]
async fn test_failed_fetch_keeps_previous_record() {
    let h = fleet(1, 0);
    h.bring_online("base0");
    let scheduler = h.kernel.scheduler();
    scheduler.run_status_cycle().await;
    scheduler.run_telemetry_cycle().await;
    let before = h.kernel.state().telemetry("base0");

    h.channel.set_default(&h.address_of("base0"), Reply::refused());
    let batch = scheduler.run_telemetry_cycle().await;
    assert_eq!(batch.failed, 1);
    assert_eq!(h.kernel.state().telemetry("base0"), before);
}

#[tokio::test]
async fn test_ceiling_skips_one_cycle_then_resumes() {
    let h = fleet(1, 0);
    h.bring_online("base0");
    let address = h.address_of("base0");
    h.channel.set_default(&address, Reply::refused());

    let scheduler = h.kernel.scheduler();
    scheduler.run_status_cycle().await;
    for _ in 0..10 {
        assert_eq!(scheduler.run_telemetry_cycle().await.failed, 1);
    }
    assert_eq!(h.channel.call_count(&address), 10);

    let skipped = scheduler.run_telemetry_cycle().await;
    assert_eq!(skipped.skipped, 1);
    assert_eq!(h.channel.call_count(&address), 10);
    assert_eq!(scheduler.fetcher("base0").unwrap().failure_count(), 0);

    h.channel.set_default(&address, Reply::stdout(fleetwatch_devkit::MOTOR_SAMPLE));
    let resumed = scheduler.run_telemetry_cycle().await;
    assert_eq!(resumed.updated, 1);
    assert_eq!(h.channel.call_count(&address), 11);
}

#[tokio::test]
async fn test_simulated_telemetry_requires_opt_in() {
    for allow in [false, true] {
        let h = TestHarness::builder()
            .unit("base0", "10.0.0.1", true)
            .allow_simulated_telemetry(allow)
            .build()
            .unwrap();
        h.bring_online("base0");
        h.channel.set_default("10.0.0.1", Reply::Timeout);

        let scheduler = h.kernel.scheduler();
        scheduler.run_status_cycle().await;
        let mut simulated = 0;
        for _ in 0..6 {
            simulated += scheduler.run_telemetry_cycle().await.simulated;
        }

        let telemetry = h.kernel.state().telemetry("base0").unwrap();
        if allow {
            // failures 5 and 6
            assert_eq!(simulated, 2);
            assert!(telemetry.simulated);
        } else {
            assert_eq!(simulated, 0);
            assert_eq!(telemetry, TelemetryRecord::zeroed());
        }
    }
}

#[tokio::test]
async fn test_stop_halts_both_cycles() {
    let h = fleet(2, 0);
    h.bring_online("base0");
    h.bring_online("base1");

    assert!(h.kernel.start_scheduler());
    assert!(!h.kernel.start_scheduler(), "second start is a no-op");

    let channel = h.channel.clone();
    let probe = h.probe.clone();
    assert!(wait_until(Duration::from_secs(2), || channel.calls().len() >= 4 && probe.probe_count() >= 4).await);

    h.kernel.stop_scheduler();
    assert!(!h.kernel.scheduler().is_running());

    // let in-flight ticks drain (command timeout is 200ms)
    tokio::time::sleep(Duration::from_millis(300)).await;
    let calls = h.channel.calls().len();
    let probes = h.probe.probe_count();
    let snapshot = serde_json::to_value(h.kernel.snapshot()).unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(h.channel.calls().len(), calls);
    assert_eq!(h.probe.probe_count(), probes);
    assert_eq!(serde_json::to_value(h.kernel.snapshot()).unwrap(), snapshot);

    h.kernel.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_joins_and_allows_restart() {
    let h = fleet(1, 0);
    h.bring_online("base0");

    assert!(h.kernel.start_scheduler());
    let probe = h.probe.clone();
    assert!(wait_until(Duration::from_secs(2), || probe.probe_count() >= 1).await);
    h.kernel.shutdown().await;

    let probes = h.probe.probe_count();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.probe.probe_count(), probes);

    assert!(h.kernel.start_scheduler());
    assert!(wait_until(Duration::from_secs(2), || probe.probe_count() > probes).await);
    h.kernel.shutdown().await;
}

#[tokio::test]
async fn test_restart_without_shutdown_drops_finished_tasks() {
    let h = fleet(1, 0);
    h.bring_online("base0");
    let scheduler = h.kernel.scheduler();

    for _ in 0..3 {
        assert!(h.kernel.start_scheduler());
        let probe = h.probe.clone();
        let seen = probe.probe_count();
        assert!(wait_until(Duration::from_secs(2), || probe.probe_count() > seen).await);
        h.kernel.stop_scheduler();
        // both loops observe the cancelled token and exit
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    assert!(h.kernel.start_scheduler());
    assert_eq!(scheduler.pending_tasks(), 2);
    h.kernel.shutdown().await;
    assert_eq!(scheduler.pending_tasks(), 0);
}
