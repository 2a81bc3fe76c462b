//! End-to-end script execution: `.art` source -> parse -> session ->
//! interpreter -> device I/O over the bus -> run report, plus session
//! arbitration against manual commands and emergency stop.

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use art_script::TestOutcome;
use art_test_utils::MemoryBus;
use controller::stations::{SessionState, StationState};
use controller::Controller;
use pump_sim::PumpConfig;
use station::StationConfig;

fn fast_station() -> StationConfig {
    let mut cfg = StationConfig::new("pump-sim-01", "PUMP-01");
    cfg.heartbeat_interval = Duration::from_millis(50);
    cfg.tick_interval = Duration::from_millis(10);
    cfg.time_scale = 20.0;
    cfg.pump = PumpConfig::accelerated();
    cfg
}

async fn start_controller(bus: &MemoryBus) -> Controller {
    Controller::start(
        Arc::new(bus.clone()),
        "controller-01",
        Duration::from_secs(90),
        Duration::from_secs(30),
        1_000,
    )
    .await
    .unwrap()
}

async fn wait_for_device(ctrl: &Controller, device: &str) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while ctrl.registry().lookup_device(device).is_none() {
        assert!(Instant::now() < deadline, "device never registered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn script_file(source: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".art")
        .tempfile()
        .unwrap();
    file.write_all(source.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[tokio::test]
async fn script_queries_pump_and_reports_pass() {
    let bus = MemoryBus::new();
    let ctrl = start_controller(&bus).await;
    let handle = station::spawn(Arc::new(bus.clone()), fast_station()).await.unwrap();
    wait_for_device(&ctrl, "PUMP-01").await;

    let script = script_file(
        r#"# Pump smoke test
CONST PUMP "PUMP-01"

TEST "pump is on"
  QUERY PUMP "pump_status" status TIMEOUT 2000
  ASSERT status == "1" "pump should be on"
ENDTEST

TEST "no regen error"
  QUERY PUMP "regen_error" err TIMEOUT 2000
  ASSERT err == "@"
ENDTEST
"#,
    );

    let outcome = controller::run_script(&ctrl, script.path(), "pump-sim-01", "alice", None)
        .await
        .unwrap();
    assert!(outcome.diagnostics.is_empty());
    let report = outcome.report.unwrap();
    assert!(report.success(), "run errors: {:?}", report.run_errors);
    assert_eq!(report.overall.passed, 2);
    assert_eq!(report.tests[0].outcome, TestOutcome::Passed);
    assert!(!report.commands.is_empty());

    // Session closed; the station is idle again.
    let session = ctrl.tracker().session("pump-sim-01").unwrap();
    assert_eq!(session.state, SessionState::Completed);
    assert_eq!(session.operator, "alice");
    assert_eq!(ctrl.tracker().state("pump-sim-01"), StationState::Idle);

    handle.stop();
    ctrl.shutdown();
}

#[tokio::test]
async fn parse_errors_block_the_session() {
    let bus = MemoryBus::new();
    let ctrl = start_controller(&bus).await;
    let handle = station::spawn(Arc::new(bus.clone()), fast_station()).await.unwrap();
    wait_for_device(&ctrl, "PUMP-01").await;

    let script = script_file("SET 42 1\nWHILE\nENDWHILE\n");
    let outcome = controller::run_script(&ctrl, script.path(), "pump-sim-01", "alice", None)
        .await
        .unwrap();
    assert!(outcome.report.is_none());
    assert!(!outcome.diagnostics.is_empty());
    // No session was opened for the unparseable script.
    assert!(ctrl.tracker().session("pump-sim-01").is_none());
    assert_eq!(ctrl.tracker().state("pump-sim-01"), StationState::Idle);

    handle.stop();
    ctrl.shutdown();
}

#[tokio::test]
async fn manual_commands_rejected_while_script_runs() {
    let bus = MemoryBus::new();
    let ctrl = Arc::new(start_controller(&bus).await);
    let handle = station::spawn(Arc::new(bus.clone()), fast_station()).await.unwrap();
    wait_for_device(&ctrl, "PUMP-01").await;

    let script = script_file("LOG INFO \"holding\"\nDELAY 60000\n");
    let runner = {
        let ctrl = Arc::clone(&ctrl);
        let path = script.path().to_owned();
        tokio::spawn(async move {
            controller::run_script(&ctrl, &path, "pump-sim-01", "alice", None).await
        })
    };

    // Wait until the session is open.
    let deadline = Instant::now() + Duration::from_secs(2);
    while ctrl.tracker().state("pump-sim-01") != StationState::Testing {
        assert!(Instant::now() < deadline, "session never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let err = ctrl
        .manual_command("PUMP-01", "pump_status", &BTreeMap::new(), 1_000)
        .await
        .unwrap_err();
    assert_eq!(err.code, "E_STATION_BUSY");

    // Terminating the session cancels the script's DELAY promptly.
    ctrl.tracker()
        .terminate_test("pump-sim-01", "operator stop")
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(2), runner)
        .await
        .expect("run should return promptly after termination")
        .unwrap()
        .unwrap();
    let report = outcome.report.unwrap();
    assert!(!report.run_errors.is_empty(), "cancellation surfaces as a run error");

    let session = ctrl.tracker().session("pump-sim-01").unwrap();
    assert_eq!(session.state, SessionState::Terminated);
    assert_eq!(session.end_reason.as_deref(), Some("operator stop"));

    // Manual commands are allowed again.
    assert!(ctrl
        .manual_command("PUMP-01", "pump_status", &BTreeMap::new(), 1_000)
        .await
        .is_ok());

    handle.stop();
    ctrl.shutdown();
}

#[tokio::test]
async fn emergency_stop_halts_script_and_pump() {
    let bus = MemoryBus::new();
    let ctrl = Arc::new(start_controller(&bus).await);
    let handle = station::spawn(Arc::new(bus.clone()), fast_station()).await.unwrap();
    wait_for_device(&ctrl, "PUMP-01").await;

    let script = script_file("DELAY 60000\n");
    let runner = {
        let ctrl = Arc::clone(&ctrl);
        let path = script.path().to_owned();
        tokio::spawn(async move {
            controller::run_script(&ctrl, &path, "pump-sim-01", "alice", None).await
        })
    };
    let deadline = Instant::now() + Duration::from_secs(2);
    while ctrl.tracker().state("pump-sim-01") != StationState::Testing {
        assert!(Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    ctrl.emergency_stop("overtemperature", "operator:alice", "critical")
        .await
        .unwrap();

    // The script unblocks and the session records the stop.
    tokio::time::timeout(Duration::from_secs(2), runner)
        .await
        .expect("script should stop promptly")
        .unwrap()
        .unwrap();
    let session = ctrl.tracker().session("pump-sim-01").unwrap();
    assert_eq!(session.state, SessionState::Terminated);
    assert_eq!(session.end_reason.as_deref(), Some("emergency stop"));

    // The station-side interlock turned the pump off.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let off = handle
            .with_pump(|pump| pump.state() == pump_sim::OperationalState::Off)
            .await;
        if off {
            break;
        }
        assert!(Instant::now() < deadline, "pump never turned off");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    handle.stop();
    ctrl.shutdown();
}

#[tokio::test]
async fn second_station_runs_independently() {
    let bus = MemoryBus::new();
    let ctrl = Arc::new(start_controller(&bus).await);

    let mut cfg_a = fast_station();
    cfg_a.instance = "pump-sim-01".to_owned();
    let mut cfg_b = fast_station();
    cfg_b.instance = "pump-sim-02".to_owned();
    cfg_b.device_id = "PUMP-02".to_owned();

    let a = station::spawn(Arc::new(bus.clone()), cfg_a).await.unwrap();
    let b = station::spawn(Arc::new(bus.clone()), cfg_b).await.unwrap();
    wait_for_device(&ctrl, "PUMP-01").await;
    wait_for_device(&ctrl, "PUMP-02").await;

    // A long script holds station 1; station 2 still accepts commands.
    let script = script_file("DELAY 60000\n");
    let runner = {
        let ctrl = Arc::clone(&ctrl);
        let path = script.path().to_owned();
        tokio::spawn(async move {
            controller::run_script(&ctrl, &path, "pump-sim-01", "alice", None).await
        })
    };
    let deadline = Instant::now() + Duration::from_secs(2);
    while ctrl.tracker().state("pump-sim-01") != StationState::Testing {
        assert!(Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let outcome = ctrl
        .manual_command("PUMP-02", "pump_status", &BTreeMap::new(), 2_000)
        .await
        .unwrap();
    assert_eq!(outcome.response.as_deref(), Some("1"));

    ctrl.tracker().abort_test("pump-sim-01").unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(2), runner).await;

    a.stop();
    b.stop();
    ctrl.shutdown();
}
