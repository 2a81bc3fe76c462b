//! End-to-end command round-trip: controller -> command stream -> station
//! -> response stream -> dispatcher -> waiter.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use art_bus::{channels, Bus};
use art_test_utils::{heartbeat_envelope, MemoryBus};
use controller::Controller;
use pump_sim::PumpConfig;
use station::StationConfig;

fn fast_station(instance: &str, device: &str) -> StationConfig {
    let mut cfg = StationConfig::new(instance, device);
    cfg.heartbeat_interval = Duration::from_millis(50);
    cfg.tick_interval = Duration::from_millis(20);
    cfg.time_scale = 10.0;
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
    .expect("controller should start")
}

async fn wait_for_device(ctrl: &Controller, device: &str) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while ctrl.registry().lookup_device(device).is_none() {
        assert!(Instant::now() < deadline, "device never registered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn manual_command_round_trips_through_the_station() {
    let bus = MemoryBus::new();
    let ctrl = start_controller(&bus).await;
    let handle = station::spawn(Arc::new(bus.clone()), fast_station("pump-sim-01", "PUMP-01"))
        .await
        .unwrap();
    wait_for_device(&ctrl, "PUMP-01").await;

    let outcome = ctrl
        .manual_command("PUMP-01", "pump_status", &BTreeMap::new(), 2_000)
        .await
        .expect("round-trip should succeed");
    // Accelerated stations start cold, i.e. pump on.
    assert_eq!(outcome.response.as_deref(), Some("1"));

    // The waiter resolved and the slot is gone.
    assert_eq!(ctrl.dispatcher().pending_count(), 0);

    handle.stop();
    ctrl.shutdown();
}

#[tokio::test]
async fn concurrent_commands_resolve_to_their_own_waiters() {
    let bus = MemoryBus::new();
    let ctrl = Arc::new(start_controller(&bus).await);
    let handle = station::spawn(Arc::new(bus.clone()), fast_station("pump-sim-01", "PUMP-01"))
        .await
        .unwrap();
    wait_for_device(&ctrl, "PUMP-01").await;

    let status = {
        let ctrl = Arc::clone(&ctrl);
        tokio::spawn(async move {
            ctrl.manual_command("PUMP-01", "pump_status", &BTreeMap::new(), 2_000)
                .await
        })
    };
    let step = {
        let ctrl = Arc::clone(&ctrl);
        tokio::spawn(async move {
            ctrl.manual_command("PUMP-01", "get_regen_step", &BTreeMap::new(), 2_000)
                .await
        })
    };

    let status = status.await.unwrap().unwrap();
    let step = step.await.unwrap().unwrap();
    assert_eq!(status.response.as_deref(), Some("1"));
    assert_eq!(step.response.as_deref(), Some("0"));
    assert_eq!(ctrl.dispatcher().pending_count(), 0);

    handle.stop();
    ctrl.shutdown();
}

#[tokio::test]
async fn unanswered_command_times_out_and_frees_the_slot() {
    let bus = MemoryBus::new();
    let ctrl = start_controller(&bus).await;

    // Advertise a device by heartbeat only; nothing consumes the command
    // stream, so the request must time out.
    let hb = heartbeat_envelope("ghost-station", &["GHOST-01"]);
    bus.publish(channels::HEARTBEAT, hb.to_bytes().unwrap())
        .await
        .unwrap();
    wait_for_device(&ctrl, "GHOST-01").await;

    let started = Instant::now();
    let err = ctrl
        .manual_command("GHOST-01", "noop", &BTreeMap::new(), 300)
        .await
        .unwrap_err();
    assert_eq!(err.code, "E_DEVICE_TIMEOUT");
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(
        ctrl.dispatcher().pending_count(),
        0,
        "timed-out slot must be deregistered"
    );

    ctrl.shutdown();
}

#[tokio::test]
async fn unknown_device_is_rejected_without_touching_the_bus() {
    let bus = MemoryBus::new();
    let ctrl = start_controller(&bus).await;
    let err = ctrl
        .manual_command("NOBODY-9", "noop", &BTreeMap::new(), 1_000)
        .await
        .unwrap_err();
    assert_eq!(err.code, "E_DEVICE_NOT_FOUND");
    ctrl.shutdown();
}

#[tokio::test]
async fn unknown_command_surfaces_station_error_code() {
    let bus = MemoryBus::new();
    let ctrl = start_controller(&bus).await;
    let handle = station::spawn(Arc::new(bus.clone()), fast_station("pump-sim-01", "PUMP-01"))
        .await
        .unwrap();
    wait_for_device(&ctrl, "PUMP-01").await;

    let err = ctrl
        .manual_command("PUMP-01", "warp_drive", &BTreeMap::new(), 2_000)
        .await
        .unwrap_err();
    assert_eq!(err.code, "E_INVALID_PARAMETER");

    handle.stop();
    ctrl.shutdown();
}
