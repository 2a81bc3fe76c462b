//! End-to-end: station heartbeats populate the controller's registry, and
//! silence expires them.
//!
//! The controller and a simulated station share an in-memory bus.  The
//! liveness window is compressed so expiry is observable in test time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use art_test_utils::MemoryBus;
use controller::registry::StationStatus;
use controller::stations::StationState;
use controller::Controller;
use pump_sim::PumpConfig;
use station::StationConfig;

fn fast_station(instance: &str) -> StationConfig {
    let mut cfg = StationConfig::new(instance, "PUMP-01");
    cfg.heartbeat_interval = Duration::from_millis(50);
    cfg.tick_interval = Duration::from_millis(20);
    cfg.time_scale = 10.0;
    cfg.pump = PumpConfig::accelerated();
    cfg
}

async fn start_controller(bus: &MemoryBus, window: Duration) -> Controller {
    Controller::start(
        Arc::new(bus.clone()),
        "controller-01",
        window,
        Duration::from_millis(50),
        1_000,
    )
    .await
    .expect("controller should start")
}

/// Poll until the predicate holds or the deadline passes.
async fn wait_for(budget: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + budget;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn heartbeat_binds_device_to_station_within_a_second() {
    let bus = MemoryBus::new();
    let ctrl = start_controller(&bus, Duration::from_secs(90)).await;
    let handle = station::spawn(Arc::new(bus.clone()), fast_station("pump-sim-01"))
        .await
        .unwrap();

    let found = wait_for(Duration::from_secs(1), || {
        ctrl.registry()
            .lookup_device("PUMP-01")
            .is_some_and(|entry| entry.station == "pump-sim-01")
    })
    .await;
    assert!(found, "PUMP-01 should be registered within 1 s");

    let stations = ctrl.registry().list_stations();
    assert_eq!(stations.len(), 1);
    assert_eq!(stations[0].status, StationStatus::Online);
    assert_eq!(stations[0].devices, vec!["PUMP-01"]);
    assert_eq!(ctrl.tracker().state("pump-sim-01"), StationState::Idle);

    handle.stop();
    ctrl.shutdown();
}

#[tokio::test]
async fn silent_station_expires_and_devices_vanish() {
    let bus = MemoryBus::new();
    // Compressed liveness window so the sweep fires quickly.
    let ctrl = start_controller(&bus, Duration::from_millis(200)).await;
    let handle = station::spawn(Arc::new(bus.clone()), fast_station("pump-sim-01"))
        .await
        .unwrap();

    assert!(
        wait_for(Duration::from_secs(1), || {
            !ctrl.registry().list_devices().is_empty()
        })
        .await
    );

    // Stop the station; heartbeats cease.
    handle.stop();

    let expired = wait_for(Duration::from_secs(2), || {
        ctrl.registry().list_devices().is_empty()
    })
    .await;
    assert!(expired, "devices should vanish after the liveness window");
    assert!(ctrl.registry().lookup_device("PUMP-01").is_none());
    assert_eq!(ctrl.tracker().state("pump-sim-01"), StationState::Offline);

    ctrl.shutdown();
}

#[tokio::test]
async fn returning_station_reregisters() {
    let bus = MemoryBus::new();
    let ctrl = start_controller(&bus, Duration::from_millis(200)).await;

    let first = station::spawn(Arc::new(bus.clone()), fast_station("pump-sim-01"))
        .await
        .unwrap();
    assert!(
        wait_for(Duration::from_secs(1), || {
            ctrl.registry().lookup_device("PUMP-01").is_some()
        })
        .await
    );
    first.stop();
    assert!(
        wait_for(Duration::from_secs(2), || {
            ctrl.registry().list_devices().is_empty()
        })
        .await
    );

    // Same instance comes back.
    let second = station::spawn(Arc::new(bus.clone()), fast_station("pump-sim-01"))
        .await
        .unwrap();
    assert!(
        wait_for(Duration::from_secs(1), || {
            ctrl.registry().lookup_device("PUMP-01").is_some()
        })
        .await
    );
    assert_eq!(ctrl.tracker().state("pump-sim-01"), StationState::Idle);

    second.stop();
    ctrl.shutdown();
}
