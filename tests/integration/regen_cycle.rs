//! End-to-end pump regeneration driven over the bus.
//!
//! An accelerated simulated station runs a full regen cycle; the
//! controller observes the phase sequence through correlated
//! `get_regen_step` queries, exactly as a script would.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use art_test_utils::MemoryBus;
use controller::Controller;
use pump_sim::PumpConfig;
use station::StationConfig;

#[tokio::test]
async fn regen_happy_path_observed_over_the_bus() {
    let bus = MemoryBus::new();
    let ctrl = Controller::start(
        Arc::new(bus.clone()),
        "controller-01",
        Duration::from_secs(90),
        Duration::from_secs(30),
        1_000,
    )
    .await
    .unwrap();

    let mut cfg = StationConfig::new("pump-sim-01", "PUMP-01");
    cfg.heartbeat_interval = Duration::from_millis(50);
    cfg.tick_interval = Duration::from_millis(10);
    cfg.time_scale = 20.0; // 0.2 simulated seconds per tick
    cfg.pump = PumpConfig::accelerated();
    let handle = station::spawn(Arc::new(bus.clone()), cfg).await.unwrap();

    // Wait for registration.
    let deadline = Instant::now() + Duration::from_secs(2);
    while ctrl.registry().lookup_device("PUMP-01").is_none() {
        assert!(Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let query = |command: &'static str| {
        let ctrl = &ctrl;
        async move {
            ctrl.manual_command("PUMP-01", command, &BTreeMap::new(), 2_000)
                .await
                .expect("query should round-trip")
                .response
                .unwrap_or_default()
        }
    };

    // Accelerated stations start cold.
    assert_eq!(query("pump_status").await, "1");
    assert_eq!(query("get_regen_step").await, "0");
    assert_eq!(query("start_regen").await, "OK");

    // Observe the phase sequence until regen completes.
    let mut observed: Vec<String> = vec![query("get_regen_step").await];
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        assert!(Instant::now() < deadline, "regen did not finish in time");
        let step = query("get_regen_step").await;
        if observed.last() != Some(&step) {
            observed.push(step.clone());
        }
        if step == "0" && observed.len() > 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(
        observed,
        vec!["1", "2", "3", "4", "5", "0"],
        "phase sequence: warming, purge, roughing, rate-of-rise, cooling, none"
    );
    assert_eq!(query("regen_error").await, "@");

    // The pump is back on the operational side of the diagram.
    let state = handle.with_pump(|pump| pump.state()).await;
    assert!(matches!(
        state,
        pump_sim::OperationalState::Cooling | pump_sim::OperationalState::Cold
    ));

    handle.stop();
    ctrl.shutdown();
}
