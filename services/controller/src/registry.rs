//! Device registry and station liveness.
//!
//! The single source of truth for where a device lives.  Heartbeats create
//! and refresh station records; `expire_stale` drops stations whose last
//! heartbeat is older than the liveness window and, transitively, the
//! devices they advertised.  If a device id migrates between stations
//! across heartbeats, the latest heartbeat wins.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use art_protocol::{DeviceProtocol, Heartbeat};
use tracing::{debug, info};

/// Default liveness window (matches the presence-key TTL).
pub const LIVENESS_WINDOW: Duration = Duration::from_secs(90);

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationStatus {
    Online,
    Offline,
}

/// Snapshot of one station's latest heartbeat.
#[derive(Debug, Clone)]
pub struct StationRecord {
    pub instance: String,
    pub status: StationStatus,
    pub devices: Vec<String>,
    pub device_types: BTreeMap<String, DeviceProtocol>,
    pub firmware_version: String,
    pub free_heap: u64,
    pub wifi_rssi: i32,
    pub uptime_seconds: u64,
    /// Monotonic receive time of the latest heartbeat.
    pub last_heartbeat: Instant,
}

/// Where a device currently lives.
#[derive(Debug, Clone)]
pub struct DeviceEntry {
    pub device_id: String,
    pub station: String,
    pub protocol: Option<DeviceProtocol>,
    pub last_seen: Instant,
    pub status: StationStatus,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RegistryState {
    stations: HashMap<String, StationRecord>,
    /// device id -> owning station instance
    devices: HashMap<String, String>,
}

pub struct DeviceRegistry {
    state: Mutex<RegistryState>,
    window: Duration,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(LIVENESS_WINDOW)
    }
}

impl DeviceRegistry {
    pub fn new(window: Duration) -> Self {
        DeviceRegistry {
            state: Mutex::new(RegistryState::default()),
            window,
        }
    }

    pub fn liveness_window(&self) -> Duration {
        self.window
    }

    /// Ingest one heartbeat at time `now`.
    pub fn update_from_heartbeat(&self, instance: &str, hb: &Heartbeat, now: Instant) {
        let mut state = self.state.lock().expect("registry lock poisoned");

        // Latest heartbeat wins: claim every advertised device, then drop
        // mappings this station no longer advertises.
        for device in &hb.devices {
            if let Some(previous) = state.devices.insert(device.clone(), instance.to_owned()) {
                if previous != instance {
                    info!(
                        device = %device,
                        from = %previous,
                        to = %instance,
                        "device migrated between stations"
                    );
                }
            }
        }
        let advertised: Vec<String> = hb.devices.clone();
        state.devices.retain(|device, station| {
            station != instance || advertised.iter().any(|d| d == device)
        });

        let is_new = !state.stations.contains_key(instance);
        state.stations.insert(
            instance.to_owned(),
            StationRecord {
                instance: instance.to_owned(),
                status: StationStatus::Online,
                devices: advertised,
                device_types: hb.device_types.clone(),
                firmware_version: hb.firmware_version.clone(),
                free_heap: hb.free_heap,
                wifi_rssi: hb.wifi_rssi,
                uptime_seconds: hb.uptime_seconds,
                last_heartbeat: now,
            },
        );
        if is_new {
            info!(station = %instance, "station registered");
        } else {
            debug!(station = %instance, "heartbeat");
        }
    }

    /// Drop stations not heard from within `window` (and their devices).
    /// Returns the dropped station instances.
    pub fn expire_stale(&self, now: Instant, window: Duration) -> Vec<String> {
        let mut state = self.state.lock().expect("registry lock poisoned");
        let expired: Vec<String> = state
            .stations
            .values()
            .filter(|record| now.duration_since(record.last_heartbeat) > window)
            .map(|record| record.instance.clone())
            .collect();
        for instance in &expired {
            state.stations.remove(instance);
            state.devices.retain(|_, station| station != instance);
            info!(station = %instance, "station expired from registry");
        }
        expired
    }

    pub fn lookup_device(&self, device_id: &str) -> Option<DeviceEntry> {
        let state = self.state.lock().expect("registry lock poisoned");
        let station = state.devices.get(device_id)?;
        let record = state.stations.get(station)?;
        Some(DeviceEntry {
            device_id: device_id.to_owned(),
            station: station.clone(),
            protocol: record.device_types.get(device_id).copied(),
            last_seen: record.last_heartbeat,
            status: self.derived_status(record),
        })
    }

    pub fn list_devices(&self) -> Vec<DeviceEntry> {
        let state = self.state.lock().expect("registry lock poisoned");
        let mut entries: Vec<DeviceEntry> = state
            .devices
            .iter()
            .filter_map(|(device, station)| {
                let record = state.stations.get(station)?;
                Some(DeviceEntry {
                    device_id: device.clone(),
                    station: station.clone(),
                    protocol: record.device_types.get(device).copied(),
                    last_seen: record.last_heartbeat,
                    status: self.derived_status(record),
                })
            })
            .collect();
        entries.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        entries
    }

    pub fn list_stations(&self) -> Vec<StationRecord> {
        let state = self.state.lock().expect("registry lock poisoned");
        let mut records: Vec<StationRecord> = state
            .stations
            .values()
            .map(|record| {
                let mut record = record.clone();
                record.status = self.derived_status(&record);
                record
            })
            .collect();
        records.sort_by(|a, b| a.instance.cmp(&b.instance));
        records
    }

    fn derived_status(&self, record: &StationRecord) -> StationStatus {
        if record.last_heartbeat.elapsed() <= self.window {
            StationStatus::Online
        } else {
            StationStatus::Offline
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(devices: &[&str]) -> Heartbeat {
        serde_json::from_value(serde_json::json!({
            "status": "online",
            "uptime_seconds": 10,
            "devices": devices,
            "free_heap": 150_000,
            "wifi_rssi": -60,
            "firmware_version": "1.0.0",
        }))
        .unwrap()
    }

    #[test]
    fn heartbeat_registers_station_and_devices() {
        let registry = DeviceRegistry::default();
        registry.update_from_heartbeat("pump-sim-01", &heartbeat(&["PUMP-01"]), Instant::now());

        let devices = registry.list_devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].device_id, "PUMP-01");
        assert_eq!(devices[0].station, "pump-sim-01");

        let entry = registry.lookup_device("PUMP-01").unwrap();
        assert_eq!(entry.station, "pump-sim-01");
        assert_eq!(entry.status, StationStatus::Online);
    }

    #[test]
    fn expire_stale_drops_station_and_devices() {
        let registry = DeviceRegistry::default();
        let t0 = Instant::now();
        registry.update_from_heartbeat("pump-sim-01", &heartbeat(&["PUMP-01"]), t0);

        // Within the window nothing expires.
        let dropped = registry.expire_stale(t0 + Duration::from_secs(60), LIVENESS_WINDOW);
        assert!(dropped.is_empty());

        let dropped = registry.expire_stale(t0 + Duration::from_secs(95), LIVENESS_WINDOW);
        assert_eq!(dropped, vec!["pump-sim-01".to_owned()]);
        assert!(registry.list_devices().is_empty());
        assert!(registry.lookup_device("PUMP-01").is_none());
    }

    #[test]
    fn latest_heartbeat_wins_device_migration() {
        let registry = DeviceRegistry::default();
        let now = Instant::now();
        registry.update_from_heartbeat("station-a", &heartbeat(&["DMM-01"]), now);
        registry.update_from_heartbeat("station-b", &heartbeat(&["DMM-01"]), now);

        let entry = registry.lookup_device("DMM-01").unwrap();
        assert_eq!(entry.station, "station-b");
        // station-a's stale claim is gone from the device list.
        let devices = registry.list_devices();
        assert_eq!(devices.len(), 1);
    }

    #[test]
    fn station_dropping_a_device_unmaps_it() {
        let registry = DeviceRegistry::default();
        let now = Instant::now();
        registry.update_from_heartbeat("station-a", &heartbeat(&["DMM-01", "PSU-01"]), now);
        registry.update_from_heartbeat("station-a", &heartbeat(&["PSU-01"]), now);

        assert!(registry.lookup_device("DMM-01").is_none());
        assert!(registry.lookup_device("PSU-01").is_some());
    }

    #[test]
    fn list_stations_reports_telemetry() {
        let registry = DeviceRegistry::default();
        registry.update_from_heartbeat("pump-sim-01", &heartbeat(&["PUMP-01"]), Instant::now());
        let stations = registry.list_stations();
        assert_eq!(stations.len(), 1);
        assert_eq!(stations[0].firmware_version, "1.0.0");
        assert_eq!(stations[0].wifi_rssi, -60);
        assert_eq!(stations[0].status, StationStatus::Online);
    }
}
