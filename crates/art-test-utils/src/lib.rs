// art-test-utils: Shared test utilities for the Arturo suite.
//
// Provides an in-memory `Bus` implementation with the same semantics as the
// Redis client (pub/sub glob subscriptions, ordered streams with blocking
// reads, presence keys with TTL) so controller and station code can be
// integration-tested without a broker.

pub mod memory_bus;

pub use memory_bus::MemoryBus;

use art_protocol::{Envelope, Source};

/// Build a heartbeat envelope for tests.
pub fn heartbeat_envelope(instance: &str, devices: &[&str]) -> Envelope {
    let payload = serde_json::json!({
        "status": "online",
        "uptime_seconds": 60,
        "devices": devices,
        "free_heap": 180_000,
        "wifi_rssi": -60,
        "firmware_version": "test",
    });
    Envelope::build(
        Source::new("station", instance, "test"),
        art_protocol::message_types::SERVICE_HEARTBEAT,
        None,
        None,
        payload,
    )
    .expect("test heartbeat must validate")
}

#[cfg(test)]
mod tests {
    use super::*;
    use art_bus::{channels, Bus, CURSOR_START, CURSOR_TAIL};
    use std::time::Duration;

    // -----------------------------------------------------------------------
    // MemoryBus pub/sub
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn pubsub_glob_subscription_receives_matching_channels() {
        let bus = MemoryBus::new();
        let mut rx = bus.subscribe("events:*").await.unwrap();

        bus.publish(channels::HEARTBEAT, b"hb".to_vec()).await.unwrap();
        bus.publish("other:channel", b"nope".to_vec()).await.unwrap();
        bus.publish(channels::EMERGENCY_STOP, b"stop".to_vec())
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.channel, channels::HEARTBEAT);
        let second = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.channel, channels::EMERGENCY_STOP);
    }

    // -----------------------------------------------------------------------
    // MemoryBus streams
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn stream_append_preserves_order_and_cursors_advance() {
        let bus = MemoryBus::new();
        let stream = "commands:station-1";
        let id1 = bus.append(stream, b"one".to_vec()).await.unwrap();
        let id2 = bus.append(stream, b"two".to_vec()).await.unwrap();
        assert_ne!(id1, id2);

        let entries = bus
            .read_blocking(stream, CURSOR_START, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].payload, b"one");
        assert_eq!(entries[1].payload, b"two");

        // Reading after the first id returns only the tail.
        let tail = bus
            .read_blocking(stream, &entries[0].id, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].payload, b"two");
    }

    #[tokio::test]
    async fn blocking_read_wakes_on_append() {
        let bus = MemoryBus::new();
        let stream = "responses:controller-1";
        let reader = {
            let bus = bus.clone();
            let stream = stream.to_owned();
            tokio::spawn(async move {
                bus.read_blocking(&stream, CURSOR_TAIL, Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        bus.append(stream, b"late".to_vec()).await.unwrap();

        let entries = reader.await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, b"late");
    }

    #[tokio::test]
    async fn blocking_read_times_out_empty() {
        let bus = MemoryBus::new();
        let entries = bus
            .read_blocking("commands:nobody", CURSOR_TAIL, Duration::from_millis(30))
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn ack_deletes_and_trim_bounds_length() {
        let bus = MemoryBus::new();
        let stream = "events:emergency_stop";
        let id = bus.append(stream, b"x".to_vec()).await.unwrap();
        bus.ack(stream, &id).await.unwrap();
        let entries = bus
            .read_blocking(stream, CURSOR_START, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(entries.is_empty());

        for i in 0..20u8 {
            bus.append(stream, vec![i]).await.unwrap();
        }
        bus.trim(stream, 5).await.unwrap();
        let entries = bus
            .read_blocking(stream, CURSOR_START, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[4].payload, vec![19]);
    }

    // -----------------------------------------------------------------------
    // Presence
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn presence_expires_after_ttl() {
        let bus = MemoryBus::new();
        bus.refresh_presence("pump-sim-01", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(bus.presence("pump-sim-01").await.unwrap());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!bus.presence("pump-sim-01").await.unwrap());
        assert!(!bus.presence("never-seen").await.unwrap());
    }

    // -----------------------------------------------------------------------
    // Envelope helper
    // -----------------------------------------------------------------------

    #[test]
    fn heartbeat_helper_builds_valid_envelope() {
        let envelope = heartbeat_envelope("pump-sim-01", &["PUMP-01"]);
        assert_eq!(
            envelope.message_type,
            art_protocol::message_types::SERVICE_HEARTBEAT
        );
        let parsed = Envelope::parse(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.source.instance, "pump-sim-01");
    }
}
