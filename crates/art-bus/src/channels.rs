//! Channel, stream, and key naming.
//!
//! | Purpose                | Kind     | Name                        |
//! |------------------------|----------|-----------------------------|
//! | per-station commands   | stream   | `commands:{instance}`       |
//! | per-requester responses| stream   | `responses:{instance}`      |
//! | heartbeats             | pub/sub  | `events:heartbeat`          |
//! | e-stop (fast path)     | pub/sub  | `events:emergency_stop`     |
//! | e-stop (audit)         | stream   | `events:emergency_stop`     |
//! | presence               | key+TTL  | `device:{instance}:alive`   |

use std::time::Duration;

/// Heartbeat pub/sub channel (single channel for all stations).
pub const HEARTBEAT: &str = "events:heartbeat";

/// Emergency-stop channel name, used for both the pub/sub fast path and the
/// durable audit stream.
pub const EMERGENCY_STOP: &str = "events:emergency_stop";

/// Glob matching all event channels.
pub const EVENTS_PATTERN: &str = "events:*";

/// TTL on presence keys; refreshed by stations on every heartbeat.
pub const PRESENCE_TTL: Duration = Duration::from_secs(90);

/// Default approximate max length writers keep streams trimmed to.
pub const STREAM_MAX_LEN: usize = 10_000;

/// Command stream consumed by one station.
pub fn commands(instance: &str) -> String {
    format!("commands:{instance}")
}

/// Response stream owned by one requester.
pub fn responses(instance: &str) -> String {
    format!("responses:{instance}")
}

/// Presence key for an instance.
pub fn alive_key(instance: &str) -> String {
    format!("device:{instance}:alive")
}
