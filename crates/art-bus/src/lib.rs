// art-bus: Message backbone abstraction for the Arturo suite.
//
// Two transport primitives: fire-and-forget pub/sub and reliable streams
// with ordered server-generated ids.  `RedisBus` is the production
// implementation; tests run against the in-memory bus in art-test-utils.
// This crate is the only place that knows channel naming.

pub mod backoff;
pub mod channels;
pub mod redis_bus;

pub use backoff::Backoff;
pub use redis_bus::RedisBus;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Transport-level failures, surfaced unchanged to callers (no retry here).
#[derive(Debug, Error)]
pub enum BusError {
    /// Connection refused, reset, or otherwise unusable.
    #[error("BUS_UNAVAILABLE: {0}")]
    Unavailable(String),
    /// An operation exceeded its deadline inside the transport.
    #[error("BUS_TIMEOUT: {0}")]
    Timeout(String),
    /// Payload could not be encoded or decoded at the transport layer.
    #[error("bus encoding error: {0}")]
    Encoding(String),
}

// ---------------------------------------------------------------------------
// Message shapes
// ---------------------------------------------------------------------------

/// A message delivered on a pub/sub subscription.
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// One entry read from a reliable stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Server-generated ordered id; also the cursor for the next read.
    pub id: String,
    pub payload: Vec<u8>,
}

/// Cursor value meaning "only entries appended after now".
pub const CURSOR_TAIL: &str = "$";
/// Cursor value meaning "from the beginning of the stream".
pub const CURSOR_START: &str = "0";

// ---------------------------------------------------------------------------
// Bus trait
// ---------------------------------------------------------------------------

/// The transport contract shared by the Redis client and the in-memory bus.
///
/// Within a single stream, append order is preserved; across streams there
/// is no cross-ordering guarantee.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Fire-and-forget publish on a pub/sub channel.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Broadcast subscribe on a channel prefix glob (e.g. `events:*`).
    ///
    /// The returned receiver yields messages until the bus is dropped or the
    /// receiver is closed.
    async fn subscribe(&self, pattern: &str) -> Result<mpsc::Receiver<PubSubMessage>, BusError>;

    /// Append to a reliable stream; returns the server-generated ordered id.
    async fn append(&self, stream: &str, payload: Vec<u8>) -> Result<String, BusError>;

    /// Blocking read of entries appended after `last_id`.
    ///
    /// Returns an empty vec when `block` elapses with no new entries.
    async fn read_blocking(
        &self,
        stream: &str,
        last_id: &str,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, BusError>;

    /// Explicitly acknowledge a processed entry.
    async fn ack(&self, stream: &str, entry_id: &str) -> Result<(), BusError>;

    /// Trim a stream to approximately `max_len` entries.
    async fn trim(&self, stream: &str, max_len: usize) -> Result<(), BusError>;

    /// Refresh the presence key for an instance (TTL-keyed liveness).
    async fn refresh_presence(&self, instance: &str, ttl: Duration) -> Result<(), BusError>;

    /// True while the instance's presence key has not expired.
    async fn presence(&self, instance: &str) -> Result<bool, BusError>;
}
