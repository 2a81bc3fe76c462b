//! Response dispatcher: the correlated-async primitive.
//!
//! A concurrency-safe table maps correlation id -> one-shot delivery slot.
//! One reader task per owned response stream looks up each incoming
//! message's correlation id and fulfills the slot.  Unknown correlation ids
//! are silently discarded (they may belong to prior runs or already
//! timed-out waiters) but counted; so are envelope parse failures.
//!
//! Contract: waiters call `register` BEFORE publishing the request, then
//! block on the slot with the request's deadline.  On deadline or
//! cancellation the waiter must `deregister` to avoid leaking the slot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use art_bus::Bus;
use art_protocol::{message_types, CommandResponse, Envelope};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// How long each blocking stream read waits before re-checking cancellation.
const READ_BLOCK: Duration = Duration::from_secs(5);

pub struct ResponseDispatcher {
    pending: Mutex<HashMap<Uuid, oneshot::Sender<CommandResponse>>>,
    unknown_dropped: AtomicU64,
    parse_failures: AtomicU64,
}

impl Default for ResponseDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseDispatcher {
    pub fn new() -> Self {
        ResponseDispatcher {
            pending: Mutex::new(HashMap::new()),
            unknown_dropped: AtomicU64::new(0),
            parse_failures: AtomicU64::new(0),
        }
    }

    /// Register a correlation id and get the delivery slot.  Returns
    /// immediately even under contention.
    pub fn register(&self, id: Uuid) -> oneshot::Receiver<CommandResponse> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().expect("dispatcher lock poisoned");
        pending.insert(id, tx);
        rx
    }

    /// Drop a slot (deadline hit or waiter cancelled).
    pub fn deregister(&self, id: &Uuid) {
        let mut pending = self.pending.lock().expect("dispatcher lock poisoned");
        pending.remove(id);
    }

    /// Hand a response to its registered waiter.  Returns false when no
    /// waiter is registered (the response is dropped).
    pub fn dispatch(&self, correlation_id: Uuid, response: CommandResponse) -> bool {
        let sender = {
            let mut pending = self.pending.lock().expect("dispatcher lock poisoned");
            pending.remove(&correlation_id)
        };
        match sender {
            Some(tx) => {
                // A receiver dropped between deregister and here is fine.
                let delivered = tx.send(response).is_ok();
                if !delivered {
                    self.unknown_dropped.fetch_add(1, Ordering::Relaxed);
                }
                delivered
            }
            None => {
                self.unknown_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("dispatcher lock poisoned").len()
    }

    pub fn unknown_dropped(&self) -> u64 {
        self.unknown_dropped.load(Ordering::Relaxed)
    }

    pub fn parse_failures(&self) -> u64 {
        self.parse_failures.load(Ordering::Relaxed)
    }

    /// Spawn the reader task for one owned response stream.  Reads from the
    /// stream tail, parses envelopes, and dispatches command responses
    /// until cancelled.
    pub fn spawn_reader(
        self: &Arc<Self>,
        bus: Arc<dyn Bus>,
        stream: String,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut cursor = art_bus::CURSOR_TAIL.to_owned();
            loop {
                let entries = tokio::select! {
                    _ = cancel.cancelled() => return,
                    result = bus.read_blocking(&stream, &cursor, READ_BLOCK) => match result {
                        Ok(entries) => entries,
                        Err(e) => {
                            warn!(stream = %stream, error = %e, "response stream read failed");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            continue;
                        }
                    },
                };
                for entry in entries {
                    cursor = entry.id.clone();
                    dispatcher.ingest(&entry.payload, &stream);
                }
            }
        })
    }

    /// Parse one stream entry and dispatch it.  Parse failures are counted
    /// and skipped; the reader never stops on bad input.
    fn ingest(&self, bytes: &[u8], stream: &str) {
        let envelope = match Envelope::parse(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.parse_failures.fetch_add(1, Ordering::Relaxed);
                debug!(stream = %stream, error = %e, "dropping unparseable message");
                return;
            }
        };
        if envelope.message_type != message_types::DEVICE_COMMAND_RESPONSE {
            debug!(stream = %stream, message_type = %envelope.message_type, "ignoring non-response");
            return;
        }
        // Validation guarantees correlation_id is present for responses.
        let Some(correlation_id) = envelope.correlation_id else {
            self.parse_failures.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let response: CommandResponse = match envelope.payload_as() {
            Ok(response) => response,
            Err(e) => {
                self.parse_failures.fetch_add(1, Ordering::Relaxed);
                debug!(stream = %stream, error = %e, "dropping malformed response payload");
                return;
            }
        };
        if !self.dispatch(correlation_id, response) {
            debug!(
                correlation_id = %correlation_id,
                "no waiter for correlation id (timed out or stale)"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
