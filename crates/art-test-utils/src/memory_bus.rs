//! In-memory `Bus` implementation.
//!
//! Mirrors the Redis client's semantics closely enough for integration
//! tests: glob pub/sub, ordered streams with blocking cursor reads,
//! ack-deletes, approximate trims, and TTL presence keys.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use art_bus::{Bus, BusError, PubSubMessage, StreamEntry, CURSOR_START, CURSOR_TAIL};
use tokio::sync::{broadcast, mpsc, Mutex, Notify};

#[derive(Default)]
struct StreamState {
    next_seq: u64,
    entries: Vec<(u64, StreamEntry)>,
}

struct Inner {
    pubsub: broadcast::Sender<PubSubMessage>,
    streams: Mutex<HashMap<String, StreamState>>,
    appended: Notify,
    presence: Mutex<HashMap<String, Instant>>,
}

/// Cloneable handle to a shared in-memory bus.
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        let (pubsub, _) = broadcast::channel(4096);
        MemoryBus {
            inner: Arc::new(Inner {
                pubsub,
                streams: Mutex::new(HashMap::new()),
                appended: Notify::new(),
                presence: Mutex::new(HashMap::new()),
            }),
        }
    }
}

/// Channel glob matching: a trailing `*` matches any suffix.
fn pattern_matches(pattern: &str, channel: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => channel.starts_with(prefix),
        None => pattern == channel,
    }
}

/// Stream ids are `{seq}-0`; cursors are ids, `0`, or `$`.
fn seq_of(id: &str) -> Option<u64> {
    id.split('-').next()?.parse().ok()
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError> {
        // No subscribers is fine for fire-and-forget.
        let _ = self.inner.pubsub.send(PubSubMessage {
            channel: channel.to_owned(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<mpsc::Receiver<PubSubMessage>, BusError> {
        let (tx, rx) = mpsc::channel(1024);
        let mut source = self.inner.pubsub.subscribe();
        let pattern = pattern.to_owned();
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(msg) => {
                        if pattern_matches(&pattern, &msg.channel)
                            && tx.send(msg).await.is_err()
                        {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Ok(rx)
    }

    async fn append(&self, stream: &str, payload: Vec<u8>) -> Result<String, BusError> {
        let id = {
            let mut streams = self.inner.streams.lock().await;
            let state = streams.entry(stream.to_owned()).or_default();
            state.next_seq += 1;
            let seq = state.next_seq;
            let id = format!("{}-0", seq);
            state.entries.push((
                seq,
                StreamEntry {
                    id: id.clone(),
                    payload,
                },
            ));
            id
        };
        self.inner.appended.notify_waiters();
        Ok(id)
    }

    async fn read_blocking(
        &self,
        stream: &str,
        last_id: &str,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, BusError> {
        let deadline = Instant::now() + block;
        let from = if last_id == CURSOR_TAIL {
            // Only entries appended from now on.
            let streams = self.inner.streams.lock().await;
            streams.get(stream).map(|s| s.next_seq).unwrap_or(0)
        } else if last_id == CURSOR_START {
            0
        } else {
            seq_of(last_id)
                .ok_or_else(|| BusError::Encoding(format!("bad cursor '{}'", last_id)))?
        };

        loop {
            let notified = self.inner.appended.notified();
            {
                let streams = self.inner.streams.lock().await;
                if let Some(state) = streams.get(stream) {
                    let matching: Vec<StreamEntry> = state
                        .entries
                        .iter()
                        .filter(|(seq, _)| *seq > from)
                        .map(|(_, e)| e.clone())
                        .collect();
                    if !matching.is_empty() {
                        return Ok(matching);
                    }
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, entry_id: &str) -> Result<(), BusError> {
        let mut streams = self.inner.streams.lock().await;
        if let Some(state) = streams.get_mut(stream) {
            state.entries.retain(|(_, e)| e.id != entry_id);
        }
        Ok(())
    }

    async fn trim(&self, stream: &str, max_len: usize) -> Result<(), BusError> {
        let mut streams = self.inner.streams.lock().await;
        if let Some(state) = streams.get_mut(stream) {
            let len = state.entries.len();
            if len > max_len {
                state.entries.drain(..len - max_len);
            }
        }
        Ok(())
    }

    async fn refresh_presence(&self, instance: &str, ttl: Duration) -> Result<(), BusError> {
        self.inner
            .presence
            .lock()
            .await
            .insert(instance.to_owned(), Instant::now() + ttl);
        Ok(())
    }

    async fn presence(&self, instance: &str) -> Result<bool, BusError> {
        Ok(self
            .inner
            .presence
            .lock()
            .await
            .get(instance)
            .is_some_and(|expiry| *expiry > Instant::now()))
    }
}
