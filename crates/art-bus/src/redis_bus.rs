//! Redis-backed bus client.
//!
//! A single shared multiplexed connection (via `ConnectionManager`, which
//! reconnects with exponential backoff) serves all non-blocking commands.
//! Blocking stream reads each get a dedicated connection, cached per
//! stream, so an `XREAD BLOCK` cannot stall unrelated traffic.  Pub/sub
//! subscriptions run on their own connections with a reconnect loop.
//!
//! Acknowledged stream entries are deleted (`XDEL`); readers track their
//! own position cursors.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, ConnectionManagerConfig, MultiplexedConnection};
use redis::streams::{StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::channels;
use crate::{Backoff, Bus, BusError, PubSubMessage, StreamEntry};

/// Payload field name used for stream entries.
const PAYLOAD_FIELD: &str = "payload";

/// Max entries returned by a single blocking read.
const READ_COUNT: usize = 128;

// ---------------------------------------------------------------------------
// RedisBus
// ---------------------------------------------------------------------------

pub struct RedisBus {
    client: redis::Client,
    manager: ConnectionManager,
    /// Dedicated connections for blocking reads, keyed by stream name.
    blocking_conns: Mutex<HashMap<String, MultiplexedConnection>>,
}

impl RedisBus {
    /// Connect to a Redis server, e.g. `redis://10.0.0.5:6379/`.
    ///
    /// The command connection reconnects automatically with exponential
    /// backoff (1 s base, 30 s cap).
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(url)
            .map_err(|e| BusError::Unavailable(format!("invalid redis url: {}", e)))?;
        let config = ConnectionManagerConfig::new()
            .set_factor(1_000)
            .set_exponent_base(2)
            .set_max_delay(30_000)
            .set_connection_timeout(Duration::from_secs(10));
        let manager = ConnectionManager::new_with_config(client.clone(), config)
            .await
            .map_err(map_err)?;
        Ok(RedisBus {
            client,
            manager,
            blocking_conns: Mutex::new(HashMap::new()),
        })
    }

    async fn blocking_conn(&self, stream: &str) -> Result<MultiplexedConnection, BusError> {
        let mut conns = self.blocking_conns.lock().await;
        if let Some(conn) = conns.get(stream) {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_err)?;
        conns.insert(stream.to_owned(), conn.clone());
        Ok(conn)
    }

    async fn drop_blocking_conn(&self, stream: &str) {
        self.blocking_conns.lock().await.remove(stream);
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let mut conn = self.manager.clone();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(map_err)
    }

    async fn subscribe(&self, pattern: &str) -> Result<mpsc::Receiver<PubSubMessage>, BusError> {
        let (tx, rx) = mpsc::channel(1024);
        let client = self.client.clone();
        let pattern = pattern.to_owned();

        // First subscription happens before returning so callers observe
        // connection failures synchronously.
        let mut pubsub = client.get_async_pubsub().await.map_err(map_err)?;
        pubsub.psubscribe(&pattern).await.map_err(map_err)?;

        tokio::spawn(async move {
            let mut backoff = Backoff::reconnect();
            let mut pubsub = Some(pubsub);
            loop {
                let mut active = match pubsub.take() {
                    Some(p) => p,
                    None => {
                        // Reconnect path.
                        match client.get_async_pubsub().await {
                            Ok(mut p) => match p.psubscribe(&pattern).await {
                                Ok(()) => {
                                    backoff.reset();
                                    p
                                }
                                Err(e) => {
                                    warn!(pattern = %pattern, error = %e, "psubscribe failed");
                                    tokio::time::sleep(backoff.next_delay()).await;
                                    continue;
                                }
                            },
                            Err(e) => {
                                warn!(pattern = %pattern, error = %e, "pubsub reconnect failed");
                                tokio::time::sleep(backoff.next_delay()).await;
                                continue;
                            }
                        }
                    }
                };

                let mut stream = active.on_message();
                while let Some(msg) = stream.next().await {
                    let delivery = PubSubMessage {
                        channel: msg.get_channel_name().to_owned(),
                        payload: msg.get_payload_bytes().to_vec(),
                    };
                    if tx.send(delivery).await.is_err() {
                        debug!(pattern = %pattern, "subscriber dropped, ending pubsub task");
                        return;
                    }
                }
                // Message stream ended: connection lost.  Loop reconnects.
                warn!(pattern = %pattern, "pubsub connection lost, reconnecting");
            }
        });

        Ok(rx)
    }

    async fn append(&self, stream: &str, payload: Vec<u8>) -> Result<String, BusError> {
        let mut conn = self.manager.clone();
        let id: String = conn
            .xadd(stream, "*", &[(PAYLOAD_FIELD, payload)])
            .await
            .map_err(map_err)?;
        Ok(id)
    }

    async fn read_blocking(
        &self,
        stream: &str,
        last_id: &str,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, BusError> {
        let mut conn = self.blocking_conn(stream).await?;
        let options = StreamReadOptions::default()
            .block(block.as_millis() as usize)
            .count(READ_COUNT);
        let reply: Option<StreamReadReply> = match conn
            .xread_options(&[stream], &[last_id], &options)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                // Drop the cached connection so the next call dials fresh.
                self.drop_blocking_conn(stream).await;
                return Err(map_err(e));
            }
        };

        let mut entries = Vec::new();
        if let Some(reply) = reply {
            for key in reply.keys {
                for id in key.ids {
                    match id.map.get(PAYLOAD_FIELD) {
                        Some(value) => match redis::from_redis_value::<Vec<u8>>(value) {
                            Ok(payload) => entries.push(StreamEntry {
                                id: id.id.clone(),
                                payload,
                            }),
                            Err(e) => {
                                return Err(BusError::Encoding(format!(
                                    "stream {} entry {}: {}",
                                    stream, id.id, e
                                )));
                            }
                        },
                        None => {
                            // Entries written by other tools may lack the
                            // payload field; skip them.
                            debug!(stream = %stream, id = %id.id, "entry without payload field");
                        }
                    }
                }
            }
        }
        Ok(entries)
    }

    async fn ack(&self, stream: &str, entry_id: &str) -> Result<(), BusError> {
        let mut conn = self.manager.clone();
        conn.xdel::<_, _, ()>(stream, &[entry_id])
            .await
            .map_err(map_err)
    }

    async fn trim(&self, stream: &str, max_len: usize) -> Result<(), BusError> {
        let mut conn = self.manager.clone();
        conn.xtrim::<_, ()>(stream, StreamMaxlen::Approx(max_len))
            .await
            .map_err(map_err)
    }

    async fn refresh_presence(&self, instance: &str, ttl: Duration) -> Result<(), BusError> {
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(channels::alive_key(instance), "1", ttl.as_secs())
            .await
            .map_err(map_err)
    }

    async fn presence(&self, instance: &str) -> Result<bool, BusError> {
        let mut conn = self.manager.clone();
        conn.exists(channels::alive_key(instance))
            .await
            .map_err(map_err)
    }
}

fn map_err(e: redis::RedisError) -> BusError {
    if e.is_timeout() {
        BusError::Timeout(e.to_string())
    } else {
        BusError::Unavailable(e.to_string())
    }
}
