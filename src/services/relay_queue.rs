//! Durable two-channel mailbox between the dispatch bridge and live terminal sessions.
//!
//! Each device serial number owns an outbound channel (operator -> terminal)
//! and an inbound channel (terminal replies awaited by a dispatch caller).
//! Both are strict FIFO lists. Redis is the production backend; the in-process
//! backend serves single-node setups and tests.

use dashmap::DashMap;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::settings::RelayConfig;
use crate::error::AppError;
use crate::models::Envelope;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("relay queue backend unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),
    #[error("queued entry on {key} is not a valid envelope: {source}")]
    CorruptEntry {
        key: String,
        #[source]
        source: AppError,
    },
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Operator -> terminal
    Outbound,
    /// Terminal -> dispatch caller
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => write!(f, "outbound"),
            Direction::Inbound => write!(f, "inbound"),
        }
    }
}

impl FromStr for Direction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "out" | "outbound" => Ok(Direction::Outbound),
            "in" | "inbound" => Ok(Direction::Inbound),
            other => Err(AppError::Validation(format!(
                "direction must be out or in (got {})",
                other
            ))),
        }
    }
}

/// Derives channel keys; sessions and the dispatch bridge must agree on these.
#[derive(Debug, Clone)]
pub struct ChannelKeys {
    prefix: String,
    out_suffix: String,
    in_suffix: String,
}

impl ChannelKeys {
    pub fn new(prefix: impl Into<String>, out_suffix: impl Into<String>, in_suffix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            out_suffix: out_suffix.into(),
            in_suffix: in_suffix.into(),
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(&config.key_prefix, &config.out_suffix, &config.in_suffix)
    }

    pub fn key(&self, device_sn: &str, direction: Direction) -> String {
        let suffix = match direction {
            Direction::Outbound => &self.out_suffix,
            Direction::Inbound => &self.in_suffix,
        };
        format!("{}_{}_{}", self.prefix, device_sn, suffix)
    }
}

impl Default for ChannelKeys {
    fn default() -> Self {
        Self::new("aiface", "OUT", "IN")
    }
}

#[derive(Debug, Default)]
pub struct MemoryChannel {
    entries: VecDeque<String>,
    notify: Arc<Notify>,
}

/// Storage backend for the relay queue
#[derive(Clone)]
pub enum RelayQueueStorage {
    /// In-process lists (single instance, lost on restart)
    Memory {
        channels: Arc<DashMap<String, MemoryChannel>>,
    },
    /// Redis lists (survive restarts when Redis does)
    Redis {
        connection_manager: Arc<redis::aio::ConnectionManager>,
    },
}

#[derive(Clone)]
pub struct RelayQueue {
    storage: RelayQueueStorage,
    keys: ChannelKeys,
    /// Reply polling interval for backends without wake-ups
    poll_interval: Duration,
}

impl RelayQueue {
    pub fn new_memory(keys: ChannelKeys) -> Self {
        Self {
            storage: RelayQueueStorage::Memory {
                channels: Arc::new(DashMap::new()),
            },
            keys,
            poll_interval: Duration::from_millis(100),
        }
    }

    pub async fn new_redis(redis_url: &str, keys: ChannelKeys, poll_interval: Duration) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let connection_manager = redis::aio::ConnectionManager::new(client).await?;

        info!("Redis connection established for relay queue: {}", redis_url);

        Ok(Self {
            storage: RelayQueueStorage::Redis {
                connection_manager: Arc::new(connection_manager),
            },
            keys,
            poll_interval,
        })
    }

    /// Redis queue that connects on first use; tests point it at a closed port.
    #[cfg(test)]
    pub(crate) fn unreachable_redis(keys: ChannelKeys) -> Self {
        let client = redis::Client::open("redis://127.0.0.1:1/").unwrap();
        let config = redis::aio::ConnectionManagerConfig::new()
            .set_number_of_retries(0)
            .set_connection_timeout(Some(Duration::from_millis(200)))
            .set_response_timeout(Some(Duration::from_millis(200)));
        let connection_manager = redis::aio::ConnectionManager::new_lazy_with_config(client, config).unwrap();

        Self {
            storage: RelayQueueStorage::Redis {
                connection_manager: Arc::new(connection_manager),
            },
            keys,
            poll_interval: Duration::from_millis(20),
        }
    }

    /// Appends raw text, bypassing envelope encoding.
    #[cfg(test)]
    pub(crate) fn push_raw(&self, device_sn: &str, direction: Direction, text: &str) {
        if let RelayQueueStorage::Memory { channels } = &self.storage {
            let key = self.channel_key(device_sn, direction);
            channels.entry(key).or_default().entries.push_back(text.to_string());
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked_channels(&self) -> usize {
        match &self.storage {
            RelayQueueStorage::Memory { channels } => channels.len(),
            RelayQueueStorage::Redis { .. } => 0,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match &self.storage {
            RelayQueueStorage::Memory { .. } => "memory",
            RelayQueueStorage::Redis { .. } => "redis",
        }
    }

    pub fn channel_key(&self, device_sn: &str, direction: Direction) -> String {
        self.keys.key(device_sn, direction)
    }

    /// Appends to the tail of the channel. Never blocks on consumers.
    pub async fn enqueue(&self, device_sn: &str, direction: Direction, envelope: &Envelope) -> Result<(), QueueError> {
        let key = self.channel_key(device_sn, direction);
        let payload = serde_json::to_string(envelope)?;

        match &self.storage {
            RelayQueueStorage::Memory { channels } => {
                let notify = {
                    let mut channel = channels.entry(key.clone()).or_default();
                    channel.entries.push_back(payload);
                    channel.notify.clone()
                };
                notify.notify_one();
            }
            RelayQueueStorage::Redis { connection_manager } => {
                let mut conn = connection_manager.as_ref().clone();
                let _: i64 = conn.rpush(&key, payload).await?;
            }
        }

        debug!(key = %key, kind = %envelope.kind(), "Relay entry enqueued");
        Ok(())
    }

    /// Removes and returns the head entry, or None when the channel is empty.
    pub async fn dequeue(&self, device_sn: &str, direction: Direction) -> Result<Option<Envelope>, QueueError> {
        let key = self.channel_key(device_sn, direction);

        let raw = match &self.storage {
            RelayQueueStorage::Memory { channels } => {
                let raw = channels
                    .get_mut(&key)
                    .and_then(|mut channel| channel.entries.pop_front());
                prune_idle_channel(channels, &key);
                raw
            }
            RelayQueueStorage::Redis { connection_manager } => {
                let mut conn = connection_manager.as_ref().clone();
                let raw: Option<String> = conn.lpop(&key, None).await?;
                raw
            }
        };

        raw.map(|text| decode_entry(&key, &text)).transpose()
    }

    /// Returns the tail entry without removing it. Inspection only.
    pub async fn peek_last(&self, device_sn: &str, direction: Direction) -> Result<Option<Envelope>, QueueError> {
        let key = self.channel_key(device_sn, direction);

        let raw = match &self.storage {
            RelayQueueStorage::Memory { channels } => channels
                .get(&key)
                .and_then(|channel| channel.entries.back().cloned()),
            RelayQueueStorage::Redis { connection_manager } => {
                let mut conn = connection_manager.as_ref().clone();
                let raw: Option<String> = conn.lindex(&key, -1).await?;
                raw
            }
        };

        raw.map(|text| decode_entry(&key, &text)).transpose()
    }

    /// Drops every entry of the channel and returns how many were removed.
    pub async fn purge(&self, device_sn: &str, direction: Direction) -> Result<usize, QueueError> {
        let key = self.channel_key(device_sn, direction);

        let removed = match &self.storage {
            RelayQueueStorage::Memory { channels } => {
                let removed = channels
                    .get_mut(&key)
                    .map(|mut channel| {
                        let count = channel.entries.len();
                        channel.entries.clear();
                        count
                    })
                    .unwrap_or(0);
                prune_idle_channel(channels, &key);
                removed
            }
            RelayQueueStorage::Redis { connection_manager } => {
                let mut conn = connection_manager.as_ref().clone();
                let (removed, _): (usize, usize) = redis::pipe()
                    .atomic()
                    .cmd("LLEN")
                    .arg(&key)
                    .cmd("DEL")
                    .arg(&key)
                    .query_async(&mut conn)
                    .await?;
                removed
            }
        };

        debug!(key = %key, removed = removed, "Relay channel purged");
        Ok(removed)
    }

    pub async fn len(&self, device_sn: &str, direction: Direction) -> Result<usize, QueueError> {
        let key = self.channel_key(device_sn, direction);

        match &self.storage {
            RelayQueueStorage::Memory { channels } => {
                Ok(channels.get(&key).map(|channel| channel.entries.len()).unwrap_or(0))
            }
            RelayQueueStorage::Redis { connection_manager } => {
                let mut conn = connection_manager.as_ref().clone();
                let len: usize = conn.llen(&key).await?;
                Ok(len)
            }
        }
    }

    /// Dequeues the head entry, waiting up to `timeout` for one to arrive.
    ///
    /// The in-process backend is woken by `enqueue`; Redis is polled at
    /// `poll_interval`, sleeping in between.
    pub async fn wait_dequeue(
        &self,
        device_sn: &str,
        direction: Direction,
        timeout: Duration,
    ) -> Result<Option<Envelope>, QueueError> {
        let deadline = Instant::now() + timeout;

        match &self.storage {
            RelayQueueStorage::Memory { channels } => {
                let key = self.channel_key(device_sn, direction);
                loop {
                    // Holding the Notify keeps the channel from being pruned while we wait
                    let notify = channels.entry(key.clone()).or_default().notify.clone();

                    let head = self.dequeue(device_sn, direction).await;
                    let timed_out = match &head {
                        Ok(None) => tokio::time::timeout_at(deadline, notify.notified()).await.is_err(),
                        _ => false,
                    };
                    drop(notify);

                    match head? {
                        Some(envelope) => {
                            prune_idle_channel(channels, &key);
                            return Ok(Some(envelope));
                        }
                        None if timed_out => {
                            prune_idle_channel(channels, &key);
                            return Ok(None);
                        }
                        None => {}
                    }
                }
            }
            RelayQueueStorage::Redis { .. } => loop {
                if let Some(envelope) = self.dequeue(device_sn, direction).await? {
                    return Ok(Some(envelope));
                }

                let now = Instant::now();
                if now >= deadline {
                    return Ok(None);
                }
                tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
            },
        }
    }
}

/// Drops an in-process channel once it is empty and nobody waits on it.
fn prune_idle_channel(channels: &DashMap<String, MemoryChannel>, key: &str) {
    channels.remove_if(key, |_, channel| {
        channel.entries.is_empty() && Arc::strong_count(&channel.notify) == 1
    });
}

fn decode_entry(key: &str, text: &str) -> Result<Envelope, QueueError> {
    Envelope::parse(text).map_err(|source| QueueError::CorruptEntry {
        key: key.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn envelope(value: serde_json::Value) -> Envelope {
        Envelope::from_value(value).unwrap()
    }

    #[test]
    fn test_channel_key_naming() {
        let keys = ChannelKeys::new("aiface", "OUT", "IN");
        assert_eq!(keys.key("SN1", Direction::Outbound), "aiface_SN1_OUT");
        assert_eq!(keys.key("SN1", Direction::Inbound), "aiface_SN1_IN");
    }

    #[test]
    fn test_direction_parsing() {
        assert_eq!("out".parse::<Direction>().unwrap(), Direction::Outbound);
        assert_eq!("Inbound".parse::<Direction>().unwrap(), Direction::Inbound);
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[tokio::test]
    async fn test_fifo_per_channel() {
        let queue = RelayQueue::new_memory(ChannelKeys::default());
        let first = envelope(json!({"cmd": "getuserlist", "sn": "SN1", "stn": true}));
        let second = envelope(json!({"cmd": "reboot", "sn": "SN1"}));

        queue.enqueue("SN1", Direction::Outbound, &first).await.unwrap();
        queue.enqueue("SN1", Direction::Outbound, &second).await.unwrap();

        assert_eq!(queue.len("SN1", Direction::Outbound).await.unwrap(), 2);
        assert_eq!(queue.dequeue("SN1", Direction::Outbound).await.unwrap(), Some(first));
        assert_eq!(queue.dequeue("SN1", Direction::Outbound).await.unwrap(), Some(second));
        assert_eq!(queue.dequeue("SN1", Direction::Outbound).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_round_trip_is_field_for_field() {
        let queue = RelayQueue::new_memory(ChannelKeys::default());
        let original = json!({
            "ret": "getuserinfo",
            "sn": "SN1",
            "result": true,
            "enrollid": 7,
            "record": "base64==",
            "nested": {"a": [1, 2.5, null]}
        });

        queue.enqueue("SN1", Direction::Inbound, &envelope(original.clone())).await.unwrap();
        let back = queue.dequeue("SN1", Direction::Inbound).await.unwrap().unwrap();

        assert_eq!(back.to_value(), original);
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let queue = RelayQueue::new_memory(ChannelKeys::default());
        queue
            .enqueue("SN1", Direction::Outbound, &envelope(json!({"cmd": "reboot"})))
            .await
            .unwrap();

        assert_eq!(queue.dequeue("SN2", Direction::Outbound).await.unwrap(), None);
        assert_eq!(queue.dequeue("SN1", Direction::Inbound).await.unwrap(), None);
        assert!(queue.dequeue("SN1", Direction::Outbound).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_peek_last_and_purge() {
        let queue = RelayQueue::new_memory(ChannelKeys::default());
        queue.enqueue("SN1", Direction::Inbound, &envelope(json!({"ret": "a"}))).await.unwrap();
        queue.enqueue("SN1", Direction::Inbound, &envelope(json!({"ret": "b"}))).await.unwrap();

        let last = queue.peek_last("SN1", Direction::Inbound).await.unwrap().unwrap();
        assert_eq!(last.kind().name(), "b");
        assert_eq!(queue.len("SN1", Direction::Inbound).await.unwrap(), 2);

        assert_eq!(queue.purge("SN1", Direction::Inbound).await.unwrap(), 2);
        assert_eq!(queue.peek_last("SN1", Direction::Inbound).await.unwrap(), None);
        assert_eq!(queue.purge("SN9", Direction::Inbound).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_wait_dequeue_wakes_on_enqueue() {
        let queue = RelayQueue::new_memory(ChannelKeys::default());
        let producer = queue.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            producer
                .enqueue("SN1", Direction::Inbound, &envelope(json!({"ret": "getuserlist", "result": true})))
                .await
                .unwrap();
        });

        let started = std::time::Instant::now();
        let reply = queue
            .wait_dequeue("SN1", Direction::Inbound, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(reply.unwrap().kind().name(), "getuserlist");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_wait_dequeue_times_out_empty() {
        let queue = RelayQueue::new_memory(ChannelKeys::default());
        let started = std::time::Instant::now();

        let reply = queue
            .wait_dequeue("SN1", Direction::Inbound, Duration::from_millis(100))
            .await
            .unwrap();

        assert!(reply.is_none());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_drained_channels_are_forgotten() {
        let queue = RelayQueue::new_memory(ChannelKeys::default());
        queue
            .enqueue("SN1", Direction::Outbound, &envelope(json!({"cmd": "getuserlist"})))
            .await
            .unwrap();
        queue
            .enqueue("SN2", Direction::Outbound, &envelope(json!({"cmd": "getuserlist"})))
            .await
            .unwrap();
        assert_eq!(queue.tracked_channels(), 2);

        queue.dequeue("SN1", Direction::Outbound).await.unwrap();
        queue.purge("SN2", Direction::Outbound).await.unwrap();
        // a wait on a serial number nobody ever used must not leave a channel behind
        queue
            .wait_dequeue("TYPO", Direction::Inbound, Duration::from_millis(20))
            .await
            .unwrap();

        assert_eq!(queue.tracked_channels(), 0);
    }

    #[tokio::test]
    async fn test_channel_kept_while_a_waiter_is_parked() {
        let queue = RelayQueue::new_memory(ChannelKeys::default());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .wait_dequeue("SN1", Direction::Inbound, Duration::from_secs(2))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // an unrelated purge must not drop the waiter's wake-up
        queue.purge("SN1", Direction::Inbound).await.unwrap();
        queue
            .enqueue("SN1", Direction::Inbound, &envelope(json!({"ret": "getuserlist"})))
            .await
            .unwrap();

        let started = Instant::now();
        let reply = waiter.await.unwrap().unwrap();
        assert_eq!(reply.unwrap().kind().name(), "getuserlist");
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(queue.tracked_channels(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_backend_reports_unavailable() {
        let queue = RelayQueue::unreachable_redis(ChannelKeys::default());

        let enqueued = queue
            .enqueue("SN1", Direction::Outbound, &envelope(json!({"cmd": "getuserlist"})))
            .await;
        assert!(matches!(enqueued, Err(QueueError::Unavailable(_))));
        assert!(matches!(
            queue.dequeue("SN1", Direction::Outbound).await,
            Err(QueueError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_redis_backend_fifo() {
        // This test will only run if RELAY_TEST_REDIS_URL is set in the environment
        let Ok(url) = std::env::var("RELAY_TEST_REDIS_URL") else {
            return;
        };
        let keys = ChannelKeys::new(format!("relaytest{}", uuid::Uuid::new_v4().simple()), "OUT", "IN");
        let queue = RelayQueue::new_redis(&url, keys, Duration::from_millis(20)).await.unwrap();

        queue.enqueue("SN1", Direction::Outbound, &envelope(json!({"cmd": "a"}))).await.unwrap();
        queue.enqueue("SN1", Direction::Outbound, &envelope(json!({"cmd": "b"}))).await.unwrap();

        assert_eq!(queue.peek_last("SN1", Direction::Outbound).await.unwrap().unwrap().kind().name(), "b");
        assert_eq!(queue.dequeue("SN1", Direction::Outbound).await.unwrap().unwrap().kind().name(), "a");
        assert_eq!(queue.purge("SN1", Direction::Outbound).await.unwrap(), 1);
        assert!(queue
            .wait_dequeue("SN1", Direction::Outbound, Duration::from_millis(60))
            .await
            .unwrap()
            .is_none());
    }
}
