//! Hot-value cache (C4): optional Redis-compatible KV store holding the
//! last value per identity, fed by keyspace notifications and drained on a
//! fixed interval. Connect failures are retried a bounded number of times;
//! once connected, any other failure is logged and ingestion falls back to
//! in-memory pub/sub for that event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fred::clients::Client;
use fred::prelude::*;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::identity::Identity;
use crate::pubsub::{MetricUpdateEvent, PubSub};
use crate::value::MetricValue;

const DRAIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct CacheValue {
    identity: Identity,
    ts: i64,
    value: MetricValue,
}

pub struct HotCache {
    publisher: Client,
}

impl HotCache {
    /// Connects the publisher client, retrying connection establishment up
    /// to `max_retries` times with a fixed delay — the only retried
    /// operation in the system per the concurrency model's retry policy.
    /// On success also spins up the subscriber connection that drives
    /// `drain` from keyspace notifications.
    pub async fn connect(url: &str, max_retries: u32, drain: Arc<CacheDrain>) -> Option<Self> {
        let config = match Config::from_url(url) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "invalid hot cache url, running without hot cache");
                return None;
            }
        };

        let mut attempt = 0;
        let publisher = loop {
            let client = Client::new(config.clone(), None, None, None);
            client.connect();
            match client.wait_for_connect().await {
                Ok(_) => {
                    info!("hot cache connected");
                    break client;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_retries {
                        warn!(error = %e, attempt, "hot cache unreachable, falling back to in-memory pub/sub");
                        return None;
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        };

        spawn_keyspace_subscriber(publisher.clone(), drain);
        Some(Self { publisher })
    }

    pub async fn set_value(&self, identity: &Identity, ts: i64, value: &MetricValue) {
        let payload = CacheValue { identity: identity.clone(), ts, value: value.clone() };
        let key = identity.cache_key();
        if let Ok(json) = serde_json::to_string(&payload) {
            let _: Result<(), _> = self.publisher.set(key, json, None, None, false).await;
        }
    }

    /// Deletes the exact key for a fully-qualified metric identity, or, for
    /// a node/device-granularity identity (empty `device`/`metric`), scans
    /// for every key under that prefix and deletes them all.
    pub async fn delete_matching_identity(&self, identity: &Identity) {
        if identity.metric.is_empty() {
            let pattern = format!("{}|{}|{}|*", identity.group, identity.node, identity.device);
            self.delete_matching_pattern(&pattern).await;
        } else {
            let key = identity.cache_key();
            let _: Result<(), _> = self.publisher.del(key).await;
        }
    }

    async fn delete_matching_pattern(&self, pattern: &str) {
        let keys: Result<Vec<String>, _> = self.publisher.keys(pattern).await;
        match keys {
            Ok(keys) if !keys.is_empty() => {
                let _: Result<(), _> = self.publisher.del(keys).await;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, pattern, "failed to scan hot cache keys for delete"),
        }
    }

    /// Reads every key, decodes it as a cached identity/value pair, and
    /// folds the result into a `Host` projection — the on-demand hierarchy
    /// rebuild the cache can be asked to perform independent of the
    /// in-memory topology.
    pub async fn rebuild_hierarchy(&self) -> crate::topology::Host {
        use crate::topology::{TopologyMetric, TopologyDevice, TopologyGroup, TopologyNode};

        let mut host = crate::topology::Host::default();
        let keys: Vec<String> = match self.publisher.keys("*").await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "failed to scan hot cache keys for hierarchy rebuild");
                return host;
            }
        };

        for key in keys {
            let raw: Result<Option<String>, _> = self.publisher.get(&key).await;
            let Ok(Some(json)) = raw else { continue };
            let Ok(cached) = serde_json::from_str::<CacheValue>(&json) else {
                warn!(key, "skipping undecodable hot cache entry during hierarchy rebuild");
                continue;
            };
            let metric = TopologyMetric {
                name: cached.identity.metric.clone(),
                type_name: String::new(),
                value: cached.value,
                timestamp: cached.ts,
                scan_rate: None,
                properties: HashMap::new(),
                template_ref: None,
            };
            let group = host.groups.entry(cached.identity.group.clone()).or_insert_with(TopologyGroup::default);
            let node = group.nodes.entry(cached.identity.node.clone()).or_insert_with(TopologyNode::default);
            if cached.identity.device.is_empty() {
                node.metrics.insert(metric.name.clone(), metric);
            } else {
                let device = node
                    .devices
                    .entry(cached.identity.device.clone())
                    .or_insert_with(TopologyDevice::default);
                device.metrics.insert(metric.name.clone(), metric);
            }
        }
        host
    }
}

/// Opens a second connection subscribed to `__keyevent@0__:*`, enabling
/// `KEA` notifications on first connect. Each notification carries the
/// mutated key as its payload; the current value is re-fetched and handed
/// to `drain` for the next batched publish.
fn spawn_keyspace_subscriber(publisher: Client, drain: Arc<CacheDrain>) {
    tokio::spawn(async move {
        let subscriber = publisher.clone_new();
        subscriber.connect();
        if let Err(e) = subscriber.wait_for_connect().await {
            warn!(error = %e, "hot cache subscriber connection failed, keyspace feed disabled");
            return;
        }
        if let Err(e) = subscriber.config_set("notify-keyspace-events", "KEA").await {
            warn!(error = %e, "failed to enable keyspace notifications");
        }
        let mut stream = subscriber.message_rx();
        if let Err(e) = subscriber.psubscribe("__keyevent@0__:*").await {
            warn!(error = %e, "failed to subscribe to keyspace events");
            return;
        }

        while let Ok(message) = stream.recv().await {
            let Some(key) = message.value.as_str().map(|s| s.to_string()) else { continue };
            let raw: Result<Option<String>, _> = publisher.get(&key).await;
            let Ok(Some(json)) = raw else { continue };
            let Ok(cached) = serde_json::from_str::<CacheValue>(&json) else { continue };
            drain
                .buffer_update(
                    key,
                    MetricUpdateEvent {
                        identity: cached.identity,
                        value: cached.value,
                        timestamp_ms: cached.ts,
                    },
                )
                .await;
        }
    });
}

/// Buffers keyspace-notification-driven updates and flushes them onto the
/// pub/sub fabric once per second, matching the drain-batch design.
pub struct CacheDrain {
    buffer: Arc<Mutex<HashMap<String, MetricUpdateEvent>>>,
}

impl Default for CacheDrain {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheDrain {
    pub fn new() -> Self {
        Self { buffer: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub async fn buffer_update(&self, key: String, event: MetricUpdateEvent) {
        self.buffer.lock().await.insert(key, event);
    }

    pub fn spawn_drain_loop(self: Arc<Self>, bus: Arc<PubSub>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DRAIN_INTERVAL);
            loop {
                ticker.tick().await;
                let mut buffer = self.buffer.lock().await;
                if buffer.is_empty() {
                    continue;
                }
                for (_, event) in buffer.drain() {
                    bus.publish_metric_update(event);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buffered_updates_dedup_by_key_between_drains() {
        let drain = CacheDrain::new();
        let id = Identity::new("G1", "N1", "", "Temp");
        drain
            .buffer_update(
                id.cache_key(),
                MetricUpdateEvent { identity: id.clone(), value: MetricValue::Int(1), timestamp_ms: 1 },
            )
            .await;
        drain
            .buffer_update(
                id.cache_key(),
                MetricUpdateEvent { identity: id.clone(), value: MetricValue::Int(2), timestamp_ms: 2 },
            )
            .await;
        assert_eq!(drain.buffer.lock().await.len(), 1);
        assert_eq!(
            drain.buffer.lock().await.get(&id.cache_key()).unwrap().timestamp_ms,
            2
        );
    }
}
