//! Pub/Sub fabric (C10): topic-based broadcast for metric updates and alarm
//! transitions. Best-effort fan-out — a slow subscriber drops events rather
//! than slowing down ingestion, matching the "throughput over lossless
//! delivery" ordering guarantee.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::identity::Identity;
use crate::value::MetricValue;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricUpdateEvent {
    pub identity: Identity,
    pub value: MetricValue,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmStateChangeEvent {
    pub rule_id: uuid::Uuid,
    pub identity: Identity,
    pub from_state: String,
    pub to_state: String,
    pub value: Option<f64>,
    pub timestamp_ms: i64,
}

pub struct PubSub {
    metric_updates: broadcast::Sender<MetricUpdateEvent>,
    alarm_changes: broadcast::Sender<AlarmStateChangeEvent>,
}

impl Default for PubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl PubSub {
    pub fn new() -> Self {
        let (metric_updates, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (alarm_changes, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { metric_updates, alarm_changes }
    }

    pub fn publish_metric_update(&self, event: MetricUpdateEvent) {
        // Lossy by design: no receivers or a full ring buffer is not an error.
        let _ = self.metric_updates.send(event);
    }

    pub fn publish_alarm_change(&self, event: AlarmStateChangeEvent) {
        let _ = self.alarm_changes.send(event);
    }

    pub fn subscribe_metric_updates(&self) -> broadcast::Receiver<MetricUpdateEvent> {
        self.metric_updates.subscribe()
    }

    pub fn subscribe_alarm_changes(&self) -> broadcast::Receiver<AlarmStateChangeEvent> {
        self.alarm_changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_metric_update() {
        let bus = PubSub::new();
        let mut rx = bus.subscribe_metric_updates();
        bus.publish_metric_update(MetricUpdateEvent {
            identity: Identity::new("G1", "N1", "", "Temp"),
            value: MetricValue::Float(1.0),
            timestamp_ms: 0,
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.identity.metric, "Temp");
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_error() {
        let bus = PubSub::new();
        bus.publish_alarm_change(AlarmStateChangeEvent {
            rule_id: uuid::Uuid::nil(),
            identity: Identity::new("G1", "N1", "", "Temp"),
            from_state: "normal".into(),
            to_state: "active".into(),
            value: Some(1.0),
            timestamp_ms: 0,
        });
    }
}
