//! Alarm engine (C9): rule cache, per-sample evaluation, restart-safe delay
//! timers, durable state machine and webhook dispatch.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{MantleError, MantleResult};
use crate::identity::Identity;
use crate::pubsub::{AlarmStateChangeEvent, PubSub};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AlarmState {
    Normal,
    Pending,
    Active,
    Acknowledged,
}

impl AlarmState {
    fn as_str(&self) -> &'static str {
        match self {
            AlarmState::Normal => "normal",
            AlarmState::Pending => "pending",
            AlarmState::Active => "active",
            AlarmState::Acknowledged => "acknowledged",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "pending" => AlarmState::Pending,
            "active" => AlarmState::Active,
            "acknowledged" => AlarmState::Acknowledged,
            _ => AlarmState::Normal,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AlarmRule {
    pub id: Uuid,
    pub identity: Identity,
    pub name: String,
    pub rule_type: String,
    pub threshold: Option<f64>,
    pub delay_sec: i64,
    pub enabled: bool,
}

#[derive(Debug, sqlx::FromRow)]
pub struct AlarmRuleRow {
    pub id: Uuid,
    pub group_id: String,
    pub node_id: String,
    pub device_id: String,
    pub metric_id: String,
    pub name: String,
    pub rule_type: String,
    pub threshold: Option<f64>,
    pub delay_sec: i64,
    pub enabled: bool,
}

impl From<AlarmRuleRow> for AlarmRule {
    fn from(r: AlarmRuleRow) -> Self {
        AlarmRule {
            id: r.id,
            identity: Identity::new(r.group_id, r.node_id, r.device_id, r.metric_id),
            name: r.name,
            rule_type: r.rule_type,
            threshold: r.threshold,
            delay_sec: r.delay_sec,
            enabled: r.enabled,
        }
    }
}

/// Pure condition evaluation, independent of I/O: `true`/`false` rule types
/// check nonzero/zero, `above`/`below` compare against `threshold`.
pub fn evaluate_condition(rule_type: &str, threshold: Option<f64>, value: Option<f64>) -> bool {
    let Some(v) = value else { return false };
    match rule_type {
        "true" => v != 0.0,
        "false" => v == 0.0,
        "above" => threshold.map(|t| v > t).unwrap_or(false),
        "below" => threshold.map(|t| v < t).unwrap_or(false),
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    None,
    ToPending,
    ToActiveImmediate,
    ToNormal,
}

/// Pure state-machine step, independent of timers and storage. Callers
/// schedule/cancel timers based on the returned transition.
pub fn next_transition(current: &AlarmState, condition_met: bool, delay_sec: i64) -> Transition {
    match (current, condition_met) {
        (AlarmState::Normal, true) if delay_sec <= 0 => Transition::ToActiveImmediate,
        (AlarmState::Normal, true) => Transition::ToPending,
        (AlarmState::Pending, false) => Transition::ToNormal,
        (AlarmState::Active, false) => Transition::ToNormal,
        (AlarmState::Acknowledged, false) => Transition::ToNormal,
        _ => Transition::None,
    }
}

pub struct AlarmEngine {
    pool: PgPool,
    rules_by_identity: RwLock<HashMap<String, Vec<AlarmRule>>>,
    timers: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    pubsub: Arc<PubSub>,
    http: reqwest::Client,
    webhook_url: Option<String>,
    webhook_secret: Option<String>,
    space_short_id: String,
}

impl AlarmEngine {
    pub async fn load(
        pool: PgPool,
        pubsub: Arc<PubSub>,
        webhook_url: Option<String>,
        webhook_secret: Option<String>,
        space_short_id: String,
    ) -> MantleResult<Arc<Self>> {
        let engine = Arc::new(Self {
            pool,
            rules_by_identity: RwLock::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            pubsub,
            http: reqwest::Client::new(),
            webhook_url,
            webhook_secret,
            space_short_id,
        });
        engine.reload_rule_cache().await?;
        engine.restore_pending_timers().await?;
        Ok(engine)
    }

    /// Rebuilds the identity-keyed rule cache from `alarm_rules`. Called on
    /// startup and after every create/update/delete/enable mutation so the
    /// evaluation path never consults a stale rule set.
    #[allow(clippy::type_complexity)]
    pub async fn reload_rule_cache(&self) -> MantleResult<()> {
        let rows = sqlx::query_as::<_, AlarmRuleRow>(
            "SELECT id, group_id, node_id, device_id, metric_id, name, rule_type, threshold, delay_sec, enabled FROM alarm_rules",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut map: HashMap<String, Vec<AlarmRule>> = HashMap::new();
        for row in rows {
            let rule = AlarmRule::from(row);
            map.entry(rule.identity.cache_key()).or_default().push(rule);
        }
        *self.rules_by_identity.write().await = map;
        Ok(())
    }

    /// Restart safety: any rule left in `pending` gets its remaining delay
    /// recomputed from `condition_met_at`; if the delay has already elapsed
    /// it transitions to active immediately, otherwise a fresh timer is
    /// scheduled for the remainder.
    async fn restore_pending_timers(self: &Arc<Self>) -> MantleResult<()> {
        let rows = sqlx::query_as::<_, (Uuid, DateTime<Utc>)>(
            "SELECT rule_id, condition_met_at FROM alarm_state WHERE state='pending' AND condition_met_at IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await?;

        for (rule_id, condition_met_at) in rows {
            let rules = self.rules_by_identity.read().await;
            let Some(rule) = rules.values().flatten().find(|r| r.id == rule_id).cloned() else {
                continue;
            };
            drop(rules);
            let elapsed = Utc::now().signed_duration_since(condition_met_at);
            let remaining = Duration::from_secs(rule.delay_sec as u64)
                .checked_sub(elapsed.to_std().unwrap_or(Duration::ZERO));
            match remaining {
                None => {
                    let value = self.last_value(rule_id).await;
                    self.clone().transition_to_active(rule.clone(), AlarmState::Pending, value).await
                }
                Some(remaining) => self.clone().schedule_timer(rule.clone(), remaining).await,
            }
        }
        Ok(())
    }

    async fn last_value(&self, rule_id: Uuid) -> Option<f64> {
        sqlx::query_scalar::<_, Option<f64>>("SELECT last_value FROM alarm_state WHERE rule_id=$1")
            .bind(rule_id)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten()
            .flatten()
    }

    pub async fn rules_for(&self, identity: &Identity) -> Vec<AlarmRule> {
        self.rules_by_identity
            .read()
            .await
            .get(&identity.cache_key())
            .cloned()
            .unwrap_or_default()
    }

    /// Invoked fire-and-forget from the ingress path for every named metric.
    /// Per-identity evaluations are serialised by the caller awaiting this
    /// future to completion before processing the next sample for the same
    /// identity (the ordering guarantee in the concurrency model).
    pub async fn evaluate(self: &Arc<Self>, identity: &Identity, value: Option<f64>) {
        for rule in self.rules_for(identity).await {
            if !rule.enabled {
                continue;
            }
            if let Err(e) = self.clone().evaluate_rule(rule, value).await {
                warn!(error = %e, "alarm evaluation failed");
            }
        }
    }

    async fn evaluate_rule(self: Arc<Self>, rule: AlarmRule, value: Option<f64>) -> MantleResult<()> {
        let row = sqlx::query_as::<_, (String,)>("SELECT state FROM alarm_state WHERE rule_id=$1")
            .bind(rule.id)
            .fetch_optional(&self.pool)
            .await?;
        let current = row.map(|(s,)| AlarmState::from_str(&s)).unwrap_or(AlarmState::Normal);

        let condition_met = evaluate_condition(&rule.rule_type, rule.threshold, value);
        let transition = next_transition(&current, condition_met, rule.delay_sec);

        sqlx::query(
            "INSERT INTO alarm_state (rule_id, state, last_value, updated_at) VALUES ($1,$2,$3, now())
             ON CONFLICT (rule_id) DO UPDATE SET last_value=$3, updated_at=now()",
        )
        .bind(rule.id)
        .bind(current.as_str())
        .bind(value)
        .execute(&self.pool)
        .await?;

        match transition {
            Transition::None => {}
            Transition::ToPending => self.clone().enter_pending(rule.clone(), value).await?,
            Transition::ToActiveImmediate => {
                self.clone().transition_to_active(rule.clone(), current, value).await
            }
            Transition::ToNormal => self.clone().transition_to_normal(rule.clone(), current, value).await?,
        }
        Ok(())
    }

    async fn enter_pending(self: Arc<Self>, rule: AlarmRule, value: Option<f64>) -> MantleResult<()> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE alarm_state SET state='pending', condition_met_at=$2, updated_at=now() WHERE rule_id=$1",
        )
        .bind(rule.id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.record_transition(&rule, "normal", "pending", value).await?;
        let delay = Duration::from_secs(rule.delay_sec.max(0) as u64);
        self.clone().schedule_timer(rule, delay).await;
        Ok(())
    }

    async fn schedule_timer(self: Arc<Self>, rule: AlarmRule, delay: Duration) {
        let rule_id = rule.id;
        self.cancel_timer(rule_id).await;
        let engine = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let value = engine.last_value(rule.id).await;
            engine.transition_to_active(rule, AlarmState::Pending, value).await;
        });
        self.timers.lock().await.insert(rule_id, handle);
    }

    async fn cancel_timer(&self, rule_id: Uuid) {
        if let Some(handle) = self.timers.lock().await.remove(&rule_id) {
            handle.abort();
        }
    }

    async fn transition_to_active(self: Arc<Self>, rule: AlarmRule, from: AlarmState, value: Option<f64>) {
        self.cancel_timer(rule.id).await;
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE alarm_state SET state='active', activated_at=$2, updated_at=now() WHERE rule_id=$1",
        )
        .bind(rule.id)
        .bind(now)
        .execute(&self.pool)
        .await;
        if let Err(e) = result {
            warn!(error = %e, "failed to persist active transition");
            return;
        }
        if let Err(e) = self.record_transition(&rule, from.as_str(), "active", value).await {
            warn!(error = %e, "failed to record alarm history");
        }
        self.dispatch_webhook(&rule, "active").await;
    }

    async fn transition_to_normal(
        self: Arc<Self>,
        rule: AlarmRule,
        from: AlarmState,
        value: Option<f64>,
    ) -> MantleResult<()> {
        self.cancel_timer(rule.id).await;
        sqlx::query(
            "UPDATE alarm_state SET state='normal', condition_met_at=NULL, activated_at=NULL, updated_at=now() WHERE rule_id=$1",
        )
        .bind(rule.id)
        .execute(&self.pool)
        .await?;
        self.record_transition(&rule, from.as_str(), "normal", value).await?;
        if from != AlarmState::Pending {
            self.dispatch_webhook(&rule, "normal").await;
        }
        Ok(())
    }

    /// Acknowledgement is only legal while a rule is `active`.
    pub async fn acknowledge(&self, rule_id: Uuid) -> MantleResult<()> {
        let row = sqlx::query_as::<_, (String,)>("SELECT state FROM alarm_state WHERE rule_id=$1")
            .bind(rule_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| MantleError::Invariant("alarm state not found".into()))?;
        if row.0 != "active" {
            return Err(MantleError::Invariant("can only acknowledge an active alarm".into()));
        }
        sqlx::query("UPDATE alarm_state SET state='acknowledged', updated_at=now() WHERE rule_id=$1")
            .bind(rule_id)
            .execute(&self.pool)
            .await?;

        let last_value = self.last_value(rule_id).await;
        let rule = self.find_rule(rule_id).await?;
        self.record_transition(&rule, "active", "acknowledged", last_value).await?;
        Ok(())
    }

    /// Disabling a rule cancels any pending timer and forces `normal`.
    pub async fn set_enabled(&self, rule_id: Uuid, enabled: bool) -> MantleResult<()> {
        sqlx::query("UPDATE alarm_rules SET enabled=$2, updated_at=now() WHERE id=$1")
            .bind(rule_id)
            .bind(enabled)
            .execute(&self.pool)
            .await?;
        if !enabled {
            self.cancel_timer(rule_id).await;
            sqlx::query(
                "UPDATE alarm_state SET state='normal', condition_met_at=NULL, activated_at=NULL, updated_at=now() WHERE rule_id=$1",
            )
            .bind(rule_id)
            .execute(&self.pool)
            .await?;
        }
        self.reload_rule_cache().await
    }

    async fn find_rule(&self, rule_id: Uuid) -> MantleResult<AlarmRule> {
        self.rules_by_identity
            .read()
            .await
            .values()
            .flatten()
            .find(|r| r.id == rule_id)
            .cloned()
            .ok_or_else(|| MantleError::Invariant("alarm rule not found".into()))
    }

    async fn record_transition(
        &self,
        rule: &AlarmRule,
        from: &str,
        to: &str,
        value: Option<f64>,
    ) -> MantleResult<()> {
        sqlx::query(
            "INSERT INTO alarm_history (id, rule_id, from_state, to_state, value, ts) VALUES ($1,$2,$3,$4,$5,now())",
        )
        .bind(Uuid::new_v4())
        .bind(rule.id)
        .bind(from)
        .bind(to)
        .bind(value)
        .execute(&self.pool)
        .await?;

        self.pubsub.publish_alarm_change(AlarmStateChangeEvent {
            rule_id: rule.id,
            identity: rule.identity.clone(),
            from_state: from.to_string(),
            to_state: to.to_string(),
            value,
            timestamp_ms: Utc::now().timestamp_millis(),
        });
        Ok(())
    }

    /// At-most-once delivery: failures are logged, never retried, and never
    /// block the caller's state-machine progress.
    async fn dispatch_webhook(&self, rule: &AlarmRule, transition: &str) {
        let Some(url) = &self.webhook_url else { return };
        let body = serde_json::json!({
            "eventId": Uuid::new_v4().to_string(),
            "spaceShortId": self.space_short_id,
            "ruleId": rule.id,
            "ruleName": rule.name,
            "identity": rule.identity,
            "transition": transition,
        });
        let mut req = self.http.post(url).json(&body);
        if let Some(secret) = &self.webhook_secret {
            req = req.header("X-Alarm-Webhook-Secret", secret);
        }
        match req.send().await {
            Ok(resp) if !resp.status().is_success() => {
                warn!(status = %resp.status(), "alarm webhook rejected");
            }
            Err(e) => warn!(error = %e, "alarm webhook delivery failed"),
            _ => info!(rule_id = %rule.id, transition, "alarm webhook delivered"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn true_rule_fires_on_nonzero() {
        assert!(evaluate_condition("true", None, Some(1.0)));
        assert!(!evaluate_condition("true", None, Some(0.0)));
    }

    #[test]
    fn false_rule_fires_on_zero() {
        assert!(evaluate_condition("false", None, Some(0.0)));
        assert!(!evaluate_condition("false", None, Some(1.0)));
    }

    #[test]
    fn above_rule_requires_threshold() {
        assert!(evaluate_condition("above", Some(100.0), Some(150.0)));
        assert!(!evaluate_condition("above", Some(100.0), Some(50.0)));
        assert!(!evaluate_condition("above", None, Some(150.0)));
    }

    #[test]
    fn below_rule_compares_correctly() {
        assert!(evaluate_condition("below", Some(10.0), Some(5.0)));
        assert!(!evaluate_condition("below", Some(10.0), Some(15.0)));
    }

    #[test]
    fn missing_value_never_meets_condition() {
        assert!(!evaluate_condition("true", None, None));
    }

    #[test]
    fn normal_to_pending_when_delay_positive() {
        assert_eq!(next_transition(&AlarmState::Normal, true, 30), Transition::ToPending);
    }

    #[test]
    fn normal_to_active_when_delay_zero() {
        assert_eq!(next_transition(&AlarmState::Normal, true, 0), Transition::ToActiveImmediate);
    }

    #[test]
    fn pending_clears_to_normal_when_condition_clears() {
        assert_eq!(next_transition(&AlarmState::Pending, false, 30), Transition::ToNormal);
    }

    #[test]
    fn pending_stays_pending_while_condition_holds() {
        assert_eq!(next_transition(&AlarmState::Pending, true, 30), Transition::None);
    }

    #[test]
    fn active_clears_to_normal() {
        assert_eq!(next_transition(&AlarmState::Active, false, 30), Transition::ToNormal);
    }

    #[test]
    fn acknowledged_clears_to_normal() {
        assert_eq!(next_transition(&AlarmState::Acknowledged, false, 30), Transition::ToNormal);
    }
}
