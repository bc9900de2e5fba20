//! Request/response DTOs for the external surface (C12), following the
//! teacher's `Request`/`Response` DTO split with `From<Entity>` conversions.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::alarm_engine::AlarmRule;
use crate::identity::Identity;

#[derive(Debug, Deserialize)]
pub struct CreateAlarmRuleRequest {
    pub group: String,
    pub node: String,
    #[serde(default)]
    pub device: String,
    pub metric: String,
    pub name: String,
    pub rule_type: String,
    pub threshold: Option<f64>,
    #[serde(default)]
    pub delay_sec: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl CreateAlarmRuleRequest {
    /// Rule-type/threshold co-requirement and non-negative delay, enforced
    /// at the mutation boundary per the error-handling design's Programmer
    /// error kind.
    pub fn validate(&self) -> Result<(), String> {
        let valid_types = ["true", "false", "above", "below"];
        if !valid_types.contains(&self.rule_type.as_str()) {
            return Err(format!("invalid rule_type: {}", self.rule_type));
        }
        if matches!(self.rule_type.as_str(), "above" | "below") && self.threshold.is_none() {
            return Err("threshold is required for above/below rules".to_string());
        }
        if self.delay_sec < 0 {
            return Err("delay_sec must not be negative".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateAlarmRuleRequest {
    pub name: String,
    pub rule_type: String,
    pub threshold: Option<f64>,
    #[serde(default)]
    pub delay_sec: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl UpdateAlarmRuleRequest {
    pub fn validate(&self) -> Result<(), String> {
        let valid_types = ["true", "false", "above", "below"];
        if !valid_types.contains(&self.rule_type.as_str()) {
            return Err(format!("invalid rule_type: {}", self.rule_type));
        }
        if matches!(self.rule_type.as_str(), "above" | "below") && self.threshold.is_none() {
            return Err("threshold is required for above/below rules".to_string());
        }
        if self.delay_sec < 0 {
            return Err("delay_sec must not be negative".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct AlarmRuleResponse {
    pub id: Uuid,
    pub identity: Identity,
    pub name: String,
    pub rule_type: String,
    pub threshold: Option<f64>,
    pub delay_sec: i64,
    pub enabled: bool,
}

impl From<AlarmRule> for AlarmRuleResponse {
    fn from(r: AlarmRule) -> Self {
        Self {
            id: r.id,
            identity: r.identity,
            name: r.name,
            rule_type: r.rule_type,
            threshold: r.threshold,
            delay_sec: r.delay_sec,
            enabled: r.enabled,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQueryRequest {
    pub metrics: Vec<Identity>,
    pub start_ms: i64,
    pub end_ms: i64,
    pub interval_secs: Option<i64>,
    pub samples: Option<u32>,
    #[serde(default)]
    pub raw: bool,
}

impl HistoryQueryRequest {
    /// Resolves the effective bucket width, enforcing the 1-second minimum
    /// auto-interval boundary behaviour.
    pub fn effective_bucket_secs(&self) -> i64 {
        if let Some(secs) = self.interval_secs {
            return secs.max(1);
        }
        let samples = self.samples.unwrap_or(100).max(1) as i64;
        let span_ms = (self.end_ms - self.start_ms).max(0);
        (span_ms / 1000 / samples).max(1)
    }
}

#[derive(Debug, Deserialize)]
pub struct HideRequest {
    pub group: String,
    #[serde(default)]
    pub node: String,
    #[serde(default)]
    pub device: String,
    #[serde(default)]
    pub metric: String,
}

#[derive(Debug, Deserialize)]
pub struct WriteMetricRequest {
    pub group: String,
    pub node: String,
    #[serde(default)]
    pub device: String,
    pub metric: String,
    pub value: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn above_rule_without_threshold_is_rejected() {
        let req = CreateAlarmRuleRequest {
            group: "G1".into(),
            node: "N1".into(),
            device: "".into(),
            metric: "Temp".into(),
            name: "hot".into(),
            rule_type: "above".into(),
            threshold: None,
            delay_sec: 0,
            enabled: true,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn negative_delay_is_rejected() {
        let req = CreateAlarmRuleRequest {
            group: "G1".into(),
            node: "N1".into(),
            device: "".into(),
            metric: "Temp".into(),
            name: "hot".into(),
            rule_type: "true".into(),
            threshold: None,
            delay_sec: -1,
            enabled: true,
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn auto_interval_has_a_one_second_floor() {
        let req = HistoryQueryRequest {
            metrics: vec![],
            start_ms: 0,
            end_ms: 500,
            interval_secs: None,
            samples: Some(100),
            raw: false,
        };
        assert_eq!(req.effective_bucket_secs(), 1);
    }

    #[test]
    fn zero_samples_does_not_divide_by_zero() {
        let req = HistoryQueryRequest {
            metrics: vec![],
            start_ms: 0,
            end_ms: 60_000,
            interval_secs: None,
            samples: Some(0),
            raw: false,
        };
        assert_eq!(req.effective_bucket_secs(), 60);
    }
}
