//! Property store (C6): JSON merge upsert of per-metric properties.

use serde_json::{Map, Value};
use sqlx::PgPool;

use crate::error::MantleResult;
use crate::identity::Identity;

/// Shallow-merges `incoming` into `existing`: incoming keys overwrite,
/// keys absent from `incoming` are preserved.
pub fn shallow_merge(existing: &Value, incoming: &Value) -> Value {
    let mut base = match existing {
        Value::Object(m) => m.clone(),
        _ => Map::new(),
    };
    if let Value::Object(add) = incoming {
        for (k, v) in add {
            base.insert(k.clone(), v.clone());
        }
    }
    Value::Object(base)
}

pub struct PropertyStore {
    pool: PgPool,
}

impl PropertyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, identity: &Identity, incoming: &Value) -> MantleResult<()> {
        let current: Option<Value> = sqlx::query_scalar(
            "SELECT properties FROM metric_properties WHERE group_id=$1 AND node_id=$2 AND device_id=$3 AND metric_id=$4",
        )
        .bind(&identity.group)
        .bind(&identity.node)
        .bind(&identity.device)
        .bind(&identity.metric)
        .fetch_optional(&self.pool)
        .await?;

        let merged = shallow_merge(&current.unwrap_or(Value::Object(Map::new())), incoming);

        sqlx::query(
            "INSERT INTO metric_properties (group_id, node_id, device_id, metric_id, properties, updated_at)
             VALUES ($1, $2, $3, $4, $5, now())
             ON CONFLICT (group_id, node_id, device_id, metric_id)
             DO UPDATE SET properties = $5, updated_at = now()",
        )
        .bind(&identity.group)
        .bind(&identity.node)
        .bind(&identity.device)
        .bind(&identity.metric)
        .bind(&merged)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, identity: &Identity) -> MantleResult<Value> {
        let row: Option<Value> = sqlx::query_scalar(
            "SELECT properties FROM metric_properties WHERE group_id=$1 AND node_id=$2 AND device_id=$3 AND metric_id=$4",
        )
        .bind(&identity.group)
        .bind(&identity.node)
        .bind(&identity.device)
        .bind(&identity.metric)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.unwrap_or(Value::Object(Map::new())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_overwrites_matching_keys_and_keeps_others() {
        let existing = json!({"a": 1, "b": 2});
        let incoming = json!({"a": 3});
        assert_eq!(shallow_merge(&existing, &incoming), json!({"a": 3, "b": 2}));
    }

    #[test]
    fn merge_adds_new_keys() {
        let existing = json!({"a": 1});
        let incoming = json!({"b": 2});
        assert_eq!(shallow_merge(&existing, &incoming), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn merge_is_idempotent() {
        let existing = json!({"a": 1});
        let incoming = json!({"a": 1});
        let once = shallow_merge(&existing, &incoming);
        let twice = shallow_merge(&once, &incoming);
        assert_eq!(once, twice);
    }

    #[test]
    fn merge_against_empty_existing_is_incoming() {
        let existing = Value::Object(Map::new());
        let incoming = json!({"a": 1});
        assert_eq!(shallow_merge(&existing, &incoming), incoming);
    }
}
