//! External surface (C12): axum JSON + WebSocket handlers standing in for
//! the GraphQL resolver layer, which is delegated to an external collaborator.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::{Json, Router};
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::Engine;
use crate::error::{MantleError, MantleResult};
use crate::hidden::{HiddenFilter, HiddenItem};
use crate::models::mantle::{
    CreateAlarmRuleRequest, HideRequest, HistoryQueryRequest, UpdateAlarmRuleRequest, WriteMetricRequest,
};
use crate::value::MetricValue;

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/groups", get(groups))
        .route("/api/v1/templates", get(template_definitions))
        .route("/api/v1/cache/hierarchy", get(hierarchy_rebuild))
        .route("/api/v1/hidden", get(list_hidden).post(hide_item))
        .route("/api/v1/hidden/unhide", post(unhide_item))
        .route("/api/v1/history", post(query_history))
        .route("/api/v1/usage", get(usage))
        .route("/api/v1/storage-stats", get(storage_stats))
        .route("/api/v1/alarms", get(list_alarms).post(create_alarm))
        .route(
            "/api/v1/alarms/{id}",
            axum::routing::put(update_alarm).delete(delete_alarm),
        )
        .route("/api/v1/alarms/{id}/ack", post(acknowledge_alarm))
        .route("/api/v1/alarms/{id}/enabled", post(set_alarm_enabled))
        .route("/api/v1/nodes/{group}/{node}", axum::routing::delete(delete_node))
        .route("/api/v1/devices/{group}/{node}/{device}", axum::routing::delete(delete_device))
        .route(
            "/api/v1/metrics/{group}/{node}/{device}/{metric}",
            axum::routing::delete(delete_metric),
        )
        .route("/api/v1/write", post(write_metric))
        .route("/api/v1/subscribe/metric-update", get(ws_metric_updates))
        .route("/api/v1/subscribe/alarm-state", get(ws_alarm_changes))
        .with_state(engine)
}

async fn healthz(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    let db_ok = sqlx::query("SELECT 1").execute(engine.pool()).await.is_ok();
    Json(serde_json::json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "db": db_ok,
        "hotCache": engine.hot_cache.is_some(),
    }))
}

#[derive(Debug, Deserialize)]
struct GroupsQuery {
    #[serde(default)]
    include_hidden: bool,
}

async fn groups(
    State(engine): State<Arc<Engine>>,
    Query(q): Query<GroupsQuery>,
) -> MantleResult<impl IntoResponse> {
    let snapshot = engine.topology.snapshot();
    let hidden_items = engine.hidden.list().await?;
    let filter = HiddenFilter::build(&hidden_items);
    let filtered = filter.apply(&snapshot, q.include_hidden);
    Ok(Json(filtered))
}

async fn template_definitions(State(engine): State<Arc<Engine>>) -> impl IntoResponse {
    Json(engine.topology.template_definitions())
}

async fn hierarchy_rebuild(State(engine): State<Arc<Engine>>) -> MantleResult<impl IntoResponse> {
    let cache = engine
        .hot_cache
        .as_ref()
        .ok_or_else(|| MantleError::Invariant("hot cache not configured".into()))?;
    Ok(Json(cache.rebuild_hierarchy().await))
}

async fn list_hidden(State(engine): State<Arc<Engine>>) -> MantleResult<impl IntoResponse> {
    let items = engine.hidden.list().await?;
    Ok(Json(items.into_iter().map(hidden_item_json).collect::<Vec<_>>()))
}

fn hidden_item_json(item: HiddenItem) -> serde_json::Value {
    serde_json::json!({
        "group": item.group, "node": item.node, "device": item.device, "metric": item.metric,
    })
}

async fn hide_item(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<HideRequest>,
) -> MantleResult<impl IntoResponse> {
    engine
        .hidden
        .hide(&HiddenItem { group: req.group, node: req.node, device: req.device, metric: req.metric })
        .await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn unhide_item(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<HideRequest>,
) -> MantleResult<impl IntoResponse> {
    engine
        .hidden
        .unhide(&HiddenItem { group: req.group, node: req.node, device: req.device, metric: req.metric })
        .await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn query_history(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<HistoryQueryRequest>,
) -> MantleResult<impl IntoResponse> {
    let start = DateTime::from_timestamp_millis(req.start_ms)
        .ok_or_else(|| MantleError::Programmer("invalid start_ms".into()))?;
    let end = DateTime::from_timestamp_millis(req.end_ms)
        .ok_or_else(|| MantleError::Programmer("invalid end_ms".into()))?;
    let bucket_secs = req.effective_bucket_secs();
    let series = engine
        .storage
        .query_window(&req.metrics, start, end, bucket_secs, req.raw)
        .await?;
    Ok(Json(series))
}

async fn usage(State(engine): State<Arc<Engine>>) -> MantleResult<impl IntoResponse> {
    Ok(Json(engine.storage.usage().await?))
}

async fn storage_stats(State(engine): State<Arc<Engine>>) -> MantleResult<impl IntoResponse> {
    Ok(Json(engine.storage.storage_stats().await?))
}

async fn list_alarms(State(engine): State<Arc<Engine>>) -> MantleResult<impl IntoResponse> {
    let rows = sqlx::query_as::<_, crate::alarm_engine::AlarmRuleRow>(
        "SELECT id, group_id, node_id, device_id, metric_id, name, rule_type, threshold, delay_sec, enabled FROM alarm_rules",
    )
    .fetch_all(engine.pool())
    .await?;
    let rules: Vec<_> = rows
        .into_iter()
        .map(crate::alarm_engine::AlarmRule::from)
        .map(crate::models::mantle::AlarmRuleResponse::from)
        .collect();
    Ok(Json(rules))
}

async fn create_alarm(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<CreateAlarmRuleRequest>,
) -> MantleResult<impl IntoResponse> {
    req.validate().map_err(MantleError::Programmer)?;
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO alarm_rules (id, group_id, node_id, device_id, metric_id, name, rule_type, threshold, delay_sec, enabled, created_at, updated_at)
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10, now(), now())",
    )
    .bind(id)
    .bind(&req.group)
    .bind(&req.node)
    .bind(&req.device)
    .bind(&req.metric)
    .bind(&req.name)
    .bind(&req.rule_type)
    .bind(req.threshold)
    .bind(req.delay_sec)
    .bind(req.enabled)
    .execute(engine.pool())
    .await?;
    sqlx::query("INSERT INTO alarm_state (rule_id, state, updated_at) VALUES ($1, 'normal', now())")
        .bind(id)
        .execute(engine.pool())
        .await?;
    engine.alarms.reload_rule_cache().await?;
    Ok((axum::http::StatusCode::CREATED, Json(serde_json::json!({ "id": id }))))
}

async fn update_alarm(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateAlarmRuleRequest>,
) -> MantleResult<impl IntoResponse> {
    req.validate().map_err(MantleError::Programmer)?;
    let result = sqlx::query(
        "UPDATE alarm_rules SET name=$2, rule_type=$3, threshold=$4, delay_sec=$5, enabled=$6, updated_at=now()
         WHERE id=$1",
    )
    .bind(id)
    .bind(&req.name)
    .bind(&req.rule_type)
    .bind(req.threshold)
    .bind(req.delay_sec)
    .bind(req.enabled)
    .execute(engine.pool())
    .await?;
    if result.rows_affected() == 0 {
        return Err(MantleError::Invariant("alarm rule not found".into()));
    }
    engine.alarms.reload_rule_cache().await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn delete_alarm(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
) -> MantleResult<impl IntoResponse> {
    let result = sqlx::query("DELETE FROM alarm_rules WHERE id=$1").bind(id).execute(engine.pool()).await?;
    if result.rows_affected() == 0 {
        return Err(MantleError::Invariant("alarm rule not found".into()));
    }
    engine.alarms.reload_rule_cache().await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn acknowledge_alarm(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
) -> MantleResult<impl IntoResponse> {
    engine.alarms.acknowledge(id).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct SetEnabledRequest {
    enabled: bool,
}

async fn set_alarm_enabled(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<Uuid>,
    Json(req): Json<SetEnabledRequest>,
) -> MantleResult<impl IntoResponse> {
    engine.alarms.set_enabled(id, req.enabled).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

/// Authoritative command write path: infers Sparkplug type from the JSON
/// value shape and publishes an NCMD/DCMD carrying a single metric.
async fn delete_node(
    State(engine): State<Arc<Engine>>,
    Path((group, node)): Path<(String, String)>,
) -> MantleResult<impl IntoResponse> {
    engine.delete_cascade.delete_node(&group, &node).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn delete_device(
    State(engine): State<Arc<Engine>>,
    Path((group, node, device)): Path<(String, String, String)>,
) -> MantleResult<impl IntoResponse> {
    engine.delete_cascade.delete_device(&group, &node, &device).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn delete_metric(
    State(engine): State<Arc<Engine>>,
    Path((group, node, device, metric)): Path<(String, String, String, String)>,
) -> MantleResult<impl IntoResponse> {
    engine
        .delete_cascade
        .delete_metric(&crate::identity::Identity::new(group, node, device, metric))
        .await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

async fn write_metric(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<WriteMetricRequest>,
) -> MantleResult<impl IntoResponse> {
    let class = if req.device.is_empty() { "NCMD" } else { "DCMD" };
    let topic = if req.device.is_empty() {
        format!("spBv1.0/{}/{}/{}", req.group, class, req.node)
    } else {
        format!("spBv1.0/{}/{}/{}/{}", req.group, class, req.node, req.device)
    };

    let value = json_to_metric_value(&req.value);
    let wire_metric = crate::sparkplug::payload::Metric {
        name: Some(req.metric.clone()),
        alias: None,
        timestamp: Some(Utc::now().timestamp_millis() as u64),
        datatype: Some(type_code_for_value(&value)),
        properties: vec![],
        value: Some(metric_value_to_wire(&value)),
    };
    let payload = crate::sparkplug::payload::Payload {
        timestamp: Some(Utc::now().timestamp_millis() as u64),
        seq: None,
        metrics: vec![wire_metric],
    };
    let bytes = prost::Message::encode_to_vec(&payload);

    engine
        .mqtt
        .publish(topic, rumqttc::QoS::AtLeastOnce, false, bytes)
        .await
        .map_err(|e| MantleError::TransientIo(e.to_string()))?;
    Ok(axum::http::StatusCode::ACCEPTED)
}

fn json_to_metric_value(v: &serde_json::Value) -> MetricValue {
    match v {
        serde_json::Value::Bool(b) => MetricValue::Bool(*b),
        serde_json::Value::Number(n) if n.is_i64() => MetricValue::Int(n.as_i64().unwrap()),
        serde_json::Value::Number(n) => MetricValue::Float(n.as_f64().unwrap_or_default()),
        serde_json::Value::String(s) => {
            if let Ok(f) = s.parse::<f64>() {
                MetricValue::Float(f)
            } else {
                MetricValue::String(s.clone())
            }
        }
        _ => MetricValue::Null,
    }
}

fn type_code_for_value(v: &MetricValue) -> u32 {
    match v {
        MetricValue::Int(_) => 4,
        MetricValue::Float(_) => 10,
        MetricValue::Bool(_) => 11,
        MetricValue::String(_) | MetricValue::Null => 12,
    }
}

fn metric_value_to_wire(v: &MetricValue) -> crate::sparkplug::payload::MetricValue {
    use crate::sparkplug::payload::MetricValue as Wire;
    match v {
        MetricValue::Int(i) => Wire::IntValue(*i),
        MetricValue::Float(f) => Wire::DoubleValue(*f),
        MetricValue::Bool(b) => Wire::BooleanValue(*b),
        MetricValue::String(s) => Wire::StringValue(s.clone()),
        MetricValue::Null => Wire::StringValue(String::new()),
    }
}

async fn ws_metric_updates(
    ws: WebSocketUpgrade,
    State(engine): State<Arc<Engine>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| metric_update_stream(socket, engine))
}

async fn metric_update_stream(mut socket: WebSocket, engine: Arc<Engine>) {
    let mut rx = engine.pubsub.subscribe_metric_updates();
    while let Ok(event) = rx.recv().await {
        let Ok(text) = serde_json::to_string(&event) else { continue };
        if socket.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
}

async fn ws_alarm_changes(
    ws: WebSocketUpgrade,
    State(engine): State<Arc<Engine>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| alarm_change_stream(socket, engine))
}

async fn alarm_change_stream(mut socket: WebSocket, engine: Arc<Engine>) {
    let mut rx = engine.pubsub.subscribe_alarm_changes();
    while let Ok(event) = rx.recv().await {
        let Ok(text) = serde_json::to_string(&event) else { continue };
        if socket.send(Message::Text(text.into())).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_json_maps_to_boolean_type_code() {
        assert_eq!(type_code_for_value(&json_to_metric_value(&serde_json::json!(true))), 11);
    }

    #[test]
    fn numeric_string_is_inferred_as_float() {
        let v = json_to_metric_value(&serde_json::json!("42.5"));
        assert_eq!(v, MetricValue::Float(42.5));
    }

    #[test]
    fn non_numeric_string_stays_a_string() {
        let v = json_to_metric_value(&serde_json::json!("RUNNING"));
        assert_eq!(v, MetricValue::String("RUNNING".to_string()));
    }
}
