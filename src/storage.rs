//! Time-series storage (C3): history/property persistence, windowed
//! downsample queries with left-edge fill, usage and storage statistics.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use sqlx::Row;
use tracing::{debug, warn};

use crate::error::{MantleError, MantleResult};
use crate::identity::Identity;
use crate::value::{ColumnRoute, MetricValue, route_for_type};

#[derive(Debug, Clone, Serialize)]
pub struct SamplePoint {
    pub ts: DateTime<Utc>,
    pub value: Option<String>,
    /// Synthesised by `fill_left_edge`, not read from a row.
    pub synthetic: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct IdentitySeries {
    pub identity: Identity,
    pub points: Vec<SamplePoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub approx_total: i64,
    pub per_month: Vec<(String, i64)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub per_table: Vec<(String, i64)>,
    pub compression_ratio: Option<f64>,
}

pub struct Storage {
    pool: PgPool,
}

impl Storage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Records one history sample. Duplicate `(identity, ts)` inserts are a
    /// non-fatal conflict per the error-handling design; any other failure
    /// is logged and the sample is dropped so ingestion keeps moving.
    pub async fn record_sample(
        &self,
        identity: &Identity,
        ts: DateTime<Utc>,
        type_name: &str,
        value: &MetricValue,
    ) {
        let (int_v, float_v, string_v, bool_v) = route_value(type_name, value);
        let result = sqlx::query(
            "INSERT INTO history (group_id, node_id, device_id, metric_id, ts, int_value, float_value, string_value, bool_value)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
             ON CONFLICT (group_id, node_id, device_id, metric_id, ts) DO NOTHING",
        )
        .bind(&identity.group)
        .bind(&identity.node)
        .bind(&identity.device)
        .bind(&identity.metric)
        .bind(ts)
        .bind(int_v)
        .bind(float_v)
        .bind(string_v)
        .bind(bool_v)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(error = %e, identity = %identity, "dropping sample after storage error");
        }
    }

    /// Records one property-value sample into the time-series audit table,
    /// distinct from `PropertyStore`'s latest-value snapshot. Same
    /// non-fatal-conflict/drop-on-error handling as `record_sample`.
    pub async fn record_property(
        &self,
        identity: &Identity,
        ts: DateTime<Utc>,
        property_id: &str,
        value: &Value,
    ) {
        let result = sqlx::query(
            "INSERT INTO history_properties (group_id, node_id, device_id, metric_id, property_id, ts, value)
             VALUES ($1,$2,$3,$4,$5,$6,$7)
             ON CONFLICT (group_id, node_id, device_id, metric_id, property_id, ts) DO NOTHING",
        )
        .bind(&identity.group)
        .bind(&identity.node)
        .bind(&identity.device)
        .bind(&identity.metric)
        .bind(property_id)
        .bind(ts)
        .bind(value)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(error = %e, identity = %identity, property_id, "dropping property sample after storage error");
        }
    }

    pub async fn delete_by_node(&self, group: &str, node: &str) -> MantleResult<()> {
        sqlx::query("DELETE FROM history_properties WHERE group_id=$1 AND node_id=$2")
            .bind(group)
            .bind(node)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM history WHERE group_id=$1 AND node_id=$2")
            .bind(group)
            .bind(node)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM hidden_items WHERE group_id=$1 AND node_id=$2")
            .bind(group)
            .bind(node)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM metric_properties WHERE group_id=$1 AND node_id=$2")
            .bind(group)
            .bind(node)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_by_device(&self, group: &str, node: &str, device: &str) -> MantleResult<()> {
        sqlx::query("DELETE FROM history_properties WHERE group_id=$1 AND node_id=$2 AND device_id=$3")
            .bind(group).bind(node).bind(device).execute(&self.pool).await?;
        sqlx::query("DELETE FROM history WHERE group_id=$1 AND node_id=$2 AND device_id=$3")
            .bind(group).bind(node).bind(device).execute(&self.pool).await?;
        sqlx::query("DELETE FROM hidden_items WHERE group_id=$1 AND node_id=$2 AND device_id=$3")
            .bind(group).bind(node).bind(device).execute(&self.pool).await?;
        sqlx::query("DELETE FROM metric_properties WHERE group_id=$1 AND node_id=$2 AND device_id=$3")
            .bind(group).bind(node).bind(device).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn delete_by_metric(&self, identity: &Identity) -> MantleResult<()> {
        sqlx::query(
            "DELETE FROM history_properties WHERE group_id=$1 AND node_id=$2 AND device_id=$3 AND metric_id=$4",
        )
        .bind(&identity.group).bind(&identity.node).bind(&identity.device).bind(&identity.metric)
        .execute(&self.pool).await?;
        sqlx::query(
            "DELETE FROM history WHERE group_id=$1 AND node_id=$2 AND device_id=$3 AND metric_id=$4",
        )
        .bind(&identity.group).bind(&identity.node).bind(&identity.device).bind(&identity.metric)
        .execute(&self.pool).await?;
        sqlx::query(
            "DELETE FROM hidden_items WHERE group_id=$1 AND node_id=$2 AND device_id=$3 AND metric_id=$4",
        )
        .bind(&identity.group).bind(&identity.node).bind(&identity.device).bind(&identity.metric)
        .execute(&self.pool).await?;
        sqlx::query(
            "DELETE FROM metric_properties WHERE group_id=$1 AND node_id=$2 AND device_id=$3 AND metric_id=$4",
        )
        .bind(&identity.group).bind(&identity.node).bind(&identity.device).bind(&identity.metric)
        .execute(&self.pool).await?;
        Ok(())
    }

    /// Windowed downsample query with left-edge fill, per the C3/C11
    /// algorithm: pick a bucket width, aggregate with AVG, synthesise a
    /// leading point per identity from the most recent sample before
    /// `start` when one isn't already present exactly at `start`.
    pub async fn query_window(
        &self,
        identities: &[Identity],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bucket_secs: i64,
        raw: bool,
    ) -> MantleResult<Vec<IdentitySeries>> {
        let bucket_secs = bucket_secs.max(1);
        let mut out = Vec::with_capacity(identities.len());

        for identity in identities {
            let mut points = if raw {
                let rows = sqlx::query(
                    "SELECT ts, int_value, float_value, string_value, bool_value FROM history
                     WHERE group_id=$1 AND node_id=$2 AND device_id=$3 AND metric_id=$4
                       AND ts >= $5 AND ts <= $6
                     ORDER BY ts ASC",
                )
                .bind(&identity.group).bind(&identity.node).bind(&identity.device).bind(&identity.metric)
                .bind(start).bind(end)
                .fetch_all(&self.pool)
                .await?;
                rows.into_iter()
                    .map(|r| SamplePoint {
                        ts: r.get("ts"),
                        value: Some(render_row_value(&r)),
                        synthetic: false,
                    })
                    .collect::<Vec<_>>()
            } else {
                let rows = sqlx::query(
                    "SELECT time_bucket($1::interval, ts) AS bucket,
                            AVG(COALESCE(float_value, int_value::double precision, bool_value::int::double precision)) AS avg_value
                     FROM history
                     WHERE group_id=$2 AND node_id=$3 AND device_id=$4 AND metric_id=$5
                       AND ts >= $6 AND ts <= $7
                     GROUP BY bucket
                     ORDER BY bucket ASC",
                )
                .bind(format!("{bucket_secs} seconds"))
                .bind(&identity.group).bind(&identity.node).bind(&identity.device).bind(&identity.metric)
                .bind(start).bind(end)
                .fetch_all(&self.pool)
                .await?;
                rows.into_iter()
                    .map(|r| {
                        let v: Option<f64> = r.get("avg_value");
                        SamplePoint {
                            ts: r.get("bucket"),
                            value: v.map(|x| x.to_string()),
                            synthetic: false,
                        }
                    })
                    .collect::<Vec<_>>()
            };

            let left_edge = sqlx::query(
                "SELECT ts, int_value, float_value, string_value, bool_value FROM history
                 WHERE group_id=$1 AND node_id=$2 AND device_id=$3 AND metric_id=$4 AND ts < $5
                 ORDER BY ts DESC LIMIT 1",
            )
            .bind(&identity.group).bind(&identity.node).bind(&identity.device).bind(&identity.metric)
            .bind(start)
            .fetch_optional(&self.pool)
            .await?
            .map(|r| render_row_value(&r));

            points = fill_left_edge(points, start, left_edge);
            out.push(IdentitySeries { identity: identity.clone(), points });
        }
        Ok(out)
    }

    pub async fn usage(&self) -> MantleResult<UsageReport> {
        let approx_total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(approximate_row_count), 0)::bigint FROM (
                 SELECT approximate_row_count('history') AS approximate_row_count
             ) t",
        )
        .fetch_one(&self.pool)
        .await
        .unwrap_or(0);

        let rows = sqlx::query(
            "SELECT to_char(range_start, 'YYYY-MM') AS month, count(*) AS chunks
             FROM timescaledb_information.chunks
             WHERE hypertable_name = 'history'
             GROUP BY month ORDER BY month DESC",
        )
        .fetch_all(&self.pool)
        .await
        .unwrap_or_default();

        let per_month = rows
            .into_iter()
            .map(|r| (r.get::<String, _>("month"), r.get::<i64, _>("chunks")))
            .collect();

        Ok(UsageReport { approx_total, per_month })
    }

    pub async fn storage_stats(&self) -> MantleResult<StorageStats> {
        let tables = ["history", "history_properties", "metric_properties"];
        let mut per_table = Vec::new();
        for t in tables {
            let count: i64 = sqlx::query_scalar("SELECT approximate_row_count($1)")
                .bind(t)
                .fetch_one(&self.pool)
                .await
                .unwrap_or(0);
            per_table.push((t.to_string(), count));
        }
        debug!(?per_table, "computed storage stats");
        Ok(StorageStats { per_table, compression_ratio: None })
    }
}

fn route_value(
    type_name: &str,
    value: &MetricValue,
) -> (Option<i64>, Option<f64>, Option<String>, Option<bool>) {
    match route_for_type(type_name) {
        ColumnRoute::Int => (
            match value {
                MetricValue::Int(i) => Some(*i),
                other => other.as_numeric().map(|v| v as i64),
            },
            None,
            None,
            None,
        ),
        ColumnRoute::Float => (None, value.as_numeric(), None, None),
        ColumnRoute::Bool => (None, None, None, match value {
            MetricValue::Bool(b) => Some(*b),
            other => other.as_numeric().map(|v| v != 0.0),
        }),
        ColumnRoute::String => (None, None, Some(value.as_string()), None),
    }
}

fn render_row_value(row: &sqlx::postgres::PgRow) -> String {
    if let Ok(Some(v)) = row.try_get::<Option<f64>, _>("float_value") {
        return v.to_string();
    }
    if let Ok(Some(v)) = row.try_get::<Option<i64>, _>("int_value") {
        return v.to_string();
    }
    if let Ok(Some(v)) = row.try_get::<Option<bool>, _>("bool_value") {
        return v.to_string();
    }
    if let Ok(Some(v)) = row.try_get::<Option<String>, _>("string_value") {
        return v;
    }
    String::new()
}

/// Pure left-edge-fill step, tested independently of the database: given the
/// bucketed/raw points already inside `[start, end]` and the most recent
/// value strictly before `start` (if any), prepend a synthetic point at
/// `start` unless a real point already sits there.
pub fn fill_left_edge(
    mut points: Vec<SamplePoint>,
    start: DateTime<Utc>,
    left_edge_value: Option<String>,
) -> Vec<SamplePoint> {
    let has_start_point = points.first().map(|p| p.ts == start).unwrap_or(false);
    if !has_start_point
        && let Some(value) = left_edge_value
    {
        points.insert(0, SamplePoint { ts: start, value: Some(value), synthetic: true });
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn point(secs: i64, v: &str) -> SamplePoint {
        SamplePoint { ts: ts(secs), value: Some(v.to_string()), synthetic: false }
    }

    #[test]
    fn synthesises_left_edge_when_no_point_at_start() {
        let points = vec![point(5000, "20")];
        let filled = fill_left_edge(points, ts(3000), Some("10".to_string()));
        assert_eq!(filled.len(), 2);
        assert!(filled[0].synthetic);
        assert_eq!(filled[0].ts, ts(3000));
        assert_eq!(filled[0].value.as_deref(), Some("10"));
    }

    #[test]
    fn skips_synthesis_when_point_already_at_start() {
        let points = vec![point(3000, "15")];
        let filled = fill_left_edge(points, ts(3000), Some("10".to_string()));
        assert_eq!(filled.len(), 1);
        assert!(!filled[0].synthetic);
    }

    #[test]
    fn no_left_edge_value_means_no_synthesis() {
        let points = vec![point(5000, "20")];
        let filled = fill_left_edge(points, ts(3000), None);
        assert_eq!(filled.len(), 1);
    }

    #[test]
    fn route_value_int_type_fills_int_column_only() {
        let (i, f, s, b) = route_value("Int32", &MetricValue::Int(5));
        assert_eq!(i, Some(5));
        assert!(f.is_none() && s.is_none() && b.is_none());
    }

    #[test]
    fn route_value_int_preserves_precision_beyond_f64_safe_range() {
        let huge = (1i64 << 62) + 1;
        let (i, ..) = route_value("Int64", &MetricValue::Int(huge));
        assert_eq!(i, Some(huge));
    }

    #[test]
    fn route_value_string_type_fills_string_column_only() {
        let (i, f, s, b) = route_value("String", &MetricValue::String("hi".into()));
        assert!(i.is_none() && f.is_none() && b.is_none());
        assert_eq!(s.as_deref(), Some("hi"));
    }
}
