//! Idempotent schema migrations, run in order against a Postgres/TimescaleDB
//! database. Mirrors the teacher's ordered-array-of-statements pattern, with
//! TimescaleDB hypertable/compression calls swapped in for the ClickHouse
//! `MergeTree` DDL the teacher used.

use sqlx::PgPool;
use tracing::info;

use crate::error::MantleResult;

pub const MIGRATIONS: &[&str] = &[
    r#"CREATE EXTENSION IF NOT EXISTS timescaledb"#,
    r#"CREATE TABLE IF NOT EXISTS history (
        group_id    TEXT NOT NULL,
        node_id     TEXT NOT NULL,
        device_id   TEXT NOT NULL DEFAULT '',
        metric_id   TEXT NOT NULL,
        ts          TIMESTAMPTZ NOT NULL,
        int_value   BIGINT,
        float_value DOUBLE PRECISION,
        string_value TEXT,
        bool_value  BOOLEAN,
        PRIMARY KEY (group_id, node_id, device_id, metric_id, ts)
    )"#,
    r#"SELECT create_hypertable('history', by_range('ts'), chunk_time_interval => INTERVAL '1 day', if_not_exists => TRUE)"#,
    r#"CREATE INDEX IF NOT EXISTS history_identity_ts_idx
        ON history (group_id, node_id, device_id, metric_id, ts DESC)"#,
    r#"ALTER TABLE history SET (
        timescaledb.compress,
        timescaledb.compress_segmentby = 'group_id, node_id, device_id, metric_id',
        timescaledb.compress_orderby = 'ts DESC'
    )"#,
    r#"SELECT add_compression_policy('history', INTERVAL '1 hour', if_not_exists => TRUE)"#,
    r#"CREATE TABLE IF NOT EXISTS history_properties (
        group_id    TEXT NOT NULL,
        node_id     TEXT NOT NULL,
        device_id   TEXT NOT NULL DEFAULT '',
        metric_id   TEXT NOT NULL,
        property_id TEXT NOT NULL,
        ts          TIMESTAMPTZ NOT NULL,
        value       JSONB NOT NULL,
        PRIMARY KEY (group_id, node_id, device_id, metric_id, property_id, ts)
    )"#,
    r#"SELECT create_hypertable('history_properties', by_range('ts'), chunk_time_interval => INTERVAL '1 day', if_not_exists => TRUE)"#,
    r#"ALTER TABLE history_properties SET (
        timescaledb.compress,
        timescaledb.compress_segmentby = 'group_id, node_id, device_id, metric_id',
        timescaledb.compress_orderby = 'ts DESC'
    )"#,
    r#"SELECT add_compression_policy('history_properties', INTERVAL '24 hours', if_not_exists => TRUE)"#,
    r#"CREATE TABLE IF NOT EXISTS metric_properties (
        group_id    TEXT NOT NULL,
        node_id     TEXT NOT NULL,
        device_id   TEXT NOT NULL DEFAULT '',
        metric_id   TEXT NOT NULL,
        properties  JSONB NOT NULL DEFAULT '{}',
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (group_id, node_id, device_id, metric_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS hidden_items (
        group_id  TEXT NOT NULL,
        node_id   TEXT NOT NULL,
        device_id TEXT NOT NULL DEFAULT '',
        metric_id TEXT NOT NULL DEFAULT '',
        hidden_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (group_id, node_id, device_id, metric_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS alarm_rules (
        id         UUID PRIMARY KEY,
        group_id   TEXT NOT NULL,
        node_id    TEXT NOT NULL,
        device_id  TEXT NOT NULL DEFAULT '',
        metric_id  TEXT NOT NULL,
        name       TEXT NOT NULL,
        rule_type  TEXT NOT NULL CHECK (rule_type IN ('true','false','above','below')),
        threshold  DOUBLE PRECISION,
        delay_sec  BIGINT NOT NULL DEFAULT 0 CHECK (delay_sec >= 0),
        enabled    BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE INDEX IF NOT EXISTS alarm_rules_identity_idx
        ON alarm_rules (group_id, node_id, device_id, metric_id)"#,
    r#"CREATE TABLE IF NOT EXISTS alarm_state (
        rule_id          UUID PRIMARY KEY REFERENCES alarm_rules(id) ON DELETE CASCADE,
        state            TEXT NOT NULL CHECK (state IN ('normal','pending','active','acknowledged')),
        condition_met_at TIMESTAMPTZ,
        activated_at     TIMESTAMPTZ,
        last_notified_at TIMESTAMPTZ,
        last_value       DOUBLE PRECISION,
        updated_at       TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS alarm_history (
        id         UUID PRIMARY KEY,
        rule_id    UUID NOT NULL REFERENCES alarm_rules(id) ON DELETE CASCADE,
        from_state TEXT NOT NULL,
        to_state   TEXT NOT NULL,
        value      DOUBLE PRECISION,
        ts         TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    r#"CREATE INDEX IF NOT EXISTS alarm_history_rule_ts_idx ON alarm_history (rule_id, ts DESC)"#,
];

pub async fn run_migrations(pool: &PgPool) -> MantleResult<()> {
    for (i, stmt) in MIGRATIONS.iter().enumerate() {
        info!(step = i, "applying migration");
        sqlx::query(stmt).execute(pool).await?;
    }
    info!(count = MIGRATIONS.len(), "migrations complete");
    Ok(())
}
