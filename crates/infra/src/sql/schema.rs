//! Idempotent bootstrap DDL for the four log tables.
//!
//! JSON payloads and timestamps are stored as text so both dialects share the
//! same statements everywhere else.

use tracing::info;

use super::{Dialect, Sql, SqlError, SqlExecutor};

const SQLITE_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS streams (
        stream_id        TEXT    NOT NULL,
        stream_position  BIGINT  NOT NULL,
        partition        TEXT    NOT NULL DEFAULT 'global',
        stream_type      TEXT    NOT NULL,
        stream_metadata  TEXT    NOT NULL DEFAULT '{}',
        is_archived      BOOLEAN NOT NULL DEFAULT FALSE,
        PRIMARY KEY (stream_id, partition, is_archived)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        global_position         INTEGER PRIMARY KEY AUTOINCREMENT,
        stream_id               TEXT    NOT NULL,
        stream_position         BIGINT  NOT NULL,
        partition               TEXT    NOT NULL DEFAULT 'global',
        message_kind            TEXT    NOT NULL DEFAULT 'E',
        message_data            TEXT    NOT NULL,
        message_metadata        TEXT    NOT NULL,
        message_schema_version  TEXT    NOT NULL,
        message_type            TEXT    NOT NULL,
        message_id              TEXT    NOT NULL,
        is_archived             BOOLEAN NOT NULL DEFAULT FALSE,
        created_at              TEXT    NOT NULL,
        UNIQUE (stream_id, stream_position, partition, is_archived)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_messages_partition_position
        ON messages (partition, is_archived, global_position)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS processors (
        processor_id               TEXT    NOT NULL,
        version                    INTEGER NOT NULL DEFAULT 1,
        partition                  TEXT    NOT NULL DEFAULT 'global',
        last_processed_checkpoint  TEXT    NOT NULL,
        processor_instance_id      TEXT    NOT NULL,
        PRIMARY KEY (processor_id, partition, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS projections (
        name          TEXT    NOT NULL,
        version       INTEGER NOT NULL DEFAULT 1,
        partition     TEXT    NOT NULL DEFAULT 'global',
        type          TEXT    NOT NULL,
        kind          TEXT    NOT NULL,
        status        TEXT    NOT NULL,
        definition    TEXT    NOT NULL DEFAULT '{}',
        created_at    TEXT    NOT NULL,
        last_updated  TEXT    NOT NULL,
        PRIMARY KEY (name, partition, version)
    )
    "#,
];

const POSTGRES_SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS streams (
        stream_id        TEXT    NOT NULL,
        stream_position  BIGINT  NOT NULL,
        partition        TEXT    NOT NULL DEFAULT 'global',
        stream_type      TEXT    NOT NULL,
        stream_metadata  TEXT    NOT NULL DEFAULT '{}',
        is_archived      BOOLEAN NOT NULL DEFAULT FALSE,
        PRIMARY KEY (stream_id, partition, is_archived)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS messages (
        global_position         BIGSERIAL PRIMARY KEY,
        stream_id               TEXT    NOT NULL,
        stream_position         BIGINT  NOT NULL,
        partition               TEXT    NOT NULL DEFAULT 'global',
        message_kind            TEXT    NOT NULL DEFAULT 'E',
        message_data            TEXT    NOT NULL,
        message_metadata        TEXT    NOT NULL,
        message_schema_version  TEXT    NOT NULL,
        message_type            TEXT    NOT NULL,
        message_id              TEXT    NOT NULL,
        is_archived             BOOLEAN NOT NULL DEFAULT FALSE,
        created_at              TEXT    NOT NULL,
        UNIQUE (stream_id, stream_position, partition, is_archived)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_messages_partition_position
        ON messages (partition, is_archived, global_position)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS processors (
        processor_id               TEXT    NOT NULL,
        version                    INTEGER NOT NULL DEFAULT 1,
        partition                  TEXT    NOT NULL DEFAULT 'global',
        last_processed_checkpoint  TEXT    NOT NULL,
        processor_instance_id      TEXT    NOT NULL,
        PRIMARY KEY (processor_id, partition, version)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS projections (
        name          TEXT    NOT NULL,
        version       INTEGER NOT NULL DEFAULT 1,
        partition     TEXT    NOT NULL DEFAULT 'global',
        type          TEXT    NOT NULL,
        kind          TEXT    NOT NULL,
        status        TEXT    NOT NULL,
        definition    TEXT    NOT NULL DEFAULT '{}',
        created_at    TEXT    NOT NULL,
        last_updated  TEXT    NOT NULL,
        PRIMARY KEY (name, partition, version)
    )
    "#,
];

pub fn statements(dialect: Dialect) -> &'static [&'static str] {
    match dialect {
        Dialect::Sqlite => SQLITE_SCHEMA,
        Dialect::Postgres => POSTGRES_SCHEMA,
    }
}

/// Create the log tables if they do not exist yet.
pub async fn create_schema(executor: &dyn SqlExecutor) -> Result<(), SqlError> {
    let dialect = executor.dialect();
    let statements: Vec<Sql> = statements(dialect)
        .iter()
        .map(|ddl| Sql::new("create_schema", *ddl))
        .collect();

    executor.batch_command(&statements).await?;
    info!(?dialect, "event log schema ready");
    Ok(())
}
