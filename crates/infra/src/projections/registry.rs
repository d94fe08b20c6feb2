//! Projection registrations: one row per `(name, partition, version)`.
//!
//! Registering a new version leaves earlier versions' rows untouched.

use core::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tracing::{debug, instrument};

use super::ProjectionDefinition;
use crate::sql::{Dialect, Sql, SqlError, SqlExecutor, SqlRow, SqlTransaction};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionStatus {
    Active,
    Inactive,
    /// Being rebuilt; inline application is suspended.
    AsyncProcessing,
}

impl ProjectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectionStatus::Active => "active",
            ProjectionStatus::Inactive => "inactive",
            ProjectionStatus::AsyncProcessing => "async_processing",
        }
    }
}

impl FromStr for ProjectionStatus {
    type Err = SqlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ProjectionStatus::Active),
            "inactive" => Ok(ProjectionStatus::Inactive),
            "async_processing" => Ok(ProjectionStatus::AsyncProcessing),
            other => Err(SqlError::Decode {
                column: "status".to_string(),
                message: format!("unknown projection status '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionType {
    Inline,
    Async,
}

impl ProjectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectionType::Inline => "inline",
            ProjectionType::Async => "async",
        }
    }
}

impl FromStr for ProjectionType {
    type Err = SqlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inline" => Ok(ProjectionType::Inline),
            "async" => Ok(ProjectionType::Async),
            other => Err(SqlError::Decode {
                column: "type".to_string(),
                message: format!("unknown projection type '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionRegistration {
    pub name: String,
    pub version: u32,
    pub partition: String,
    pub projection_type: ProjectionType,
    pub kind: String,
    pub status: ProjectionStatus,
    pub definition: JsonValue,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

fn now_text() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(row: &SqlRow, column: &str) -> Result<DateTime<Utc>, SqlError> {
    DateTime::parse_from_rfc3339(&row.try_string(column)?)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SqlError::Decode {
            column: column.to_string(),
            message: e.to_string(),
        })
}

fn decode_registration(row: &SqlRow) -> Result<ProjectionRegistration, SqlError> {
    let definition = serde_json::from_str(&row.try_string("definition")?).map_err(|e| SqlError::Decode {
        column: "definition".to_string(),
        message: e.to_string(),
    })?;
    Ok(ProjectionRegistration {
        name: row.try_string("name")?,
        version: u32::try_from(row.try_i64("version")?).map_err(|e| SqlError::Decode {
            column: "version".to_string(),
            message: e.to_string(),
        })?,
        partition: row.try_string("partition")?,
        projection_type: row.try_string("type")?.parse()?,
        kind: row.try_string("kind")?,
        status: row.try_string("status")?.parse()?,
        definition,
        created_at: parse_timestamp(row, "created_at")?,
        last_updated: parse_timestamp(row, "last_updated")?,
    })
}

fn select_registration(name: &str, partition: &str, version: u32) -> Sql {
    select_registration_with(name, partition, version, "")
}

fn select_registration_with(name: &str, partition: &str, version: u32, locking: &str) -> Sql {
    Sql::new(
        "read_projection",
        format!(
            "SELECT name, version, partition, type, kind, status, definition, created_at, last_updated \
             FROM projections WHERE name = $1 AND partition = $2 AND version = $3{locking}"
        ),
    )
    .bind(name)
    .bind(partition)
    .bind(version)
}

/// Register `definition` as `active` unless a row already exists.
///
/// Returns whether a new row was written.
#[instrument(skip_all, fields(projection = definition.name(), partition = %partition), err)]
pub async fn register_projection(
    tx: &mut dyn SqlTransaction,
    definition: &dyn ProjectionDefinition,
    partition: &str,
    projection_type: ProjectionType,
) -> Result<bool, SqlError> {
    let now = now_text();
    let details = json!({ "can_handle": definition.can_handle() });
    let result = tx
        .command(
            &Sql::new(
                "register_projection",
                "INSERT INTO projections (name, version, partition, type, kind, status, definition, created_at, last_updated) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8) \
                 ON CONFLICT (name, partition, version) DO NOTHING",
            )
            .bind(definition.name())
            .bind(definition.version())
            .bind(partition)
            .bind(projection_type.as_str())
            .bind(definition.kind())
            .bind(ProjectionStatus::Active.as_str())
            .bind(details.to_string())
            .bind(now),
        )
        .await?;

    let created = result.rows_affected > 0;
    if created {
        debug!(version = definition.version(), "projection registered");
    }
    Ok(created)
}

pub async fn read_projection(
    executor: &dyn SqlExecutor,
    name: &str,
    partition: &str,
    version: u32,
) -> Result<Option<ProjectionRegistration>, SqlError> {
    let rows = executor
        .query(&select_registration(name, partition, version))
        .await?;
    rows.first().map(decode_registration).transpose()
}

/// Same as [`read_projection`], inside an open transaction.
pub async fn read_projection_in(
    tx: &mut dyn SqlTransaction,
    name: &str,
    partition: &str,
    version: u32,
) -> Result<Option<ProjectionRegistration>, SqlError> {
    let rows = tx.query(&select_registration(name, partition, version)).await?;
    rows.first().map(decode_registration).transpose()
}

/// [`read_projection_in`] for a writer that acts on the status it reads.
///
/// On Postgres the row is read `FOR SHARE`, so a status change by another
/// transaction waits until this one ends. SQLite writers are serialized anyway.
pub async fn read_projection_shared(
    tx: &mut dyn SqlTransaction,
    name: &str,
    partition: &str,
    version: u32,
) -> Result<Option<ProjectionRegistration>, SqlError> {
    let locking = match tx.dialect() {
        Dialect::Postgres => " FOR SHARE",
        Dialect::Sqlite => "",
    };
    let rows = tx
        .query(&select_registration_with(name, partition, version, locking))
        .await?;
    rows.first().map(decode_registration).transpose()
}

#[instrument(skip(tx), err)]
pub async fn set_projection_status(
    tx: &mut dyn SqlTransaction,
    name: &str,
    partition: &str,
    version: u32,
    status: ProjectionStatus,
) -> Result<u64, SqlError> {
    let result = tx
        .command(
            &Sql::new(
                "set_projection_status",
                "UPDATE projections SET status = $1, last_updated = $2 \
                 WHERE name = $3 AND partition = $4 AND version = $5",
            )
            .bind(status.as_str())
            .bind(now_text())
            .bind(name)
            .bind(partition)
            .bind(version),
        )
        .await?;
    Ok(result.rows_affected)
}
