//! Narrow SQL executor boundary.
//!
//! The log, checkpoint store and projections only ever talk to storage through
//! [`SqlExecutor`] and [`SqlTransaction`]: parameterized statements, `RETURNING`
//! queries and explicit transactions. A transaction is handed down as
//! `&mut dyn SqlTransaction`, so a projection write and the checkpoint write that
//! follows it share one commit.
//!
//! Statements use `$1..$n` placeholders, numbered in order of first appearance;
//! both bundled drivers accept that form.
//!
//! ## Error Mapping
//!
//! | SQLx Error | SqlError |
//! |------------|----------|
//! | Database (unique violation) | `UniqueViolation` |
//! | Database (other) | `Database` |
//! | PoolClosed | `PoolClosed` |
//! | ColumnDecode / Decode | `Decode` |
//! | Other | `Other` |

pub mod postgres;
pub mod schema;
pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

pub use postgres::PostgresExecutor;
pub use sqlite::SqliteExecutor;

/// SQL flavour spoken by an executor.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

/// Statement parameter / column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u64> for SqlValue {
    fn from(value: u64) -> Self {
        Self::Int(value as i64)
    }
}

impl From<u32> for SqlValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<&String> for SqlValue {
    fn from(value: &String) -> Self {
        Self::Text(value.clone())
    }
}

/// A parameterized statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Sql {
    operation: &'static str,
    text: String,
    params: Vec<SqlValue>,
}

impl Sql {
    /// `operation` names the statement in logs and error messages.
    pub fn new(operation: &'static str, text: impl Into<String>) -> Self {
        Self {
            operation,
            text: text.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }
}

/// One decoded result row (column order preserved).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlRow {
    columns: Vec<(String, SqlValue)>,
}

impl SqlRow {
    pub fn new(columns: Vec<(String, SqlValue)>) -> Self {
        Self { columns }
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    fn required(&self, column: &str) -> Result<&SqlValue, SqlError> {
        self.get(column).ok_or_else(|| SqlError::Decode {
            column: column.to_string(),
            message: "column not present in row".to_string(),
        })
    }

    pub fn try_i64(&self, column: &str) -> Result<i64, SqlError> {
        match self.required(column)? {
            SqlValue::Int(v) => Ok(*v),
            SqlValue::Bool(b) => Ok(i64::from(*b)),
            SqlValue::Text(s) => s.parse().map_err(|e| SqlError::Decode {
                column: column.to_string(),
                message: format!("{e}"),
            }),
            SqlValue::Null => Err(SqlError::Decode {
                column: column.to_string(),
                message: "unexpected NULL".to_string(),
            }),
        }
    }

    pub fn try_u64(&self, column: &str) -> Result<u64, SqlError> {
        let value = self.try_i64(column)?;
        u64::try_from(value).map_err(|_| SqlError::Decode {
            column: column.to_string(),
            message: format!("negative value {value}"),
        })
    }

    pub fn try_string(&self, column: &str) -> Result<String, SqlError> {
        match self.required(column)? {
            SqlValue::Text(s) => Ok(s.clone()),
            SqlValue::Int(v) => Ok(v.to_string()),
            SqlValue::Bool(b) => Ok(b.to_string()),
            SqlValue::Null => Err(SqlError::Decode {
                column: column.to_string(),
                message: "unexpected NULL".to_string(),
            }),
        }
    }

    pub fn try_optional_string(&self, column: &str) -> Result<Option<String>, SqlError> {
        match self.get(column) {
            None | Some(SqlValue::Null) => Ok(None),
            Some(_) => self.try_string(column).map(Some),
        }
    }

    pub fn try_bool(&self, column: &str) -> Result<bool, SqlError> {
        match self.required(column)? {
            SqlValue::Bool(b) => Ok(*b),
            SqlValue::Int(v) => Ok(*v != 0),
            other => Err(SqlError::Decode {
                column: column.to_string(),
                message: format!("expected boolean, got {other:?}"),
            }),
        }
    }
}

/// Outcome of a statement that returns no rows.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub rows_affected: u64,
}

/// Storage error surfaced by an executor.
#[derive(Debug, Error)]
pub enum SqlError {
    #[error("unique constraint violated in {operation}: {message}")]
    UniqueViolation { operation: String, message: String },

    #[error("database error in {operation}: {message}")]
    Database { operation: String, message: String },

    #[error("connection pool closed in {0}")]
    PoolClosed(String),

    #[error("failed to decode column '{column}': {message}")]
    Decode { column: String, message: String },

    #[error("unsupported connection url: {0}")]
    UnsupportedUrl(String),

    #[error("sqlx error in {operation}: {message}")]
    Other { operation: String, message: String },
}

impl SqlError {
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, SqlError::UniqueViolation { .. })
    }
}

/// Map SQLx errors to `SqlError`.
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> SqlError {
    match err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_string();
            if db_err.is_unique_violation() {
                SqlError::UniqueViolation {
                    operation: operation.to_string(),
                    message,
                }
            } else {
                SqlError::Database {
                    operation: operation.to_string(),
                    message,
                }
            }
        }
        sqlx::Error::PoolClosed => SqlError::PoolClosed(operation.to_string()),
        sqlx::Error::ColumnDecode { index, source } => SqlError::Decode {
            column: index,
            message: source.to_string(),
        },
        sqlx::Error::Decode(source) => SqlError::Decode {
            column: operation.to_string(),
            message: source.to_string(),
        },
        other => SqlError::Other {
            operation: operation.to_string(),
            message: other.to_string(),
        },
    }
}

/// An open transaction. Dropping it without `commit` rolls it back.
#[async_trait]
pub trait SqlTransaction: Send {
    fn dialect(&self) -> Dialect;

    async fn query(&mut self, sql: &Sql) -> Result<Vec<SqlRow>, SqlError>;

    async fn command(&mut self, sql: &Sql) -> Result<CommandResult, SqlError>;

    async fn batch_command(&mut self, statements: &[Sql]) -> Result<Vec<CommandResult>, SqlError> {
        let mut results = Vec::with_capacity(statements.len());
        for statement in statements {
            results.push(self.command(statement).await?);
        }
        Ok(results)
    }

    async fn commit(self: Box<Self>) -> Result<(), SqlError>;

    async fn rollback(self: Box<Self>) -> Result<(), SqlError>;
}

/// Pooled statement executor supplied by a concrete driver.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    fn dialect(&self) -> Dialect;

    async fn query(&self, sql: &Sql) -> Result<Vec<SqlRow>, SqlError>;

    async fn command(&self, sql: &Sql) -> Result<CommandResult, SqlError>;

    /// Run all statements in one transaction.
    async fn batch_command(&self, statements: &[Sql]) -> Result<Vec<CommandResult>, SqlError> {
        let mut tx = self.begin().await?;
        let results = tx.batch_command(statements).await?;
        tx.commit().await?;
        Ok(results)
    }

    async fn begin(&self) -> Result<Box<dyn SqlTransaction>, SqlError>;

    /// Release pooled connections. Idempotent.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}
