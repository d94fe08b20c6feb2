//! SQLite executor over an SQLx pool.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Column, Row, Transaction, TypeInfo, ValueRef};
use tracing::trace;

use super::{
    map_sqlx_error, CommandResult, Dialect, Sql, SqlError, SqlExecutor, SqlRow, SqlTransaction,
    SqlValue,
};

/// SQLite-backed executor.
///
/// In-memory databases live as long as their single connection, so
/// [`SqliteExecutor::in_memory`] pins exactly one connection for the pool's lifetime.
#[derive(Debug, Clone)]
pub struct SqliteExecutor {
    pool: SqlitePool,
}

impl SqliteExecutor {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a file (or `sqlite::memory:`) database.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, SqlError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| map_sqlx_error("connect", e))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self { pool })
    }

    /// Private in-memory database (tests, embedded use).
    pub async fn in_memory() -> Result<Self, SqlError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| map_sqlx_error("connect", e))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn bind_params(sql: &Sql) -> Query<'_, Sqlite, SqliteArguments<'_>> {
    let mut query = sqlx::query(sql.text());
    for param in sql.params() {
        query = match param {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Bool(b) => query.bind(*b),
            SqlValue::Int(i) => query.bind(*i),
            SqlValue::Text(s) => query.bind(s.as_str()),
        };
    }
    query
}

fn decode_row(row: &SqliteRow) -> Result<SqlRow, SqlError> {
    let mut columns = Vec::with_capacity(row.columns().len());

    for (idx, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let (is_null, type_name) = {
            let raw = row
                .try_get_raw(idx)
                .map_err(|e| map_sqlx_error("decode_row", e))?;
            (raw.is_null(), raw.type_info().name().to_string())
        };

        let value = if is_null {
            SqlValue::Null
        } else {
            match type_name.as_str() {
                "INTEGER" | "BOOLEAN" => SqlValue::Int(
                    row.try_get::<i64, _>(idx)
                        .map_err(|e| map_sqlx_error("decode_row", e))?,
                ),
                "REAL" => SqlValue::Text(
                    row.try_get::<f64, _>(idx)
                        .map_err(|e| map_sqlx_error("decode_row", e))?
                        .to_string(),
                ),
                _ => SqlValue::Text(
                    row.try_get::<String, _>(idx)
                        .map_err(|e| map_sqlx_error("decode_row", e))?,
                ),
            }
        };
        columns.push((name, value));
    }

    Ok(SqlRow::new(columns))
}

fn decode_rows(rows: Vec<SqliteRow>) -> Result<Vec<SqlRow>, SqlError> {
    rows.iter().map(decode_row).collect()
}

#[async_trait]
impl SqlExecutor for SqliteExecutor {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn query(&self, sql: &Sql) -> Result<Vec<SqlRow>, SqlError> {
        trace!(operation = sql.operation(), "sqlite query");
        let rows = bind_params(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(sql.operation(), e))?;
        decode_rows(rows)
    }

    async fn command(&self, sql: &Sql) -> Result<CommandResult, SqlError> {
        trace!(operation = sql.operation(), "sqlite command");
        let result = bind_params(sql)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(sql.operation(), e))?;
        Ok(CommandResult {
            rows_affected: result.rows_affected(),
        })
    }

    async fn begin(&self) -> Result<Box<dyn SqlTransaction>, SqlError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(SqliteTransaction { tx }))
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl SqlTransaction for SqliteTransaction {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn query(&mut self, sql: &Sql) -> Result<Vec<SqlRow>, SqlError> {
        trace!(operation = sql.operation(), "sqlite query (tx)");
        let rows = bind_params(sql)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error(sql.operation(), e))?;
        decode_rows(rows)
    }

    async fn command(&mut self, sql: &Sql) -> Result<CommandResult, SqlError> {
        trace!(operation = sql.operation(), "sqlite command (tx)");
        let result = bind_params(sql)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error(sql.operation(), e))?;
        Ok(CommandResult {
            rows_affected: result.rows_affected(),
        })
    }

    async fn commit(self: Box<Self>) -> Result<(), SqlError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), SqlError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}
