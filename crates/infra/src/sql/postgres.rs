//! PostgreSQL executor over an SQLx pool.
//!
//! ## Thread Safety
//!
//! `PostgresExecutor` is `Send + Sync` and cheap to clone; all operations go
//! through the SQLx connection pool.

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow, Postgres};
use sqlx::query::Query;
use sqlx::{Column, Row, Transaction, TypeInfo, ValueRef};
use tracing::{debug, trace};

use super::{
    map_sqlx_error, CommandResult, Dialect, Sql, SqlError, SqlExecutor, SqlRow, SqlTransaction,
    SqlValue,
};
use crate::projections::lock::{AdvisoryLock, LockGuard, LockKey};

/// Postgres-backed executor.
#[derive(Debug, Clone)]
pub struct PostgresExecutor {
    pool: PgPool,
}

impl PostgresExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, SqlError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Session-level advisory lock sharing this executor's pool.
    pub fn advisory_lock(&self) -> PostgresAdvisoryLock {
        PostgresAdvisoryLock {
            pool: self.pool.clone(),
        }
    }
}

fn bind_params(sql: &Sql) -> Query<'_, Postgres, PgArguments> {
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

fn decode_row(row: &PgRow) -> Result<SqlRow, SqlError> {
    let mut columns = Vec::with_capacity(row.columns().len());

    for (idx, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let is_null = row
            .try_get_raw(idx)
            .map_err(|e| map_sqlx_error("decode_row", e))?
            .is_null();
        let type_name = column.type_info().name().to_string();

        let decode = |e| map_sqlx_error("decode_row", e);
        let value = if is_null {
            SqlValue::Null
        } else {
            match type_name.as_str() {
                "INT8" => SqlValue::Int(row.try_get::<i64, _>(idx).map_err(decode)?),
                "INT4" => SqlValue::Int(i64::from(row.try_get::<i32, _>(idx).map_err(decode)?)),
                "INT2" => SqlValue::Int(i64::from(row.try_get::<i16, _>(idx).map_err(decode)?)),
                "BOOL" => SqlValue::Bool(row.try_get::<bool, _>(idx).map_err(decode)?),
                _ => SqlValue::Text(row.try_get::<String, _>(idx).map_err(decode)?),
            }
        };
        columns.push((name, value));
    }

    Ok(SqlRow::new(columns))
}

fn decode_rows(rows: Vec<PgRow>) -> Result<Vec<SqlRow>, SqlError> {
    rows.iter().map(decode_row).collect()
}

#[async_trait]
impl SqlExecutor for PostgresExecutor {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn query(&self, sql: &Sql) -> Result<Vec<SqlRow>, SqlError> {
        trace!(operation = sql.operation(), "postgres query");
        let rows = bind_params(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(sql.operation(), e))?;
        decode_rows(rows)
    }

    async fn command(&self, sql: &Sql) -> Result<CommandResult, SqlError> {
        trace!(operation = sql.operation(), "postgres command");
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
        Ok(Box::new(PostgresTransaction { tx }))
    }

    async fn close(&self) {
        self.pool.close().await;
    }

    fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

struct PostgresTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl SqlTransaction for PostgresTransaction {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    async fn query(&mut self, sql: &Sql) -> Result<Vec<SqlRow>, SqlError> {
        let rows = bind_params(sql)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error(sql.operation(), e))?;
        decode_rows(rows)
    }

    async fn command(&mut self, sql: &Sql) -> Result<CommandResult, SqlError> {
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

/// `pg_try_advisory_lock` held on a pinned pooled connection.
///
/// Session locks belong to the connection that took them, so the guard keeps
/// that connection out of the pool until release.
#[derive(Debug, Clone)]
pub struct PostgresAdvisoryLock {
    pool: PgPool,
}

#[async_trait]
impl AdvisoryLock for PostgresAdvisoryLock {
    async fn try_acquire(&self, key: LockKey) -> Result<Option<Box<dyn LockGuard>>, SqlError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire_lock_connection", e))?;

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key.value())
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("pg_try_advisory_lock", e))?;

        if !acquired {
            return Ok(None);
        }

        // A guard dropped without release must not hand a locked session back to the pool.
        conn.close_on_drop();

        debug!(lock_key = key.value(), "advisory lock acquired");
        Ok(Some(Box::new(PostgresLockGuard { conn, key })))
    }
}

struct PostgresLockGuard {
    conn: PoolConnection<Postgres>,
    key: LockKey,
}

#[async_trait]
impl LockGuard for PostgresLockGuard {
    fn key(&self) -> LockKey {
        self.key
    }

    async fn release(mut self: Box<Self>) -> Result<(), SqlError> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(self.key.value())
            .execute(&mut *self.conn)
            .await
            .map_err(|e| map_sqlx_error("pg_advisory_unlock", e))?;
        debug!(lock_key = self.key.value(), "advisory lock released");
        Ok(())
    }
}
