//! Typed wrappers over the ledger store's stored procedures.
//!
//! Procedure names and argument order are the wire contract; everything here
//! is a thin call with row translation. `bigint` columns decode as `i64` and
//! unsigned 32-bit checksums travel widened through `i64`.

use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::Row;
use uuid::Uuid;

/// Database handle. Clones share the underlying pool.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

/// One row of a selector result set. The first row of `run_selector` is a
/// header carrying only `(timestamp, checksum)` — the position the query
/// read through.
#[derive(Debug, Clone)]
pub struct SelectedRow {
    pub timestamp: i64,
    pub checksum: i64,
    pub event: Option<String>,
    pub entities: Option<Value>,
    pub meta: Option<Value>,
    pub data: Option<Value>,
}

/// The stored event a previously used append key points at.
#[derive(Debug, Clone)]
pub struct AppendKeyRow {
    pub timestamp: i64,
    pub checksum: i64,
    pub event: String,
    pub entities: Value,
    pub meta: Option<Value>,
    pub data: Option<Value>,
}

fn selected_row(row: &sqlx::postgres::PgRow) -> Result<SelectedRow, sqlx::Error> {
    Ok(SelectedRow {
        timestamp: row.try_get("timestamp")?,
        checksum: row.try_get("checksum")?,
        event: row.try_get("event")?,
        entities: row.try_get("entities")?,
        meta: row.try_get("meta")?,
        data: row.try_get("data")?,
    })
}

impl Db {
    pub fn new(pool: PgPool) -> Self {
        Db { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Atomic append with race detection against `predicate` applied to
    /// events after `previous_id`. Returns the new event id.
    #[tracing::instrument(skip_all, fields(event = %event))]
    pub async fn append_event(
        &self,
        previous_id: Uuid,
        event: &str,
        entities: &Value,
        meta: &Value,
        data: &Value,
        append_key: &str,
        predicate: &[u8],
    ) -> Result<Uuid, sqlx::Error> {
        let row = sqlx::query("SELECT append_event($1, $2, $3, $4, $5, $6, $7) AS event_id")
            .bind(previous_id)
            .bind(event)
            .bind(entities)
            .bind(meta)
            .bind(data)
            .bind(append_key)
            .bind(predicate)
            .fetch_one(&self.pool)
            .await?;
        row.try_get("event_id")
    }

    /// First batch of a selector run. The first returned row is the header.
    #[tracing::instrument(skip_all, fields(ledger = %ledger, limit))]
    pub async fn run_selector(
        &self,
        ledger: &str,
        after_timestamp: i64,
        after_checksum: i64,
        limit: i32,
        predicate: &[u8],
        batch_size: i32,
    ) -> Result<Vec<SelectedRow>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT timestamp, checksum, event, entities, meta, data \
             FROM run_selector($1, $2, $3, $4, $5, $6)",
        )
        .bind(ledger)
        .bind(after_timestamp)
        .bind(after_checksum)
        .bind(limit)
        .bind(predicate)
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(selected_row).collect()
    }

    /// Continuation batch after `run_selector`.
    pub async fn fetch_selected(
        &self,
        ledger: &str,
        after_timestamp: i64,
        limit: i32,
        predicate: &[u8],
    ) -> Result<Vec<SelectedRow>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT timestamp, checksum, event, entities, meta, data \
             FROM fetch_selected($1, $2, $3, $4)",
        )
        .bind(ledger)
        .bind(after_timestamp)
        .bind(limit)
        .bind(predicate)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(selected_row).collect()
    }

    /// Latest matching position without the event rows.
    pub async fn fetch_event_id(
        &self,
        ledger: &str,
        predicate: &[u8],
        after_timestamp: i64,
        limit: i32,
    ) -> Result<Option<(i64, i64)>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT timestamp, checksum FROM fetch_event_id($1, $2, $3, $4)",
        )
        .bind(ledger)
        .bind(predicate)
        .bind(after_timestamp)
        .bind(limit)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some((row.try_get("timestamp")?, row.try_get("checksum")?))),
            None => Ok(None),
        }
    }

    /// Idempotency lookup: the event previously appended with `key`, if any.
    pub async fn find_with_append_key(
        &self,
        ledger: &str,
        key: &str,
    ) -> Result<Option<AppendKeyRow>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT timestamp, checksum, event, entities, meta, data \
             FROM find_with_append_key($1, $2)",
        )
        .bind(ledger)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(AppendKeyRow {
                timestamp: row.try_get("timestamp")?,
                checksum: row.try_get("checksum")?,
                event: row.try_get("event")?,
                entities: row.try_get("entities")?,
                meta: row.try_get("meta")?,
                data: row.try_get("data")?,
            })),
            None => Ok(None),
        }
    }

    /// Create a ledger; returns the id, or the existing id for a duplicate
    /// name when the database resolves it.
    #[tracing::instrument(skip_all, fields(name = %name))]
    pub async fn create_ledger(
        &self,
        name: &str,
        description: &str,
    ) -> Result<Option<String>, sqlx::Error> {
        let row = sqlx::query("SELECT create_ledger($1, $2) AS ledger_id")
            .bind(name)
            .bind(description)
            .fetch_one(&self.pool)
            .await?;
        row.try_get("ledger_id")
    }

    pub async fn ledger_event_count(&self, ledger: &str) -> Result<i64, sqlx::Error> {
        let row = sqlx::query("SELECT ledger_event_count($1) AS count")
            .bind(ledger)
            .fetch_one(&self.pool)
            .await?;
        row.try_get("count")
    }

    /// Trim all events strictly after `(after_timestamp, after_checksum)`.
    #[tracing::instrument(skip_all, fields(ledger = %ledger))]
    pub async fn reset_ledger_events(
        &self,
        ledger: &str,
        after_timestamp: i64,
        after_checksum: i64,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT reset_ledger_events($1, $2, $3)")
            .bind(ledger)
            .bind(after_timestamp)
            .bind(after_checksum)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(ledger = %ledger))]
    pub async fn remove_ledger(&self, ledger: &str) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT remove_ledger($1)")
            .bind(ledger)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn after_exists(
        &self,
        ledger: &str,
        timestamp: i64,
        checksum: i64,
    ) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT after_exists($1, $2, $3) AS found")
            .bind(ledger)
            .bind(timestamp)
            .bind(checksum)
            .fetch_one(&self.pool)
            .await?;
        row.try_get("found")
    }

    /// Meta/data elided from an oversized notification payload.
    pub async fn fetch_missing_data(
        &self,
        ledger: &str,
        timestamp: i64,
        need_meta: bool,
    ) -> Result<(Option<Value>, Option<Value>), sqlx::Error> {
        let row = sqlx::query("SELECT meta, data FROM fetch_missing_data($1, $2, $3)")
            .bind(ledger)
            .bind(timestamp)
            .bind(need_meta)
            .fetch_one(&self.pool)
            .await?;
        Ok((row.try_get("meta")?, row.try_get("data")?))
    }
}

/// The message raised by the database, if this is a database-side error.
pub fn db_message(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(e) => Some(e.message().to_string()),
        _ => None,
    }
}

/// Unique violation against a constraint whose name ends with `suffix`.
pub fn is_unique_violation(err: &sqlx::Error, suffix: &str) -> bool {
    match err {
        sqlx::Error::Database(e) => {
            e.is_unique_violation()
                && e.constraint().is_some_and(|c| c.ends_with(suffix))
        }
        _ => false,
    }
}

/// SQL syntax error (code 42601) — a malformed selector predicate.
pub fn is_syntax_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(e) => e.code().as_deref() == Some("42601"),
        _ => false,
    }
}

/// Connection-level failures that should surface as 503.
pub fn is_connection_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
    )
}
