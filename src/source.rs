//! Selector execution against the ledger store.
//!
//! A selector run returns the position the query read through (the ETag
//! basis) plus a finite, ordered stream of matched events fetched in rolling
//! batches. Dropping the stream cancels the in-flight batch fetch.

use async_stream::try_stream;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::db::{self, Db, SelectedRow};
use crate::ledger::event_id::{EventId, LedgerId};
use crate::ledger::events::{Ledger, PersistedEvent};
use crate::selector::{sql, FilterSelector, PlainSelector, Selector};
use crate::Error;

/// Rows requested per database round trip.
pub const BATCH_SIZE: i32 = 100;

#[derive(Clone)]
pub struct EventSource {
    db: Db,
}

/// The result of executing a selector.
pub struct Selection {
    /// The ledger position the query read through.
    pub position: EventId,
    pub events: BoxStream<'static, Result<PersistedEvent, Error>>,
}

impl EventSource {
    pub fn new(db: Db) -> Self {
        EventSource { db }
    }

    /// Execute a plain selector: all events after `after`, up to `limit`.
    pub async fn all(&self, ledger: &Ledger, selector: &PlainSelector) -> Result<Selection, Error> {
        self.run(ledger, &Selector::Plain(selector.clone())).await
    }

    /// Execute a filter selector.
    pub async fn filter(
        &self,
        ledger: &Ledger,
        selector: &FilterSelector,
    ) -> Result<Selection, Error> {
        self.run(ledger, &Selector::Filter(selector.clone())).await
    }

    #[tracing::instrument(skip_all, fields(ledger = %ledger.id))]
    pub async fn run(&self, ledger: &Ledger, selector: &Selector) -> Result<Selection, Error> {
        let after = validate_after(ledger, selector)?;
        let predicate = sql::predicate(selector);
        let (after_ts, after_chk) = after
            .map(|a| (a.timestamp as i64, a.checksum as i64))
            .unwrap_or((0, 0));
        // limit 0 means unbounded.
        let limit = selector.limit().unwrap_or(0);

        let rows = self
            .db
            .run_selector(
                &ledger.id.to_string(),
                after_ts,
                after_chk,
                limit as i32,
                predicate.as_bytes(),
                BATCH_SIZE,
            )
            .await
            .map_err(|e| classify(e, after))?;

        let mut rows = rows.into_iter();
        let header = rows
            .next()
            .ok_or_else(|| Error::Internal("selector returned no header row".to_string()))?;
        let position = EventId::new(
            header.timestamp as u64,
            header.checksum as u32,
            ledger.id,
        );
        let first: Vec<SelectedRow> = rows.collect();
        let full_batch = first.len() >= BATCH_SIZE as usize;

        let db = self.db.clone();
        let ledger_id = ledger.id;
        let events = try_stream! {
            let mut yielded: u32 = 0;
            let mut last_ts: i64 = after_ts;
            for row in first {
                last_ts = row.timestamp;
                yield translate(row, ledger_id)?;
                yielded += 1;
            }
            if full_batch {
                loop {
                    let fetch_limit = if limit == 0 {
                        BATCH_SIZE
                    } else {
                        let remaining = limit.saturating_sub(yielded);
                        if remaining == 0 {
                            break;
                        }
                        remaining.min(BATCH_SIZE as u32) as i32
                    };
                    let batch = db
                        .fetch_selected(
                            &ledger_id.to_string(),
                            last_ts,
                            fetch_limit,
                            predicate.as_bytes(),
                        )
                        .await
                        .map_err(|e| classify(e, after))?;
                    let drained = (batch.len() as i32) < fetch_limit;
                    for row in batch {
                        last_ts = row.timestamp;
                        yield translate(row, ledger_id)?;
                        yielded += 1;
                    }
                    if drained {
                        break;
                    }
                }
            }
        };

        Ok(Selection {
            position,
            events: events.boxed(),
        })
    }

    /// The latest matching position without fetching event rows. Falls back
    /// to the selector's `after`, then the ledger's genesis.
    #[tracing::instrument(skip_all, fields(ledger = %ledger.id))]
    pub async fn latest_event_id(
        &self,
        ledger: &Ledger,
        selector: &Selector,
    ) -> Result<EventId, Error> {
        let after = validate_after(ledger, selector)?;
        let predicate = sql::predicate(selector);
        let after_ts = after.map(|a| a.timestamp as i64).unwrap_or(0);
        let limit = selector.limit().unwrap_or(0);

        let row = self
            .db
            .fetch_event_id(
                &ledger.id.to_string(),
                predicate.as_bytes(),
                after_ts,
                limit as i32,
            )
            .await
            .map_err(|e| classify(e, after))?;

        Ok(match row {
            Some((ts, chk)) => EventId::new(ts as u64, chk as u32, ledger.id),
            None => after.unwrap_or(ledger.genesis),
        })
    }
}

fn validate_after(ledger: &Ledger, selector: &Selector) -> Result<Option<EventId>, Error> {
    if let Some(after) = selector.after() {
        if after.ledger != ledger.id {
            return Err(Error::BadInput(format!(
                "'after' event {} does not belong to ledger {}",
                after.hex(),
                ledger.id
            )));
        }
    }
    Ok(selector.after())
}

fn translate(row: SelectedRow, ledger: LedgerId) -> Result<PersistedEvent, Error> {
    let event = row
        .event
        .ok_or_else(|| Error::Internal("event row without an event name".to_string()))?;
    Ok(PersistedEvent::new(
        EventId::new(row.timestamp as u64, row.checksum as u32, ledger),
        event,
        row.entities.unwrap_or(serde_json::Value::Null),
        row.meta.unwrap_or(serde_json::Value::Null),
        row.data.unwrap_or(serde_json::Value::Null),
    ))
}

fn classify(err: sqlx::Error, after: Option<EventId>) -> Error {
    if db::is_syntax_error(&err) {
        return Error::BadInput("invalid selector query".to_string());
    }
    if let Some(message) = db::db_message(&err) {
        if message.starts_with("AFTER not found") {
            let echo = after.map(|a| a.hex()).unwrap_or_default();
            return Error::BadInput(format!("'after' event {echo} not found"));
        }
    }
    Error::Database(err)
}
