//! The append engine.
//!
//! Factual appends use the never-matching predicate; atomic appends carry
//! the selector's SQL so the database can detect a race against events
//! appended after the selector's `after`. A client-supplied idempotency key
//! turns replays of the identical event into a success that returns the
//! originally appended event id.

use serde_json::Value;
use uuid::Uuid;

use crate::db::{self, AppendKeyRow, Db};
use crate::ledger::event_id::EventId;
use crate::ledger::events::{AppendEvent, Ledger};
use crate::registry::{Registry, LEDGER_ENTITY};
use crate::selector::{sql, FilterSelector, Selector};
use crate::Error;

/// How an append resolved. The HTTP layer maps these onto status codes and
/// substitutes the `/REGISTER` and `/RESET` placeholders with real URIs.
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Success {
        event_id: EventId,
        idempotency_key: String,
    },
    /// The atomic append lost a race (HTTP 409).
    Race { message: String },
    /// An append rule failed; remediation is possible (HTTP 403).
    Fail { message: String },
    /// The event fails validation against the registry or a reused
    /// idempotency key (HTTP 422).
    Invalid { message: String },
    /// Bad request inputs echoed back (HTTP 400).
    Error { message: String },
}

#[derive(Clone)]
pub struct EventStore {
    db: Db,
    registry: Registry,
}

impl EventStore {
    pub fn new(db: Db, registry: Registry) -> Self {
        EventStore { db, registry }
    }

    /// Unconditional append.
    pub async fn append_factual(
        &self,
        ledger: &Ledger,
        input: &AppendEvent,
    ) -> Result<AppendOutcome, Error> {
        self.append(ledger, input, None, sql::NEVER.to_string())
            .await
    }

    /// Conditional append: succeeds only if no event matching `selector`
    /// exists later than its `after` at the moment of commit.
    pub async fn append_atomic(
        &self,
        ledger: &Ledger,
        input: &AppendEvent,
        selector: &FilterSelector,
    ) -> Result<AppendOutcome, Error> {
        let predicate = sql::predicate(&Selector::Filter(selector.clone()));
        self.append(ledger, input, selector.after, predicate).await
    }

    #[tracing::instrument(skip_all, fields(ledger = %ledger.id, event = %input.event))]
    async fn append(
        &self,
        ledger: &Ledger,
        input: &AppendEvent,
        after: Option<EventId>,
        predicate: String,
    ) -> Result<AppendOutcome, Error> {
        if input.entities.keys().any(|name| name == LEDGER_ENTITY) {
            return Err(Error::Forbidden(format!(
                "entity name '{LEDGER_ENTITY}' is reserved"
            )));
        }
        if let Some(message) = self.validate(ledger, input).await? {
            return Ok(AppendOutcome::Invalid { message });
        }

        let (after_ts, after_chk) = after
            .map(|a| (a.timestamp, a.checksum))
            .unwrap_or((0, 0));
        let previous = EventId::new(after_ts, after_chk, ledger.id).to_uuid();
        let append_key = input
            .idempotency_key
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        let entities = input.entities_json();
        let meta = input.meta.clone().unwrap_or(Value::Null);
        let data = input.data.clone().unwrap_or(Value::Null);

        let appended = self
            .db
            .append_event(
                previous,
                &input.event,
                &entities,
                &meta,
                &data,
                &append_key,
                predicate.as_bytes(),
            )
            .await;

        match appended {
            Ok(event_id) => Ok(AppendOutcome::Success {
                event_id: EventId::from_uuid(event_id),
                idempotency_key: append_key,
            }),
            Err(e) => self.map_append_error(e, ledger, input, &append_key).await,
        }
    }

    /// Check the event name and its entity names against the registry.
    async fn validate(
        &self,
        ledger: &Ledger,
        input: &AppendEvent,
    ) -> Result<Option<String>, Error> {
        let entry = match self.registry.get_event(ledger, &input.event).await? {
            Some(entry) => entry,
            None => {
                return Ok(Some(format!(
                    "Event '{}' is not registered. Register it at /REGISTER first.",
                    input.event
                )))
            }
        };
        for name in input.entities.keys() {
            if !entry.entities.iter().any(|e| e == name) {
                return Ok(Some(format!(
                    "Entity '{}' is not registered for event '{}'. Update the registration at /REGISTER first.",
                    name, input.event
                )));
            }
        }
        Ok(None)
    }

    async fn map_append_error(
        &self,
        err: sqlx::Error,
        ledger: &Ledger,
        input: &AppendEvent,
        append_key: &str,
    ) -> Result<AppendOutcome, Error> {
        if let Some(message) = db::db_message(&err) {
            if message.starts_with("RACE CONDITION") {
                if input.idempotency_key.is_some() {
                    if let Some(outcome) =
                        self.idempotent_replay(ledger, input, append_key).await?
                    {
                        return Ok(outcome);
                    }
                }
                return Ok(AppendOutcome::Race {
                    message: "An event matching the selector was appended after 'after'"
                        .to_string(),
                });
            }
            if message.starts_with("previous can only be genesis for first event") {
                return Ok(AppendOutcome::Fail {
                    message: "Ledger already has events. Reset it at /RESET to append from the start."
                        .to_string(),
                });
            }
            if message.starts_with("previous_id must exist in the ledger") {
                return Ok(AppendOutcome::Error {
                    message: "Previous Event ID not found".to_string(),
                });
            }
            if message.starts_with("AFTER not found") {
                return Ok(AppendOutcome::Error {
                    message: "'after' value not found".to_string(),
                });
            }
        }
        if db::is_unique_violation(&err, "_append_key_key") {
            if let Some(outcome) = self.idempotent_replay(ledger, input, append_key).await? {
                return Ok(outcome);
            }
            return Ok(AppendOutcome::Invalid {
                message: format!(
                    "idempotency key '{append_key}' was already used for a different event"
                ),
            });
        }
        Err(Error::Database(err))
    }

    /// A replayed idempotency key succeeds when the stored event deeply
    /// equals the input, suppressing the race or key conflict.
    async fn idempotent_replay(
        &self,
        ledger: &Ledger,
        input: &AppendEvent,
        append_key: &str,
    ) -> Result<Option<AppendOutcome>, Error> {
        let prior = self
            .db
            .find_with_append_key(&ledger.id.to_string(), append_key)
            .await?;
        let Some(prior) = prior else {
            return Ok(None);
        };
        if same_event(input, &prior) {
            Ok(Some(AppendOutcome::Success {
                event_id: EventId::new(
                    prior.timestamp as u64,
                    prior.checksum as u32,
                    ledger.id,
                ),
                idempotency_key: append_key.to_string(),
            }))
        } else {
            Ok(Some(AppendOutcome::Invalid {
                message: "Event does not match the event originally appended with idempotencyKey"
                    .to_string(),
            }))
        }
    }
}

/// Deep, key-order-independent equality of the input against a stored event.
fn same_event(input: &AppendEvent, prior: &AppendKeyRow) -> bool {
    if input.event != prior.event {
        return false;
    }
    if input.entities_json() != prior.entities {
        return false;
    }
    let input_meta = input.meta.clone().unwrap_or(Value::Null);
    let prior_meta = prior.meta.clone().unwrap_or(Value::Null);
    if input_meta != prior_meta {
        return false;
    }
    let input_data = input.data.clone().unwrap_or(Value::Null);
    let prior_data = prior.data.clone().unwrap_or(Value::Null);
    input_data == prior_data
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn input(data: Option<Value>) -> AppendEvent {
        let mut entities = BTreeMap::new();
        entities.insert("order".to_string(), vec!["o-1".to_string()]);
        AppendEvent {
            event: "order-placed".to_string(),
            entities,
            meta: None,
            data,
            idempotency_key: Some("K".to_string()),
        }
    }

    fn prior(data: Option<Value>) -> AppendKeyRow {
        AppendKeyRow {
            timestamp: 1,
            checksum: 2,
            event: "order-placed".to_string(),
            entities: json!({"order": ["o-1"]}),
            meta: None,
            data,
        }
    }

    #[test]
    fn test_same_event_matches_identical_input() {
        assert!(same_event(&input(Some(json!({"total": 42}))), &prior(Some(json!({"total": 42})))));
    }

    #[test]
    fn test_same_event_is_key_order_independent() {
        assert!(same_event(
            &input(Some(json!({"a": 1, "b": 2}))),
            &prior(Some(json!({"b": 2, "a": 1})))
        ));
    }

    #[test]
    fn test_same_event_treats_missing_as_null() {
        assert!(same_event(&input(None), &prior(Some(Value::Null))));
    }

    #[test]
    fn test_same_event_rejects_changed_data() {
        assert!(!same_event(
            &input(Some(json!({"total": 42}))),
            &prior(Some(json!({"total": 43})))
        ));
    }

    #[test]
    fn test_same_event_rejects_changed_name() {
        let mut changed = input(None);
        changed.event = "order-shipped".to_string();
        assert!(!same_event(&changed, &prior(None)));
    }
}
