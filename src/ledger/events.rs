use chrono::{SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::event_id::{EventId, LedgerId};

/// An event as returned to clients: hex id, ISO-8601 timestamp, and the
/// stored JSON for entities, meta and data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedEvent {
    #[serde(rename = "eventId")]
    pub event_id: String,
    pub timestamp: String,
    pub event: String,
    pub entities: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub meta: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl PersistedEvent {
    pub fn new(
        id: EventId,
        event: String,
        entities: Value,
        meta: Value,
        data: Value,
    ) -> Self {
        PersistedEvent {
            event_id: id.hex(),
            timestamp: iso8601(id.timestamp),
            event,
            entities,
            meta,
            data,
        }
    }

    pub fn id(&self) -> Option<EventId> {
        EventId::parse_hex(&self.event_id)
    }
}

/// Render an epoch-microsecond instant as ISO-8601 with microsecond precision.
pub fn iso8601(epoch_micros: u64) -> String {
    match Utc.timestamp_micros(epoch_micros as i64) {
        chrono::LocalResult::Single(dt) => dt.to_rfc3339_opts(SecondsFormat::Micros, true),
        _ => Utc
            .timestamp_micros(0)
            .unwrap()
            .to_rfc3339_opts(SecondsFormat::Micros, true),
    }
}

/// Client input for an append.
#[derive(Debug, Clone, Deserialize)]
pub struct AppendEvent {
    pub event: String,
    pub entities: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub meta: Option<Value>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default, rename = "idempotencyKey")]
    pub idempotency_key: Option<String>,
}

impl AppendEvent {
    /// Entities as the JSON object stored alongside the event.
    pub fn entities_json(&self) -> Value {
        serde_json::to_value(&self.entities).unwrap_or(Value::Null)
    }
}

/// Ledger metadata. `genesis` is the id of the ledger's creation event.
#[derive(Debug, Clone)]
pub struct Ledger {
    pub id: LedgerId,
    pub name: String,
    pub description: String,
    pub genesis: EventId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::event_id::{EventId, LedgerId};

    #[test]
    fn test_iso8601_micros() {
        assert_eq!(iso8601(0), "1970-01-01T00:00:00.000000Z");
        assert_eq!(iso8601(1_500_000), "1970-01-01T00:00:01.500000Z");
    }

    #[test]
    fn test_persisted_event_serializes_without_null_meta() {
        let e = PersistedEvent::new(
            EventId::new(1, 2, LedgerId(3)),
            "order-placed".into(),
            serde_json::json!({"order": ["o-1"]}),
            Value::Null,
            serde_json::json!({"total": 42}),
        );
        let json = serde_json::to_value(&e).unwrap();
        assert!(json.get("meta").is_none());
        assert_eq!(json["event"], "order-placed");
        assert_eq!(json["eventId"], e.event_id);
    }
}
