//! Per-ledger registry of permitted event types.
//!
//! The registry is not a table: it is the fold of two marker event types
//! stored in the ledger itself. `EVENT_REGISTERED` records a name with its
//! entity list, `EVENT_UNREGISTERED` removes it; a type is registered iff
//! the last marker for it is a registration. Markers are tagged with the
//! reserved "📒" entity keyed by ledger id.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::db::Db;
use crate::ledger::event_id::EventId;
use crate::ledger::events::{Ledger, PersistedEvent};
use crate::selector::{sql, FilterSelector, JsonPathFilter};
use crate::source::EventSource;
use crate::Error;

pub const EVENT_REGISTERED: &str = "EVENT_REGISTERED";
pub const EVENT_UNREGISTERED: &str = "EVENT_UNREGISTERED";

/// Synthetic entity reserved for ledger bookkeeping markers.
pub const LEDGER_ENTITY: &str = "📒";

const CACHE_CAPACITY: u64 = 1_000;
const CACHE_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryEntry {
    pub event: String,
    pub entities: Vec<String>,
}

/// Outcome of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registered {
    Created,
    /// The identical (order-independent) entity set was already registered.
    Unchanged,
}

#[derive(Clone)]
pub struct Registry {
    db: Db,
    source: EventSource,
    cache: moka::future::Cache<u32, Arc<Vec<RegistryEntry>>>,
}

impl Registry {
    pub fn new(db: Db, source: EventSource) -> Self {
        Registry {
            db,
            source,
            cache: moka::future::Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(CACHE_TTL)
                .build(),
        }
    }

    pub async fn all_events(&self, ledger: &Ledger) -> Result<Vec<RegistryEntry>, Error> {
        Ok(self.read(ledger).await?.as_ref().clone())
    }

    pub async fn get_event(
        &self,
        ledger: &Ledger,
        name: &str,
    ) -> Result<Option<RegistryEntry>, Error> {
        Ok(self
            .read(ledger)
            .await?
            .iter()
            .find(|e| e.event == name)
            .cloned())
    }

    /// All entity names across registered event types, sorted and deduped.
    pub async fn entities(&self, ledger: &Ledger) -> Result<Vec<String>, Error> {
        let entries = self.read(ledger).await?;
        let names: BTreeSet<String> = entries
            .iter()
            .flat_map(|e| e.entities.iter().cloned())
            .collect();
        Ok(names.into_iter().collect())
    }

    pub async fn events_for_entity(
        &self,
        ledger: &Ledger,
        entity: &str,
    ) -> Result<Vec<RegistryEntry>, Error> {
        Ok(self
            .read(ledger)
            .await?
            .iter()
            .filter(|e| e.entities.iter().any(|n| n == entity))
            .cloned()
            .collect())
    }

    /// Register an event type. Re-registering with an identical entity set
    /// is a no-op.
    #[tracing::instrument(skip_all, fields(ledger = %ledger.id, event = %name))]
    pub async fn register_event_type(
        &self,
        ledger: &Ledger,
        name: &str,
        entities: Vec<String>,
    ) -> Result<Registered, Error> {
        if name.is_empty() {
            return Err(Error::BadInput("event name must not be empty".to_string()));
        }
        if entities.iter().any(|e| e == LEDGER_ENTITY) {
            return Err(Error::Forbidden(format!(
                "entity name '{LEDGER_ENTITY}' is reserved"
            )));
        }

        let current = self.read(ledger).await?;
        if let Some(existing) = current.iter().find(|e| e.event == name) {
            let existing_set: BTreeSet<&str> =
                existing.entities.iter().map(String::as_str).collect();
            let requested_set: BTreeSet<&str> = entities.iter().map(String::as_str).collect();
            if existing_set == requested_set {
                return Ok(Registered::Unchanged);
            }
        }

        self.append_marker(
            ledger,
            EVENT_REGISTERED,
            json!({ "event": name, "entities": entities }),
        )
        .await?;
        self.cache.invalidate(&ledger.id.0).await;
        Ok(Registered::Created)
    }

    #[tracing::instrument(skip_all, fields(ledger = %ledger.id, event = %name))]
    pub async fn delete_event(&self, ledger: &Ledger, name: &str) -> Result<(), Error> {
        let current = self.read(ledger).await?;
        if !current.iter().any(|e| e.event == name) {
            return Err(Error::NotFound(format!("event '{name}' is not registered")));
        }
        self.append_marker(ledger, EVENT_UNREGISTERED, json!({ "event": name }))
            .await?;
        self.cache.invalidate(&ledger.id.0).await;
        Ok(())
    }

    /// The resolved registry for a ledger. Concurrent callers share one
    /// replay per cache window.
    async fn read(&self, ledger: &Ledger) -> Result<Arc<Vec<RegistryEntry>>, Error> {
        let registry = self.clone();
        let ledger = ledger.clone();
        self.cache
            .try_get_with(ledger.id.0, async move {
                registry.load(&ledger).await.map(Arc::new)
            })
            .await
            .map_err(|e: Arc<Error>| e.duplicate())
    }

    /// Replay the marker events and fold them into the registry.
    async fn load(&self, ledger: &Ledger) -> Result<Vec<RegistryEntry>, Error> {
        let mut events = BTreeMap::new();
        for marker in [EVENT_REGISTERED, EVENT_UNREGISTERED] {
            events.insert(
                marker.to_string(),
                JsonPathFilter {
                    query: "$".to_string(),
                    vars: None,
                },
            );
        }
        let selector = FilterSelector {
            events,
            ..Default::default()
        };
        let selection = self.source.filter(ledger, &selector).await?;
        let markers: Vec<PersistedEvent> = selection.events.try_collect().await?;
        Ok(fold_markers(markers))
    }

    /// Append a registry marker. Markers bypass event-type validation and
    /// append factually (the never-matching predicate).
    async fn append_marker(
        &self,
        ledger: &Ledger,
        marker: &str,
        data: serde_json::Value,
    ) -> Result<(), Error> {
        let previous = EventId::new(0, 0, ledger.id).to_uuid();
        let append_key = Uuid::new_v4().simple().to_string();
        let entities = json!({ LEDGER_ENTITY: [ledger.id.to_string()] });
        self.db
            .append_event(
                previous,
                marker,
                &entities,
                &serde_json::Value::Null,
                &data,
                &append_key,
                sql::NEVER.as_bytes(),
            )
            .await?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RegisteredMarker {
    event: String,
    #[serde(default)]
    entities: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct UnregisteredMarker {
    event: String,
}

/// Fold the marker history: a type is registered iff its last marker is a
/// registration, with the entity list of that marker.
pub fn fold_markers(markers: impl IntoIterator<Item = PersistedEvent>) -> Vec<RegistryEntry> {
    let mut registered: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for marker in markers {
        match marker.event.as_str() {
            EVENT_REGISTERED => {
                match serde_json::from_value::<RegisteredMarker>(marker.data.clone()) {
                    Ok(m) => {
                        registered.insert(m.event, m.entities);
                    }
                    Err(e) => {
                        tracing::warn!(event_id = %marker.event_id, error = %e, "malformed registration marker");
                    }
                }
            }
            EVENT_UNREGISTERED => {
                match serde_json::from_value::<UnregisteredMarker>(marker.data.clone()) {
                    Ok(m) => {
                        registered.remove(&m.event);
                    }
                    Err(e) => {
                        tracing::warn!(event_id = %marker.event_id, error = %e, "malformed unregistration marker");
                    }
                }
            }
            other => {
                tracing::warn!(event = %other, "unexpected event in registry replay");
            }
        }
    }
    registered
        .into_iter()
        .map(|(event, entities)| RegistryEntry { event, entities })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::event_id::{EventId, LedgerId};

    fn marker(ts: u64, event: &str, data: serde_json::Value) -> PersistedEvent {
        PersistedEvent::new(
            EventId::new(ts, 0, LedgerId(1)),
            event.to_string(),
            json!({ LEDGER_ENTITY: ["00000001"] }),
            serde_json::Value::Null,
            data,
        )
    }

    #[test]
    fn test_fold_register_unregister() {
        let history = vec![
            marker(1, EVENT_REGISTERED, json!({"event": "A", "entities": ["x"]})),
            marker(2, EVENT_REGISTERED, json!({"event": "B", "entities": ["y"]})),
            marker(3, EVENT_UNREGISTERED, json!({"event": "A"})),
        ];
        let entries = fold_markers(history);
        assert_eq!(
            entries,
            vec![RegistryEntry {
                event: "B".to_string(),
                entities: vec!["y".to_string()],
            }]
        );
    }

    #[test]
    fn test_fold_last_marker_wins() {
        let history = vec![
            marker(1, EVENT_REGISTERED, json!({"event": "A", "entities": ["x"]})),
            marker(2, EVENT_UNREGISTERED, json!({"event": "A"})),
            marker(3, EVENT_REGISTERED, json!({"event": "A", "entities": ["x", "z"]})),
        ];
        let entries = fold_markers(history);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entities, vec!["x".to_string(), "z".to_string()]);
    }

    #[test]
    fn test_fold_skips_malformed_markers() {
        let history = vec![
            marker(1, EVENT_REGISTERED, json!({"entities": ["x"]})),
            marker(2, EVENT_REGISTERED, json!({"event": "B"})),
        ];
        let entries = fold_markers(history);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event, "B");
        assert!(entries[0].entities.is_empty());
    }

    #[test]
    fn test_fold_empty_history() {
        assert!(fold_markers(Vec::new()).is_empty());
    }
}
