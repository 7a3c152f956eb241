//! Ledger administration: create, resolve, reset, remove.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Deserialize;

use super::event_id::{EventId, LedgerId};
use super::events::Ledger;
use crate::db::{self, Db};
use crate::selector::{FilterSelector, JsonPathFilter};
use crate::source::EventSource;
use crate::Error;

/// Marker event every ledger starts with; its data carries the ledger's
/// name and description and its id is the ledger's genesis.
pub const LEDGER_CREATED: &str = "📒𒃻";

const CACHE_CAPACITY: u64 = 1_000;
const CACHE_TTL: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Ledgers {
    db: Db,
    source: EventSource,
    cache: moka::future::Cache<u32, Option<Arc<Ledger>>>,
}

#[derive(Debug, Deserialize)]
struct GenesisData {
    name: String,
    #[serde(default)]
    description: String,
}

impl Ledgers {
    pub fn new(db: Db, source: EventSource) -> Self {
        Ledgers {
            db,
            source,
            cache: moka::future::Cache::builder()
                .max_capacity(CACHE_CAPACITY)
                .time_to_live(CACHE_TTL)
                .build(),
        }
    }

    /// Create a ledger. A duplicate name resolves to the existing ledger id
    /// when the database can supply it, otherwise the create is forbidden.
    #[tracing::instrument(skip_all, fields(name = %name))]
    pub async fn create(&self, name: &str, description: &str) -> Result<LedgerId, Error> {
        if name.trim().is_empty() {
            return Err(Error::BadInput("ledger name must not be empty".to_string()));
        }
        let created = self.db.create_ledger(name, description).await;
        let id = match created {
            Ok(Some(id)) => id,
            Ok(None) => {
                return Err(Error::Forbidden(format!("ledger '{name}' already exists")))
            }
            Err(e) if db::is_unique_violation(&e, "_name_key") => {
                return Err(Error::Forbidden(format!("ledger '{name}' already exists")))
            }
            Err(e) => return Err(e.into()),
        };
        let id: LedgerId = id
            .parse()
            .map_err(|_| Error::Internal(format!("database returned malformed ledger id: {id}")))?;
        self.cache.invalidate(&id.0).await;
        Ok(id)
    }

    /// Resolve a ledger from its genesis marker. Absent when the ledger does
    /// not exist or its genesis cannot be read.
    pub async fn for_ledger_id(&self, id: LedgerId) -> Result<Option<Arc<Ledger>>, Error> {
        let ledgers = self.clone();
        self.cache
            .try_get_with(id.0, async move { ledgers.load(id).await })
            .await
            .map_err(|e: Arc<Error>| e.duplicate())
    }

    async fn load(&self, id: LedgerId) -> Result<Option<Arc<Ledger>>, Error> {
        // The genesis lookup runs a bounded selector for the creation marker.
        let probe = Ledger {
            id,
            name: String::new(),
            description: String::new(),
            genesis: EventId::new(0, 0, id),
        };
        let mut events = std::collections::BTreeMap::new();
        events.insert(
            LEDGER_CREATED.to_string(),
            JsonPathFilter {
                query: "$".to_string(),
                vars: None,
            },
        );
        let selector = FilterSelector {
            limit: Some(1),
            events,
            ..Default::default()
        };
        let mut selection = self.source.filter(&probe, &selector).await?;
        let genesis_event = match selection.events.next().await {
            Some(Ok(event)) => event,
            Some(Err(e)) => return Err(e),
            None => return Ok(None),
        };
        let genesis = match genesis_event.id() {
            Some(id) => id,
            None => return Ok(None),
        };
        let data: GenesisData = match serde_json::from_value(genesis_event.data.clone()) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(ledger = %id, error = %e, "malformed genesis marker");
                return Ok(None);
            }
        };
        Ok(Some(Arc::new(Ledger {
            id,
            name: data.name,
            description: data.description,
            genesis,
        })))
    }

    /// Trim the ledger back to `after` (exclusive), or to its genesis when
    /// absent.
    #[tracing::instrument(skip_all, fields(ledger = %id))]
    pub async fn reset(&self, id: LedgerId, after: Option<EventId>) -> Result<(), Error> {
        let ledger = self
            .for_ledger_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("ledger {id} not found")))?;

        let target = match after {
            Some(after) => {
                if after.ledger != id {
                    return Err(Error::BadInput(format!(
                        "'after' event {} does not belong to ledger {id}",
                        after.hex()
                    )));
                }
                let found = self
                    .db
                    .after_exists(
                        &id.to_string(),
                        after.timestamp as i64,
                        after.checksum as i64,
                    )
                    .await?;
                if !found {
                    return Err(Error::BadInput(format!(
                        "'after' event {} not found",
                        after.hex()
                    )));
                }
                after
            }
            None => ledger.genesis,
        };

        self.db
            .reset_ledger_events(
                &id.to_string(),
                target.timestamp as i64,
                target.checksum as i64,
            )
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(ledger = %id))]
    pub async fn remove(&self, id: LedgerId) -> Result<(), Error> {
        self.for_ledger_id(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("ledger {id} not found")))?;
        self.db.remove_ledger(&id.to_string()).await?;
        self.cache.invalidate(&id.0).await;
        Ok(())
    }

    pub async fn event_count(&self, id: LedgerId) -> Result<i64, Error> {
        Ok(self.db.ledger_event_count(&id.to_string()).await?)
    }
}
