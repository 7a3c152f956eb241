//! Compiles a selector into a boolean predicate over a persisted event,
//! mirroring the SQL predicate the same selector generates: an event matches
//! when any of the entities / meta / per-event data clauses matches.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::jsonpath::JsonPath;
use crate::ledger::events::PersistedEvent;
use crate::selector::{JsonPathFilter, Selector};
use crate::Error;

/// A compiled data-or-meta jsonpath. `None` stands for the trivial `$`
/// query, which is always true without invoking the engine.
#[derive(Debug, Clone)]
struct CompiledFilter {
    path: Option<JsonPath>,
    vars: Option<Map<String, Value>>,
}

impl CompiledFilter {
    fn compile(filter: &JsonPathFilter) -> Result<CompiledFilter, Error> {
        let path = if filter.query.trim() == "$" {
            None
        } else {
            Some(JsonPath::parse(&filter.query).map_err(|e| {
                Error::BadInput(format!("invalid jsonpath '{}': {}", filter.query, e))
            })?)
        };
        Ok(CompiledFilter {
            path,
            vars: filter.vars.clone(),
        })
    }

    fn matches(&self, value: &Value) -> bool {
        match &self.path {
            None => true,
            Some(path) => path.exists(value, self.vars.as_ref()),
        }
    }
}

/// In-process event predicate compiled once per subscription.
#[derive(Debug, Clone)]
pub struct Matcher {
    kind: MatcherKind,
}

#[derive(Debug, Clone)]
enum MatcherKind {
    /// A plain selector matches every event.
    Always,
    Filter {
        entities: BTreeMap<String, Vec<String>>,
        meta: Option<CompiledFilter>,
        events: BTreeMap<String, CompiledFilter>,
    },
}

impl Matcher {
    pub fn compile(selector: &Selector) -> Result<Matcher, Error> {
        let filter = match selector {
            Selector::Plain(_) => {
                return Ok(Matcher {
                    kind: MatcherKind::Always,
                })
            }
            Selector::Filter(f) => f,
        };
        let meta = filter
            .meta
            .as_ref()
            .map(CompiledFilter::compile)
            .transpose()?;
        let mut events = BTreeMap::new();
        for (name, path) in &filter.events {
            events.insert(name.clone(), CompiledFilter::compile(path)?);
        }
        Ok(Matcher {
            kind: MatcherKind::Filter {
                entities: filter.entities.clone(),
                meta,
                events,
            },
        })
    }

    pub fn matches(&self, event: &PersistedEvent) -> bool {
        let (entities, meta, events) = match &self.kind {
            MatcherKind::Always => return true,
            MatcherKind::Filter {
                entities,
                meta,
                events,
            } => (entities, meta, events),
        };

        if entities_overlap(entities, &event.entities) {
            return true;
        }
        if let Some(meta_filter) = meta {
            if meta_filter.matches(&event.meta) {
                return true;
            }
        }
        if let Some(data_filter) = events.get(&event.event) {
            if data_filter.matches(&event.data) {
                return true;
            }
        }
        false
    }
}

/// Any (name, key) pair shared between the selector's entities and the
/// event's entity map.
fn entities_overlap(wanted: &BTreeMap<String, Vec<String>>, entities: &Value) -> bool {
    let map = match entities.as_object() {
        Some(map) => map,
        None => return false,
    };
    for (name, keys) in wanted {
        let event_keys = match map.get(name).and_then(Value::as_array) {
            Some(keys) => keys,
            None => continue,
        };
        for key in keys {
            if event_keys.iter().any(|k| k.as_str() == Some(key)) {
                return true;
            }
        }
    }
    false
}
