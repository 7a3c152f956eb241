pub mod codec;
pub mod sql;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ledger::event_id::EventId;

/// A JSONPath filter: the query string and optional variables, serialized on
/// the wire as `{q, v?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonPathFilter {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vars: Option<Map<String, Value>>,
}

impl JsonPathFilter {
    /// Sort variable keys recursively and drop an empty vars object. The
    /// result is stable under re-canonicalization.
    fn canonicalize(&mut self) {
        if let Some(vars) = self.vars.take() {
            if !vars.is_empty() {
                let sorted = match canonical_value(Value::Object(vars)) {
                    Value::Object(m) => m,
                    _ => unreachable!(),
                };
                self.vars = Some(sorted);
            }
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.query.trim().is_empty() {
            return Err("jsonpath query must not be empty".to_string());
        }
        if self.query.trim_start().starts_with("strict") {
            return Err("strict jsonpath mode is not supported".to_string());
        }
        Ok(())
    }
}

/// "All events from `after` exclusive, up to `limit`."
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PlainSelector {
    pub after: Option<EventId>,
    pub limit: Option<u32>,
}

/// A plain selector plus any of the entities / meta / events filter clauses.
/// An event matches when at least one specified clause matches.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FilterSelector {
    pub after: Option<EventId>,
    pub limit: Option<u32>,
    pub entities: BTreeMap<String, Vec<String>>,
    pub meta: Option<JsonPathFilter>,
    pub events: BTreeMap<String, JsonPathFilter>,
}

impl FilterSelector {
    pub fn has_clauses(&self) -> bool {
        !self.entities.is_empty() || self.meta.is_some() || !self.events.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    Plain(PlainSelector),
    Filter(FilterSelector),
}

impl Selector {
    pub fn after(&self) -> Option<EventId> {
        match self {
            Selector::Plain(s) => s.after,
            Selector::Filter(s) => s.after,
        }
    }

    pub fn limit(&self) -> Option<u32> {
        match self {
            Selector::Plain(s) => s.limit,
            Selector::Filter(s) => s.limit,
        }
    }

    pub fn with_after(&self, after: EventId) -> Selector {
        let mut s = self.clone();
        match &mut s {
            Selector::Plain(p) => p.after = Some(after),
            Selector::Filter(f) => f.after = Some(after),
        }
        s
    }

    /// Canonical, stable form: nested map keys sorted, empty containers
    /// normalized away. Idempotent.
    pub fn canonical(mut self) -> Selector {
        if let Selector::Filter(f) = &mut self {
            if let Some(meta) = &mut f.meta {
                meta.canonicalize();
            }
            for filter in f.events.values_mut() {
                filter.canonicalize();
            }
            if !f.has_clauses() {
                return Selector::Plain(PlainSelector {
                    after: f.after,
                    limit: f.limit,
                });
            }
        }
        self
    }

    /// Subscription form: the canonical selector with any `limit` stripped.
    pub fn without_limit(&self) -> Selector {
        let mut s = self.clone();
        match &mut s {
            Selector::Plain(p) => p.limit = None,
            Selector::Filter(f) => f.limit = None,
        }
        s
    }
}

/// Recursively sort the keys of every JSON object. Arrays keep their order;
/// only key reorderings are neutral.
pub fn canonical_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, canonical_value(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonical_value).collect()),
        other => other,
    }
}

/// The JSON form of a selector accepted in request bodies and returned when
/// representing a subscription.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectorInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub entities: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<JsonPathFilter>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub events: BTreeMap<String, JsonPathFilter>,
}

impl SelectorInput {
    /// Validate and convert to the internal model.
    pub fn into_selector(self) -> Result<Selector, crate::Error> {
        let bad = |m: String| crate::Error::BadInput(m);

        let after = match self.after {
            Some(hex) => Some(
                EventId::parse_hex(&hex)
                    .ok_or_else(|| bad(format!("invalid event id: {hex}")))?,
            ),
            None => None,
        };
        if self.limit == Some(0) {
            return Err(bad("limit must be greater than zero".to_string()));
        }
        for (name, keys) in &self.entities {
            if keys.is_empty() {
                return Err(bad(format!("entity '{name}' has no keys")));
            }
        }
        if let Some(meta) = &self.meta {
            meta.validate().map_err(bad)?;
        }
        for (event, filter) in &self.events {
            filter
                .validate()
                .map_err(|m| bad(format!("event '{event}': {m}")))?;
        }

        let selector = if self.entities.is_empty() && self.meta.is_none() && self.events.is_empty()
        {
            Selector::Plain(PlainSelector {
                after,
                limit: self.limit,
            })
        } else {
            Selector::Filter(FilterSelector {
                after,
                limit: self.limit,
                entities: self.entities,
                meta: self.meta,
                events: self.events,
            })
        };
        Ok(selector.canonical())
    }

    pub fn from_selector(selector: &Selector) -> SelectorInput {
        match selector {
            Selector::Plain(p) => SelectorInput {
                after: p.after.map(|a| a.hex()),
                limit: p.limit,
                ..Default::default()
            },
            Selector::Filter(f) => SelectorInput {
                after: f.after.map(|a| a.hex()),
                limit: f.limit,
                entities: f.entities.clone(),
                meta: f.meta.clone(),
                events: f.events.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::event_id::LedgerId;
    use serde_json::json;

    #[test]
    fn test_canonical_value_sorts_keys_recursively() {
        let v = json!({"b": 1, "a": {"z": 1, "y": [ {"q": 1, "p": 2} ]}});
        let canonical = canonical_value(v);
        assert_eq!(
            serde_json::to_string(&canonical).unwrap(),
            r#"{"a":{"y":[{"p":2,"q":1}],"z":1},"b":1}"#
        );
        // Idempotent.
        let again = canonical_value(canonical.clone());
        assert_eq!(again, canonical);
    }

    #[test]
    fn test_input_rejects_zero_limit() {
        let input = SelectorInput {
            limit: Some(0),
            ..Default::default()
        };
        assert!(input.into_selector().is_err());
    }

    #[test]
    fn test_input_rejects_strict_jsonpath() {
        let input = SelectorInput {
            meta: Some(JsonPathFilter {
                query: "strict $.a".to_string(),
                vars: None,
            }),
            ..Default::default()
        };
        assert!(input.into_selector().is_err());
    }

    #[test]
    fn test_input_rejects_empty_entity_keys() {
        let mut entities = BTreeMap::new();
        entities.insert("order".to_string(), vec![]);
        let input = SelectorInput {
            entities,
            ..Default::default()
        };
        assert!(input.into_selector().is_err());
    }

    #[test]
    fn test_clauseless_filter_canonicalizes_to_plain() {
        let input = SelectorInput {
            after: Some(EventId::new(1, 2, LedgerId(3)).hex()),
            limit: Some(10),
            ..Default::default()
        };
        match input.into_selector().unwrap() {
            Selector::Plain(p) => {
                assert_eq!(p.limit, Some(10));
                assert!(p.after.is_some());
            }
            Selector::Filter(_) => panic!("expected plain selector"),
        }
    }

    #[test]
    fn test_canonical_drops_empty_vars() {
        let mut events = BTreeMap::new();
        events.insert(
            "order-placed".to_string(),
            JsonPathFilter {
                query: "$".to_string(),
                vars: Some(Map::new()),
            },
        );
        let selector = SelectorInput {
            events,
            ..Default::default()
        }
        .into_selector()
        .unwrap();
        match selector {
            Selector::Filter(f) => assert!(f.events["order-placed"].vars.is_none()),
            _ => panic!("expected filter selector"),
        }
    }
}
