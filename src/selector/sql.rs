//! SQL predicate generation.
//!
//! The generated text is sent to the database as the selector's predicate
//! bytes. The database interpolates it into `WHERE` clauses and also compares
//! it byte-for-byte to detect append races, so generation must be
//! deterministic: map iteration is over sorted keys and every literal is
//! formatted one way only.

use super::{FilterSelector, JsonPathFilter, Selector};

/// Render a selector as its SQL predicate. A plain selector matches nothing
/// structurally, so it generates the literal `true`.
pub fn predicate(selector: &Selector) -> String {
    match selector {
        Selector::Plain(_) => "true".to_string(),
        Selector::Filter(f) => filter_predicate(f),
    }
}

/// The predicate that never matches, used for factual appends.
pub const NEVER: &str = "false";

fn filter_predicate(filter: &FilterSelector) -> String {
    let mut groups: Vec<String> = Vec::new();

    if !filter.entities.is_empty() {
        let clauses: Vec<String> = filter
            .entities
            .iter()
            .map(|(name, keys)| {
                let alternatives: Vec<String> = keys
                    .iter()
                    .map(|k| format!("@==\"{}\"", jsonpath_string(k)))
                    .collect();
                format!(
                    "entities @? '$.\"{}\" ? ({})'",
                    sql_escape(&jsonpath_string(name)),
                    sql_escape(&alternatives.join(" || "))
                )
            })
            .collect();
        groups.push(join_or(clauses));
    }

    if let Some(meta) = &filter.meta {
        groups.push(jsonpath_clause("meta", meta));
    }

    if !filter.events.is_empty() {
        let mut trivial: Vec<&String> = Vec::new();
        let mut clauses: Vec<String> = Vec::new();
        for (name, path) in &filter.events {
            if path.query.trim() == "$" {
                trivial.push(name);
            } else {
                clauses.push(format!(
                    "(event = '{}' AND {})",
                    sql_escape(name),
                    jsonpath_clause("data", path)
                ));
            }
        }
        match trivial.len() {
            0 => {}
            1 => clauses.insert(0, format!("event = '{}'", sql_escape(trivial[0]))),
            _ => {
                let names: Vec<String> = trivial
                    .iter()
                    .map(|n| format!("\"{}\"", array_element(n)))
                    .collect();
                clauses.insert(
                    0,
                    format!("event = ANY('{}')", sql_escape(&format!("{{{}}}", names.join(",")))),
                );
            }
        }
        groups.push(join_or(clauses));
    }

    format!("({})", groups.join(" OR "))
}

fn jsonpath_clause(column: &str, path: &JsonPathFilter) -> String {
    match &path.vars {
        Some(vars) if !vars.is_empty() => {
            let vars_json = serde_json::to_string(vars).unwrap_or_else(|_| "{}".to_string());
            format!(
                "jsonb_path_exists({}, '{}', '{}')",
                column,
                sql_escape(&path.query),
                sql_escape(&vars_json)
            )
        }
        _ => format!("{} @? '{}'", column, sql_escape(&path.query)),
    }
}

fn join_or(clauses: Vec<String>) -> String {
    if clauses.len() == 1 {
        clauses.into_iter().next().unwrap()
    } else {
        format!("({})", clauses.join(" OR "))
    }
}

/// Single quotes double inside SQL string literals.
fn sql_escape(s: &str) -> String {
    s.replace('\'', "''")
}

/// Escapes for a string inside a jsonpath double-quoted literal.
fn jsonpath_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Escapes for an element of a Postgres array literal.
fn array_element(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::{PlainSelector, SelectorInput};
    use serde_json::json;

    fn selector(input: serde_json::Value) -> Selector {
        serde_json::from_value::<SelectorInput>(input)
            .unwrap()
            .into_selector()
            .unwrap()
    }

    #[test]
    fn test_plain_selector_is_true() {
        assert_eq!(predicate(&Selector::Plain(PlainSelector::default())), "true");
    }

    #[test]
    fn test_entities_clause() {
        let s = selector(json!({"entities": {"order": ["o-1", "o-2"]}}));
        assert_eq!(
            predicate(&s),
            r#"(entities @? '$."order" ? (@=="o-1" || @=="o-2")')"#
        );
    }

    #[test]
    fn test_entities_joined_by_or_in_name_order() {
        let s = selector(json!({"entities": {"user": ["u-1"], "order": ["o-1"]}}));
        assert_eq!(
            predicate(&s),
            r#"((entities @? '$."order" ? (@=="o-1")' OR entities @? '$."user" ? (@=="u-1")'))"#
        );
    }

    #[test]
    fn test_meta_without_vars() {
        let s = selector(json!({"meta": {"query": "$.actor"}}));
        assert_eq!(predicate(&s), "(meta @? '$.actor')");
    }

    #[test]
    fn test_meta_with_vars() {
        let s = selector(json!({"meta": {"query": "$.n ? (@ > $min)", "vars": {"min": 3}}}));
        assert_eq!(
            predicate(&s),
            r#"(jsonb_path_exists(meta, '$.n ? (@ > $min)', '{"min":3}'))"#
        );
    }

    #[test]
    fn test_trivial_event_queries_collapse() {
        let s = selector(json!({"events": {"a": {"query": "$"}}}));
        assert_eq!(predicate(&s), "(event = 'a')");

        let s = selector(json!({"events": {"b": {"query": "$"}, "a": {"query": "$"}}}));
        assert_eq!(predicate(&s), r#"(event = ANY('{"a","b"}'))"#);
    }

    #[test]
    fn test_event_with_data_query() {
        let s = selector(json!({"events": {"order-placed": {"query": "$.total ? (@ > 10)"}}}));
        assert_eq!(
            predicate(&s),
            "((event = 'order-placed' AND data @? '$.total ? (@ > 10)'))"
        );
    }

    #[test]
    fn test_mixed_events_group() {
        let s = selector(json!({
            "events": {
                "a": {"query": "$"},
                "b": {"query": "$.x"}
            }
        }));
        assert_eq!(
            predicate(&s),
            "((event = 'a' OR (event = 'b' AND data @? '$.x')))"
        );
    }

    #[test]
    fn test_clause_groups_are_disjoined() {
        let s = selector(json!({
            "entities": {"order": ["o-1"]},
            "meta": {"query": "$.actor"},
            "events": {"a": {"query": "$"}}
        }));
        assert_eq!(
            predicate(&s),
            r#"(entities @? '$."order" ? (@=="o-1")' OR meta @? '$.actor' OR event = 'a')"#
        );
    }

    #[test]
    fn test_single_quote_doubling() {
        let s = selector(json!({"events": {"o'brien": {"query": "$"}}}));
        assert_eq!(predicate(&s), "(event = 'o''brien')");
    }

    #[test]
    fn test_determinism_under_input_reordering() {
        let a = selector(json!({"entities": {"b": ["2"], "a": ["1"]}}));
        let b = selector(json!({"entities": {"a": ["1"], "b": ["2"]}}));
        assert_eq!(predicate(&a), predicate(&b));
    }
}
