//! Binary selector codec.
//!
//! A canonical selector packs to a compact msgpack map — keys `a` (after, 16
//! raw bytes), `d` (events), `e` (entities), `l` (limit), `m` (meta), emitted
//! in sorted order with empty containers omitted — and the bytes encode to a
//! base64url token used in URIs and as the idempotent subscription key.
//! `decode(encode(s))` equals the canonical form of `s` for every selector.

use std::collections::BTreeMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{Map, Value as Json};

use super::{canonical_value, FilterSelector, JsonPathFilter, PlainSelector, Selector};
use crate::ledger::event_id::EventId;
use crate::Error;

const KEY_AFTER: &str = "a";
const KEY_EVENTS: &str = "d";
const KEY_ENTITIES: &str = "e";
const KEY_LIMIT: &str = "l";
const KEY_META: &str = "m";
const KEY_QUERY: &str = "q";
const KEY_VARS: &str = "v";

fn invalid() -> Error {
    Error::BadInput("invalid URI part".to_string())
}

/// Pack a selector into its canonical msgpack bytes.
pub fn pack(selector: &Selector) -> Vec<u8> {
    let canonical = selector.clone().canonical();
    let mut entries: Vec<(rmpv::Value, rmpv::Value)> = Vec::new();

    // Keys are appended in their lexicographic order: a, d, e, l, m.
    if let Some(after) = canonical.after() {
        entries.push((
            rmpv::Value::from(KEY_AFTER),
            rmpv::Value::Binary(after.to_bytes().to_vec()),
        ));
    }
    if let Selector::Filter(f) = &canonical {
        if !f.events.is_empty() {
            let events = f
                .events
                .iter()
                .map(|(name, filter)| {
                    (rmpv::Value::from(name.as_str()), filter_value(filter))
                })
                .collect();
            entries.push((rmpv::Value::from(KEY_EVENTS), rmpv::Value::Map(events)));
        }
        if !f.entities.is_empty() {
            let entities = f
                .entities
                .iter()
                .map(|(name, keys)| {
                    let keys = keys
                        .iter()
                        .map(|k| rmpv::Value::from(k.as_str()))
                        .collect();
                    (rmpv::Value::from(name.as_str()), rmpv::Value::Array(keys))
                })
                .collect();
            entries.push((rmpv::Value::from(KEY_ENTITIES), rmpv::Value::Map(entities)));
        }
    }
    if let Some(limit) = canonical.limit() {
        if limit > 0 {
            entries.push((rmpv::Value::from(KEY_LIMIT), rmpv::Value::from(limit)));
        }
    }
    if let Selector::Filter(f) = &canonical {
        if let Some(meta) = &f.meta {
            entries.push((rmpv::Value::from(KEY_META), filter_value(meta)));
        }
    }

    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, &rmpv::Value::Map(entries))
        .expect("msgpack encoding into a Vec cannot fail");
    buf
}

/// Encode a selector as its base64url URI token.
pub fn encode(selector: &Selector) -> String {
    URL_SAFE_NO_PAD.encode(pack(selector))
}

/// Decode a URI token back into a canonical selector.
pub fn decode(token: &str) -> Result<Selector, Error> {
    let bytes = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
    unpack(&bytes)
}

/// Unpack canonical msgpack bytes into a selector. Presence of any of the
/// `e`/`m`/`d` keys makes it a filter selector.
pub fn unpack(bytes: &[u8]) -> Result<Selector, Error> {
    let mut cursor = bytes;
    let value = rmpv::decode::read_value(&mut cursor).map_err(|_| invalid())?;
    if !cursor.is_empty() {
        return Err(invalid());
    }
    let entries = match value {
        rmpv::Value::Map(entries) => entries,
        _ => return Err(invalid()),
    };

    let mut after: Option<EventId> = None;
    let mut limit: Option<u32> = None;
    let mut entities: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut meta: Option<JsonPathFilter> = None;
    let mut events: BTreeMap<String, JsonPathFilter> = BTreeMap::new();
    let mut filtered = false;

    for (key, value) in entries {
        match key.as_str().ok_or_else(invalid)? {
            KEY_AFTER => {
                let bin = match &value {
                    rmpv::Value::Binary(b) if b.len() == 16 => b,
                    _ => return Err(invalid()),
                };
                let mut buf = [0u8; 16];
                buf.copy_from_slice(bin);
                after = Some(EventId::from_bytes(buf));
            }
            KEY_LIMIT => {
                let n = value.as_u64().ok_or_else(invalid)?;
                if n == 0 || n > u32::MAX as u64 {
                    return Err(invalid());
                }
                limit = Some(n as u32);
            }
            KEY_ENTITIES => {
                filtered = true;
                for (name, keys) in map_entries(value)? {
                    let keys = match keys {
                        rmpv::Value::Array(items) => items
                            .into_iter()
                            .map(|k| k.as_str().map(str::to_string).ok_or_else(invalid))
                            .collect::<Result<Vec<_>, _>>()?,
                        _ => return Err(invalid()),
                    };
                    if keys.is_empty() {
                        return Err(invalid());
                    }
                    entities.insert(name, keys);
                }
            }
            KEY_META => {
                filtered = true;
                meta = Some(read_filter(value)?);
            }
            KEY_EVENTS => {
                filtered = true;
                for (name, filter) in map_entries(value)? {
                    events.insert(name, read_filter(filter)?);
                }
            }
            _ => return Err(invalid()),
        }
    }

    let selector = if filtered {
        Selector::Filter(FilterSelector {
            after,
            limit,
            entities,
            meta,
            events,
        })
    } else {
        Selector::Plain(PlainSelector { after, limit })
    };
    Ok(selector.canonical())
}

fn filter_value(filter: &JsonPathFilter) -> rmpv::Value {
    let mut entries = vec![(
        rmpv::Value::from(KEY_QUERY),
        rmpv::Value::from(filter.query.as_str()),
    )];
    if let Some(vars) = &filter.vars {
        if !vars.is_empty() {
            entries.push((
                rmpv::Value::from(KEY_VARS),
                json_to_msgpack(&Json::Object(vars.clone())),
            ));
        }
    }
    rmpv::Value::Map(entries)
}

fn read_filter(value: rmpv::Value) -> Result<JsonPathFilter, Error> {
    let mut query: Option<String> = None;
    let mut vars: Option<Map<String, Json>> = None;
    for (key, value) in map_entries(value)? {
        match key.as_str() {
            KEY_QUERY => {
                query = Some(value.as_str().map(str::to_string).ok_or_else(invalid)?);
            }
            KEY_VARS => match canonical_value(msgpack_to_json(&value)?) {
                Json::Object(m) if !m.is_empty() => vars = Some(m),
                Json::Object(_) => {}
                _ => return Err(invalid()),
            },
            _ => return Err(invalid()),
        }
    }
    Ok(JsonPathFilter {
        query: query.ok_or_else(invalid)?,
        vars,
    })
}

fn map_entries(value: rmpv::Value) -> Result<Vec<(String, rmpv::Value)>, Error> {
    match value {
        rmpv::Value::Map(entries) => entries
            .into_iter()
            .map(|(k, v)| {
                k.as_str()
                    .map(|k| (k.to_string(), v))
                    .ok_or_else(invalid)
            })
            .collect(),
        _ => Err(invalid()),
    }
}

/// JSON → msgpack for variable objects. The input is already canonical, so
/// plain iteration keeps the byte output deterministic.
fn json_to_msgpack(value: &Json) -> rmpv::Value {
    match value {
        Json::Null => rmpv::Value::Nil,
        Json::Bool(b) => rmpv::Value::from(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                rmpv::Value::from(i)
            } else if let Some(u) = n.as_u64() {
                rmpv::Value::from(u)
            } else {
                rmpv::Value::from(n.as_f64().unwrap_or(0.0))
            }
        }
        Json::String(s) => rmpv::Value::from(s.as_str()),
        Json::Array(items) => {
            rmpv::Value::Array(items.iter().map(json_to_msgpack).collect())
        }
        Json::Object(map) => rmpv::Value::Map(
            map.iter()
                .map(|(k, v)| (rmpv::Value::from(k.as_str()), json_to_msgpack(v)))
                .collect(),
        ),
    }
}

fn msgpack_to_json(value: &rmpv::Value) -> Result<Json, Error> {
    Ok(match value {
        rmpv::Value::Nil => Json::Null,
        rmpv::Value::Boolean(b) => Json::Bool(*b),
        rmpv::Value::Integer(i) => {
            if let Some(n) = i.as_i64() {
                Json::from(n)
            } else if let Some(n) = i.as_u64() {
                Json::from(n)
            } else {
                return Err(invalid());
            }
        }
        rmpv::Value::F32(f) => {
            Json::Number(serde_json::Number::from_f64(*f as f64).ok_or_else(invalid)?)
        }
        rmpv::Value::F64(f) => {
            Json::Number(serde_json::Number::from_f64(*f).ok_or_else(invalid)?)
        }
        rmpv::Value::String(s) => Json::String(s.as_str().ok_or_else(invalid)?.to_string()),
        rmpv::Value::Array(items) => Json::Array(
            items
                .iter()
                .map(msgpack_to_json)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        rmpv::Value::Map(entries) => {
            let mut map = Map::new();
            for (k, v) in entries {
                let key = k.as_str().ok_or_else(invalid)?.to_string();
                map.insert(key, msgpack_to_json(v)?);
            }
            Json::Object(map)
        }
        _ => return Err(invalid()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::event_id::LedgerId;
    use serde_json::json;

    fn filter_selector() -> Selector {
        let mut entities = BTreeMap::new();
        entities.insert("order".to_string(), vec!["o-1".to_string(), "o-2".to_string()]);
        let mut events = BTreeMap::new();
        events.insert(
            "order-placed".to_string(),
            JsonPathFilter {
                query: "$.total ? (@ > $min)".to_string(),
                vars: Some(
                    json!({"min": 10}).as_object().cloned().unwrap(),
                ),
            },
        );
        Selector::Filter(FilterSelector {
            after: Some(EventId::new(1_700_000_000_000_000, 42, LedgerId(7))),
            limit: Some(50),
            entities,
            meta: Some(JsonPathFilter {
                query: "$.actor".to_string(),
                vars: None,
            }),
            events,
        })
    }

    #[test]
    fn test_roundtrip_plain() {
        let s = Selector::Plain(PlainSelector {
            after: Some(EventId::new(5, 6, LedgerId(7))),
            limit: Some(3),
        });
        assert_eq!(decode(&encode(&s)).unwrap(), s);
    }

    #[test]
    fn test_roundtrip_empty_plain() {
        let s = Selector::Plain(PlainSelector::default());
        assert_eq!(decode(&encode(&s)).unwrap(), s);
    }

    #[test]
    fn test_roundtrip_filter() {
        let s = filter_selector();
        assert_eq!(decode(&encode(&s)).unwrap(), s.clone().canonical());
    }

    #[test]
    fn test_token_is_urlsafe() {
        let token = encode(&filter_selector());
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_encoding_stable_under_vars_key_reordering() {
        let build = |vars: Json| {
            let mut events = BTreeMap::new();
            events.insert(
                "x".to_string(),
                JsonPathFilter {
                    query: "$.a ? (@ == $p || @ == $q)".to_string(),
                    vars: vars.as_object().cloned(),
                },
            );
            Selector::Filter(FilterSelector {
                events,
                ..Default::default()
            })
        };
        let a = build(json!({"p": 1, "q": {"zz": 1, "aa": 2}}));
        let b = build(json!({"q": {"aa": 2, "zz": 1}, "p": 1}));
        assert_eq!(encode(&a), encode(&b));
    }

    #[test]
    fn test_limit_zero_is_rejected() {
        // A forged token carrying l=0 does not decode.
        let map = rmpv::Value::Map(vec![(rmpv::Value::from("l"), rmpv::Value::from(0u32))]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &map).unwrap();
        assert!(unpack(&buf).is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode("not base64 !!").is_err());
        assert!(decode(&URL_SAFE_NO_PAD.encode(b"\x01\x02\x03")).is_err());
        // A non-map top level value.
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &rmpv::Value::from("x")).unwrap();
        assert!(decode(&URL_SAFE_NO_PAD.encode(&buf)).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_keys() {
        let map = rmpv::Value::Map(vec![(rmpv::Value::from("z"), rmpv::Value::from(1u32))]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &map).unwrap();
        assert!(unpack(&buf).is_err());
    }

    #[test]
    fn test_after_survives_bit_exact() {
        let after = EventId::new(u64::MAX - 1, u32::MAX, LedgerId(u32::MAX));
        let s = Selector::Plain(PlainSelector {
            after: Some(after),
            limit: None,
        });
        match decode(&encode(&s)).unwrap() {
            Selector::Plain(p) => assert_eq!(p.after, Some(after)),
            _ => panic!("expected plain selector"),
        }
    }
}
