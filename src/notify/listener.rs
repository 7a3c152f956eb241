//! Upstream listener: a single LISTEN on the database's `ALL_EVENTS`
//! channel, demultiplexed to every open SSE stream.
//!
//! Notification payloads are CSV:
//! `ledgerId,timestamp,checksum,event,entities[,meta[,data]]`. Fields are
//! bare, single-quoted with SQL-style doubled quotes, or `E'…'`-prefixed
//! (which takes an extra backslash un-escape pass). Meta and data are elided
//! when the payload would exceed the database's notification size limit and
//! are fetched separately.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sqlx::postgres::PgListener;

use super::Channels;
use crate::db::Db;
use crate::ledger::event_id::{EventId, LedgerId};
use crate::ledger::events::PersistedEvent;

pub const NOTIFY_CHANNEL: &str = "ALL_EVENTS";

#[derive(Debug, PartialEq)]
pub struct RawNotification {
    pub ledger: LedgerId,
    pub timestamp: u64,
    pub checksum: u32,
    pub event: String,
    pub entities: Value,
    pub meta: Option<Value>,
    pub data: Option<Value>,
}

/// Run the listener until the task is aborted. Reconnects with a short
/// backoff on connection loss.
pub async fn run(db: Db, channels: Arc<Channels>) {
    loop {
        match listen(&db, &channels).await {
            Ok(()) => {}
            Err(e) => {
                tracing::warn!(error = %e, "event listener disconnected, retrying");
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn listen(db: &Db, channels: &Channels) -> Result<(), sqlx::Error> {
    let mut listener = PgListener::connect_with(db.pool()).await?;
    listener.listen(NOTIFY_CHANNEL).await?;
    tracing::info!(channel = NOTIFY_CHANNEL, "listening for appended events");

    loop {
        let notification = listener.recv().await?;
        match parse_notification(notification.payload()) {
            Ok(raw) => deliver(db, channels, raw).await,
            Err(e) => {
                tracing::warn!(error = %e, payload = notification.payload(), "unparsable notification");
            }
        }
        metrics::counter!("notifications_received_total").increment(1);
    }
}

async fn deliver(db: &Db, channels: &Channels, raw: RawNotification) {
    let (meta, data) = if raw.meta.is_none() || raw.data.is_none() {
        match db
            .fetch_missing_data(
                &raw.ledger.to_string(),
                raw.timestamp as i64,
                raw.meta.is_none(),
            )
            .await
        {
            Ok((meta, data)) => (raw.meta.or(meta), raw.data.or(data)),
            Err(e) => {
                tracing::warn!(error = %e, "failed to fetch elided notification payload");
                (raw.meta, raw.data)
            }
        }
    } else {
        (raw.meta, raw.data)
    };

    let event = PersistedEvent::new(
        EventId::new(raw.timestamp, raw.checksum, raw.ledger),
        raw.event,
        raw.entities,
        meta.unwrap_or(Value::Null),
        data.unwrap_or(Value::Null),
    );
    channels.dispatch(raw.ledger, Arc::new(event));
}

/// Parse one notification payload.
pub fn parse_notification(payload: &str) -> Result<RawNotification, String> {
    let fields = parse_fields(payload)?;
    if fields.len() < 5 || fields.len() > 7 {
        return Err(format!("expected 5 to 7 fields, got {}", fields.len()));
    }

    let ledger: LedgerId = fields[0]
        .parse()
        .map_err(|_| format!("invalid ledger id '{}'", fields[0]))?;
    let timestamp: u64 = fields[1]
        .parse()
        .map_err(|_| format!("invalid timestamp '{}'", fields[1]))?;
    let checksum: u64 = fields[2]
        .parse()
        .map_err(|_| format!("invalid checksum '{}'", fields[2]))?;
    if checksum > u32::MAX as u64 {
        return Err(format!("checksum '{checksum}' out of range"));
    }
    let entities: Value = serde_json::from_str(&fields[4])
        .map_err(|e| format!("invalid entities JSON: {e}"))?;
    let meta = match fields.get(5) {
        Some(raw) => Some(serde_json::from_str(raw).map_err(|e| format!("invalid meta JSON: {e}"))?),
        None => None,
    };
    let data = match fields.get(6) {
        Some(raw) => Some(serde_json::from_str(raw).map_err(|e| format!("invalid data JSON: {e}"))?),
        None => None,
    };

    Ok(RawNotification {
        ledger,
        timestamp,
        checksum: checksum as u32,
        event: fields[3].clone(),
        entities,
        meta,
        data,
    })
}

/// Split a payload on commas, honoring bare fields, `'…'` quoting with
/// doubled-quote escapes, and the `E'…'` form.
fn parse_fields(payload: &str) -> Result<Vec<String>, String> {
    let bytes = payload.as_bytes();
    let mut fields = Vec::new();
    let mut i = 0;

    loop {
        let escaped_literal = bytes.get(i) == Some(&b'E') && bytes.get(i + 1) == Some(&b'\'');
        if escaped_literal {
            i += 1;
        }
        if bytes.get(i) == Some(&b'\'') {
            let (field, next) = parse_quoted(payload, i)?;
            let field = if escaped_literal {
                unescape_backslashes(&field)
            } else {
                field
            };
            fields.push(field);
            i = next;
            match bytes.get(i) {
                None => return Ok(fields),
                Some(b',') => i += 1,
                Some(other) => {
                    return Err(format!("expected ',' after quoted field, got '{}'", *other as char))
                }
            }
        } else {
            let end = payload[i..]
                .find(',')
                .map(|off| i + off)
                .unwrap_or(payload.len());
            fields.push(payload[i..end].to_string());
            if end == payload.len() {
                return Ok(fields);
            }
            i = end + 1;
        }
    }
}

/// Parse a single-quoted field starting at `start`; doubled quotes escape.
/// Returns the unquoted content and the index just past the closing quote.
fn parse_quoted(payload: &str, start: usize) -> Result<(String, usize), String> {
    let bytes = payload.as_bytes();
    let mut out = String::new();
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == b'\'' {
            if bytes.get(i + 1) == Some(&b'\'') {
                out.push('\'');
                i += 2;
            } else {
                return Ok((out, i + 1));
            }
        } else {
            // Payloads are UTF-8; copy the whole code point.
            let ch_len = utf8_len(bytes[i]);
            out.push_str(&payload[i..i + ch_len]);
            i += ch_len;
        }
    }
    Err("unterminated quoted field".to_string())
}

fn utf8_len(first: u8) -> usize {
    match first {
        b if b < 0x80 => 1,
        b if b >= 0xf0 => 4,
        b if b >= 0xe0 => 3,
        _ => 2,
    }
}

/// The extra pass for `E'…'` literals.
fn unescape_backslashes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_bare_fields() {
        let raw = parse_notification(
            r#"0000002a,1700000000000000,42,order-placed,{"order":["o-1"]},null,{"total":1}"#,
        )
        .unwrap();
        assert_eq!(raw.ledger, LedgerId(0x2a));
        assert_eq!(raw.timestamp, 1_700_000_000_000_000);
        assert_eq!(raw.checksum, 42);
        assert_eq!(raw.event, "order-placed");
        assert_eq!(raw.entities, json!({"order": ["o-1"]}));
        assert_eq!(raw.meta, Some(Value::Null));
        assert_eq!(raw.data, Some(json!({"total": 1})));
    }

    #[test]
    fn test_parse_quoted_field_with_doubled_quotes() {
        let raw = parse_notification(
            r#"00000001,1,2,noted,{},'{"note":"it''s fine"}'"#,
        )
        .unwrap();
        assert_eq!(raw.meta, Some(json!({"note": "it's fine"})));
        assert_eq!(raw.data, None);
    }

    #[test]
    fn test_parse_escaped_literal() {
        let raw = parse_notification(
            "00000001,1,2,noted,{},E'{\"s\":\"a\\nb\"}'",
        )
        .unwrap();
        assert_eq!(raw.meta, Some(json!({"s": "a\nb"})));
    }

    #[test]
    fn test_escaped_literal_backslash_and_quote() {
        assert_eq!(unescape_backslashes(r"it\'s"), "it's");
        assert_eq!(unescape_backslashes(r"a\\b"), r"a\b");
    }

    #[test]
    fn test_elided_meta_and_data_are_detected() {
        let raw = parse_notification(r#"00000001,1,2,big-one,{"order":["o-1"]}"#).unwrap();
        assert!(raw.meta.is_none());
        assert!(raw.data.is_none());

        let raw = parse_notification(r#"00000001,1,2,big-one,{},{"m":1}"#).unwrap();
        assert!(raw.meta.is_some());
        assert!(raw.data.is_none());
    }

    #[test]
    fn test_quoted_event_name() {
        let raw = parse_notification("00000001,1,2,'odd, name',{}").unwrap();
        assert_eq!(raw.event, "odd, name");
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(parse_notification("").is_err());
        assert!(parse_notification("1,2,3").is_err());
        assert!(parse_notification("zzzzzzzz,1,2,x,{}").is_err());
        assert!(parse_notification("00000001,nope,2,x,{}").is_err());
        assert!(parse_notification("00000001,1,2,x,not json").is_err());
        assert!(parse_notification("00000001,1,2,'unterminated,{}").is_err());
        assert!(parse_notification("00000001,1,2,x,{},1,2,3").is_err());
    }
}
