use axum::body::{Body, Bytes};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{Map, Value};

use crate::ledger::events::PersistedEvent;
use crate::Error;

pub const HAL_CONTENT_TYPE: &str = "application/hal+json";
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson; charset=utf-8";

/// Flush threshold for NDJSON response chunks; aligns back-pressure with the
/// HTTP response writer.
const HIGH_WATER_MARK: usize = 16 * 1024;

/// HAL-JSON response builder: `_links` plus flat body fields.
#[derive(Debug, Default)]
pub struct Hal {
    links: Vec<(&'static str, String)>,
    body: Map<String, Value>,
}

impl Hal {
    pub fn new(self_href: impl Into<String>) -> Hal {
        Hal::default().link("self", self_href)
    }

    pub fn link(mut self, rel: &'static str, href: impl Into<String>) -> Hal {
        self.links.push((rel, href.into()));
        self
    }

    pub fn field(mut self, name: &str, value: Value) -> Hal {
        self.body.insert(name.to_string(), value);
        self
    }

    fn into_value(self) -> Value {
        let mut links = Map::new();
        for (rel, href) in self.links {
            let mut link = Map::new();
            link.insert("href".to_string(), Value::String(href));
            links.insert(rel.to_string(), Value::Object(link));
        }
        let mut body = Map::new();
        body.insert("_links".to_string(), Value::Object(links));
        for (name, value) in self.body {
            body.insert(name, value);
        }
        Value::Object(body)
    }
}

impl IntoResponse for Hal {
    fn into_response(self) -> Response {
        match serde_json::to_vec_pretty(&self.into_value()) {
            Ok(bytes) => ([(header::CONTENT_TYPE, HAL_CONTENT_TYPE)], bytes).into_response(),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                e.to_string(),
            )
                .into_response(),
        }
    }
}

/// NDJSON chunking: one JSON line per event, flushed whenever the running
/// buffer passes the high-water mark. A mid-stream failure terminates the
/// body; the status line has already been sent.
pub fn ndjson_chunks(
    events: BoxStream<'static, Result<PersistedEvent, Error>>,
) -> BoxStream<'static, Result<Bytes, std::convert::Infallible>> {
    let stream = async_stream::stream! {
        let mut events = events;
        let mut buf: Vec<u8> = Vec::with_capacity(HIGH_WATER_MARK + 1024);
        while let Some(event) = events.next().await {
            match event {
                Ok(event) => match serde_json::to_vec(&event) {
                    Ok(line) => {
                        buf.extend_from_slice(&line);
                        buf.push(b'\n');
                        if buf.len() >= HIGH_WATER_MARK {
                            yield Ok(Bytes::from(std::mem::take(&mut buf)));
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to serialize event");
                        break;
                    }
                },
                Err(e) => {
                    tracing::warn!(error = %e, "selector stream failed mid-response");
                    break;
                }
            }
        }
        if !buf.is_empty() {
            yield Ok(Bytes::from(buf));
        }
    };
    stream.boxed()
}

pub fn ndjson_body(events: BoxStream<'static, Result<PersistedEvent, Error>>) -> Body {
    Body::from_stream(ndjson_chunks(events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::event_id::{EventId, LedgerId};
    use futures::stream;
    use serde_json::json;

    fn event(n: u64) -> PersistedEvent {
        PersistedEvent::new(
            EventId::new(n, 0, LedgerId(1)),
            "order-placed".to_string(),
            json!({"order": [format!("o-{n}")]}),
            Value::Null,
            json!({"n": n}),
        )
    }

    #[tokio::test]
    async fn test_ndjson_recovers_each_event() {
        let events: Vec<Result<PersistedEvent, Error>> = (0..250).map(|n| Ok(event(n))).collect();
        let chunks: Vec<Bytes> = ndjson_chunks(stream::iter(events).boxed())
            .map(|c| c.unwrap())
            .collect()
            .await;
        let joined: Vec<u8> = chunks.concat();
        let text = String::from_utf8(joined).unwrap();
        assert!(text.ends_with('\n'));

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 250);
        for (n, line) in lines.iter().enumerate() {
            let parsed: PersistedEvent = serde_json::from_str(line).unwrap();
            assert_eq!(parsed, event(n as u64));
        }
    }

    #[tokio::test]
    async fn test_ndjson_stops_on_stream_error() {
        let events: Vec<Result<PersistedEvent, Error>> = vec![
            Ok(event(1)),
            Err(Error::Internal("boom".to_string())),
            Ok(event(2)),
        ];
        let chunks: Vec<Bytes> = ndjson_chunks(stream::iter(events).boxed())
            .map(|c| c.unwrap())
            .collect()
            .await;
        let text = String::from_utf8(chunks.concat()).unwrap();
        assert_eq!(text.lines().count(), 1);
    }

    #[test]
    fn test_hal_shape() {
        let hal = Hal::new("/x").link("other", "/y").field("name", json!("n"));
        let value = hal.into_value();
        assert_eq!(value["_links"]["self"]["href"], "/x");
        assert_eq!(value["_links"]["other"]["href"], "/y");
        assert_eq!(value["name"], "n");
    }
}
