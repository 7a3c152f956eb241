//! Notification channel endpoints and the SSE stream.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use super::auth::{Action, Auth, Claims};
use super::error::ApiError;
use super::types::Hal;
use crate::ledger::event_id::LedgerId;
use crate::selector::SelectorInput;
use crate::AppState;

/// Milliseconds clients should wait before an SSE reconnect.
const SSE_RETRY: Duration = Duration::from_millis(10_000);

fn notify_ledger(claims: &Claims) -> Result<LedgerId, ApiError> {
    claims.require(Action::Notify)?;
    claims.ledger_id()
}

/// GET /notify
pub async fn index(Auth(claims): Auth) -> Result<Hal, ApiError> {
    notify_ledger(&claims)?;
    Ok(Hal::new("/notify").link("open-channel", "/notify/open-channel"))
}

/// POST /notify/open-channel
#[tracing::instrument(skip_all)]
pub async fn open_channel(
    State(state): State<Arc<AppState>>,
    Auth(claims): Auth,
) -> Result<Response, ApiError> {
    let ledger = notify_ledger(&claims)?;
    let channel_id = state.channels.open(ledger);
    metrics::counter!("notify_channels_opened_total").increment(1);
    let href = format!("/notify/{channel_id}");
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, href.clone())],
        Hal::new(href).field("channelId", json!(channel_id)),
    )
        .into_response())
}

/// GET /notify/{ch}
#[tracing::instrument(skip_all)]
pub async fn channel(
    State(state): State<Arc<AppState>>,
    Auth(claims): Auth,
    Path(channel_id): Path<String>,
) -> Result<Hal, ApiError> {
    let ledger = notify_ledger(&claims)?;
    state
        .channels
        .channel(ledger, &channel_id)
        .ok_or_else(|| ApiError::NotFound(format!("channel '{channel_id}' not found")))?;
    let subscriptions: Vec<_> = state
        .channels
        .subscriptions(ledger, &channel_id)?
        .into_iter()
        .map(|sub| {
            json!({
                "subscriptionId": sub.id,
                "selector": SelectorInput::from_selector(&sub.selector),
            })
        })
        .collect();
    let href = format!("/notify/{channel_id}");
    Ok(Hal::new(href.clone())
        .link("sse", format!("{href}/sse"))
        .link("subscribe", format!("{href}/subscribe"))
        .field("channelId", json!(channel_id))
        .field("subscriptions", json!(subscriptions)))
}

/// DELETE /notify/{ch}
#[tracing::instrument(skip_all)]
pub async fn close_channel(
    State(state): State<Arc<AppState>>,
    Auth(claims): Auth,
    Path(channel_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let ledger = notify_ledger(&claims)?;
    state.channels.close(ledger, &channel_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /notify/{ch}/subscribe
#[tracing::instrument(skip_all)]
pub async fn subscribe(
    State(state): State<Arc<AppState>>,
    Auth(claims): Auth,
    Path(channel_id): Path<String>,
    Json(input): Json<SelectorInput>,
) -> Result<Response, ApiError> {
    let ledger = notify_ledger(&claims)?;
    let selector = input.into_selector()?;
    let subscription_id = state.channels.subscribe(ledger, &channel_id, &selector)?;
    metrics::counter!("notify_subscriptions_total").increment(1);
    let href = format!("/notify/{channel_id}/subscriptions/{subscription_id}");
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, href.clone())],
        Hal::new(href).field("subscriptionId", json!(subscription_id)),
    )
        .into_response())
}

/// GET /notify/{ch}/subscriptions/{sid}
#[tracing::instrument(skip_all)]
pub async fn subscription(
    State(state): State<Arc<AppState>>,
    Auth(claims): Auth,
    Path((channel_id, subscription_id)): Path<(String, String)>,
) -> Result<Hal, ApiError> {
    let ledger = notify_ledger(&claims)?;
    let sub = state
        .channels
        .subscription(ledger, &channel_id, &subscription_id)?;
    Ok(
        Hal::new(format!("/notify/{channel_id}/subscriptions/{subscription_id}"))
            .field("subscriptionId", json!(sub.id))
            .field("selector", json!(SelectorInput::from_selector(&sub.selector))),
    )
}

/// DELETE /notify/{ch}/subscriptions/{sid}
#[tracing::instrument(skip_all)]
pub async fn unsubscribe(
    State(state): State<Arc<AppState>>,
    Auth(claims): Auth,
    Path((channel_id, subscription_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    let ledger = notify_ledger(&claims)?;
    state
        .channels
        .unsubscribe(ledger, &channel_id, &subscription_id)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /notify/{ch}/sse
///
/// One message per event that matches at least one of the channel's
/// subscriptions: `id` is the event id, `data` the comma-joined matched
/// subscription ids. Catch-up is unsupported, so `Last-Event-Id` rejects.
#[tracing::instrument(skip_all)]
pub async fn sse(
    State(state): State<Arc<AppState>>,
    Auth(claims): Auth,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let ledger = notify_ledger(&claims)?;
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok());
    let mut stream = state
        .channels
        .open_event_stream(ledger, &channel_id, last_event_id)?;
    metrics::counter!("notify_sse_streams_total").increment(1);

    let messages = async_stream::stream! {
        while let Some(event) = stream.recv().await {
            let matched = stream.channel().matched_subscriptions(&event);
            if matched.is_empty() {
                continue;
            }
            yield Ok::<Event, Infallible>(
                Event::default()
                    .id(event.event_id.clone())
                    .event("Subscriptions Triggered")
                    .data(matched.join(","))
                    .retry(SSE_RETRY),
            );
        }
    };

    Ok(Sse::new(messages)
        .keep_alive(KeepAlive::default())
        .into_response())
}
