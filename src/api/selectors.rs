//! Selector lookup and streaming endpoints.
//!
//! The ETag of a selector representation is the hex of the position event id
//! in double quotes; it changes exactly when a later matching event appears.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use super::auth::{Action, Auth};
use super::error::ApiError;
use super::types::{ndjson_body, NDJSON_CONTENT_TYPE};
use crate::ledger::event_id::EventId;
use crate::ledger::events::Ledger;
use crate::selector::{codec, Selector, SelectorInput};
use crate::AppState;

pub fn selector_uri(selector: &Selector) -> String {
    format!("/selectors/{}.ndjson", codec::encode(selector))
}

/// Decode the `{select}.ndjson` path segment.
pub(super) fn decode_token(select: &str) -> Result<Selector, ApiError> {
    let token = select
        .strip_suffix(".ndjson")
        .ok_or_else(|| ApiError::NotFound(format!("no representation for '{select}'")))?;
    Ok(codec::decode(token)?)
}

fn quoted_etag(position: EventId) -> String {
    format!("\"{}\"", position.hex())
}

fn selector_headers(
    selector: &Selector,
    position: EventId,
    base: &str,
) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    let value = |s: &str| HeaderValue::from_str(s).map_err(ApiError::internal);

    headers.insert(header::ETAG, value(&quoted_etag(position))?);
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("private,max-age=0"),
    );
    let start = codec::encode(selector);
    let current = codec::encode(&selector.with_after(position));
    headers.insert(
        header::LINK,
        value(&format!(
            "<{base}/{start}.ndjson>; rel=\"start\", <{base}/{current}.ndjson>; rel=\"current\""
        ))?,
    );
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(NDJSON_CONTENT_TYPE));
    Ok(headers)
}

fn if_none_match_hits(request: &HeaderMap, etag: &str) -> bool {
    request
        .get_all(header::IF_NONE_MATCH)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .any(|candidate| candidate == etag || candidate == "*")
}

/// Shared HEAD path: position only, empty body.
pub(super) async fn head_response(
    state: &AppState,
    ledger: &Ledger,
    selector: &Selector,
    base: &str,
) -> Result<Response, ApiError> {
    let position = state.source.latest_event_id(ledger, selector).await?;
    let headers = selector_headers(selector, position, base)?;
    Ok((StatusCode::OK, headers).into_response())
}

/// Shared GET path: run the selector, 304 on a matching `If-None-Match`,
/// otherwise stream NDJSON.
pub(super) async fn get_response(
    state: &AppState,
    ledger: &Ledger,
    selector: &Selector,
    base: &str,
    request_headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let selection = state.source.run(ledger, selector).await?;
    let headers = selector_headers(selector, selection.position, base)?;

    if if_none_match_hits(request_headers, &quoted_etag(selection.position)) {
        // Matching ETag: drop the event stream unconsumed.
        return Ok((StatusCode::NOT_MODIFIED, headers).into_response());
    }
    Ok((StatusCode::OK, headers, ndjson_body(selection.events)).into_response())
}

/// HEAD /selectors/{select}.ndjson
#[tracing::instrument(skip_all)]
pub async fn head(
    State(state): State<Arc<AppState>>,
    Auth(claims): Auth,
    Path(select): Path<String>,
) -> Result<Response, ApiError> {
    claims.require(Action::Read)?;
    let selector = decode_token(&select)?;
    let ledger = super::claim_ledger(&state, &claims).await?;
    head_response(&state, &ledger, &selector, "/selectors").await
}

/// GET /selectors/{select}.ndjson
#[tracing::instrument(skip_all)]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Auth(claims): Auth,
    Path(select): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    claims.require(Action::Read)?;
    let selector = decode_token(&select)?;
    let ledger = super::claim_ledger(&state, &claims).await?;
    metrics::counter!("api_requests_total", "endpoint" => "selectors").increment(1);
    get_response(&state, &ledger, &selector, "/selectors", &headers).await
}

/// POST /selectors — look up the URI for a filter selector, or stream it
/// inline under `Prefer: return=representation`.
#[tracing::instrument(skip_all)]
pub async fn lookup(
    State(state): State<Arc<AppState>>,
    Auth(claims): Auth,
    headers: HeaderMap,
    Json(input): Json<SelectorInput>,
) -> Result<Response, ApiError> {
    claims.require(Action::Read)?;
    let ledger = super::claim_ledger(&state, &claims).await?;
    let selector = input.into_selector()?;
    if matches!(selector, Selector::Plain(_)) {
        return Err(ApiError::Unprocessable(
            "lookup requires at least one filter clause; plain selectors are served by ledger download"
                .to_string(),
        ));
    }
    let uri = selector_uri(&selector);

    if prefers_representation(&headers) {
        let mut response =
            get_response(&state, &ledger, &selector, "/selectors", &headers).await?;
        response.headers_mut().insert(
            header::CONTENT_LOCATION,
            HeaderValue::from_str(&uri).map_err(ApiError::internal)?,
        );
        response.headers_mut().insert(
            axum::http::HeaderName::from_static("preference-applied"),
            HeaderValue::from_static("return=representation"),
        );
        return Ok(response);
    }

    Ok((StatusCode::SEE_OTHER, [(header::LOCATION, uri)]).into_response())
}

pub(super) fn prefers_representation(headers: &HeaderMap) -> bool {
    headers
        .get_all("prefer")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.split(',').any(|p| p.trim() == "return=representation"))
}
