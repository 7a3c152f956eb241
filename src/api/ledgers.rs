//! Ledger administration and download endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::auth::{Action, Auth};
use super::error::ApiError;
use super::selectors;
use super::types::Hal;
use crate::ledger::event_id::EventId;
use crate::ledger::events::Ledger;
use crate::selector::{codec, Selector, SelectorInput};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateLedgerRequest {
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct ResetRequest {
    #[serde(default)]
    after: Option<String>,
}

/// GET /ledgers
pub async fn index(Auth(claims): Auth) -> Result<Hal, ApiError> {
    claims.require(Action::LedgerAdmin)?;
    Ok(Hal::new("/ledgers").link("create-ledger", "/ledgers/create-ledger"))
}

/// POST /ledgers/create-ledger
#[tracing::instrument(skip_all, fields(name = %request.name))]
pub async fn create(
    State(state): State<Arc<AppState>>,
    Auth(claims): Auth,
    Json(request): Json<CreateLedgerRequest>,
) -> Result<Response, ApiError> {
    claims.require(Action::LedgerAdmin)?;
    let id = state
        .ledgers
        .create(&request.name, &request.description)
        .await?;
    metrics::counter!("ledgers_created_total").increment(1);
    let href = format!("/ledgers/{id}");
    Ok((
        StatusCode::CREATED,
        [(header::LOCATION, href.clone())],
        Hal::new(href)
            .field("id", json!(id.to_string()))
            .field("name", json!(request.name)),
    )
        .into_response())
}

/// GET /ledgers/{id}
#[tracing::instrument(skip_all)]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Auth(claims): Auth,
    Path(id): Path<String>,
) -> Result<Hal, ApiError> {
    claims.require(Action::LedgerAdmin)?;
    let ledger = resolve(&state, &id).await?;
    let events = state.ledgers.event_count(ledger.id).await?;
    let href = format!("/ledgers/{}", ledger.id);
    Ok(Hal::new(href.clone())
        .link("download", format!("{href}/download"))
        .link("reset", format!("{href}/reset"))
        .field("id", json!(ledger.id.to_string()))
        .field("name", json!(ledger.name))
        .field("description", json!(ledger.description))
        .field("genesis", json!(ledger.genesis.hex()))
        .field("events", json!(events)))
}

/// DELETE /ledgers/{id}
#[tracing::instrument(skip_all)]
pub async fn remove(
    State(state): State<Arc<AppState>>,
    Auth(claims): Auth,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    claims.require(Action::LedgerAdmin)?;
    let ledger = resolve(&state, &id).await?;
    state.ledgers.remove(ledger.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /ledgers/{id}/reset
#[tracing::instrument(skip_all)]
pub async fn reset(
    State(state): State<Arc<AppState>>,
    Auth(claims): Auth,
    Path(id): Path<String>,
    Json(request): Json<ResetRequest>,
) -> Result<StatusCode, ApiError> {
    claims.require(Action::LedgerAdmin)?;
    let ledger = resolve(&state, &id).await?;
    let after = match request.after {
        Some(hex) => Some(
            EventId::parse_hex(&hex)
                .ok_or_else(|| ApiError::BadRequest(format!("invalid event id: {hex}")))?,
        ),
        None => None,
    };
    state.ledgers.reset(ledger.id, after).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /ledgers/{id}/download — look up the URI of a plain selector over
/// the whole ledger.
#[tracing::instrument(skip_all)]
pub async fn download_lookup(
    State(state): State<Arc<AppState>>,
    Auth(claims): Auth,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(input): Json<SelectorInput>,
) -> Result<Response, ApiError> {
    claims.require(Action::LedgerAdmin)?;
    let ledger = resolve(&state, &id).await?;
    let selector = plain_only(input.into_selector()?)?;
    let base = format!("/ledgers/{}/download", ledger.id);
    let uri = format!("{base}/{}.ndjson", codec::encode(&selector));

    if selectors::prefers_representation(&headers) {
        let mut response =
            selectors::get_response(&state, &ledger, &selector, &base, &headers).await?;
        response.headers_mut().insert(
            header::CONTENT_LOCATION,
            HeaderValue::from_str(&uri).map_err(ApiError::internal)?,
        );
        return Ok(response);
    }
    Ok((StatusCode::SEE_OTHER, [(header::LOCATION, uri)]).into_response())
}

/// HEAD /ledgers/{id}/download/{select}.ndjson
#[tracing::instrument(skip_all)]
pub async fn download_head(
    State(state): State<Arc<AppState>>,
    Auth(claims): Auth,
    Path((id, select)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    claims.require(Action::LedgerAdmin)?;
    let ledger = resolve(&state, &id).await?;
    let selector = plain_only(selectors::decode_token(&select)?)?;
    let base = format!("/ledgers/{}/download", ledger.id);
    selectors::head_response(&state, &ledger, &selector, &base).await
}

/// GET /ledgers/{id}/download/{select}.ndjson
#[tracing::instrument(skip_all)]
pub async fn download_get(
    State(state): State<Arc<AppState>>,
    Auth(claims): Auth,
    Path((id, select)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    claims.require(Action::LedgerAdmin)?;
    let ledger = resolve(&state, &id).await?;
    let selector = plain_only(selectors::decode_token(&select)?)?;
    let base = format!("/ledgers/{}/download", ledger.id);
    selectors::get_response(&state, &ledger, &selector, &base, &headers).await
}

async fn resolve(state: &AppState, id: &str) -> Result<Arc<Ledger>, ApiError> {
    let ledger_id = super::parse_ledger_id(id)?;
    state
        .ledgers
        .for_ledger_id(ledger_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("ledger {ledger_id} not found")))
}

fn plain_only(selector: Selector) -> Result<Selector, ApiError> {
    match selector {
        Selector::Plain(_) => Ok(selector),
        Selector::Filter(_) => Err(ApiError::Unprocessable(
            "a ledger download takes a plain selector; use /selectors for filters".to_string(),
        )),
    }
}
