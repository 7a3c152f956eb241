//! Registry management endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::auth::{Action, Auth};
use super::error::ApiError;
use super::types::Hal;
use crate::registry::Registered;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    event: String,
    #[serde(default)]
    entities: Vec<String>,
}

/// GET /registry
pub async fn index(Auth(claims): Auth) -> Result<Hal, ApiError> {
    claims.require(Action::Registry)?;
    Ok(Hal::new("/registry")
        .link("register-event", "/registry/register-event")
        .link("events", "/registry/events")
        .link("entities", "/registry/entities"))
}

/// GET /registry/register-event — the registration form.
pub async fn register_form(Auth(claims): Auth) -> Result<Hal, ApiError> {
    claims.require(Action::Registry)?;
    Ok(Hal::new("/registry/register-event")
        .field("template", json!({"event": "event-name", "entities": ["entity-name"]})))
}

/// POST /registry/register-event
#[tracing::instrument(skip_all, fields(event = %request.event))]
pub async fn register(
    State(state): State<Arc<AppState>>,
    Auth(claims): Auth,
    Json(request): Json<RegisterRequest>,
) -> Result<Response, ApiError> {
    claims.require(Action::Registry)?;
    let ledger = super::claim_ledger(&state, &claims).await?;
    let registered = state
        .registry
        .register_event_type(&ledger, &request.event, request.entities.clone())
        .await?;

    let href = format!("/registry/events/{}", urlencoding::encode(&request.event));
    let body = Hal::new(href.clone())
        .field("event", json!(request.event))
        .field("entities", json!(request.entities));
    match registered {
        Registered::Created => {
            metrics::counter!("registry_registrations_total").increment(1);
            Ok((StatusCode::CREATED, [(header::LOCATION, href)], body).into_response())
        }
        Registered::Unchanged => Ok((StatusCode::OK, body).into_response()),
    }
}

/// GET /registry/events
#[tracing::instrument(skip_all)]
pub async fn events(
    State(state): State<Arc<AppState>>,
    Auth(claims): Auth,
) -> Result<Hal, ApiError> {
    claims.require(Action::Registry)?;
    let ledger = super::claim_ledger(&state, &claims).await?;
    let entries = state.registry.all_events(&ledger).await?;
    Ok(Hal::new("/registry/events").field("events", json!(entries)))
}

/// GET /registry/events/{event}
#[tracing::instrument(skip_all)]
pub async fn event(
    State(state): State<Arc<AppState>>,
    Auth(claims): Auth,
    Path(name): Path<String>,
) -> Result<Hal, ApiError> {
    claims.require(Action::Registry)?;
    let ledger = super::claim_ledger(&state, &claims).await?;
    let entry = state
        .registry
        .get_event(&ledger, &name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("event '{name}' is not registered")))?;
    Ok(
        Hal::new(format!("/registry/events/{}", urlencoding::encode(&name)))
            .field("event", json!(entry.event))
            .field("entities", json!(entry.entities)),
    )
}

/// DELETE /registry/events/{event}
#[tracing::instrument(skip_all)]
pub async fn unregister(
    State(state): State<Arc<AppState>>,
    Auth(claims): Auth,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    claims.require(Action::Registry)?;
    let ledger = super::claim_ledger(&state, &claims).await?;
    state.registry.delete_event(&ledger, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /registry/entities
#[tracing::instrument(skip_all)]
pub async fn entities(
    State(state): State<Arc<AppState>>,
    Auth(claims): Auth,
) -> Result<Hal, ApiError> {
    claims.require(Action::Registry)?;
    let ledger = super::claim_ledger(&state, &claims).await?;
    let names = state.registry.entities(&ledger).await?;
    Ok(Hal::new("/registry/entities").field("entities", json!(names)))
}

/// GET /registry/entities/{entity}
#[tracing::instrument(skip_all)]
pub async fn entity(
    State(state): State<Arc<AppState>>,
    Auth(claims): Auth,
    Path(name): Path<String>,
) -> Result<Hal, ApiError> {
    claims.require(Action::Registry)?;
    let ledger = super::claim_ledger(&state, &claims).await?;
    let entries = state.registry.events_for_entity(&ledger, &name).await?;
    if entries.is_empty() {
        return Err(ApiError::NotFound(format!(
            "entity '{name}' is not registered for any event"
        )));
    }
    Ok(
        Hal::new(format!("/registry/entities/{}", urlencoding::encode(&name)))
            .field("entity", json!(name))
            .field("events", json!(entries)),
    )
}
