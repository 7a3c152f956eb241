//! POST /append — factual and atomic appends.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::auth::{Action, Auth};
use super::error::ApiError;
use super::selectors::selector_uri;
use crate::ledger::events::{AppendEvent, Ledger};
use crate::selector::{FilterSelector, Selector, SelectorInput};
use crate::store::AppendOutcome;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct AppendRequest {
    #[serde(flatten)]
    event: AppendEvent,
    /// Present for atomic appends; absent appends factually.
    #[serde(default)]
    selector: Option<SelectorInput>,
}

#[tracing::instrument(skip_all, fields(event = %request.event.event))]
pub async fn append(
    State(state): State<Arc<AppState>>,
    Auth(claims): Auth,
    Json(request): Json<AppendRequest>,
) -> Result<Response, ApiError> {
    claims.require(Action::Append)?;
    let ledger = super::claim_ledger(&state, &claims).await?;
    let start = std::time::Instant::now();

    let (outcome, echo) = match request.selector {
        None => {
            // The echo selector for the response Location is the event's
            // entity set.
            let echo = FilterSelector {
                entities: request.event.entities.clone(),
                ..Default::default()
            };
            let outcome = state.store.append_factual(&ledger, &request.event).await?;
            (outcome, echo)
        }
        Some(input) => match input.into_selector()? {
            Selector::Filter(filter) => {
                let outcome = state
                    .store
                    .append_atomic(&ledger, &request.event, &filter)
                    .await?;
                (outcome, filter)
            }
            Selector::Plain(_) => {
                return Err(ApiError::BadRequest(
                    "a plain (download) selector cannot guard an append".to_string(),
                ))
            }
        },
    };

    metrics::counter!("api_requests_total", "endpoint" => "append").increment(1);
    metrics::histogram!("api_request_duration_seconds", "endpoint" => "append")
        .record(start.elapsed().as_secs_f64());

    match outcome {
        AppendOutcome::Success {
            event_id,
            idempotency_key,
        } => {
            let location = selector_uri(&Selector::Filter(echo).with_after(event_id));
            Ok((
                StatusCode::CREATED,
                [(header::LOCATION, location)],
                Json(json!({
                    "eventId": event_id.hex(),
                    "idempotencyKey": idempotency_key,
                })),
            )
                .into_response())
        }
        AppendOutcome::Race { message } => {
            let selector = Selector::Filter(echo);
            let current = match state.source.latest_event_id(&ledger, &selector).await {
                Ok(position) => selector_uri(&selector.with_after(position)),
                Err(_) => selector_uri(&selector),
            };
            Err(ApiError::Conflict { message, current })
        }
        AppendOutcome::Fail { message } => Err(ApiError::Forbidden(remediate(&message, &ledger))),
        AppendOutcome::Invalid { message } => {
            Err(ApiError::Unprocessable(remediate(&message, &ledger)))
        }
        AppendOutcome::Error { message } => Err(ApiError::BadRequest(message)),
    }
}

/// Substitute the remediation placeholders with real URIs.
fn remediate(message: &str, ledger: &Ledger) -> String {
    message
        .replace("/RESET", &format!("/ledgers/{}/reset", ledger.id))
        .replace("/REGISTER", "/registry/register-event")
}
