pub mod append;
pub mod auth;
pub mod error;
pub mod ledgers;
pub mod notify;
pub mod registry;
pub mod selectors;
pub mod types;

use std::sync::Arc;

use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::routing::{get, head, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::ledger::event_id::LedgerId;
use crate::ledger::events::Ledger;
use crate::AppState;
use auth::{Auth, Claims};
use error::ApiError;
use types::Hal;

/// Build the API router.
pub fn router(state: Arc<AppState>, metrics_handle: Option<PrometheusHandle>) -> Router {
    let mut app = Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/ledgers", get(ledgers::index))
        .route("/ledgers/create-ledger", post(ledgers::create))
        .route(
            "/ledgers/{id}",
            get(ledgers::get).delete(ledgers::remove),
        )
        .route("/ledgers/{id}/reset", post(ledgers::reset))
        .route("/ledgers/{id}/download", post(ledgers::download_lookup))
        .route(
            "/ledgers/{id}/download/{select}",
            head(ledgers::download_head).get(ledgers::download_get),
        )
        .route("/registry", get(registry::index))
        .route(
            "/registry/register-event",
            get(registry::register_form).post(registry::register),
        )
        .route("/registry/events", get(registry::events))
        .route(
            "/registry/events/{event}",
            get(registry::event).delete(registry::unregister),
        )
        .route("/registry/entities", get(registry::entities))
        .route("/registry/entities/{entity}", get(registry::entity))
        .route("/selectors", post(selectors::lookup))
        .route(
            "/selectors/{select}",
            head(selectors::head).get(selectors::get),
        )
        .route("/append", post(append::append))
        .route("/notify", get(notify::index))
        .route("/notify/open-channel", post(notify::open_channel))
        .route(
            "/notify/{ch}",
            get(notify::channel).delete(notify::close_channel),
        )
        .route("/notify/{ch}/sse", get(notify::sse))
        .route("/notify/{ch}/subscribe", post(notify::subscribe))
        .route(
            "/notify/{ch}/subscriptions/{sid}",
            get(notify::subscription).delete(notify::unsubscribe),
        );

    if let Some(handle) = metrics_handle {
        app = app.route(
            "/metrics",
            get(move || std::future::ready(handle.render())),
        );
    }

    app.layer(cors())
        .layer(SetResponseHeaderLayer::if_not_present(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_static("upgrade-insecure-requests; default-src https:"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::HEAD, Method::GET, Method::POST, Method::DELETE])
        .allow_headers(Any)
        .expose_headers([
            header::CONTENT_LOCATION,
            HeaderName::from_static("last-event-id"),
            header::LINK,
            header::LOCATION,
            HeaderName::from_static("preference-applied"),
            HeaderName::from_static("profile"),
            header::WWW_AUTHENTICATE,
        ])
}

/// GET / — the hypermedia root.
async fn root(Auth(_claims): Auth) -> Hal {
    Hal::new("/")
        .link("ledgers", "/ledgers")
        .link("registry", "/registry")
        .link("selectors", "/selectors")
        .link("append", "/append")
        .link("notify", "/notify")
}

/// GET /health
async fn health(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> Hal {
    Hal::new("/health")
        .field("status", json!("ok"))
        .field("channels", json!(state.channels.count()))
}

/// Resolve the ledger a token is scoped to.
pub(crate) async fn claim_ledger(
    state: &AppState,
    claims: &Claims,
) -> Result<Arc<Ledger>, ApiError> {
    let id = claims.ledger_id()?;
    state
        .ledgers
        .for_ledger_id(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("ledger {id} not found")))
}

pub(crate) fn parse_ledger_id(raw: &str) -> Result<LedgerId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid ledger id '{raw}'")))
}
