pub mod api;
pub mod config;
pub mod db;
pub mod ledger;
pub mod notify;
pub mod registry;
pub mod selector;
pub mod shutdown;
pub mod source;
pub mod store;

use std::sync::Arc;

use db::Db;
use ledger::admin::Ledgers;
use notify::Channels;
use registry::Registry;
use source::EventSource;
use store::EventStore;

/// Shared application state.
///
/// Every component owns a cheap clone of the database handle (a pool). The
/// channels registry is process-local mutable state; everything else is
/// stateless apart from its TTL cache.
pub struct AppState {
    pub db: Db,
    pub ledgers: Ledgers,
    pub registry: Registry,
    pub source: EventSource,
    pub store: EventStore,
    pub channels: Arc<Channels>,
}

impl AppState {
    pub fn new(db: Db) -> Arc<AppState> {
        let source = EventSource::new(db.clone());
        let registry = Registry::new(db.clone(), source.clone());
        let ledgers = Ledgers::new(db.clone(), source.clone());
        let store = EventStore::new(db.clone(), registry.clone());
        Arc::new(AppState {
            db,
            ledgers,
            registry,
            source,
            store,
            channels: Arc::new(Channels::new()),
        })
    }
}

/// Application-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    BadInput(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// A copy suitable for handing to every waiter of a single-flight cache
    /// load. Non-clonable causes collapse to their classification.
    pub fn duplicate(&self) -> Error {
        match self {
            Error::BadInput(m) => Error::BadInput(m.clone()),
            Error::Forbidden(m) => Error::Forbidden(m.clone()),
            Error::NotFound(m) => Error::NotFound(m.clone()),
            Error::Unprocessable(m) => Error::Unprocessable(m.clone()),
            Error::Unavailable(m) => Error::Unavailable(m.clone()),
            Error::Database(e) if db::is_connection_error(e) => {
                Error::Unavailable("database unavailable".to_string())
            }
            Error::Database(e) => Error::Internal(e.to_string()),
            Error::Json(e) => Error::Internal(e.to_string()),
            Error::Internal(m) => Error::Internal(m.clone()),
        }
    }
}
