use std::net::SocketAddr;

use clap::Parser;
use evently_api::api;
use evently_api::config::Config;
use evently_api::db::Db;
use evently_api::notify::listener;
use evently_api::shutdown::ShutdownHooks;
use evently_api::AppState;
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::postgres::PgPoolOptions;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    if config.production() {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let options = config.connect_options()?;
    let pool = PgPoolOptions::new()
        .max_connections(16)
        .connect_lazy_with(options);
    let db = Db::new(pool.clone());

    let metrics_handle = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "metrics recorder unavailable");
            None
        }
    };

    let state = AppState::new(db.clone());

    let hooks = ShutdownHooks::new();
    hooks.on_shutdown("database pool", async move { pool.close().await });

    // Registered after the pool so it halts first: fan-out stops before the
    // server stops accepting.
    let listener_task = tokio::spawn(listener::run(db, state.channels.clone()));
    hooks.on_shutdown("event listener", async move { listener_task.abort() });

    let app = api::router(state, metrics_handle);
    let addr: SocketAddr = format!("{}:{}", config.bind, config.port).parse()?;
    let tcp = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, "starting server");

    axum::serve(tcp, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    hooks.run().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}
