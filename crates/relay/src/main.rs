mod config;
mod decode;
mod events;
mod query;
mod reading;
mod session;
mod store;
mod web;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use events::{EventKind, EventLog};
use query::QueryService;
use session::IngestSession;
use store::ReadingStore;
use web::{AppState, BrokerInfo};

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config (the only fatal error class) ─────────────────────────
    let settings = config::load().context("startup configuration")?;

    // ── Shared state ────────────────────────────────────────────────
    let store = ReadingStore::new();
    let events = EventLog::new();
    events.record(EventKind::System, "relay started").await;

    let (session, session_state) =
        IngestSession::new(&settings.mqtt, store.clone(), events.clone());
    let query = QueryService::new(store, session_state, settings.staleness_threshold);

    // ── HTTP listener ───────────────────────────────────────────────
    let addr = settings.http.addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind http listener on {addr}"))?;

    // ── Tasks ───────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));
    let ingest = tokio::spawn(session.run(shutdown.clone()));

    let state = AppState {
        query,
        events,
        broker: BrokerInfo::from(&settings.mqtt),
    };
    let served = web::serve(listener, state, shutdown.clone()).await;

    // Stop ingest whether the server exited cleanly or not.
    shutdown.cancel();
    if let Err(e) = ingest.await {
        error!("ingest task failed: {e}");
    }
    info!("relay stopped");
    served
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl-c received, shutting down"),
        _ = terminate => info!("SIGTERM received, shutting down"),
    }
    shutdown.cancel();
}
