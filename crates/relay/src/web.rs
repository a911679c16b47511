use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use serde_json::json;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::MqttSettings;
use crate::events::EventLog;
use crate::query::{QueryService, ZoneQuery};
use crate::reading::{Reading, ZoneKey};

#[derive(Clone)]
pub struct AppState {
    pub query: QueryService,
    pub events: EventLog,
    pub broker: BrokerInfo,
}

/// Where the relay gets its readings from, as shown on the index.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerInfo {
    pub address: String,
    pub topics: Vec<String>,
}

impl From<&MqttSettings> for BrokerInfo {
    fn from(mqtt: &MqttSettings) -> Self {
        Self {
            address: mqtt.broker_addr(),
            topics: mqtt.topics.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// JSON responses
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ZoneResponse {
    #[serde(flatten)]
    reading: Reading,
    #[serde(with = "time::serde::rfc3339")]
    received_at: OffsetDateTime,
    stale: bool,
}

#[derive(Serialize)]
struct StatusResponse {
    broker_connected: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    last_update: Option<OffsetDateTime>,
    zone_count: usize,
    fresh_zone_count: usize,
}

#[derive(Serialize)]
struct ZoneListItem {
    key: ZoneKey,
    node_id: String,
    zone_id: String,
    #[serde(with = "time::serde::rfc3339")]
    received_at: OffsetDateTime,
    stale: bool,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/v1/status", get(api_status))
        .route("/api/v1/zones", get(api_zones))
        .route("/api/v1/events", get(api_events))
        .route("/api/v1/{node_id}/{zone_id}", get(api_zone))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

async fn index(State(state): State<AppState>) -> impl IntoResponse {
    let known: Vec<String> = state
        .query
        .known_zones()
        .await
        .iter()
        .map(|k| format!("/api/v1/{k}"))
        .collect();
    Json(json!({
        "name": "microgrid-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "staleness_threshold_seconds": state.query.threshold().as_secs(),
        "mqtt_broker": state.broker.address,
        "subscribed_topics": state.broker.topics,
        "endpoints": {
            "zone": "/api/v1/{node_id}/{zone_id}",
            "zones": "/api/v1/zones",
            "status": "/api/v1/status",
            "events": "/api/v1/events",
        },
        "known_zones": known,
    }))
}

async fn api_zone(
    State(state): State<AppState>,
    Path((node_id, zone_id)): Path<(String, String)>,
) -> Response {
    let key = ZoneKey::new(node_id, zone_id);
    match state.query.get_zone(&key).await {
        ZoneQuery::Found { entry, is_stale } => Json(ZoneResponse {
            reading: entry.reading,
            received_at: entry.received_at,
            stale: is_stale,
        })
        .into_response(),
        ZoneQuery::NotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "detail": format!("no data available for {key}; check that MQTT messages are being received")
            })),
        )
            .into_response(),
    }
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.query.get_status().await;
    Json(StatusResponse {
        broker_connected: status.broker_connected,
        last_update: status.last_update,
        zone_count: status.zone_count,
        fresh_zone_count: status.fresh_zone_count,
    })
}

async fn api_zones(State(state): State<AppState>) -> impl IntoResponse {
    let zones: Vec<ZoneListItem> = state
        .query
        .list_zones()
        .await
        .into_iter()
        .map(|z| ZoneListItem {
            node_id: z.entry.key.node_id().to_string(),
            zone_id: z.entry.key.zone_id().to_string(),
            key: z.entry.key,
            received_at: z.entry.received_at,
            stale: z.is_stale,
        })
        .collect();
    Json(zones)
}

async fn api_events(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.events.recent().await)
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

/// Serve until `shutdown` fires, then stop accepting and drain in-flight
/// requests.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr().context("listener has no local address")?;
    tracing::info!("http api listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("http server error")
}

// ===========================================================================
// Tests
// ===========================================================================
