use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;

use crate::crawler::{Crawler, CrawlerSnapshot};
use crate::db::models::{FailedEpochRow, HisBetRow, RoundRow};
use crate::db::queries;
use crate::error::AppError;
use crate::fanout::{connection_ack, Hub};
use crate::listener::{Listener, ListenerSnapshot};
use crate::manager::{ConnectionManager, ManagerStatus};
use crate::timefmt;

#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<ConnectionManager>,
    pub crawler: Arc<Crawler>,
    pub listener: Arc<Listener>,
    pub hub: Arc<Hub>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/status", get(get_status))
        .route("/rounds", get(get_rounds))
        .route("/rounds/:epoch/bets", get(get_round_bets))
        .route("/failed-epochs", get(get_failed_epochs))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct RoundsQuery {
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct FailedEpochsQuery {
    pub limit: Option<i64>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub db_connected: bool,
    pub http_rpc_connected: bool,
    pub ws_connected: bool,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub service: &'static str,
    pub timestamp: String,
    pub manager: ManagerStatus,
    pub crawler: CrawlerSnapshot,
    pub listener: ListenerSnapshot,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn get_health(State(state): State<ApiState>) -> Json<HealthResponse> {
    let manager = state.manager.status().await;
    Json(HealthResponse {
        status: if manager.db_connected && manager.http_rpc_connected {
            "ok"
        } else {
            "degraded"
        },
        db_connected: manager.db_connected,
        http_rpc_connected: manager.http_rpc_connected,
        ws_connected: manager.ws_connected,
    })
}

async fn get_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        service: "prediction-archiver",
        timestamp: timefmt::now_formatted(),
        manager: state.manager.status().await,
        crawler: state.crawler.snapshot(),
        listener: state.listener.snapshot(),
    })
}

async fn get_rounds(
    State(state): State<ApiState>,
    Query(params): Query<RoundsQuery>,
) -> Result<Json<Vec<RoundRow>>, AppError> {
    let limit = params.limit.unwrap_or(50).clamp(1, 500);
    let pool = state.manager.db_pool().await?;
    let rounds = queries::recent_rounds(&pool, limit).await?;
    Ok(Json(rounds))
}

async fn get_round_bets(
    State(state): State<ApiState>,
    Path(epoch): Path<u64>,
) -> Result<Json<Vec<HisBetRow>>, AppError> {
    let pool = state.manager.db_pool().await?;
    let bets = queries::bets_for_epoch(&pool, epoch).await?;
    Ok(Json(bets))
}

async fn get_failed_epochs(
    State(state): State<ApiState>,
    Query(params): Query<FailedEpochsQuery>,
) -> Result<Json<Vec<FailedEpochRow>>, AppError> {
    let limit = params.limit.unwrap_or(100).clamp(1, 1000);
    let pool = state.manager.db_pool().await?;
    let rows = queries::quarantined_epochs(&pool, limit).await?;
    Ok(Json(rows))
}

// ---------------------------------------------------------------------------
// Push fan-out socket
// ---------------------------------------------------------------------------

async fn ws_upgrade(State(state): State<ApiState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| client_session(state.hub, socket))
}

/// One task per connected subscriber: relay hub messages until either side
/// goes away. A send failure is the disconnect signal; the hub itself never
/// tracks sockets.
async fn client_session(hub: Arc<Hub>, mut socket: WebSocket) {
    let total = hub.client_connected();
    info!("push client connected ({total} total)");

    if socket.send(Message::Text(connection_ack())).await.is_err() {
        hub.client_disconnected();
        return;
    }

    let mut feed = hub.subscribe();
    loop {
        tokio::select! {
            msg = feed.recv() => match msg {
                Ok(text) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            },

            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    }

    let remaining = hub.client_disconnected();
    info!("push client disconnected ({remaining} remaining)");
}
