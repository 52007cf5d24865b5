use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    async_trait,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, FromRequestParts, Path, Query, State,
    },
    http::{request::Parts, Method},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use courier_shared::constants::APP_NAME;
use courier_shared::protocol::{
    DirectSessionEntry, GroupSessionEntry, HideRequest, HideResponse, HistoryPage, PinResponse,
    PresenceStatus, SessionPage,
};
use courier_shared::types::{GroupId, UserId};

use crate::collaborators::IdentityService;
use crate::config::ServerConfig;
use crate::dispatcher::{Dispatcher, Session};
use crate::error::ServerError;
use crate::lifecycle::PageRequest;
use crate::presence::{ConnectionHandle, ConnectionToken};

/// Header set by the gateway once it has authenticated the caller.
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub identity: Arc<dyn IdentityService>,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_upgrade))
        .route("/presence/:user_id", get(presence_status))
        .route("/chat/history/:peer_id", get(direct_history))
        .route("/chat/delete", post(hide_direct))
        .route("/chat/sessions", get(direct_sessions))
        .route("/chat/pin/:peer_id", post(pin_peer))
        .route("/group/sessions", get(group_sessions))
        .route("/group/:group_id/history", get(group_history))
        .route("/group/:group_id/delete", post(hide_group))
        .route("/group/:group_id/pin", post(pin_group))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// The authenticated caller, taken from [`USER_ID_HEADER`].
pub struct AuthUser(pub UserId);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AuthUser {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|id| *id != 0)
            .ok_or(ServerError::Unauthenticated)?;
        Ok(AuthUser(UserId(id)))
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    page: Option<u32>,
    limit: Option<u32>,
}

impl From<HistoryQuery> for PageRequest {
    fn from(q: HistoryQuery) -> Self {
        PageRequest::new(q.page, q.limit)
    }
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: APP_NAME,
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// Admit a live connection. The profile is resolved before the upgrade so
/// unknown users and identity outages fail with a plain HTTP status.
async fn ws_upgrade(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    AuthUser(user): AuthUser,
    ws: WebSocketUpgrade,
) -> Result<Response, ServerError> {
    let profile = state.identity.profile(user).await?;
    let session = Session {
        profile,
        token: ConnectionToken::from_addr(addr),
    };
    let buffer = state.config.connection_buffer;
    let dispatcher = state.dispatcher.clone();

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, dispatcher, session, buffer)))
}

async fn handle_socket(socket: WebSocket, dispatcher: Dispatcher, session: Session, buffer: usize) {
    let (mut sender, mut receiver) = socket.split();
    let (handle, mut outbound) = ConnectionHandle::channel(buffer);

    dispatcher.on_connect(&session, handle).await;

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => dispatcher.handle_frame(&session, &text).await,
            Message::Close(_) => break,
            Message::Binary(_) => {
                debug!(user = %session.user(), "Ignoring binary frame");
            }
            // Ping/pong is answered by the websocket layer.
            _ => {}
        }
    }

    dispatcher.on_disconnect(&session).await;
    writer.abort();
    debug!(user = %session.user(), connection = %session.token, "Connection closed");
}

// ---------------------------------------------------------------------------
// Presence & history
// ---------------------------------------------------------------------------

async fn presence_status(
    State(state): State<AppState>,
    AuthUser(_caller): AuthUser,
    Path(user_id): Path<u64>,
) -> Json<PresenceStatus> {
    let user = UserId(user_id);
    let connections = state.dispatcher.presence().connections(user).await.len();
    Json(PresenceStatus {
        user_id: user,
        online: connections > 0,
        connections,
    })
}

async fn direct_history(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(peer_id): Path<u64>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryPage>, ServerError> {
    let page = state
        .dispatcher
        .lifecycle()
        .direct_history(user, UserId(peer_id), query.into())?;
    Ok(Json(page))
}

async fn hide_direct(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<HideRequest>,
) -> Result<Json<HideResponse>, ServerError> {
    if req.ids.is_empty() {
        return Err(ServerError::BadRequest("ids must not be empty".into()));
    }
    let hidden = state
        .dispatcher
        .lifecycle()
        .hide_direct(user, &req.ids, Utc::now())?;
    info!(user = %user, hidden, "Direct messages hidden");
    Ok(Json(HideResponse { hidden }))
}

async fn group_history(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(group_id): Path<u64>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryPage>, ServerError> {
    let page = state
        .dispatcher
        .lifecycle()
        .group_history(GroupId(group_id), user, query.into())?;
    Ok(Json(page))
}

async fn hide_group(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(group_id): Path<u64>,
    Json(req): Json<HideRequest>,
) -> Result<Json<HideResponse>, ServerError> {
    if req.ids.is_empty() {
        return Err(ServerError::BadRequest("ids must not be empty".into()));
    }
    let group = GroupId(group_id);
    let hidden = state
        .dispatcher
        .lifecycle()
        .hide_group(group, user, &req.ids, Utc::now())?;
    info!(group = %group, user = %user, hidden, "Group messages hidden");
    Ok(Json(HideResponse { hidden }))
}

// ---------------------------------------------------------------------------
// Sessions & pins
// ---------------------------------------------------------------------------

async fn direct_sessions(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<SessionPage<DirectSessionEntry>>, ServerError> {
    let page = state.dispatcher.direct_sessions(user, query.into()).await?;
    Ok(Json(page))
}

async fn group_sessions(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<SessionPage<GroupSessionEntry>>, ServerError> {
    let page = state
        .dispatcher
        .lifecycle()
        .group_sessions(user, query.into())?;
    Ok(Json(page))
}

async fn pin_peer(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(peer_id): Path<u64>,
) -> Result<Json<PinResponse>, ServerError> {
    let pinned = state
        .dispatcher
        .lifecycle()
        .pin_peer(user, UserId(peer_id), Utc::now())
        .await?;
    Ok(Json(PinResponse { pinned }))
}

async fn pin_group(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(group_id): Path<u64>,
) -> Result<Json<PinResponse>, ServerError> {
    let pinned = state
        .dispatcher
        .lifecycle()
        .pin_group(GroupId(group_id), user, Utc::now())?;
    Ok(Json(PinResponse { pinned }))
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}
