use axum::{
    extract::{ws::WebSocketUpgrade, Path, Query, State},
    http::HeaderMap,
    response::Response,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use domain::{Message, RoomInfo, RoomSettings};

use crate::{auth::authenticate, error::ApiError, state::AppState, ws_connection::WebSocketConnection};

/// 单页消息数量上限
const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
struct RecentQuery {
    room: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    limit: Option<usize>,
    skip: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: Option<String>,
    room: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

#[derive(Debug, Serialize)]
struct Pagination {
    limit: usize,
    skip: usize,
    has_more: bool,
}

#[derive(Debug, Serialize)]
struct RoomMessagesResponse {
    success: bool,
    messages: Vec<Message>,
    pagination: Pagination,
}

#[derive(Debug, Serialize)]
struct SearchResponse {
    success: bool,
    messages: Vec<Message>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/messages", get(recent_messages))
        .route("/api/health", get(health))
        .route("/room/{room_name}", get(room_messages))
        .route("/room/{room_name}/info", get(room_info).put(configure_room))
        .route("/search", get(search_messages))
        .route("/ws", get(websocket_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 最近消息，最早的在前
async fn recent_messages(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Value>, ApiError> {
    let room = query
        .room
        .unwrap_or_else(|| state.engine.settings().default_room.to_string());
    let limit = query.limit.map(|limit| limit.clamp(1, MAX_PAGE_SIZE));
    let messages = state.engine.recent_messages(&room, limit).await?;
    Ok(Json(json!({ "messages": messages })))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let store = state.engine.store_health().await;
    Json(json!({
        "status": "ok",
        "store": {
            "kind": store.kind,
            "available": store.available,
        },
        "online_users": state.engine.online_count(),
        "timestamp": Utc::now(),
    }))
}

async fn room_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_name): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<RoomMessagesResponse>, ApiError> {
    authenticate(state.identity_provider.as_ref(), &headers).await?;

    let limit = query
        .limit
        .unwrap_or(state.engine.settings().history_limit)
        .clamp(1, MAX_PAGE_SIZE);
    let skip = query.skip.unwrap_or(0);
    let page = state.engine.room_messages(&room_name, limit, skip).await?;

    Ok(Json(RoomMessagesResponse {
        success: true,
        messages: page.messages,
        pagination: Pagination {
            limit,
            skip,
            has_more: page.has_more,
        },
    }))
}

async fn room_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_name): Path<String>,
) -> Result<Json<RoomInfo>, ApiError> {
    authenticate(state.identity_provider.as_ref(), &headers).await?;
    Ok(Json(state.engine.room_info(&room_name).await?))
}

/// 创建或修改房间信息，已有房间只有创建者可以修改
async fn configure_room(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(room_name): Path<String>,
    Json(settings): Json<RoomSettings>,
) -> Result<Json<RoomInfo>, ApiError> {
    let user = authenticate(state.identity_provider.as_ref(), &headers).await?;
    let info = state
        .engine
        .configure_room(&user, &room_name, settings)
        .await?;
    Ok(Json(info))
}

async fn search_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchResponse>, ApiError> {
    authenticate(state.identity_provider.as_ref(), &headers).await?;

    let q = query
        .q
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("search query is required"))?;
    let messages = state
        .engine
        .search_messages(&q, query.room.as_deref(), None)
        .await?;

    Ok(Json(SearchResponse {
        success: true,
        messages,
    }))
}

/// WebSocket 握手；带 `?token=` 时先验证，失败返回 401
async fn websocket_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let token = query.token.filter(|token| !token.trim().is_empty());
    if let Some(token) = &token {
        state.identity_provider.verify(token).await.map_err(|err| {
            tracing::info!(error = %err, "WebSocket 握手令牌无效");
            ApiError::from(err)
        })?;
    }

    Ok(ws.on_upgrade(move |socket| WebSocketConnection::new(socket, state, token).run()))
}
