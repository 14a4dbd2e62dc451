//! Web API 层。
//!
//! 提供 Axum 路由，将 HTTP / WebSocket 请求委托给广播引擎。

mod auth;
mod error;
mod routes;
mod state;
mod ws_connection;

use axum::http::HeaderValue;
use tower_http::cors::{AllowOrigin, CorsLayer};

pub use error::{ApiError, ErrorBody};
pub use routes::router;
pub use state::AppState;

/// 按配置的来源构建 CORS 层，包含 `*` 时放开所有来源
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
        return CorsLayer::permissive();
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(origin = %origin, error = %err, "忽略无效的 CORS 来源");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any)
}
