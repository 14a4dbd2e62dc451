//! HTTP 请求的 Bearer 认证

use application::{AuthError, IdentityProvider};
use axum::http::{header::AUTHORIZATION, HeaderMap};
use domain::UserIdentity;

use crate::error::ApiError;

/// 从 headers 中提取和验证 token
pub async fn authenticate(
    identity_provider: &dyn IdentityProvider,
    headers: &HeaderMap,
) -> Result<UserIdentity, ApiError> {
    let auth_header = headers
        .get(AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .ok_or(AuthError::MissingToken)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::unauthorized("invalid authorization header format"))?;

    let identity = identity_provider.verify(token).await.map_err(|err| {
        tracing::debug!(error = %err, "HTTP 请求认证失败");
        ApiError::from(err)
    })?;
    Ok(identity)
}
