use application::{ApplicationError, AuthError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn internal_server_error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> Self {
        match error {
            AuthError::MissingToken => ApiError::unauthorized("missing authorization token"),
            AuthError::Expired => ApiError::unauthorized("token expired"),
            AuthError::InvalidToken(_) => ApiError::unauthorized("invalid token"),
        }
    }
}

impl From<ApplicationError> for ApiError {
    fn from(error: ApplicationError) -> Self {
        use application::ApplicationError as AppErr;
        use domain::DomainError;

        match error {
            AppErr::Domain(DomainError::InvalidArgument { field, reason }) => ApiError::new(
                StatusCode::BAD_REQUEST,
                "INVALID_ARGUMENT",
                format!("{}: {}", field, reason),
            ),
            AppErr::Domain(DomainError::NotMessageAuthor) => ApiError::new(
                StatusCode::FORBIDDEN,
                "NOT_MESSAGE_AUTHOR",
                "only the author can modify this message",
            ),
            AppErr::Domain(DomainError::NotRoomOwner) => ApiError::new(
                StatusCode::FORBIDDEN,
                "NOT_ROOM_OWNER",
                "only the room creator can change its settings",
            ),
            AppErr::Domain(err) => {
                ApiError::new(StatusCode::BAD_REQUEST, "INVALID_MESSAGE", err.to_string())
            }
            AppErr::PolicyRejected { reason, .. } => {
                ApiError::new(StatusCode::UNPROCESSABLE_ENTITY, "POLICY_REJECTED", reason)
            }
            AppErr::Repository(repo_err) => match repo_err {
                domain::RepositoryError::NotFound => ApiError::new(
                    StatusCode::NOT_FOUND,
                    "NOT_FOUND",
                    "requested resource not found",
                ),
                domain::RepositoryError::Conflict => {
                    ApiError::new(StatusCode::CONFLICT, "CONFLICT", "resource already exists")
                }
                domain::RepositoryError::Storage { message, .. } => {
                    tracing::error!(error = %message, "存储访问失败");
                    ApiError::new(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "STORE_UNAVAILABLE",
                        "message store is unavailable",
                    )
                }
            },
            AppErr::NotFound(what) => ApiError::new(
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                format!("{what} not found"),
            ),
            AppErr::SessionNotFound(_) => {
                ApiError::new(StatusCode::NOT_FOUND, "SESSION_NOT_FOUND", "session not found")
            }
            AppErr::RoomFull { room, .. } => {
                ApiError::new(StatusCode::CONFLICT, "ROOM_FULL", format!("room '{room}' is full"))
            }
            AppErr::InvalidState(message) => {
                ApiError::new(StatusCode::CONFLICT, "INVALID_STATE", message)
            }
            AppErr::Authentication(err) => err.into(),
            AppErr::Policy(err) => {
                tracing::error!(error = %err, "内容策略配置错误");
                ApiError::internal_server_error("internal server error")
            }
            AppErr::Infrastructure(message) => {
                tracing::error!(error = %message, "基础设施错误");
                ApiError::internal_server_error("internal server error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
