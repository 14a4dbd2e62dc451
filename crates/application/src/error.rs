use domain::{ConnectionId, DomainError, RepositoryError, RoomName};
use thiserror::Error;

use crate::content_policy::{PolicyError, Violation};
use crate::identity::AuthError;
use crate::session_registry::RegistryError;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    /// 内容策略拒绝，只通知发送者
    #[error("message rejected: {reason}")]
    PolicyRejected {
        reason: String,
        violations: Vec<Violation>,
    },
    /// 连接已断开，事件直接丢弃
    #[error("session {0} not found")]
    SessionNotFound(ConnectionId),
    /// 房间或消息不存在
    #[error("{0} not found")]
    NotFound(String),
    /// 房间在线人数已达上限
    #[error("room '{room}' is full ({capacity} users)")]
    RoomFull { room: RoomName, capacity: usize },
    /// 会话状态不满足前置条件（未认证、未加入房间等）
    #[error("{0}")]
    InvalidState(String),
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),
    #[error("invalid content policy: {0}")]
    Policy(#[from] PolicyError),
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl From<RegistryError> for ApplicationError {
    fn from(value: RegistryError) -> Self {
        match value {
            RegistryError::NotFound(connection_id) => {
                ApplicationError::SessionNotFound(connection_id)
            }
        }
    }
}

impl ApplicationError {
    /// 创建基础设施错误
    pub fn infrastructure(message: impl Into<String>) -> Self {
        ApplicationError::Infrastructure(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        ApplicationError::NotFound(what.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        ApplicationError::InvalidState(message.into())
    }

    /// 发给客户端的错误文本，不暴露存储细节
    pub fn client_message(&self) -> String {
        match self {
            ApplicationError::Domain(err) => err.to_string(),
            ApplicationError::PolicyRejected { reason, .. } => reason.clone(),
            ApplicationError::NotFound(what) => format!("{what} not found"),
            ApplicationError::RoomFull { room, .. } => format!("room '{room}' is full"),
            ApplicationError::InvalidState(message) => message.clone(),
            ApplicationError::Authentication(_) => "authentication failed".to_string(),
            ApplicationError::Repository(RepositoryError::NotFound) => "not found".to_string(),
            ApplicationError::SessionNotFound(_) => "session not found".to_string(),
            ApplicationError::Repository(_)
            | ApplicationError::Policy(_)
            | ApplicationError::Infrastructure(_) => {
                "internal server error".to_string()
            }
        }
    }
}
