//! 领域模型错误定义
//!
//! 定义了领域层可能出现的错误类型，提供清晰的错误上下文。

use thiserror::Error;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// 参数不合法
    #[error("invalid {field}: {reason}")]
    InvalidArgument { field: String, reason: String },

    /// 文本消息内容为空
    #[error("message cannot be empty")]
    EmptyMessage,

    /// 附件与消息类型不匹配
    #[error("attachment not allowed or missing for {kind} message")]
    AttachmentMismatch { kind: String },

    /// 消息已被删除
    #[error("message has been deleted")]
    MessageDeleted,

    /// 只有作者可以修改消息
    #[error("only the author can modify this message")]
    NotMessageAuthor,

    /// 只有创建者可以修改房间信息
    #[error("only the room creator can change its settings")]
    NotRoomOwner,
}

impl DomainError {
    /// 创建参数错误
    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// 持久化层错误
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("record not found")]
    NotFound,
    #[error("record already exists")]
    Conflict,
    /// 存储不可用或写入失败
    #[error("storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}
