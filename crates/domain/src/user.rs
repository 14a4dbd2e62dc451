use serde::{Deserialize, Serialize};

use crate::value_objects::UserId;

/// 身份提供方验证后的用户身份。
///
/// 广播引擎只把它挂到会话上，从不修改。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar: Option<String>,
}

impl UserIdentity {
    pub fn new(user_id: UserId, display_name: impl Into<String>, avatar: Option<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            avatar,
        }
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            user_id: self.user_id,
            display_name: self.display_name.clone(),
        }
    }
}

/// 在线列表、输入提示等事件中携带的用户简要信息。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserSummary {
    pub user_id: UserId,
    pub display_name: String,
}
