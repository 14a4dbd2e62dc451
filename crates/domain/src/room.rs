use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{RoomName, Timestamp, UserId};

/// 房间描述的最大字符数。
pub const MAX_ROOM_DESCRIPTION_CHARS: usize = 200;

/// 房间的持久化元数据。
///
/// 成员关系只存在于内存中；这里保存的是描述、是否私有以及在线人数上限，
/// 房间不存在记录时使用全局默认上限。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub name: RoomName,
    pub description: Option<String>,
    pub is_private: bool,
    pub max_users: Option<u32>,
    pub created_by: UserId,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// 创建或修改房间元数据时可改动的字段
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RoomSettings {
    pub description: Option<String>,
    #[serde(default)]
    pub is_private: bool,
    pub max_users: Option<u32>,
}

impl RoomSettings {
    fn validate(self) -> Result<Self, DomainError> {
        let description = self
            .description
            .map(|description| description.trim().to_string())
            .filter(|description| !description.is_empty());
        if description
            .as_ref()
            .is_some_and(|description| description.chars().count() > MAX_ROOM_DESCRIPTION_CHARS)
        {
            return Err(DomainError::invalid_argument(
                "description",
                format!("cannot exceed {MAX_ROOM_DESCRIPTION_CHARS} characters"),
            ));
        }
        if self.max_users == Some(0) {
            return Err(DomainError::invalid_argument(
                "max_users",
                "must be greater than 0",
            ));
        }
        Ok(Self {
            description,
            ..self
        })
    }
}

impl RoomInfo {
    pub fn new(
        name: RoomName,
        created_by: UserId,
        settings: RoomSettings,
        now: Timestamp,
    ) -> Result<Self, DomainError> {
        let settings = settings.validate()?;
        Ok(Self {
            name,
            description: settings.description,
            is_private: settings.is_private,
            max_users: settings.max_users,
            created_by,
            created_at: now,
            updated_at: now,
        })
    }

    /// 只有创建者可以修改
    pub fn update(
        &mut self,
        editor: UserId,
        settings: RoomSettings,
        now: Timestamp,
    ) -> Result<(), DomainError> {
        if editor != self.created_by {
            return Err(DomainError::NotRoomOwner);
        }
        let settings = settings.validate()?;
        self.description = settings.description;
        self.is_private = settings.is_private;
        self.max_users = settings.max_users;
        self.updated_at = now;
        Ok(())
    }
}
