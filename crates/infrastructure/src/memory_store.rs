//! 内存持久化实现
//!
//! 未配置数据库时的默认存储，进程退出后数据丢失。

use std::collections::HashMap;
use std::sync::Arc;

use application::PersistenceStore;
use async_trait::async_trait;
use domain::{Message, MessageId, RepositoryError, RoomInfo, RoomName, Timestamp, UserId};
use tokio::sync::RwLock;

/// 用户在线状态记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserStatusRecord {
    pub display_name: String,
    pub is_online: bool,
    pub last_seen: Timestamp,
}

/// 内存中的消息、房间与在线状态存储
#[derive(Default, Clone)]
pub struct InMemoryStore {
    /// 按写入顺序保存的消息
    messages: Arc<RwLock<Vec<Message>>>,
    rooms: Arc<RwLock<HashMap<RoomName, RoomInfo>>>,
    statuses: Arc<RwLock<HashMap<UserId, UserStatusRecord>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn message_count(&self) -> usize {
        self.messages.read().await.len()
    }

    pub async fn user_status(&self, user_id: UserId) -> Option<UserStatusRecord> {
        self.statuses.read().await.get(&user_id).cloned()
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn save_message(&self, message: Message) -> Result<Message, RepositoryError> {
        let mut messages = self.messages.write().await;
        if messages.iter().any(|existing| existing.id == message.id) {
            return Err(RepositoryError::Conflict);
        }
        messages.push(message.clone());
        Ok(message)
    }

    async fn fetch_room_messages(
        &self,
        room: &RoomName,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, RepositoryError> {
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .rev()
            .filter(|message| &message.room == room)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn search_messages(
        &self,
        query: &str,
        room: Option<RoomName>,
        limit: usize,
    ) -> Result<Vec<Message>, RepositoryError> {
        let needle = query.to_lowercase();
        let messages = self.messages.read().await;
        Ok(messages
            .iter()
            .rev()
            .filter(|message| room.as_ref().map_or(true, |room| &message.room == room))
            .filter(|message| !message.is_deleted())
            .filter(|message| message.text.to_lowercase().contains(&needle))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_message(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
        let messages = self.messages.read().await;
        Ok(messages.iter().find(|message| message.id == id).cloned())
    }

    async fn update_message(&self, message: Message) -> Result<Message, RepositoryError> {
        let mut messages = self.messages.write().await;
        let existing = messages
            .iter_mut()
            .find(|existing| existing.id == message.id)
            .ok_or(RepositoryError::NotFound)?;
        *existing = message.clone();
        Ok(message)
    }

    async fn upsert_user_status(
        &self,
        user_id: UserId,
        display_name: &str,
        is_online: bool,
        last_seen: Timestamp,
    ) -> Result<(), RepositoryError> {
        self.statuses.write().await.insert(
            user_id,
            UserStatusRecord {
                display_name: display_name.to_string(),
                is_online,
                last_seen,
            },
        );
        Ok(())
    }

    async fn find_room(&self, name: &RoomName) -> Result<Option<RoomInfo>, RepositoryError> {
        Ok(self.rooms.read().await.get(name).cloned())
    }

    async fn save_room(&self, room: RoomInfo) -> Result<RoomInfo, RepositoryError> {
        self.rooms
            .write()
            .await
            .insert(room.name.clone(), room.clone());
        Ok(room)
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use domain::{MessageKind, UserIdentity, DELETED_PLACEHOLDER};
    use uuid::Uuid;

    fn room(name: &str) -> RoomName {
        RoomName::parse(name).unwrap()
    }

    fn message(room_name: &str, author: &UserIdentity, text: &str, offset_secs: i64) -> Message {
        Message::new(
            MessageId::new(),
            room(room_name),
            author,
            text.to_string(),
            MessageKind::Text,
            None,
            Utc::now() + Duration::seconds(offset_secs),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_room_messages_newest_first_with_offset() {
        let store = InMemoryStore::new();
        let alice = UserIdentity::new(UserId::from(Uuid::new_v4()), "alice", None);
        for (i, text) in ["one", "two", "three"].iter().enumerate() {
            store
                .save_message(message("general", &alice, text, i as i64))
                .await
                .unwrap();
        }
        store
            .save_message(message("random", &alice, "elsewhere", 10))
            .await
            .unwrap();

        let page = store.fetch_room_messages(&room("general"), 2, 0).await.unwrap();
        let texts: Vec<_> = page.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["three", "two"]);

        let rest = store.fetch_room_messages(&room("general"), 2, 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].text, "one");
    }

    #[tokio::test]
    async fn test_duplicate_id_is_conflict() {
        let store = InMemoryStore::new();
        let alice = UserIdentity::new(UserId::from(Uuid::new_v4()), "alice", None);
        let first = message("general", &alice, "hi", 0);
        store.save_message(first.clone()).await.unwrap();
        assert!(matches!(
            store.save_message(first).await,
            Err(RepositoryError::Conflict)
        ));
    }

    #[tokio::test]
    async fn test_search_is_case_insensitive_and_skips_deleted() {
        let store = InMemoryStore::new();
        let alice = UserIdentity::new(UserId::from(Uuid::new_v4()), "alice", None);
        store
            .save_message(message("general", &alice, "Rust is fun", 0))
            .await
            .unwrap();
        let mut gone = message("general", &alice, "rust again", 1);
        store.save_message(gone.clone()).await.unwrap();
        store
            .save_message(message("random", &alice, "RUST elsewhere", 2))
            .await
            .unwrap();

        gone.soft_delete(alice.user_id, Utc::now()).unwrap();
        let updated = store.update_message(gone).await.unwrap();
        assert_eq!(updated.text, DELETED_PLACEHOLDER);

        let everywhere = store.search_messages("rust", None, 20).await.unwrap();
        assert_eq!(everywhere.len(), 2);
        assert_eq!(everywhere[0].text, "RUST elsewhere");

        let general = store
            .search_messages("rust", Some(room("general")), 20)
            .await
            .unwrap();
        assert_eq!(general.len(), 1);
    }

    #[tokio::test]
    async fn test_update_unknown_message_is_not_found() {
        let store = InMemoryStore::new();
        let alice = UserIdentity::new(UserId::from(Uuid::new_v4()), "alice", None);
        let result = store.update_message(message("general", &alice, "x", 0)).await;
        assert!(matches!(result, Err(RepositoryError::NotFound)));
    }

    #[tokio::test]
    async fn test_user_status_upsert_overwrites() {
        let store = InMemoryStore::new();
        let user_id = UserId::from(Uuid::new_v4());
        let now = Utc::now();

        store.upsert_user_status(user_id, "alice", true, now).await.unwrap();
        store.upsert_user_status(user_id, "alice", false, now).await.unwrap();

        let status = store.user_status(user_id).await.unwrap();
        assert!(!status.is_online);
        assert_eq!(status.display_name, "alice");
        assert_eq!(store.kind(), "memory");
    }

    #[tokio::test]
    async fn test_room_info_round_trip() {
        let store = InMemoryStore::new();
        let owner = UserId::from(Uuid::new_v4());
        assert!(store.find_room(&room("lobby")).await.unwrap().is_none());

        let info = RoomInfo::new(
            room("lobby"),
            owner,
            domain::RoomSettings {
                description: Some("front door".into()),
                is_private: true,
                max_users: Some(3),
            },
            Utc::now(),
        )
        .unwrap();
        store.save_room(info.clone()).await.unwrap();

        assert_eq!(store.find_room(&room("lobby")).await.unwrap(), Some(info));
    }
}
