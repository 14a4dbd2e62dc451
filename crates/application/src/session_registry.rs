//! 会话注册表
//!
//! 每个实时连接对应一个会话，记录身份与当前房间。
//! 基于分片的 `DashMap`，不同连接上的修改互不阻塞，且不会跨 `.await` 持锁。

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use domain::{ConnectionId, RoomName, Timestamp, UserId, UserIdentity};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// 已连接，尚未认证
    Connected,
    /// 已认证，尚未加入房间
    Identified,
    InRoom,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub identity: Option<UserIdentity>,
    pub room: Option<RoomName>,
    pub connected_at: Timestamp,
    pub last_activity: Timestamp,
}

impl Session {
    fn new(connection_id: ConnectionId, now: Timestamp) -> Self {
        Self {
            connection_id,
            identity: None,
            room: None,
            connected_at: now,
            last_activity: now,
        }
    }

    pub fn state(&self) -> SessionState {
        match (&self.identity, &self.room) {
            (None, _) => SessionState::Connected,
            (Some(_), None) => SessionState::Identified,
            (Some(_), Some(_)) => SessionState::InRoom,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session {0} not found")]
    NotFound(ConnectionId),
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<ConnectionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册连接；同一个连接重复注册时返回已有会话
    pub fn register(&self, connection_id: ConnectionId, now: Timestamp) -> Session {
        match self.sessions.entry(connection_id) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => entry.insert(Session::new(connection_id, now)).clone(),
        }
    }

    pub fn attach_identity(
        &self,
        connection_id: ConnectionId,
        identity: UserIdentity,
    ) -> Result<Session, RegistryError> {
        let mut session = self
            .sessions
            .get_mut(&connection_id)
            .ok_or(RegistryError::NotFound(connection_id))?;
        session.identity = Some(identity);
        Ok(session.clone())
    }

    /// 更新当前房间，返回之前所在的房间
    pub fn set_room(
        &self,
        connection_id: ConnectionId,
        room: Option<RoomName>,
    ) -> Result<Option<RoomName>, RegistryError> {
        let mut session = self
            .sessions
            .get_mut(&connection_id)
            .ok_or(RegistryError::NotFound(connection_id))?;
        Ok(std::mem::replace(&mut session.room, room))
    }

    pub fn touch(&self, connection_id: ConnectionId, now: Timestamp) -> Result<(), RegistryError> {
        let mut session = self
            .sessions
            .get_mut(&connection_id)
            .ok_or(RegistryError::NotFound(connection_id))?;
        session.last_activity = now;
        Ok(())
    }

    pub fn get(&self, connection_id: ConnectionId) -> Option<Session> {
        self.sessions
            .get(&connection_id)
            .map(|session| session.value().clone())
    }

    pub fn remove(&self, connection_id: ConnectionId) -> Option<Session> {
        self.sessions
            .remove(&connection_id)
            .map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// 已认证的会话数量
    pub fn identified_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|session| session.identity.is_some())
            .count()
    }

    /// 所有已认证会话的连接 ID
    pub fn identified_connections(&self) -> Vec<ConnectionId> {
        self.sessions
            .iter()
            .filter(|session| session.identity.is_some())
            .map(|session| *session.key())
            .collect()
    }

    /// 该用户是否还有其他已认证的连接
    pub fn has_user(&self, user_id: UserId) -> bool {
        self.sessions.iter().any(|session| {
            session
                .identity
                .as_ref()
                .is_some_and(|identity| identity.user_id == user_id)
        })
    }

    pub fn clear(&self) {
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn identity(name: &str) -> UserIdentity {
        UserIdentity::new(UserId::from(Uuid::new_v4()), name, None)
    }

    #[test]
    fn test_session_moves_through_states() {
        let registry = SessionRegistry::new();
        let conn = ConnectionId::new();

        let session = registry.register(conn, Utc::now());
        assert_eq!(session.state(), SessionState::Connected);

        registry.attach_identity(conn, identity("alice")).unwrap();
        assert_eq!(registry.get(conn).unwrap().state(), SessionState::Identified);

        let room = RoomName::parse("general").unwrap();
        assert_eq!(registry.set_room(conn, Some(room.clone())).unwrap(), None);
        assert_eq!(registry.get(conn).unwrap().state(), SessionState::InRoom);

        let previous = registry.set_room(conn, None).unwrap();
        assert_eq!(previous, Some(room));
    }

    #[test]
    fn test_identified_connections_skip_anonymous_sessions() {
        let registry = SessionRegistry::new();
        let anonymous = ConnectionId::new();
        let alice = ConnectionId::new();
        registry.register(anonymous, Utc::now());
        registry.register(alice, Utc::now());
        registry.attach_identity(alice, identity("alice")).unwrap();

        assert_eq!(registry.identified_connections(), vec![alice]);
        assert_eq!(registry.identified_count(), 1);
    }

    #[test]
    fn test_register_is_idempotent_per_connection() {
        let registry = SessionRegistry::new();
        let conn = ConnectionId::new();
        registry.register(conn, Utc::now());
        registry.attach_identity(conn, identity("alice")).unwrap();

        let again = registry.register(conn, Utc::now());
        assert!(again.identity.is_some());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.identified_count(), 1);
        assert!(registry.has_user(again.identity.unwrap().user_id));
    }

    #[test]
    fn test_unknown_connection_is_not_found() {
        let registry = SessionRegistry::new();
        let conn = ConnectionId::new();
        assert_eq!(
            registry.attach_identity(conn, identity("ghost")),
            Err(RegistryError::NotFound(conn))
        );
        assert_eq!(registry.set_room(conn, None), Err(RegistryError::NotFound(conn)));
        assert!(registry.touch(conn, Utc::now()).is_err());
        assert!(registry.remove(conn).is_none());
    }
}
