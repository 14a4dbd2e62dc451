//! 在线与输入状态
//!
//! 在线用户列表每次都从房间目录和会话注册表重新计算，不做缓存；
//! 输入提示保存在内存中，带服务端超时，由后台清扫任务定期过期。

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use dashmap::DashMap;
use domain::{RoomName, UserId, UserSummary};
use tokio::time::Instant;

use crate::room_directory::RoomDirectory;
use crate::session_registry::SessionRegistry;

#[derive(Debug, Clone)]
struct TypingEntry {
    user: UserSummary,
    refreshed_at: Instant,
}

pub struct PresenceTracker {
    typing: DashMap<RoomName, HashMap<UserId, TypingEntry>>,
    typing_timeout: Duration,
}

impl PresenceTracker {
    pub fn new(typing_timeout: Duration) -> Self {
        Self {
            typing: DashMap::new(),
            typing_timeout,
        }
    }

    pub fn typing_timeout(&self) -> Duration {
        self.typing_timeout
    }

    /// 房间内在线用户，按用户去重，按显示名排序
    pub fn online_users_in(
        &self,
        room: &RoomName,
        directory: &RoomDirectory,
        registry: &SessionRegistry,
    ) -> Vec<UserSummary> {
        let mut seen = HashSet::new();
        let mut users: Vec<UserSummary> = directory
            .members_of(room)
            .into_iter()
            .filter_map(|connection_id| registry.get(connection_id))
            .filter_map(|session| session.identity.map(|identity| identity.summary()))
            .filter(|user| seen.insert(user.user_id))
            .collect();
        users.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        users
    }

    /// 开始或刷新输入状态，首次开始时返回 `true`
    pub fn start_typing(&self, room: &RoomName, user: UserSummary) -> bool {
        self.start_typing_at(room, user, Instant::now())
    }

    fn start_typing_at(&self, room: &RoomName, user: UserSummary, now: Instant) -> bool {
        let mut entries = self.typing.entry(room.clone()).or_default();
        let user_id = user.user_id;
        let previous = entries.insert(
            user_id,
            TypingEntry {
                user,
                refreshed_at: now,
            },
        );
        match previous {
            None => true,
            Some(entry) => now.duration_since(entry.refreshed_at) >= self.typing_timeout,
        }
    }

    /// 停止输入，返回之前处于输入状态的用户
    pub fn stop_typing(&self, room: &RoomName, user_id: UserId) -> Option<UserSummary> {
        let mut removed = None;
        self.typing.remove_if_mut(room, |_, entries| {
            removed = entries.remove(&user_id).map(|entry| entry.user);
            entries.is_empty()
        });
        removed
    }

    /// 离开房间或断开连接时清理该用户的输入状态
    pub fn clear_user(&self, room: &RoomName, user_id: UserId) -> Option<UserSummary> {
        self.stop_typing(room, user_id)
    }

    pub fn typing_users_in(&self, room: &RoomName) -> HashSet<UserId> {
        self.typing_summaries_in(room)
            .into_iter()
            .map(|user| user.user_id)
            .collect()
    }

    /// 未过期的输入用户，按显示名排序
    pub fn typing_summaries_in(&self, room: &RoomName) -> Vec<UserSummary> {
        let now = Instant::now();
        let mut users: Vec<UserSummary> = self
            .typing
            .get(room)
            .map(|entries| {
                entries
                    .values()
                    .filter(|entry| now.duration_since(entry.refreshed_at) < self.typing_timeout)
                    .map(|entry| entry.user.clone())
                    .collect()
            })
            .unwrap_or_default();
        users.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        users
    }

    /// 清除超时的输入状态，返回被清除的 (房间, 用户)
    pub fn expire_stale(&self, now: Instant) -> Vec<(RoomName, UserSummary)> {
        let mut expired = Vec::new();
        self.typing.retain(|room, entries| {
            entries.retain(|_, entry| {
                let alive = now.duration_since(entry.refreshed_at) < self.typing_timeout;
                if !alive {
                    expired.push((room.clone(), entry.user.clone()));
                }
                alive
            });
            !entries.is_empty()
        });
        expired
    }

    pub fn clear(&self) {
        self.typing.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use domain::{ConnectionId, UserIdentity};
    use uuid::Uuid;

    fn user(name: &str) -> UserIdentity {
        UserIdentity::new(UserId::from(Uuid::new_v4()), name, None)
    }

    fn room() -> RoomName {
        RoomName::parse("general").unwrap()
    }

    #[test]
    fn test_online_users_are_deduplicated_and_sorted() {
        let directory = RoomDirectory::new();
        let registry = SessionRegistry::new();
        let tracker = PresenceTracker::new(Duration::from_secs(5));
        let general = room();

        let bob = user("bob");
        let alice = user("alice");
        // bob 开了两个标签页
        for identity in [bob.clone(), bob.clone(), alice.clone()] {
            let conn = ConnectionId::new();
            registry.register(conn, Utc::now());
            registry.attach_identity(conn, identity).unwrap();
            directory.join(&general, conn);
        }
        // 未认证的连接不计入在线列表
        let anonymous = ConnectionId::new();
        registry.register(anonymous, Utc::now());
        directory.join(&general, anonymous);

        let online = tracker.online_users_in(&general, &directory, &registry);
        assert_eq!(online, vec![alice.summary(), bob.summary()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_expires_after_timeout() {
        let tracker = PresenceTracker::new(Duration::from_secs(5));
        let general = room();
        let alice = user("alice").summary();

        assert!(tracker.start_typing(&general, alice.clone()));
        assert!(!tracker.start_typing(&general, alice.clone()));
        assert!(tracker.typing_users_in(&general).contains(&alice.user_id));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(tracker.typing_users_in(&general).is_empty());

        let expired = tracker.expire_stale(Instant::now());
        assert_eq!(expired, vec![(general.clone(), alice)]);
        assert!(tracker.expire_stale(Instant::now()).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_keeps_typing_alive() {
        let tracker = PresenceTracker::new(Duration::from_secs(5));
        let general = room();
        let alice = user("alice").summary();

        tracker.start_typing(&general, alice.clone());
        tokio::time::advance(Duration::from_secs(3)).await;
        tracker.start_typing(&general, alice.clone());
        tokio::time::advance(Duration::from_secs(3)).await;

        assert!(tracker.expire_stale(Instant::now()).is_empty());
        assert_eq!(tracker.typing_summaries_in(&general), vec![alice]);
    }

    #[test]
    fn test_stop_and_clear_remove_typing_state() {
        let tracker = PresenceTracker::new(Duration::from_secs(5));
        let general = room();
        let alice = user("alice").summary();

        tracker.start_typing(&general, alice.clone());
        assert_eq!(tracker.clear_user(&general, alice.user_id), Some(alice.clone()));
        assert_eq!(tracker.stop_typing(&general, alice.user_id), None);
        assert!(tracker.typing_users_in(&general).is_empty());
    }
}
