//! 房间目录
//!
//! 房间名到成员连接集合的映射。房间只在有成员时存在，最后一个成员离开时立即回收。

use std::collections::HashSet;

use dashmap::DashMap;
use domain::{ConnectionId, RoomName};

#[derive(Default)]
pub struct RoomDirectory {
    rooms: DashMap<RoomName, HashSet<ConnectionId>>,
}

impl RoomDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加入房间，已经是成员时返回 `false`
    pub fn join(&self, room: &RoomName, connection_id: ConnectionId) -> bool {
        self.rooms
            .entry(room.clone())
            .or_default()
            .insert(connection_id)
    }

    /// 离开房间，成员集合为空时在同一把分片锁内删除房间
    pub fn leave(&self, room: &RoomName, connection_id: ConnectionId) -> bool {
        let mut removed = false;
        self.rooms.remove_if_mut(room, |_, members| {
            removed = members.remove(&connection_id);
            members.is_empty()
        });
        removed
    }

    pub fn members_of(&self, room: &RoomName) -> HashSet<ConnectionId> {
        self.rooms
            .get(room)
            .map(|members| members.value().clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, room: &RoomName, connection_id: ConnectionId) -> bool {
        self.rooms
            .get(room)
            .map(|members| members.contains(&connection_id))
            .unwrap_or(false)
    }

    pub fn is_empty(&self, room: &RoomName) -> bool {
        !self.rooms.contains_key(room)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn rooms(&self) -> Vec<RoomName> {
        self.rooms.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn clear(&self) {
        self.rooms.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn room(name: &str) -> RoomName {
        RoomName::parse(name).unwrap()
    }

    #[test]
    fn test_members_are_exactly_joined_minus_left() {
        let directory = RoomDirectory::new();
        let general = room("general");
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        let c = ConnectionId::new();

        assert!(directory.join(&general, a));
        assert!(!directory.join(&general, a));
        directory.join(&general, b);
        directory.join(&general, c);
        assert!(directory.leave(&general, b));
        assert!(!directory.leave(&general, b));

        let members = directory.members_of(&general);
        assert_eq!(members, HashSet::from([a, c]));
    }

    #[test]
    fn test_empty_room_is_evicted() {
        let directory = RoomDirectory::new();
        let lobby = room("lobby");
        let conn = ConnectionId::new();

        directory.join(&lobby, conn);
        assert_eq!(directory.room_count(), 1);
        directory.leave(&lobby, conn);
        assert!(directory.is_empty(&lobby));
        assert_eq!(directory.room_count(), 0);
        assert!(directory.members_of(&lobby).is_empty());
    }

    #[test]
    fn test_leaving_unknown_room_is_noop() {
        let directory = RoomDirectory::new();
        assert!(!directory.leave(&room("nowhere"), ConnectionId::new()));
        assert_eq!(directory.room_count(), 0);
    }

    #[test]
    fn test_concurrent_joins_and_leaves_stay_consistent() {
        let directory = Arc::new(RoomDirectory::new());
        let general = room("general");
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let directory = directory.clone();
                let general = general.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let conn = ConnectionId::new();
                        directory.join(&general, conn);
                        directory.leave(&general, conn);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(directory.is_empty(&general));
    }
}
