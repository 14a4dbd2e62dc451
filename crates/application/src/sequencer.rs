use std::sync::Arc;

use dashmap::DashMap;
use domain::RoomName;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// 房间内消息顺序器
///
/// 每个房间一把异步互斥锁，从持久化开始一直持有到扇出完成，
/// 同时分配房间内递增的序号。这样同一房间的所有接收者看到同一个全序。
#[derive(Default)]
pub struct RoomSequencer {
    rooms: DashMap<RoomName, Arc<Mutex<u64>>>,
}

/// 持有期间独占房间的写入与扇出
pub struct RoomSlot {
    guard: OwnedMutexGuard<u64>,
}

impl RoomSlot {
    /// 分配下一个序号（从 1 开始）
    pub fn next_sequence(&mut self) -> u64 {
        *self.guard += 1;
        *self.guard
    }

    pub fn current_sequence(&self) -> u64 {
        *self.guard
    }
}

impl RoomSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, room: &RoomName) -> RoomSlot {
        // 先克隆出 Arc 再 await，避免持有分片锁跨越挂起点
        let lock = self
            .rooms
            .entry(room.clone())
            .or_insert_with(|| Arc::new(Mutex::new(0)))
            .clone();
        RoomSlot {
            guard: lock.lock_owned().await,
        }
    }

    /// 房间清空后释放其计数器；仍有写入在进行时保留
    pub fn release_idle(&self, room: &RoomName) {
        self.rooms
            .remove_if(room, |_, lock| Arc::strong_count(lock) == 1);
    }

    pub fn tracked_rooms(&self) -> usize {
        self.rooms.len()
    }

    pub fn clear(&self) {
        self.rooms.clear();
    }
}
