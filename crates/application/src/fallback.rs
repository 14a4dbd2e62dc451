//! 存储不可用时的兜底队列
//!
//! 有界环形缓冲，满了丢弃最旧的消息。只在读取存储失败时用来回答历史请求。

use std::collections::VecDeque;
use std::sync::Mutex;

use domain::{Message, MessageId, RoomName};

pub struct BestEffortQueue {
    capacity: usize,
    messages: Mutex<VecDeque<Message>>,
}

impl BestEffortQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            messages: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 追加一条消息，返回因容量被挤出的旧消息
    pub fn push(&self, message: Message) -> Option<Message> {
        let mut messages = self.lock();
        let evicted = if messages.len() >= self.capacity {
            messages.pop_front()
        } else {
            None
        };
        messages.push_back(message);
        evicted
    }

    /// 房间最近的消息，最新的在前，和存储的返回顺序一致
    pub fn recent(&self, room: &RoomName, limit: usize) -> Vec<Message> {
        self.lock()
            .iter()
            .rev()
            .filter(|message| &message.room == room)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn find(&self, id: MessageId) -> Option<Message> {
        self.lock().iter().find(|message| message.id == id).cloned()
    }

    /// 替换缓冲中的同 ID 消息，不存在时返回 `false`
    pub fn replace(&self, message: Message) -> bool {
        let mut messages = self.lock();
        match messages.iter_mut().find(|existing| existing.id == message.id) {
            Some(existing) => {
                *existing = message;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Message>> {
        // 临界区内没有会 panic 的操作，中毒时直接取回数据
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
