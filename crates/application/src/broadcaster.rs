//! 出站事件路由
//!
//! 每个连接一个无界 FIFO 通道，由连接自己的发送任务消费。
//! 对同一连接的发送顺序即对端观察到的顺序。

use dashmap::DashMap;
use domain::ConnectionId;
use tokio::sync::mpsc;

use crate::events::ServerEvent;

pub type OutboundSender = mpsc::UnboundedSender<ServerEvent>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<ServerEvent>;

#[derive(Default)]
pub struct ConnectionRouter {
    channels: DashMap<ConnectionId, OutboundSender>,
}

impl ConnectionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为连接创建出站通道，重复调用会替换旧通道
    pub fn attach(&self, connection_id: ConnectionId) -> OutboundReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.insert(connection_id, tx);
        rx
    }

    pub fn detach(&self, connection_id: ConnectionId) {
        self.channels.remove(&connection_id);
    }

    /// 发送给单个连接；连接已不存在或接收端已关闭时返回 `false`
    pub fn send_to(&self, connection_id: ConnectionId, event: ServerEvent) -> bool {
        let delivered = match self.channels.get(&connection_id) {
            Some(sender) => sender.send(event).is_ok(),
            None => return false,
        };
        if !delivered {
            tracing::debug!(connection_id = %connection_id, "出站通道已关闭，移除连接");
            self.channels.remove(&connection_id);
        }
        delivered
    }

    /// 扇出给一组连接，返回成功投递的数量
    pub fn fan_out<I>(&self, recipients: I, event: &ServerEvent) -> usize
    where
        I: IntoIterator<Item = ConnectionId>,
    {
        recipients
            .into_iter()
            .filter(|connection_id| self.send_to(*connection_id, event.clone()))
            .count()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// 丢弃所有出站通道，各连接的发送任务随之结束
    pub fn clear(&self) {
        self.channels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_out_skips_vanished_connections() {
        let router = ConnectionRouter::new();
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        let gone = ConnectionId::new();

        let mut rx_a = router.attach(a);
        let rx_b = router.attach(b);
        drop(rx_b);

        let delivered = router.fan_out([a, b, gone], &ServerEvent::Pong);
        assert_eq!(delivered, 1);
        assert_eq!(rx_a.try_recv().unwrap(), ServerEvent::Pong);
        // 接收端关闭的连接被顺手清理
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn test_events_arrive_in_send_order() {
        let router = ConnectionRouter::new();
        let conn = ConnectionId::new();
        let mut rx = router.attach(conn);

        for i in 0..5 {
            router.send_to(conn, ServerEvent::error(format!("e{i}")));
        }
        for i in 0..5 {
            assert_eq!(rx.try_recv().unwrap(), ServerEvent::error(format!("e{i}")));
        }
    }
}
