use async_trait::async_trait;
use domain::{Message, MessageId, RepositoryError, RoomInfo, RoomName, Timestamp, UserId};

/// 消息、房间元数据与用户状态的持久化存储
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    // 保存消息，返回存储后的消息
    async fn save_message(&self, message: Message) -> Result<Message, RepositoryError>;

    // 房间消息，最新的在前，支持 offset 分页
    async fn fetch_room_messages(
        &self,
        room: &RoomName,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, RepositoryError>;

    // 按正文做不区分大小写的子串搜索，最新的在前
    async fn search_messages(
        &self,
        query: &str,
        room: Option<RoomName>,
        limit: usize,
    ) -> Result<Vec<Message>, RepositoryError>;

    async fn find_message(&self, id: MessageId) -> Result<Option<Message>, RepositoryError>;

    // 编辑或软删除后整体回写
    async fn update_message(&self, message: Message) -> Result<Message, RepositoryError>;

    // 同步用户在线状态与最后在线时间
    async fn upsert_user_status(
        &self,
        user_id: UserId,
        display_name: &str,
        is_online: bool,
        last_seen: Timestamp,
    ) -> Result<(), RepositoryError>;

    async fn find_room(&self, name: &RoomName) -> Result<Option<RoomInfo>, RepositoryError>;

    // 按房间名插入或整体覆盖
    async fn save_room(&self, room: RoomInfo) -> Result<RoomInfo, RepositoryError>;

    // 健康检查用的连通性探测
    async fn ping(&self) -> Result<(), RepositoryError>;

    /// 存储类型名称，用于健康检查输出
    fn kind(&self) -> &'static str;
}
