//! 引擎测试公共设施：内存存储、静态身份提供方、可注入故障的 mock 存储

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use application::{
    AuthError, BroadcastEngine, BroadcastEngineDependencies, ContentPolicy, EngineConnection,
    EngineSettings, IdentityProvider, OutboundReceiver, PersistenceStore, ServerEvent, SystemClock,
};
use async_trait::async_trait;
use domain::{
    Message, MessageId, RepositoryError, RoomInfo, RoomName, Timestamp, UserId, UserIdentity,
};
use mockall::mock;
use tokio::sync::Notify;
use uuid::Uuid;

/// 测试用内存存储
#[derive(Default)]
pub struct TestStore {
    messages: Mutex<Vec<Message>>,
    rooms: Mutex<HashMap<RoomName, RoomInfo>>,
    statuses: Mutex<HashMap<UserId, bool>>,
}

impl TestStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().unwrap().clone()
    }

    pub fn is_online(&self, user_id: UserId) -> Option<bool> {
        self.statuses.lock().unwrap().get(&user_id).copied()
    }
}

#[async_trait]
impl PersistenceStore for TestStore {
    async fn save_message(&self, message: Message) -> Result<Message, RepositoryError> {
        self.messages.lock().unwrap().push(message.clone());
        Ok(message)
    }

    async fn fetch_room_messages(
        &self,
        room: &RoomName,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, RepositoryError> {
        Ok(self
            .messages
            .lock()
            .unwrap()
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
        let query = query.to_lowercase();
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|message| room.as_ref().map_or(true, |room| &message.room == room))
            .filter(|message| message.text.to_lowercase().contains(&query))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_message(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .find(|message| message.id == id)
            .cloned())
    }

    async fn update_message(&self, message: Message) -> Result<Message, RepositoryError> {
        let mut messages = self.messages.lock().unwrap();
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
        _display_name: &str,
        is_online: bool,
        _last_seen: Timestamp,
    ) -> Result<(), RepositoryError> {
        self.statuses.lock().unwrap().insert(user_id, is_online);
        Ok(())
    }

    async fn find_room(&self, name: &RoomName) -> Result<Option<RoomInfo>, RepositoryError> {
        Ok(self.rooms.lock().unwrap().get(name).cloned())
    }

    async fn save_room(&self, room: RoomInfo) -> Result<RoomInfo, RepositoryError> {
        self.rooms
            .lock()
            .unwrap()
            .insert(room.name.clone(), room.clone());
        Ok(room)
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "test"
    }
}

/// 可以拖慢历史读取、挂起写入的存储，用来构造加入与写入过程中的交错
#[derive(Default)]
pub struct GatedStore {
    pub inner: TestStore,
    history_delay: Mutex<Option<Duration>>,
    hold_saves: Mutex<bool>,
    /// 写入已进入存储、正在等待放行
    pub save_started: Notify,
    pub release_save: Notify,
}

impl GatedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delay_history(&self, delay: Duration) {
        *self.history_delay.lock().unwrap() = Some(delay);
    }

    pub fn hold_saves(&self) {
        *self.hold_saves.lock().unwrap() = true;
    }
}

#[async_trait]
impl PersistenceStore for GatedStore {
    async fn save_message(&self, message: Message) -> Result<Message, RepositoryError> {
        let hold = *self.hold_saves.lock().unwrap();
        if hold {
            self.save_started.notify_one();
            self.release_save.notified().await;
        }
        self.inner.save_message(message).await
    }

    async fn fetch_room_messages(
        &self,
        room: &RoomName,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, RepositoryError> {
        let delay = *self.history_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.fetch_room_messages(room, limit, offset).await
    }

    async fn search_messages(
        &self,
        query: &str,
        room: Option<RoomName>,
        limit: usize,
    ) -> Result<Vec<Message>, RepositoryError> {
        self.inner.search_messages(query, room, limit).await
    }

    async fn find_message(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
        self.inner.find_message(id).await
    }

    async fn update_message(&self, message: Message) -> Result<Message, RepositoryError> {
        self.inner.update_message(message).await
    }

    async fn upsert_user_status(
        &self,
        user_id: UserId,
        display_name: &str,
        is_online: bool,
        last_seen: Timestamp,
    ) -> Result<(), RepositoryError> {
        self.inner
            .upsert_user_status(user_id, display_name, is_online, last_seen)
            .await
    }

    async fn find_room(&self, name: &RoomName) -> Result<Option<RoomInfo>, RepositoryError> {
        self.inner.find_room(name).await
    }

    async fn save_room(&self, room: RoomInfo) -> Result<RoomInfo, RepositoryError> {
        self.inner.save_room(room).await
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "gated"
    }
}

mock! {
    pub Store {}

    #[async_trait]
    impl PersistenceStore for Store {
        async fn save_message(&self, message: Message) -> Result<Message, RepositoryError>;
        async fn fetch_room_messages(
            &self,
            room: &RoomName,
            limit: usize,
            offset: usize,
        ) -> Result<Vec<Message>, RepositoryError>;
        async fn search_messages(
            &self,
            query: &str,
            room: Option<RoomName>,
            limit: usize,
        ) -> Result<Vec<Message>, RepositoryError>;
        async fn find_message(&self, id: MessageId) -> Result<Option<Message>, RepositoryError>;
        async fn update_message(&self, message: Message) -> Result<Message, RepositoryError>;
        async fn upsert_user_status(
            &self,
            user_id: UserId,
            display_name: &str,
            is_online: bool,
            last_seen: Timestamp,
        ) -> Result<(), RepositoryError>;
        async fn find_room(&self, name: &RoomName) -> Result<Option<RoomInfo>, RepositoryError>;
        async fn save_room(&self, room: RoomInfo) -> Result<RoomInfo, RepositoryError>;
        async fn ping(&self) -> Result<(), RepositoryError>;
        fn kind(&self) -> &'static str;
    }
}

/// 所有读写都失败的存储
pub fn unavailable_store() -> MockStore {
    let mut store = MockStore::new();
    store
        .expect_save_message()
        .returning(|_| Err(RepositoryError::storage("database is down")));
    store
        .expect_fetch_room_messages()
        .returning(|_, _, _| Err(RepositoryError::storage("database is down")));
    store
        .expect_find_message()
        .returning(|_| Err(RepositoryError::storage("database is down")));
    store
        .expect_update_message()
        .returning(|_| Err(RepositoryError::storage("database is down")));
    store
        .expect_upsert_user_status()
        .returning(|_, _, _, _| Err(RepositoryError::storage("database is down")));
    store
        .expect_find_room()
        .returning(|_| Err(RepositoryError::storage("database is down")));
    store
        .expect_save_room()
        .returning(|_| Err(RepositoryError::storage("database is down")));
    store
        .expect_ping()
        .returning(|| Err(RepositoryError::storage("database is down")));
    store.expect_kind().return_const("mock");
    store
}

/// 令牌即用户名的身份提供方
pub struct StaticIdentityProvider {
    users: HashMap<String, UserIdentity>,
}

impl StaticIdentityProvider {
    pub fn with_users(names: &[&str]) -> Self {
        let users = names
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    UserIdentity::new(UserId::from(Uuid::new_v4()), *name, None),
                )
            })
            .collect();
        Self { users }
    }

    pub fn identity(&self, name: &str) -> UserIdentity {
        self.users[name].clone()
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn verify(&self, token: &str) -> Result<UserIdentity, AuthError> {
        self.users
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::InvalidToken("unknown user".into()))
    }
}

pub const USERS: &[&str] = &["alice", "bob", "carol", "dave"];

pub struct TestHarness {
    pub engine: BroadcastEngine,
    pub identities: Arc<StaticIdentityProvider>,
}

impl TestHarness {
    pub fn new(store: Arc<dyn PersistenceStore>) -> Self {
        Self::with_policy(store, ContentPolicy::new(["spam"], Some(1000)).unwrap())
    }

    pub fn with_policy(store: Arc<dyn PersistenceStore>, policy: ContentPolicy) -> Self {
        Self::build(store, policy, EngineSettings::default())
    }

    pub fn with_settings(store: Arc<dyn PersistenceStore>, settings: EngineSettings) -> Self {
        Self::build(store, ContentPolicy::new(["spam"], Some(1000)).unwrap(), settings)
    }

    fn build(
        store: Arc<dyn PersistenceStore>,
        policy: ContentPolicy,
        settings: EngineSettings,
    ) -> Self {
        let identities = Arc::new(StaticIdentityProvider::with_users(USERS));
        let engine = BroadcastEngine::new(BroadcastEngineDependencies {
            store,
            identity_provider: identities.clone(),
            policy,
            clock: Arc::new(SystemClock),
            settings,
        });
        Self { engine, identities }
    }

    /// 连接、认证并加入房间，清掉加入过程中产生的事件
    pub async fn joined(&self, name: &str, room: &str) -> EngineConnection {
        let mut connection = self.engine.connect();
        self.engine.identify(connection.id, name).await.unwrap();
        self.engine
            .join(connection.id, room, application::JoinReply::History)
            .await
            .unwrap();
        drain(&mut connection.outbound);
        connection
    }
}

pub fn room(name: &str) -> RoomName {
    RoomName::parse(name).unwrap()
}

/// 取下一条事件，超时视为测试失败
pub async fn next_event(rx: &mut OutboundReceiver) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("outbound channel closed")
}

/// 跳过无关事件，直到找到指定名称的事件
pub async fn next_named(rx: &mut OutboundReceiver, name: &str) -> ServerEvent {
    loop {
        let event = next_event(rx).await;
        if event.name() == name {
            return event;
        }
    }
}

/// 取出当前已入队的全部事件
pub fn drain(rx: &mut OutboundReceiver) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
