use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use config::ChatConfig;
use domain::{
    Attachment, ConnectionId, DomainError, Message, MessageId, MessageKind, RoomInfo, RoomName,
    RoomSettings, UserIdentity, UserId, UserSummary,
};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::{
    broadcaster::{ConnectionRouter, OutboundReceiver},
    clock::Clock,
    content_policy::ContentPolicy,
    error::ApplicationError,
    events::{ClientEvent, ServerEvent},
    fallback::BestEffortQueue,
    identity::{AuthError, IdentityProvider},
    presence::PresenceTracker,
    repository::PersistenceStore,
    room_directory::RoomDirectory,
    sequencer::{RoomSequencer, RoomSlot},
    session_registry::{Session, SessionRegistry},
};

/// 引擎运行参数
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub default_room: RoomName,
    pub history_limit: usize,
    pub search_limit: usize,
    pub fallback_capacity: usize,
    pub typing_timeout: Duration,
    pub typing_sweep_interval: Duration,
    /// 房间没有单独设置上限时的在线用户上限
    pub room_capacity: usize,
}

/// 分页偏移量上限，超出后存储层无法表示
const MAX_PAGE_OFFSET: usize = i64::MAX as usize;

impl EngineSettings {
    pub fn from_config(chat: &ChatConfig) -> Result<Self, ApplicationError> {
        Ok(Self {
            default_room: RoomName::parse(chat.default_room.as_str())?,
            history_limit: chat.history_limit,
            search_limit: chat.search_limit,
            fallback_capacity: chat.fallback_capacity,
            typing_timeout: Duration::from_secs(chat.typing_timeout_secs),
            typing_sweep_interval: Duration::from_millis(chat.typing_sweep_interval_ms),
            room_capacity: chat.room_capacity,
        })
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_room: RoomName::parse("general").expect("default room name is valid"),
            history_limit: 50,
            search_limit: 20,
            fallback_capacity: 1000,
            typing_timeout: Duration::from_secs(5),
            typing_sweep_interval: Duration::from_secs(1),
            room_capacity: 100,
        }
    }
}

pub struct BroadcastEngineDependencies {
    pub store: Arc<dyn PersistenceStore>,
    pub identity_provider: Arc<dyn IdentityProvider>,
    pub policy: ContentPolicy,
    pub clock: Arc<dyn Clock>,
    pub settings: EngineSettings,
}

/// 新连接：连接 ID 与它的出站事件流
pub struct EngineConnection {
    pub id: ConnectionId,
    pub outbound: OutboundReceiver,
}

/// 加入房间后给加入者的回复形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinReply {
    /// `join_chat`：回复 `message_history`
    History,
    /// `join_room`：回复 `room_joined`，附带在线与输入中的用户
    Snapshot,
}

/// 发送消息请求
#[derive(Debug, Clone, Default)]
pub struct SendMessageRequest {
    pub text: String,
    pub room: Option<String>,
    pub kind: Option<MessageKind>,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
}

/// 房间分页结果，最新的在前
#[derive(Debug, Clone)]
pub struct RoomPage {
    pub messages: Vec<Message>,
    pub has_more: bool,
}

/// 存储健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreHealth {
    pub kind: &'static str,
    pub available: bool,
}

struct EngineState {
    deps: BroadcastEngineDependencies,
    sessions: SessionRegistry,
    rooms: RoomDirectory,
    presence: PresenceTracker,
    router: ConnectionRouter,
    sequencer: RoomSequencer,
    fallback: BestEffortQueue,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// 实时广播引擎
///
/// 显式构造、自带全部注册表，多个引擎可以在同一进程中并存。
/// 内存状态的修改都是同步的，只在读写存储和验证身份时挂起。
#[derive(Clone)]
pub struct BroadcastEngine {
    state: Arc<EngineState>,
}

impl BroadcastEngine {
    pub fn new(deps: BroadcastEngineDependencies) -> Self {
        let presence = PresenceTracker::new(deps.settings.typing_timeout);
        let fallback = BestEffortQueue::new(deps.settings.fallback_capacity);
        Self {
            state: Arc::new(EngineState {
                deps,
                sessions: SessionRegistry::new(),
                rooms: RoomDirectory::new(),
                presence,
                router: ConnectionRouter::new(),
                sequencer: RoomSequencer::new(),
                fallback,
                sweeper: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.state.deps.settings
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.state.sessions
    }

    pub fn rooms(&self) -> &RoomDirectory {
        &self.state.rooms
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.state.presence
    }

    pub fn fallback(&self) -> &BestEffortQueue {
        &self.state.fallback
    }

    /// 新连接进入：创建会话与出站通道
    pub fn connect(&self) -> EngineConnection {
        let id = ConnectionId::new();
        let outbound = self.state.router.attach(id);
        self.state.sessions.register(id, self.state.deps.clock.now());
        tracing::debug!(connection_id = %id, "新连接已注册");
        EngineConnection { id, outbound }
    }

    /// 验证凭证并把身份挂到会话上
    pub async fn identify(
        &self,
        connection_id: ConnectionId,
        token: &str,
    ) -> Result<UserIdentity, ApplicationError> {
        let identity = match self.state.deps.identity_provider.verify(token).await {
            Ok(identity) => identity,
            Err(err) => {
                tracing::warn!(connection_id = %connection_id, error = %err, "身份验证失败");
                return Err(err.into());
            }
        };

        // 验证期间连接可能已经断开
        self.state
            .sessions
            .attach_identity(connection_id, identity.clone())?;
        tracing::info!(
            connection_id = %connection_id,
            user_id = %identity.user_id,
            display_name = %identity.display_name,
            "连接身份已验证"
        );

        self.mirror_status(&identity, true).await;
        Ok(identity)
    }

    /// 加入房间；已在其他房间时先离开
    ///
    /// 从加入目录到回复入队一直持有目标房间的顺序器，
    /// 期间持久化的消息要么出现在历史里，要么在回复之后到达。
    pub async fn join(
        &self,
        connection_id: ConnectionId,
        room: &str,
        reply: JoinReply,
    ) -> Result<(), ApplicationError> {
        let room = RoomName::parse(room)?;
        let session = self.session(connection_id)?;
        let identity = session
            .identity
            .clone()
            .ok_or_else(|| ApplicationError::invalid_state("authenticate before joining a room"))?;
        let capacity = self.room_capacity(&room).await;

        let _slot = self.state.sequencer.acquire(&room).await;
        if session.room.as_ref() != Some(&room) {
            let occupants = self.online_users(&room);
            let already_present = occupants
                .iter()
                .any(|user| user.user_id == identity.user_id);
            if !already_present && occupants.len() >= capacity {
                tracing::info!(
                    connection_id = %connection_id,
                    room = %room,
                    capacity,
                    "房间已满，拒绝加入"
                );
                return Err(ApplicationError::RoomFull { room, capacity });
            }
        }

        let previous = self
            .state
            .sessions
            .set_room(connection_id, Some(room.clone()))?;
        if let Some(previous) = previous.filter(|previous| previous != &room) {
            self.depart(connection_id, &previous, &identity);
        }

        let newly_joined = self.state.rooms.join(&room, connection_id);
        // 等待顺序器期间连接可能已经断开，断开清理看不到这次加入，这里自己撤销
        let still_here = self
            .state
            .sessions
            .get(connection_id)
            .is_some_and(|session| session.room.as_ref() == Some(&room));
        if !still_here {
            self.state.rooms.leave(&room, connection_id);
            tracing::debug!(connection_id = %connection_id, room = %room, "加入过程中连接已断开");
            return Ok(());
        }
        tracing::info!(
            connection_id = %connection_id,
            room = %room,
            user_id = %identity.user_id,
            newly_joined,
            "用户加入房间"
        );

        let mut history = self.load_history(&room, self.settings().history_limit).await;
        history.reverse();

        // 读取历史期间连接可能已经断开或切走
        if !self.state.rooms.contains(&room, connection_id) {
            return Ok(());
        }

        let online_users = self.online_users(&room);
        let reply_event = match reply {
            JoinReply::History => ServerEvent::MessageHistory {
                room: room.clone(),
                messages: history,
            },
            JoinReply::Snapshot => ServerEvent::RoomJoined {
                room: room.clone(),
                messages: history,
                online_users: online_users.clone(),
                typing_users: self.state.presence.typing_summaries_in(&room),
            },
        };
        self.state.router.send_to(connection_id, reply_event);

        if newly_joined {
            let joined = ServerEvent::UserJoined {
                room: room.clone(),
                user: identity.summary(),
                timestamp: self.state.deps.clock.now(),
            };
            self.state.router.fan_out(
                self.members_except_connection(&room, connection_id),
                &joined,
            );
        }
        self.broadcast_online_users(&room, online_users);
        Ok(())
    }

    /// 发送消息
    ///
    /// 过滤通过后先占住房间顺序器再派生持久化与扇出任务，
    /// 同一连接的消息按提交顺序广播；发送者中途断开也不影响写入完成。
    pub async fn send_message(
        &self,
        connection_id: ConnectionId,
        request: SendMessageRequest,
    ) -> Result<JoinHandle<()>, ApplicationError> {
        let (identity, room) = self.require_room(connection_id, request.room.as_deref())?;

        let kind = request.kind.unwrap_or_default();
        let attachment = Attachment::from_parts(request.file_url, request.file_name)?;
        let verdict =
            self.state
                .deps
                .policy
                .evaluate(&request.text, kind, attachment.is_some());
        if let Some(reason) = verdict.rejection_reason() {
            tracing::info!(
                connection_id = %connection_id,
                room = %room,
                violations = ?verdict.violations,
                "消息被内容策略拒绝"
            );
            return Err(ApplicationError::PolicyRejected {
                reason: reason.to_string(),
                violations: verdict.violations,
            });
        }
        if !verdict.violations.is_empty() {
            tracing::debug!(
                connection_id = %connection_id,
                room = %room,
                violations = ?verdict.violations,
                "消息内容已净化"
            );
        }

        // 拿到顺序器之后再打时间戳，时间戳顺序与广播顺序一致
        let slot = self.state.sequencer.acquire(&room).await;
        let message = Message::new(
            MessageId::new(),
            room.clone(),
            &identity,
            verdict.sanitized_text,
            kind,
            attachment,
            self.state.deps.clock.now(),
        )?;

        let state = self.state.clone();
        Ok(tokio::spawn(async move {
            persist_and_broadcast(state, slot, message).await;
        }))
    }

    /// 输入提示开始/结束
    pub fn typing(
        &self,
        connection_id: ConnectionId,
        room: Option<&str>,
        started: bool,
    ) -> Result<(), ApplicationError> {
        let (identity, room) = self.require_room(connection_id, room)?;
        let user = identity.summary();

        if started {
            if self.state.presence.start_typing(&room, user.clone()) {
                let event = ServerEvent::UserTyping {
                    room: room.clone(),
                    user,
                };
                self.state
                    .router
                    .fan_out(self.members_except_user(&room, identity.user_id), &event);
            }
        } else if let Some(user) = self.state.presence.stop_typing(&room, identity.user_id) {
            let event = ServerEvent::UserStopTyping {
                room: room.clone(),
                user,
            };
            self.state
                .router
                .fan_out(self.members_except_user(&room, identity.user_id), &event);
        }
        Ok(())
    }

    /// 离开当前房间
    pub fn leave(&self, connection_id: ConnectionId, room: Option<&str>) -> Result<(), ApplicationError> {
        let (identity, room) = self.require_room(connection_id, room)?;
        self.state.sessions.set_room(connection_id, None)?;
        self.depart(connection_id, &room, &identity);
        tracing::info!(connection_id = %connection_id, room = %room, "用户离开房间");
        Ok(())
    }

    /// 编辑自己的消息
    pub async fn edit_message(
        &self,
        connection_id: ConnectionId,
        message_id: MessageId,
        text: &str,
    ) -> Result<Message, ApplicationError> {
        let (identity, room) = self.require_room(connection_id, None)?;
        let (mut message, buffered) = self.locate_message(message_id, &room).await?;

        let verdict = self.state.deps.policy.evaluate(
            text,
            message.kind,
            message.attachment.is_some(),
        );
        if let Some(reason) = verdict.rejection_reason() {
            return Err(ApplicationError::PolicyRejected {
                reason: reason.to_string(),
                violations: verdict.violations,
            });
        }

        message.edit(
            identity.user_id,
            verdict.sanitized_text,
            self.state.deps.clock.now(),
        )?;
        let message = self.write_back(message, buffered).await?;
        tracing::info!(
            connection_id = %connection_id,
            room = %room,
            message_id = %message.id,
            "消息已编辑"
        );

        self.broadcast_sequenced(
            &room,
            ServerEvent::MessageEdited {
                message: message.clone(),
            },
        )
        .await;
        Ok(message)
    }

    /// 软删除自己的消息
    pub async fn delete_message(
        &self,
        connection_id: ConnectionId,
        message_id: MessageId,
    ) -> Result<Message, ApplicationError> {
        let (identity, room) = self.require_room(connection_id, None)?;
        let (mut message, buffered) = self.locate_message(message_id, &room).await?;

        message.soft_delete(identity.user_id, self.state.deps.clock.now())?;
        let message = self.write_back(message, buffered).await?;
        tracing::info!(
            connection_id = %connection_id,
            room = %room,
            message_id = %message.id,
            "消息已删除"
        );

        self.broadcast_sequenced(
            &room,
            ServerEvent::MessageDeleted {
                message: message.clone(),
            },
        )
        .await;
        Ok(message)
    }

    /// 连接断开：移除会话、离开房间、清理输入状态并同步离线状态
    pub async fn disconnect(&self, connection_id: ConnectionId) {
        self.state.router.detach(connection_id);
        let Some(session) = self.state.sessions.remove(connection_id) else {
            tracing::debug!(connection_id = %connection_id, "断开的连接已不存在");
            return;
        };

        if let (Some(identity), Some(room)) = (&session.identity, &session.room) {
            self.depart(connection_id, room, identity);
        } else if let Some(room) = &session.room {
            self.state.rooms.leave(room, connection_id);
        }
        tracing::info!(
            connection_id = %connection_id,
            room = ?session.room.as_ref().map(|room| room.as_str()),
            "连接已断开"
        );

        if let Some(identity) = session.identity {
            self.broadcast_online_count();
            // 同一用户的其他连接仍在线时不标记离线
            if !self.user_has_sessions(identity.user_id) {
                self.mirror_status(&identity, false).await;
            }
        }
    }

    /// 事件分发入口
    ///
    /// 返回 `Err` 表示需要关闭连接（身份验证失败）；其他错误只回给发送者。
    pub async fn handle(
        &self,
        connection_id: ConnectionId,
        event: ClientEvent,
    ) -> Result<(), ApplicationError> {
        let event_name = event.name();
        if self
            .state
            .sessions
            .touch(connection_id, self.state.deps.clock.now())
            .is_err()
        {
            tracing::debug!(connection_id = %connection_id, event = event_name, "会话不存在，丢弃事件");
            return Ok(());
        }

        let result = match event {
            ClientEvent::JoinChat { token, room } => {
                self.handle_join(connection_id, token, room, JoinReply::History)
                    .await
            }
            ClientEvent::JoinRoom { room, token } => {
                self.handle_join(connection_id, token, Some(room), JoinReply::Snapshot)
                    .await
            }
            ClientEvent::SendMessage {
                text,
                room,
                message_type,
                file_url,
                file_name,
            } => self
                .send_message(
                    connection_id,
                    SendMessageRequest {
                        text,
                        room,
                        kind: message_type,
                        file_url,
                        file_name,
                    },
                )
                .await
                .map(|_| ()),
            ClientEvent::TypingStart { room } => {
                self.typing(connection_id, room.as_deref(), true)
            }
            ClientEvent::TypingStop { room } => {
                self.typing(connection_id, room.as_deref(), false)
            }
            ClientEvent::LeaveRoom { room } => self.leave(connection_id, room.as_deref()),
            ClientEvent::EditMessage { message_id, text } => self
                .edit_message(connection_id, message_id, &text)
                .await
                .map(|_| ()),
            ClientEvent::DeleteMessage { message_id } => self
                .delete_message(connection_id, message_id)
                .await
                .map(|_| ()),
            ClientEvent::Ping => {
                self.state.router.send_to(connection_id, ServerEvent::Pong);
                Ok(())
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(err @ ApplicationError::Authentication(_)) => {
                self.state
                    .router
                    .send_to(connection_id, ServerEvent::error(err.client_message()));
                Err(err)
            }
            Err(ApplicationError::SessionNotFound(_)) => {
                tracing::debug!(connection_id = %connection_id, event = event_name, "会话在处理中断开");
                Ok(())
            }
            Err(err) => {
                match &err {
                    ApplicationError::Repository(_) | ApplicationError::Infrastructure(_) => {
                        tracing::warn!(connection_id = %connection_id, event = event_name, error = %err, "事件处理失败");
                    }
                    _ => {
                        tracing::debug!(connection_id = %connection_id, event = event_name, error = %err, "事件被拒绝");
                    }
                }
                self.state
                    .router
                    .send_to(connection_id, ServerEvent::error(err.client_message()));
                Ok(())
            }
        }
    }

    /// 已认证的在线连接数
    pub fn online_count(&self) -> usize {
        self.state.sessions.identified_count()
    }

    /// 房间在线用户（去重、按显示名排序）
    pub fn online_users(&self, room: &RoomName) -> Vec<UserSummary> {
        self.state
            .presence
            .online_users_in(room, &self.state.rooms, &self.state.sessions)
    }

    /// 最近消息，最早的在前；存储不可用时退回兜底队列
    pub async fn recent_messages(
        &self,
        room: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, ApplicationError> {
        let room = RoomName::parse(room)?;
        let limit = limit.unwrap_or(self.settings().history_limit);
        let mut messages = self.load_history(&room, limit).await;
        messages.reverse();
        Ok(messages)
    }

    /// 房间消息分页，最新的在前
    pub async fn room_messages(
        &self,
        room: &str,
        limit: usize,
        skip: usize,
    ) -> Result<RoomPage, ApplicationError> {
        let room = RoomName::parse(room)?;
        if skip > MAX_PAGE_OFFSET {
            return Err(DomainError::invalid_argument("skip", "offset is too large").into());
        }
        let mut messages = self
            .state
            .deps
            .store
            .fetch_room_messages(&room, limit.saturating_add(1), skip)
            .await?;
        let has_more = messages.len() > limit;
        messages.truncate(limit);
        Ok(RoomPage { messages, has_more })
    }

    /// 按正文搜索，不区分大小写
    pub async fn search_messages(
        &self,
        query: &str,
        room: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Message>, ApplicationError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(DomainError::invalid_argument("q", "search query is required").into());
        }
        let room = room
            .filter(|room| !room.trim().is_empty())
            .map(RoomName::parse)
            .transpose()?;
        let limit = limit.unwrap_or(self.settings().search_limit);
        Ok(self
            .state
            .deps
            .store
            .search_messages(query, room, limit)
            .await?)
    }

    /// 房间元数据
    pub async fn room_info(&self, room: &str) -> Result<RoomInfo, ApplicationError> {
        let room = RoomName::parse(room)?;
        self.state
            .deps
            .store
            .find_room(&room)
            .await?
            .ok_or_else(|| ApplicationError::not_found("room"))
    }

    /// 创建或修改房间元数据；已有记录时只有创建者可以修改
    pub async fn configure_room(
        &self,
        editor: &UserIdentity,
        room: &str,
        settings: RoomSettings,
    ) -> Result<RoomInfo, ApplicationError> {
        let room = RoomName::parse(room)?;
        let now = self.state.deps.clock.now();
        let info = match self.state.deps.store.find_room(&room).await? {
            Some(mut info) => {
                info.update(editor.user_id, settings, now)?;
                info
            }
            None => RoomInfo::new(room, editor.user_id, settings, now)?,
        };
        let info = self.state.deps.store.save_room(info).await?;
        tracing::info!(
            room = %info.name,
            user_id = %editor.user_id,
            max_users = ?info.max_users,
            is_private = info.is_private,
            "房间信息已保存"
        );
        Ok(info)
    }

    pub async fn store_health(&self) -> StoreHealth {
        let store = &self.state.deps.store;
        let available = match store.ping().await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(error = %err, "存储健康检查失败");
                false
            }
        };
        StoreHealth {
            kind: store.kind(),
            available,
        }
    }

    /// 清除超时的输入状态并通知房间，返回清除的数量
    pub fn sweep_typing(&self) -> usize {
        sweep_typing(&self.state)
    }

    /// 启动输入状态清扫任务，重复调用只保留一个
    pub fn spawn_typing_sweeper(&self) {
        let mut sweeper = lock_sweeper(&self.state.sweeper);
        if sweeper.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let weak: Weak<EngineState> = Arc::downgrade(&self.state);
        let period = self.settings().typing_sweep_interval;
        *sweeper = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(state) = weak.upgrade() else {
                    break;
                };
                let expired = sweep_typing(&state);
                if expired > 0 {
                    tracing::debug!(expired, "清除超时的输入状态");
                }
            }
        }));
        tracing::debug!(period_ms = period.as_millis() as u64, "输入状态清扫任务已启动");
    }

    /// 停止后台任务并清空所有内存状态，各连接的出站通道随之关闭
    pub fn shutdown(&self) {
        if let Some(handle) = lock_sweeper(&self.state.sweeper).take() {
            handle.abort();
        }
        let sessions = self.state.sessions.len();
        self.state.router.clear();
        self.state.sessions.clear();
        self.state.rooms.clear();
        self.state.presence.clear();
        self.state.sequencer.clear();
        tracing::info!(sessions, "广播引擎已关闭");
    }

    async fn handle_join(
        &self,
        connection_id: ConnectionId,
        token: Option<String>,
        room: Option<String>,
        reply: JoinReply,
    ) -> Result<(), ApplicationError> {
        match token.filter(|token| !token.trim().is_empty()) {
            Some(token) => {
                self.identify(connection_id, &token).await?;
            }
            None => {
                let session = self.session(connection_id)?;
                if session.identity.is_none() {
                    return Err(AuthError::MissingToken.into());
                }
            }
        }

        let room = room
            .filter(|room| !room.trim().is_empty())
            .unwrap_or_else(|| self.settings().default_room.to_string());
        self.join(connection_id, &room, reply).await
    }

    fn session(&self, connection_id: ConnectionId) -> Result<Session, ApplicationError> {
        self.state
            .sessions
            .get(connection_id)
            .ok_or(ApplicationError::SessionNotFound(connection_id))
    }

    /// 要求会话已认证且在房间内；指定房间时必须是当前房间
    fn require_room(
        &self,
        connection_id: ConnectionId,
        named_room: Option<&str>,
    ) -> Result<(UserIdentity, RoomName), ApplicationError> {
        let session = self.session(connection_id)?;
        let identity = session
            .identity
            .ok_or_else(|| ApplicationError::invalid_state("not authenticated"))?;
        let room = session
            .room
            .ok_or_else(|| ApplicationError::invalid_state("join a room first"))?;

        if let Some(named) = named_room.filter(|named| !named.trim().is_empty()) {
            let named = RoomName::parse(named)?;
            if named != room {
                return Err(ApplicationError::invalid_state(format!(
                    "you are not in room '{named}'"
                )));
            }
        }
        Ok((identity, room))
    }

    /// 从房间移除连接并通知剩余成员
    fn depart(&self, connection_id: ConnectionId, room: &RoomName, identity: &UserIdentity) {
        if !self.state.rooms.leave(room, connection_id) {
            return;
        }

        // 同一用户在该房间还有其他连接时保留输入状态
        let still_present = self
            .state
            .rooms
            .members_of(room)
            .into_iter()
            .filter_map(|member| self.state.sessions.get(member))
            .any(|session| {
                session
                    .identity
                    .is_some_and(|other| other.user_id == identity.user_id)
            });
        if !still_present {
            if let Some(user) = self.state.presence.clear_user(room, identity.user_id) {
                let event = ServerEvent::UserStopTyping {
                    room: room.clone(),
                    user,
                };
                self.state
                    .router
                    .fan_out(self.state.rooms.members_of(room), &event);
            }
        }

        if self.state.rooms.is_empty(room) {
            self.state.sequencer.release_idle(room);
            tracing::debug!(room = %room, "房间已清空并回收");
            return;
        }

        let left = ServerEvent::UserLeft {
            room: room.clone(),
            user: identity.summary(),
            timestamp: self.state.deps.clock.now(),
        };
        self.state
            .router
            .fan_out(self.state.rooms.members_of(room), &left);
        self.broadcast_online_users(room, self.online_users(room));
    }

    fn broadcast_online_users(&self, room: &RoomName, users: Vec<UserSummary>) {
        let event = ServerEvent::OnlineUsersUpdate {
            room: room.clone(),
            total_online: users.len(),
            users,
        };
        self.state
            .router
            .fan_out(self.state.rooms.members_of(room), &event);
    }

    /// 全局在线人数变化，通知所有已认证的连接
    fn broadcast_online_count(&self) {
        let event = ServerEvent::OnlineCountUpdate {
            total_online: self.online_count(),
        };
        self.state
            .router
            .fan_out(self.state.sessions.identified_connections(), &event);
    }

    /// 房间在线用户上限；存储读取失败时使用默认值
    async fn room_capacity(&self, room: &RoomName) -> usize {
        let default = self.settings().room_capacity;
        match self.state.deps.store.find_room(room).await {
            Ok(Some(info)) => info.max_users.map_or(default, |max_users| max_users as usize),
            Ok(None) => default,
            Err(err) => {
                tracing::warn!(room = %room, error = %err, "读取房间信息失败，使用默认上限");
                default
            }
        }
    }

    fn members_except_connection(
        &self,
        room: &RoomName,
        excluded: ConnectionId,
    ) -> Vec<ConnectionId> {
        self.state
            .rooms
            .members_of(room)
            .into_iter()
            .filter(|member| *member != excluded)
            .collect()
    }

    fn members_except_user(&self, room: &RoomName, user_id: UserId) -> Vec<ConnectionId> {
        members_except_user(&self.state, room, user_id)
    }

    fn user_has_sessions(&self, user_id: UserId) -> bool {
        self.state.sessions.has_user(user_id)
    }

    /// 房间历史，最新的在前；读取失败时退回兜底队列
    async fn load_history(&self, room: &RoomName, limit: usize) -> Vec<Message> {
        match self
            .state
            .deps
            .store
            .fetch_room_messages(room, limit, 0)
            .await
        {
            Ok(messages) => messages,
            Err(err) => {
                tracing::warn!(room = %room, error = %err, "读取历史消息失败，使用兜底队列");
                self.state.fallback.recent(room, limit)
            }
        }
    }

    /// 查找当前房间中的消息；返回消息以及它是否只存在于兜底队列
    async fn locate_message(
        &self,
        message_id: MessageId,
        room: &RoomName,
    ) -> Result<(Message, bool), ApplicationError> {
        let stored = match self.state.deps.store.find_message(message_id).await {
            Ok(found) => found,
            Err(err) => {
                tracing::warn!(message_id = %message_id, error = %err, "查询消息失败，尝试兜底队列");
                None
            }
        };
        let (message, buffered) = match stored {
            Some(message) => (message, false),
            None => match self.state.fallback.find(message_id) {
                Some(message) => (message, true),
                None => return Err(ApplicationError::not_found("message")),
            },
        };
        if &message.room != room {
            return Err(ApplicationError::not_found("message"));
        }
        Ok((message, buffered))
    }

    async fn write_back(&self, message: Message, buffered: bool) -> Result<Message, ApplicationError> {
        if buffered {
            self.state.fallback.replace(message.clone());
            return Ok(message);
        }
        Ok(self.state.deps.store.update_message(message).await?)
    }

    /// 在房间顺序器内扇出，和新消息保持同一顺序
    async fn broadcast_sequenced(&self, room: &RoomName, event: ServerEvent) {
        let _slot = self.state.sequencer.acquire(room).await;
        self.state
            .router
            .fan_out(self.state.rooms.members_of(room), &event);
    }

    async fn mirror_status(&self, identity: &UserIdentity, is_online: bool) {
        if let Err(err) = self
            .state
            .deps
            .store
            .upsert_user_status(
                identity.user_id,
                &identity.display_name,
                is_online,
                self.state.deps.clock.now(),
            )
            .await
        {
            tracing::warn!(user_id = %identity.user_id, is_online, error = %err, "同步在线状态失败");
        }
    }
}

/// 持久化并扇出，持有房间顺序器直到所有接收者的通道都已入队
async fn persist_and_broadcast(state: Arc<EngineState>, mut slot: RoomSlot, message: Message) {
    let room = message.room.clone();
    let message = match state.deps.store.save_message(message.clone()).await {
        Ok(saved) => saved,
        Err(err) => {
            tracing::warn!(
                room = %room,
                message_id = %message.id,
                error = %err,
                "消息持久化失败，进入兜底队列"
            );
            if let Some(evicted) = state.fallback.push(message.clone()) {
                tracing::warn!(message_id = %evicted.id, "兜底队列已满，丢弃最旧的消息");
            }
            message
        }
    };

    let sequence = slot.next_sequence();
    let message_id = message.id;
    let recipients = state.rooms.members_of(&room);
    let delivered = state
        .router
        .fan_out(recipients, &ServerEvent::ReceiveMessage { message, sequence });
    tracing::debug!(room = %room, message_id = %message_id, sequence, delivered, "消息已广播");
}

fn sweep_typing(state: &EngineState) -> usize {
    let expired = state.presence.expire_stale(Instant::now());
    for (room, user) in &expired {
        let event = ServerEvent::UserStopTyping {
            room: room.clone(),
            user: user.clone(),
        };
        state
            .router
            .fan_out(members_except_user(state, room, user.user_id), &event);
    }
    expired.len()
}

fn members_except_user(state: &EngineState, room: &RoomName, user_id: UserId) -> Vec<ConnectionId> {
    state
        .rooms
        .members_of(room)
        .into_iter()
        .filter(|member| {
            state
                .sessions
                .get(*member)
                .and_then(|session| session.identity)
                .map_or(true, |identity| identity.user_id != user_id)
        })
        .collect()
}

fn lock_sweeper(
    sweeper: &Mutex<Option<JoinHandle<()>>>,
) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
    sweeper
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
