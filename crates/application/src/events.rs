//! 实时通道上的事件定义
//!
//! 线上格式为 `{"event": "<name>", "data": {...}}` 的 JSON 文本帧。

use domain::{Message, MessageId, MessageKind, RoomName, Timestamp, UserSummary};
use serde::{Deserialize, Serialize};

/// 客户端发往服务端的事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// 认证并进入房间（缺省为默认房间），回复 `message_history`
    JoinChat {
        token: Option<String>,
        room: Option<String>,
    },
    /// 切换房间，回复 `room_joined`
    JoinRoom {
        room: String,
        token: Option<String>,
    },
    SendMessage {
        #[serde(default)]
        text: String,
        room: Option<String>,
        message_type: Option<MessageKind>,
        file_url: Option<String>,
        file_name: Option<String>,
    },
    TypingStart {
        room: Option<String>,
    },
    TypingStop {
        room: Option<String>,
    },
    LeaveRoom {
        room: Option<String>,
    },
    EditMessage {
        message_id: MessageId,
        text: String,
    },
    DeleteMessage {
        message_id: MessageId,
    },
    Ping,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::JoinChat { .. } => "join_chat",
            ClientEvent::JoinRoom { .. } => "join_room",
            ClientEvent::SendMessage { .. } => "send_message",
            ClientEvent::TypingStart { .. } => "typing_start",
            ClientEvent::TypingStop { .. } => "typing_stop",
            ClientEvent::LeaveRoom { .. } => "leave_room",
            ClientEvent::EditMessage { .. } => "edit_message",
            ClientEvent::DeleteMessage { .. } => "delete_message",
            ClientEvent::Ping => "ping",
        }
    }
}

/// 服务端推送给客户端的事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageHistory {
        room: RoomName,
        messages: Vec<Message>,
    },
    RoomJoined {
        room: RoomName,
        messages: Vec<Message>,
        online_users: Vec<UserSummary>,
        typing_users: Vec<UserSummary>,
    },
    ReceiveMessage {
        message: Message,
        /// 房间内单调递增的序号
        sequence: u64,
    },
    UserTyping {
        room: RoomName,
        user: UserSummary,
    },
    UserStopTyping {
        room: RoomName,
        user: UserSummary,
    },
    UserJoined {
        room: RoomName,
        user: UserSummary,
        timestamp: Timestamp,
    },
    UserLeft {
        room: RoomName,
        user: UserSummary,
        timestamp: Timestamp,
    },
    OnlineUsersUpdate {
        room: RoomName,
        users: Vec<UserSummary>,
        total_online: usize,
    },
    /// 全局在线连接数变化
    OnlineCountUpdate {
        total_online: usize,
    },
    MessageEdited {
        message: Message,
    },
    MessageDeleted {
        message: Message,
    },
    Pong,
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::MessageHistory { .. } => "message_history",
            ServerEvent::RoomJoined { .. } => "room_joined",
            ServerEvent::ReceiveMessage { .. } => "receive_message",
            ServerEvent::UserTyping { .. } => "user_typing",
            ServerEvent::UserStopTyping { .. } => "user_stop_typing",
            ServerEvent::UserJoined { .. } => "user_joined",
            ServerEvent::UserLeft { .. } => "user_left",
            ServerEvent::OnlineUsersUpdate { .. } => "online_users_update",
            ServerEvent::OnlineCountUpdate { .. } => "online_count_update",
            ServerEvent::MessageEdited { .. } => "message_edited",
            ServerEvent::MessageDeleted { .. } => "message_deleted",
            ServerEvent::Pong => "pong",
            ServerEvent::Error { .. } => "error",
        }
    }
}
