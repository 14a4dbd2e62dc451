//! 应用层实现。
//!
//! 实时房间广播引擎：会话注册、房间目录、在线与输入状态、内容过滤，
//! 以及对外部协作方（持久化存储、身份提供方）的抽象。

pub mod broadcaster;
pub mod clock;
pub mod content_policy;
pub mod error;
pub mod events;
pub mod fallback;
pub mod identity;
pub mod presence;
pub mod repository;
pub mod room_directory;
pub mod sequencer;
pub mod services;
pub mod session_registry;

pub use broadcaster::{ConnectionRouter, OutboundReceiver, OutboundSender};
pub use clock::{Clock, SystemClock};
pub use content_policy::{ContentPolicy, PolicyError, PolicyVerdict, Violation};
pub use error::ApplicationError;
pub use events::{ClientEvent, ServerEvent};
pub use fallback::BestEffortQueue;
pub use identity::{AuthError, IdentityProvider};
pub use presence::PresenceTracker;
pub use repository::PersistenceStore;
pub use room_directory::RoomDirectory;
pub use sequencer::{RoomSequencer, RoomSlot};
pub use services::{
    BroadcastEngine, BroadcastEngineDependencies, EngineConnection, EngineSettings, JoinReply,
    RoomPage, SendMessageRequest, StoreHealth,
};
pub use session_registry::{RegistryError, Session, SessionRegistry, SessionState};
