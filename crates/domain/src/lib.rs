//! 聊天室系统核心领域模型
//!
//! 包含会话身份、房间名、消息等核心类型，以及相关的不变量校验。

pub mod errors;
pub mod message;
pub mod room;
pub mod user;
pub mod value_objects;

// 重新导出常用类型
pub use errors::*;
pub use message::*;
pub use room::*;
pub use user::*;
pub use value_objects::*;
