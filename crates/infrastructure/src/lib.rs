//! 基础设施层实现。
//!
//! 提供内存与 PostgreSQL 持久化、JWT 身份验证等适配器，实现应用层定义的接口。

pub mod auth;
pub mod builder;
pub mod memory_store;
pub mod migrations;
pub mod pg_store;

pub use auth::{Claims, JwtIdentityProvider};
pub use builder::{build_store, InfrastructureError};
pub use memory_store::{InMemoryStore, UserStatusRecord};
pub use migrations::MIGRATOR;
pub use pg_store::{create_pg_pool, PgChatStore};
