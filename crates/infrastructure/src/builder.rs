use std::sync::Arc;

use application::PersistenceStore;
use config::DatabaseConfig;
use thiserror::Error;

use crate::{memory_store::InMemoryStore, pg_store::PgChatStore};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// 按配置选择持久化实现：配置了数据库时使用 PostgreSQL，否则使用内存存储
pub async fn build_store(
    database: Option<&DatabaseConfig>,
) -> Result<Arc<dyn PersistenceStore>, InfrastructureError> {
    match database {
        Some(database) => {
            let store = PgChatStore::connect(&database.url, database.max_connections).await?;
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("未配置数据库，消息只保存在内存中");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}
