use sqlx::migrate::Migrator;

/// 内置的数据库迁移
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");
