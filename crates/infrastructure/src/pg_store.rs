use std::str::FromStr;

use application::PersistenceStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{
    Attachment, Message, MessageId, MessageKind, RepositoryError, RoomInfo, RoomName, Timestamp,
    UserId,
};
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use uuid::Uuid;

fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    match err {
        sqlx::Error::RowNotFound => RepositoryError::NotFound,
        sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict,
        other => RepositoryError::storage_with_source("postgres query failed", other),
    }
}

fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

/// `LIMIT`/`OFFSET` 参数必须落在 BIGINT 范围内
fn sql_bound(value: usize, name: &str) -> Result<i64, RepositoryError> {
    i64::try_from(value).map_err(|_| invalid_data(format!("{name} {value} exceeds BIGINT range")))
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}

const MESSAGE_COLUMNS: &str = "id, room, author_id, author_name, text, message_type, file_url, \
     file_name, created_at, is_edited, edited_at, deleted_at";

#[derive(Debug, FromRow)]
struct MessageRecord {
    id: Uuid,
    room: String,
    author_id: Uuid,
    author_name: String,
    text: String,
    message_type: String,
    file_url: Option<String>,
    file_name: Option<String>,
    created_at: DateTime<Utc>,
    is_edited: bool,
    edited_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<MessageRecord> for Message {
    type Error = RepositoryError;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        let room = RoomName::parse(value.room).map_err(|err| invalid_data(err.to_string()))?;
        let kind =
            MessageKind::from_str(&value.message_type).map_err(|err| invalid_data(err.to_string()))?;
        let attachment = Attachment::from_parts(value.file_url, value.file_name)
            .map_err(|err| invalid_data(err.to_string()))?;

        // 已删除的附件消息没有附件，不能走 Message::new 的校验
        Ok(Message {
            id: MessageId::from(value.id),
            room,
            author_id: UserId::from(value.author_id),
            author_name: value.author_name,
            text: value.text,
            kind,
            attachment,
            created_at: value.created_at,
            is_edited: value.is_edited,
            edited_at: value.edited_at,
            deleted_at: value.deleted_at,
        })
    }
}

const ROOM_COLUMNS: &str =
    "name, description, is_private, max_users, created_by, created_at, updated_at";

#[derive(Debug, FromRow)]
struct RoomRecord {
    name: String,
    description: Option<String>,
    is_private: bool,
    max_users: Option<i32>,
    created_by: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RoomRecord> for RoomInfo {
    type Error = RepositoryError;

    fn try_from(value: RoomRecord) -> Result<Self, Self::Error> {
        let max_users = value
            .max_users
            .map(u32::try_from)
            .transpose()
            .map_err(|_| invalid_data("room max_users must be positive"))?;
        Ok(RoomInfo {
            name: RoomName::parse(value.name).map_err(|err| invalid_data(err.to_string()))?,
            description: value.description,
            is_private: value.is_private,
            max_users,
            created_by: UserId::from(value.created_by),
            created_at: value.created_at,
            updated_at: value.updated_at,
        })
    }
}

/// PostgreSQL 持久化实现
#[derive(Clone)]
pub struct PgChatStore {
    pool: PgPool,
}

impl PgChatStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 连接数据库并执行内置迁移
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, crate::InfrastructureError> {
        let pool = create_pg_pool(database_url, max_connections).await?;
        crate::MIGRATOR.run(&pool).await?;
        tracing::info!(max_connections, "PostgreSQL 存储已就绪");
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl PersistenceStore for PgChatStore {
    async fn save_message(&self, message: Message) -> Result<Message, RepositoryError> {
        let (file_url, file_name) = match &message.attachment {
            Some(attachment) => (
                Some(attachment.file_url.as_str()),
                Some(attachment.file_name.as_str()),
            ),
            None => (None, None),
        };

        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            INSERT INTO messages (id, room, author_id, author_name, text, message_type, file_url, file_name, created_at, is_edited, edited_at, deleted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(Uuid::from(message.id))
        .bind(message.room.as_str())
        .bind(Uuid::from(message.author_id))
        .bind(&message.author_name)
        .bind(&message.text)
        .bind(message.kind.as_str())
        .bind(file_url)
        .bind(file_name)
        .bind(message.created_at)
        .bind(message.is_edited)
        .bind(message.edited_at)
        .bind(message.deleted_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Message::try_from(record)
    }

    async fn fetch_room_messages(
        &self,
        room: &RoomName,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>, RepositoryError> {
        let records = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE room = $1
            ORDER BY created_at DESC, seq DESC
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(room.as_str())
        .bind(sql_bound(limit, "limit")?)
        .bind(sql_bound(offset, "offset")?)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Message::try_from).collect()
    }

    async fn search_messages(
        &self,
        query: &str,
        room: Option<RoomName>,
        limit: usize,
    ) -> Result<Vec<Message>, RepositoryError> {
        let escaped = query
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let pattern = format!("%{escaped}%");

        let records = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            WHERE text ILIKE $1
              AND deleted_at IS NULL
              AND ($2::TEXT IS NULL OR room = $2)
            ORDER BY created_at DESC, seq DESC
            LIMIT $3
            "#
        ))
        .bind(pattern)
        .bind(room.as_ref().map(|room| room.as_str()))
        .bind(sql_bound(limit, "limit")?)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        records.into_iter().map(Message::try_from).collect()
    }

    async fn find_message(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(Uuid::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(Message::try_from).transpose()
    }

    async fn update_message(&self, message: Message) -> Result<Message, RepositoryError> {
        let (file_url, file_name) = match &message.attachment {
            Some(attachment) => (
                Some(attachment.file_url.as_str()),
                Some(attachment.file_name.as_str()),
            ),
            None => (None, None),
        };

        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            UPDATE messages
            SET text = $2, file_url = $3, file_name = $4, is_edited = $5, edited_at = $6, deleted_at = $7
            WHERE id = $1
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(Uuid::from(message.id))
        .bind(&message.text)
        .bind(file_url)
        .bind(file_name)
        .bind(message.is_edited)
        .bind(message.edited_at)
        .bind(message.deleted_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Message::try_from(record)
    }

    async fn upsert_user_status(
        &self,
        user_id: UserId,
        display_name: &str,
        is_online: bool,
        last_seen: Timestamp,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO user_status (user_id, display_name, is_online, last_seen)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id)
            DO UPDATE SET display_name = EXCLUDED.display_name,
                          is_online = EXCLUDED.is_online,
                          last_seen = EXCLUDED.last_seen
            "#,
        )
        .bind(Uuid::from(user_id))
        .bind(display_name)
        .bind(is_online)
        .bind(last_seen)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn find_room(&self, name: &RoomName) -> Result<Option<RoomInfo>, RepositoryError> {
        let record = sqlx::query_as::<_, RoomRecord>(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms WHERE name = $1"
        ))
        .bind(name.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        record.map(RoomInfo::try_from).transpose()
    }

    async fn save_room(&self, room: RoomInfo) -> Result<RoomInfo, RepositoryError> {
        let max_users = room
            .max_users
            .map(i32::try_from)
            .transpose()
            .map_err(|_| invalid_data("room max_users exceeds INTEGER range"))?;

        let record = sqlx::query_as::<_, RoomRecord>(&format!(
            r#"
            INSERT INTO rooms (name, description, is_private, max_users, created_by, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (name)
            DO UPDATE SET description = EXCLUDED.description,
                          is_private = EXCLUDED.is_private,
                          max_users = EXCLUDED.max_users,
                          updated_at = EXCLUDED.updated_at
            RETURNING {ROOM_COLUMNS}
            "#
        ))
        .bind(room.name.as_str())
        .bind(room.description.as_deref())
        .bind(room.is_private)
        .bind(max_users)
        .bind(Uuid::from(room.created_by))
        .bind(room.created_at)
        .bind(room.updated_at)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        RoomInfo::try_from(record)
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "postgres"
    }
}
