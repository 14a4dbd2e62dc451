//! 统一配置中心
//!
//! 提供应用的全局配置管理，包括：
//! - 服务监听
//! - 数据库连接（可选，未配置时使用内存存储）
//! - JWT认证
//! - 聊天引擎参数（历史条数、内容过滤、输入提示超时等）
//!
//! 加载顺序：默认值 -> `APP_CONFIG_FILE` 指向的 TOML 文件 -> `APP_` 前缀环境变量
//! （嵌套字段用 `__` 分隔，例如 `APP_CHAT__MAX_MESSAGE_LENGTH=500`）。

use std::fmt;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

/// 配置文件路径所在的环境变量
pub const CONFIG_FILE_ENV: &str = "APP_CONFIG_FILE";
/// 环境变量前缀
pub const ENV_PREFIX: &str = "APP_";

/// JWT 密钥最短长度（256 位）
const MIN_JWT_SECRET_LEN: usize = 32;

/// 全局应用配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 数据库配置，缺省时使用内存存储
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<DatabaseConfig>,
    /// JWT认证配置
    #[serde(default)]
    pub jwt: JwtConfig,
    /// 聊天引擎配置
    #[serde(default)]
    pub chat: ChatConfig,
}

/// 服务器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
            cors_origins: vec!["*".into()],
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// 数据库配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

/// JWT配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub expiration_hours: i64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            secret: "roomchat-development-secret-please-override".into(),
            expiration_hours: 24,
        }
    }
}

/// 单条消息的最大长度（字符数）
///
/// 配置中可以写数字，也可以写字符串 `"unbounded"` 表示不限制。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLengthLimit {
    Limited(usize),
    Unbounded,
}

impl MessageLengthLimit {
    pub fn max_chars(&self) -> Option<usize> {
        match self {
            MessageLengthLimit::Limited(max) => Some(*max),
            MessageLengthLimit::Unbounded => None,
        }
    }
}

impl Default for MessageLengthLimit {
    fn default() -> Self {
        MessageLengthLimit::Limited(1000)
    }
}

impl Serialize for MessageLengthLimit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MessageLengthLimit::Limited(max) => serializer.serialize_u64(*max as u64),
            MessageLengthLimit::Unbounded => serializer.serialize_str("unbounded"),
        }
    }
}

impl<'de> Deserialize<'de> for MessageLengthLimit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct LimitVisitor;

        impl Visitor<'_> for LimitVisitor {
            type Value = MessageLengthLimit;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a non-negative integer or the string \"unbounded\"")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Self::Value, E> {
                usize::try_from(value)
                    .map(MessageLengthLimit::Limited)
                    .map_err(|_| E::custom("message length limit is too large"))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Self::Value, E> {
                let value = u64::try_from(value)
                    .map_err(|_| E::custom("message length limit cannot be negative"))?;
                self.visit_u64(value)
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                let value = value.trim();
                if value.eq_ignore_ascii_case("unbounded") {
                    return Ok(MessageLengthLimit::Unbounded);
                }
                value
                    .parse::<u64>()
                    .map_err(|_| E::invalid_value(de::Unexpected::Str(value), &self))
                    .and_then(|parsed| self.visit_u64(parsed))
            }
        }

        deserializer.deserialize_any(LimitVisitor)
    }
}

/// 聊天引擎配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// 未指定房间时加入的默认房间
    pub default_room: String,
    /// 加入房间时返回的历史消息条数
    pub history_limit: usize,
    /// 搜索接口默认返回条数
    pub search_limit: usize,
    pub max_message_length: MessageLengthLimit,
    /// 屏蔽词，不区分大小写，替换为等长的 `*`
    pub banned_words: Vec<String>,
    /// 存储不可用时的内存兜底队列容量
    pub fallback_capacity: usize,
    pub typing_timeout_secs: u64,
    pub typing_sweep_interval_ms: u64,
    /// 房间未单独设置上限时允许的最多在线用户数
    pub room_capacity: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            default_room: "general".into(),
            history_limit: 50,
            search_limit: 20,
            max_message_length: MessageLengthLimit::default(),
            banned_words: Vec::new(),
            fallback_capacity: 1000,
            typing_timeout_secs: 5,
            typing_sweep_interval_ms: 1000,
            room_capacity: 100,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: None,
            jwt: JwtConfig::default(),
            chat: ChatConfig::default(),
        }
    }
}

impl AppConfig {
    /// 构建配置来源链：默认值 -> 可选 TOML 文件 -> 环境变量
    pub fn figment() -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(AppConfig::default()));
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// 加载并验证配置
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }

    /// 从 TOML 文本加载（未出现的字段使用默认值）
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Serialized::defaults(AppConfig::default()))
            .merge(Toml::string(source));
        Self::from_figment(figment)
    }

    fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: AppConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<(), ConfigError> {
        // JWT密钥至少256位/32字节
        if self.jwt.secret.len() < MIN_JWT_SECRET_LEN {
            return Err(ConfigError::InvalidJwtSecret(format!(
                "JWT secret must be at least {MIN_JWT_SECRET_LEN} characters long"
            )));
        }
        if self.jwt.expiration_hours <= 0 {
            return Err(ConfigError::InvalidJwtSecret(
                "token expiration must be positive".to_string(),
            ));
        }

        if let Some(database) = &self.database {
            if database.url.trim().is_empty() {
                return Err(ConfigError::InvalidDatabaseConfig(
                    "Database URL cannot be empty".to_string(),
                ));
            }
            if database.max_connections == 0 {
                return Err(ConfigError::InvalidDatabaseConfig(
                    "Max connections must be greater than 0".to_string(),
                ));
            }
        }

        let chat = &self.chat;
        if chat.history_limit == 0 {
            return Err(ConfigError::InvalidChatConfig(
                "history_limit must be greater than 0".to_string(),
            ));
        }
        if chat.search_limit == 0 {
            return Err(ConfigError::InvalidChatConfig(
                "search_limit must be greater than 0".to_string(),
            ));
        }
        if chat.fallback_capacity == 0 {
            return Err(ConfigError::InvalidChatConfig(
                "fallback_capacity must be greater than 0".to_string(),
            ));
        }
        if chat.max_message_length == MessageLengthLimit::Limited(0) {
            return Err(ConfigError::InvalidChatConfig(
                "max_message_length must be greater than 0".to_string(),
            ));
        }
        if chat.typing_timeout_secs == 0 || chat.typing_sweep_interval_ms == 0 {
            return Err(ConfigError::InvalidChatConfig(
                "typing timeout and sweep interval must be greater than 0".to_string(),
            ));
        }
        if chat.room_capacity == 0 {
            return Err(ConfigError::InvalidChatConfig(
                "room_capacity must be greater than 0".to_string(),
            ));
        }
        if chat.banned_words.iter().any(|word| word.trim().is_empty()) {
            return Err(ConfigError::InvalidChatConfig(
                "banned_words cannot contain blank entries".to_string(),
            ));
        }

        Ok(())
    }

    /// 日志输出用的脱敏表示
    pub fn sanitize(&self) -> String {
        let mut redacted = self.clone();
        redacted.jwt.secret = "[REDACTED]".into();
        if let Some(database) = redacted.database.as_mut() {
            if let Some(at) = database.url.rfind('@') {
                let scheme_end = database.url.find("://").map(|i| i + 3).unwrap_or(0);
                if scheme_end <= at {
                    database.url.replace_range(scheme_end..at, "[REDACTED]");
                }
            }
        }
        format!("{:?}", redacted)
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("Invalid JWT secret: {0}")]
    InvalidJwtSecret(String),
    #[error("Invalid database configuration: {0}")]
    InvalidDatabaseConfig(String),
    #[error("Invalid chat configuration: {0}")]
    InvalidChatConfig(String),
}
