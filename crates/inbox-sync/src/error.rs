use std::fmt;
use std::time::Duration;

use rusqlite;

use crate::transport::TransportError;

#[derive(Debug)]
pub enum InboxSyncError {
    SqliteError(rusqlite::Error),
    JsonError(String),
    IO(String),
    KvStore(String),
    Database(String),
    Migration(String),
    // 连接生命周期错误
    AuthRequired(String),       // 无可用会话令牌，需要重新走登录流程
    ConnectFailed {
        account: String,
        attempts: u32,
        last: String,
    },
    NotConnected(String),
    // 平台侧强制等待（FloodWait 类），wait 已含安全缓冲
    RateLimitedByPlatform {
        wait: Duration,
    },
    // 会话令牌文件损坏（仅此错误会丢弃令牌文件）
    StorageCorruption(String),
    // 单次拉取/回填失败，留给下一轮调度重试，不立即重试
    TransientFetchFailure(String),
    Transport(String),
    Timeout(String),
    Config(String),
    ShuttingDown,
}

impl fmt::Display for InboxSyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboxSyncError::SqliteError(e) => write!(f, "SQLite error: {}", e),
            InboxSyncError::JsonError(e) => write!(f, "JSON error: {}", e),
            InboxSyncError::IO(e) => write!(f, "IO error: {}", e),
            InboxSyncError::KvStore(e) => write!(f, "KV store error: {}", e),
            InboxSyncError::Database(e) => write!(f, "Database error: {}", e),
            InboxSyncError::Migration(e) => write!(f, "Migration error: {}", e),
            InboxSyncError::AuthRequired(account) => {
                write!(f, "Auth required for account: {}", account)
            }
            InboxSyncError::ConnectFailed {
                account,
                attempts,
                last,
            } => write!(
                f,
                "Connect failed for account {} after {} attempts: {}",
                account, attempts, last
            ),
            InboxSyncError::NotConnected(account) => {
                write!(f, "Account not connected: {}", account)
            }
            InboxSyncError::RateLimitedByPlatform { wait } => {
                write!(f, "Rate limited by platform, wait {}s", wait.as_secs())
            }
            InboxSyncError::StorageCorruption(e) => write!(f, "Storage corruption: {}", e),
            InboxSyncError::TransientFetchFailure(e) => {
                write!(f, "Transient fetch failure: {}", e)
            }
            InboxSyncError::Transport(e) => write!(f, "Transport error: {}", e),
            InboxSyncError::Timeout(e) => write!(f, "Timeout: {}", e),
            InboxSyncError::Config(e) => write!(f, "Config error: {}", e),
            InboxSyncError::ShuttingDown => write!(f, "Shutting down"),
        }
    }
}

impl std::error::Error for InboxSyncError {}

impl From<rusqlite::Error> for InboxSyncError {
    fn from(error: rusqlite::Error) -> Self {
        InboxSyncError::SqliteError(error)
    }
}

impl From<serde_json::Error> for InboxSyncError {
    fn from(error: serde_json::Error) -> Self {
        InboxSyncError::JsonError(error.to_string())
    }
}

impl From<std::io::Error> for InboxSyncError {
    fn from(error: std::io::Error) -> Self {
        InboxSyncError::IO(error.to_string())
    }
}

impl From<sled::Error> for InboxSyncError {
    fn from(error: sled::Error) -> Self {
        InboxSyncError::KvStore(error.to_string())
    }
}

impl InboxSyncError {
    /// 判断是否是需要重新登录的错误（auth_required 状态的依据）
    pub fn is_auth_required(&self) -> bool {
        matches!(self, InboxSyncError::AuthRequired(_))
    }

    /// 同步/回填路径专用：把拉取失败归一为 TransientFetchFailure，
    /// 平台限流原样保留（必须把等待时长暴露给调用方）。
    pub fn fetch_failure(e: TransportError) -> Self {
        match e {
            TransportError::FloodWait { wait_secs } => InboxSyncError::RateLimitedByPlatform {
                wait: Duration::from_secs(wait_secs),
            },
            other => InboxSyncError::TransientFetchFailure(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, InboxSyncError>;
