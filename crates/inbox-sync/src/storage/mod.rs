//! 存储层 - 每账号一个镜像库 + 共享运行状态 KV
//!
//! 设计原则：
//! - 完全控制所有数据库操作，外部无法直接访问 SQLite
//! - 每账号一个独立数据库文件（accounts/{id}/mirror.db），账号即隔离边界
//! - 同一账号的镜像写入串行化：一把锁一条连接，推送与同步不会交叠写
//! - 自动数据库迁移和版本管理
//! - 事务安全和数据一致性保障

pub mod dao;
pub mod entities;
pub mod kv;
pub mod migrate;

pub use dao::{CampaignDao, ConversationDao, DaoFactory, EventDao, MessageDao, OutboundDao, TransactionManager};
pub use entities::{
    CampaignStatsRow, ConversationRow, EventKind, EventRow, MessageRow, OutboundRecord, Provenance,
    DELETED_PLACEHOLDER,
};
pub use kv::StateKv;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::error::{InboxSyncError, Result};

/// 会话列表查询条件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListQuery {
    pub limit: u32,
    pub offset: u32,
    /// 只要有未读的会话
    pub unread_only: bool,
    /// 只要有外部分类的会话
    pub classified_only: bool,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
            unread_only: false,
            classified_only: false,
        }
    }
}

/// 消息翻页查询条件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageQuery {
    pub limit: u32,
    /// 只要该 id 之前的消息（不含），None 表示从最新开始
    pub before_message_id: Option<u64>,
}

impl Default for MessageQuery {
    fn default() -> Self {
        Self {
            limit: 50,
            before_message_id: None,
        }
    }
}

/// 镜像存储管理器
///
/// 持有所有已初始化账号的数据库连接。每账号一条连接、一把锁，
/// 这把锁同时就是该账号的镜像写锁。
#[derive(Debug, Clone)]
pub struct MirrorStore {
    base_dir: PathBuf,
    connections: Arc<RwLock<HashMap<String, Arc<Mutex<Connection>>>>>,
    kv: StateKv,
}

impl MirrorStore {
    /// 创建存储管理器并打开共享 KV
    pub async fn new(base_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(base_dir)
            .await
            .map_err(|e| InboxSyncError::IO(format!("创建数据目录失败: {}", e)))?;
        let kv = StateKv::new(base_dir).await?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            connections: Arc::new(RwLock::new(HashMap::new())),
            kv,
        })
    }

    /// 初始化账号镜像库：建目录、开连接、跑迁移。重复调用是空操作。
    pub async fn init_account(&self, account_id: &str) -> Result<()> {
        {
            let conns = self.connections.read().await;
            if conns.contains_key(account_id) {
                return Ok(());
            }
        }

        let account_dir = self.account_dir(account_id);
        tokio::fs::create_dir_all(&account_dir)
            .await
            .map_err(|e| InboxSyncError::IO(format!("创建账号目录失败: {}", e)))?;

        let db_path = account_dir.join("mirror.db");
        let mut conn = Connection::open(&db_path)
            .map_err(|e| InboxSyncError::Database(format!("打开镜像库失败: {}", e)))?;
        migrate::init_db(&mut conn)?;

        let mut conns = self.connections.write().await;
        conns
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(conn)));
        info!("账号镜像库初始化完成: {}", account_id);
        Ok(())
    }

    /// 关闭账号连接（登出/清理时）；未初始化是空操作
    pub async fn close_account(&self, account_id: &str) {
        let mut conns = self.connections.write().await;
        if conns.remove(account_id).is_some() {
            info!("账号镜像库连接已关闭: {}", account_id);
        }
    }

    async fn connection(&self, account_id: &str) -> Result<Arc<Mutex<Connection>>> {
        let conns = self.connections.read().await;
        conns
            .get(account_id)
            .cloned()
            .ok_or_else(|| InboxSyncError::Database(format!("账号镜像库未初始化: {}", account_id)))
    }

    /// 在账号的镜像连接上执行一段同步操作（持账号写锁）
    pub async fn with_conn<R, F>(&self, account_id: &str, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let conn = self.connection(account_id).await?;
        let guard = conn.lock().await;
        f(&guard)
    }

    /// 在账号的镜像连接上执行一个事务（整体提交或整体回滚）
    pub async fn with_tx<R, F>(&self, account_id: &str, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let conn = self.connection(account_id).await?;
        let guard = conn.lock().await;
        TransactionManager::new(&guard).execute(f)
    }

    /// 共享运行状态 KV
    pub fn kv(&self) -> &StateKv {
        &self.kv
    }

    /// 账号数据目录
    pub fn account_dir(&self, account_id: &str) -> PathBuf {
        let safe = account_id.replace(['/', '\\'], "_");
        self.base_dir.join("accounts").join(safe)
    }

    /// 基础数据目录
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    // ===== 会话/消息的上层查询 API（只读，给 UI / 巡检用） =====

    /// 会话列表，最近活跃在前
    pub async fn list_conversations(
        &self,
        account_id: &str,
        query: ListQuery,
    ) -> Result<Vec<ConversationRow>> {
        self.with_conn(account_id, move |conn| {
            DaoFactory::conversation_dao(conn).list_filtered(&query)
        })
        .await
    }

    /// 单个会话
    pub async fn get_conversation(
        &self,
        account_id: &str,
        peer_id: u64,
    ) -> Result<Option<ConversationRow>> {
        self.with_conn(account_id, move |conn| {
            DaoFactory::conversation_dao(conn).get_by_peer(peer_id)
        })
        .await
    }

    /// 某会话最近的镜像消息，新的在前
    pub async fn recent_messages(
        &self,
        account_id: &str,
        peer_id: u64,
        limit: u32,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(account_id, move |conn| {
            DaoFactory::message_dao(conn).list_recent(peer_id, limit)
        })
        .await
    }

    /// 消息历史翻页（游标是 message_id），新的在前
    pub async fn messages_page(
        &self,
        account_id: &str,
        peer_id: u64,
        query: MessageQuery,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(account_id, move |conn| {
            DaoFactory::message_dao(conn).list_page(peer_id, &query)
        })
        .await
    }

    /// 账号总未读数
    pub async fn total_unread(&self, account_id: &str) -> Result<i64> {
        self.with_conn(account_id, |conn| DaoFactory::conversation_dao(conn).total_unread())
            .await
    }

    /// 待外发通知的业务事件
    pub async fn pending_events(&self, account_id: &str, limit: u32) -> Result<Vec<EventRow>> {
        self.with_conn(account_id, move |conn| {
            DaoFactory::event_dao(conn).list_unnotified(limit)
        })
        .await
    }

    /// 批量置事件已通知位
    pub async fn mark_events_notified(&self, account_id: &str, ids: Vec<i64>) -> Result<()> {
        self.with_conn(account_id, move |conn| {
            DaoFactory::event_dao(conn).mark_notified(&ids)
        })
        .await
    }
}
