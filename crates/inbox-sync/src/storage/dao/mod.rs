//! 数据访问层 (DAO) - 每张表一个专门的操作模块
//!
//! 这里封装了镜像库的所有 SQL 操作，确保：
//! - 数据操作的一致性和封装性
//! - 推送/补拉/会话同步三条写入路径共用同一套去重原语
//! - 未来 schema 升级的兼容性

pub mod campaign;
pub mod conversation;
pub mod event;
pub mod message;
pub mod outbound;

// 重新导出核心 DAO 类型
pub use campaign::CampaignDao;
pub use conversation::ConversationDao;
pub use event::EventDao;
pub use message::MessageDao;
pub use outbound::OutboundDao;

use rusqlite::Connection;

use crate::error::{InboxSyncError, Result};

/// DAO 工厂 - 统一创建各种 DAO 实例
pub struct DaoFactory;

impl DaoFactory {
    /// 创建会话 DAO
    pub fn conversation_dao(conn: &Connection) -> ConversationDao<'_> {
        ConversationDao::new(conn)
    }

    /// 创建消息 DAO
    pub fn message_dao(conn: &Connection) -> MessageDao<'_> {
        MessageDao::new(conn)
    }

    /// 创建事件日志 DAO
    pub fn event_dao(conn: &Connection) -> EventDao<'_> {
        EventDao::new(conn)
    }

    /// 创建活动计数 DAO
    pub fn campaign_dao(conn: &Connection) -> CampaignDao<'_> {
        CampaignDao::new(conn)
    }

    /// 创建外发历史 DAO
    pub fn outbound_dao(conn: &Connection) -> OutboundDao<'_> {
        OutboundDao::new(conn)
    }
}

/// 事务管理器 - 统一管理跨表操作的事务
///
/// 单条推送事件的全部写入（消息 + 会话指针 + 事件日志 + 活动计数）
/// 必须在一个事务内完成，崩溃后不能留下半个事件。
pub struct TransactionManager<'a> {
    conn: &'a Connection,
}

impl<'a> TransactionManager<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 执行事务操作
    pub fn execute<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R>,
    {
        let tx = self.conn.unchecked_transaction()
            .map_err(|e| InboxSyncError::Database(format!("开始事务失败: {}", e)))?;

        let result = f(self.conn)?;

        tx.commit()
            .map_err(|e| InboxSyncError::Database(format!("提交事务失败: {}", e)))?;

        Ok(result)
    }
}
