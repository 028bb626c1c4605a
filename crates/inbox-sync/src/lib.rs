//! Inbox Sync - 私聊收件箱同步引擎
//!
//! 把远端消息平台上的一对一私聊镜像到本地，提供：
//! - 🔗 连接管理：每账号单连接复用、指数退避重连、空闲回收
//! - 📥 推送处理：新消息/回执/编辑/删除，事务落库 + 实时广播
//! - 🔄 周期对账：缺口算术 + 有界补拉 + 全量审计，远端调用最少化
//! - 🛡️ 外发守卫：跨重启幂等、滚动窗口限速、回复率豁免
//! - ⚙️ 事件系统：广播订阅 + 持久事件日志双消费面
//! - 💾 数据安全：每账号独立 SQLite 镜像库，令牌损坏自动丢弃
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use inbox_sync::{
//!     Collaborators, Credentials, InboxConfig, InboxManager, StaticDirectory,
//! };
//!
//! # async fn run(transport: Arc<dyn inbox_sync::Transport>) -> inbox_sync::Result<()> {
//! // 账号目录（生产环境接到自己的账号服务上）
//! let directory = Arc::new(StaticDirectory::new());
//! directory.insert(
//!     "acct_1",
//!     Credentials { api_id: 12345, api_secret: "secret".into(), proxy: None },
//! );
//!
//! // 初始化并启动引擎
//! let config = InboxConfig::new("/path/to/data");
//! let manager = InboxManager::initialize(
//!     config,
//!     transport,
//!     Collaborators::standalone(directory),
//! ).await?;
//! manager.start().await?;
//!
//! // 接入目录里的全部账号
//! let results = manager.connect_all().await;
//! println!("连接结果: {:?}", results);
//!
//! // 消费实时事件
//! let mut rx = manager.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = rx.recv().await {
//!         println!("事件: {}", event.event_type());
//!     }
//! });
//!
//! // 发送一条带活动标记的消息
//! let outcome = manager.send_message("acct_1", 8800, "你好", Some(7)).await?;
//! println!("发送结果: {:?}", outcome);
//!
//! // 有序停机（会话令牌落盘）
//! manager.stop().await;
//! # Ok(())
//! # }
//! ```

// 导出核心模块
pub mod collaborators;
pub mod connection;
pub mod connection_state;
pub mod error;
pub mod events;
pub mod guard;
pub mod manager;
pub mod processor;
pub mod session;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod version;

// 重新导出核心类型，方便使用
pub use error::{InboxSyncError, Result};
pub use manager::{InboxConfig, InboxManager, SendOutcome};
pub use collaborators::{
    AccountDirectory, CampaignMetrics, Classification, Collaborators, ContactClassification,
    StaticDirectory,
};
pub use connection::{
    credential_fingerprint, ConnectionConfig, ConnectionHandle, ConnectionManager, UpdateStream,
};
pub use connection_state::{AccountStateManager, AccountStateSnapshot, AccountStatus};
pub use events::{event_builders, EventFilter, EventManager, FilteredEventReceiver, InboxEvent};
pub use guard::{GuardConfig, GuardDecision, GuardStatus, OutboundGuard};
pub use processor::{EventProcessor, ProcessorConfig};
pub use session::SessionStore;
pub use storage::entities::{ConversationRow, EventKind, EventRow, MessageRow, Provenance};
pub use storage::{ListQuery, MessageQuery, MirrorStore};
pub use sync::{SyncConfig, SyncEngine, SyncStats};
pub use transport::{
    Credentials, DialogSummary, Direction, MockTransport, ProxyConfig, PushUpdate, RemoteMessage,
    SentReceipt, Transport, TransportError, TransportSession,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_metadata() {
        assert!(!version::SDK_VERSION.is_empty());
        assert!(version::MIRROR_DB_VERSION >= 2);
        println!(
            "✅ inbox-sync v{} (镜像库 v{})",
            version::SDK_VERSION,
            version::MIRROR_DB_VERSION
        );
    }
}
