//! 同步引擎 - 周期对账与缺口收敛
//!
//! 三层调度，原则是能不打远端调用就不打：
//! - 会话同步（30 分钟）：一次 `fetch_dialogs`，按缺口算术决定后续动作
//! - 补拉扫描（5 分钟）：消费 needs_backfill 标记，分页收敛缺口
//! - 全量同步（12 小时）：会话同步 + 强制补拉 + 计数对账 + 读位补偿

mod engine;

pub use engine::SyncEngine;

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 同步调度配置
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// 会话列表同步间隔
    pub dialog_sync_interval: Duration,
    /// 全量同步间隔
    pub full_sync_interval: Duration,
    /// 补拉扫描间隔
    pub backfill_check_interval: Duration,
    /// 一次会话同步拉取的对话数上限
    pub dialog_fetch_limit: u32,
    /// 单次补拉的页大小
    pub backfill_page: u32,
    /// 同一轮扫描内两个会话补拉之间的间隔
    pub backfill_pacing: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            dialog_sync_interval: Duration::from_secs(30 * 60),
            full_sync_interval: Duration::from_secs(12 * 60 * 60),
            backfill_check_interval: Duration::from_secs(5 * 60),
            dialog_fetch_limit: 200,
            backfill_page: 100,
            backfill_pacing: Duration::from_secs(1),
        }
    }
}

/// 一轮同步的统计（SyncCompleted 事件随身携带）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStats {
    /// 拉到的对话摘要数
    pub dialogs_fetched: u32,
    /// 缺口为 1、直接内联写入的会话数
    pub applied_inline: u32,
    /// 缺口为 0、跳过的会话数
    pub skipped: u32,
    /// 缺口 >= 2、置补拉标记的会话数
    pub gaps_flagged: u32,
    /// 远端指针回退、做了删尾处理的会话数
    pub deletions_reconciled: u32,
    /// 本轮补拉写入的消息数
    pub messages_backfilled: u32,
    /// 本轮新建的会话数
    pub conversations_created: u32,
    /// 读位补偿翻转的外发消息数（全量同步才有）
    pub receipts_reconciled: u32,
    /// 计数对账不一致的会话数（只记录，不修复）
    pub count_mismatches: u32,
    /// 非致命错误，留给下一轮调度
    pub errors: Vec<String>,
}

impl SyncStats {
    /// 一行摘要（日志用）
    pub fn summary(&self) -> String {
        format!(
            "对话{}个: 内联{}/跳过{}/缺口{}/删尾{}, 补拉{}条, 新建会话{}个, 错误{}个",
            self.dialogs_fetched,
            self.applied_inline,
            self.skipped,
            self.gaps_flagged,
            self.deletions_reconciled,
            self.messages_backfilled,
            self.conversations_created,
            self.errors.len()
        )
    }
}
