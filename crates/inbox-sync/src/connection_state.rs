//! 账号连接状态管理
//!
//! 提供每个账号的连接状态信息，包括：
//! - 连接生命周期状态（连接中/已连接/重连中/需要登录/失败）
//! - 活动统计（处理的推送数、镜像的消息数、外发数）
//! - 状态变更事件广播
//! - 快照持久化（进程重启后可查最后状态）

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use crate::events::{event_builders, EventManager};
use crate::storage::kv::{keys, StateKv};

/// 账号连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    /// 未连接
    Disconnected,
    /// 连接中
    Connecting,
    /// 已连接
    Connected,
    /// 重连中
    Reconnecting,
    /// 凭据失效，需要重新登录
    AuthRequired,
    /// 重连次数耗尽，连接失败
    Failed,
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccountStatus::Disconnected => write!(f, "未连接"),
            AccountStatus::Connecting => write!(f, "连接中"),
            AccountStatus::Connected => write!(f, "已连接"),
            AccountStatus::Reconnecting => write!(f, "重连中"),
            AccountStatus::AuthRequired => write!(f, "需要登录"),
            AccountStatus::Failed => write!(f, "连接失败"),
        }
    }
}

/// 账号活动统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountActivityStats {
    /// 已处理的推送更新数
    pub updates_processed: u64,
    /// 已镜像的消息数
    pub messages_mirrored: u64,
    /// 已外发的消息数
    pub messages_sent: u64,
    /// 重连尝试次数（累计）
    pub reconnect_attempts: u64,
    /// 最后活动时间（UTC毫秒时间戳）
    pub last_activity_time: Option<i64>,
}

/// 账号状态快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountStateSnapshot {
    /// 账号 ID
    pub account_id: String,
    /// 当前状态
    pub status: AccountStatus,
    /// 连接建立时间（UTC毫秒时间戳）
    pub connected_at: Option<i64>,
    /// 活动统计
    pub stats: AccountActivityStats,
    /// 引擎版本
    pub engine_version: String,
    /// 备注信息（最近一次错误等）
    pub notes: Option<String>,
}

impl AccountStateSnapshot {
    /// 创建新的状态快照（未连接）
    pub fn new(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            status: AccountStatus::Disconnected,
            connected_at: None,
            stats: AccountActivityStats::default(),
            engine_version: crate::version::SDK_VERSION.to_string(),
            notes: None,
        }
    }

    /// 获取连接持续时间（秒）
    pub fn connection_duration_secs(&self) -> Option<i64> {
        self.connected_at.map(|connected_at| {
            let now = Utc::now().timestamp_millis();
            (now - connected_at) / 1000
        })
    }

    /// 格式化连接持续时间为可读字符串
    pub fn format_connection_duration(&self) -> String {
        match self.connection_duration_secs() {
            Some(secs) => {
                let hours = secs / 3600;
                let minutes = (secs % 3600) / 60;
                let seconds = secs % 60;

                if hours > 0 {
                    format!("{}小时{}分{}秒", hours, minutes, seconds)
                } else if minutes > 0 {
                    format!("{}分{}秒", minutes, seconds)
                } else {
                    format!("{}秒", seconds)
                }
            }
            None => "未连接".to_string(),
        }
    }

    /// 生成状态摘要（用于日志打印）
    pub fn summary(&self) -> String {
        format!(
            "【账号状态】\n\
             账号: {}\n\
             状态: {}\n\
             已连接: {}\n\
             统计: 推送{}条/镜像{}条/外发{}条/重连{}次\n\
             引擎版本: {}",
            self.account_id,
            self.status,
            self.format_connection_duration(),
            self.stats.updates_processed,
            self.stats.messages_mirrored,
            self.stats.messages_sent,
            self.stats.reconnect_attempts,
            self.engine_version,
        )
    }
}

/// 账号状态管理器（线程安全，覆盖全部账号）
#[derive(Clone)]
pub struct AccountStateManager {
    states: Arc<RwLock<HashMap<String, AccountStateSnapshot>>>,
    events: Arc<EventManager>,
    /// 快照持久化目标；None 时只在内存维护
    kv: Option<StateKv>,
}

impl AccountStateManager {
    /// 创建新的状态管理器
    pub fn new(events: Arc<EventManager>) -> Self {
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
            events,
            kv: None,
        }
    }

    /// 创建带快照持久化的状态管理器
    pub fn with_kv(events: Arc<EventManager>, kv: StateKv) -> Self {
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
            events,
            kv: Some(kv),
        }
    }

    /// 注册账号（重复注册是空操作）；尝试从 KV 恢复上次的统计
    pub async fn register_account(&self, account_id: &str) {
        {
            let states = self.states.read().await;
            if states.contains_key(account_id) {
                return;
            }
        }

        let mut snapshot = AccountStateSnapshot::new(account_id);
        if let Some(kv) = &self.kv {
            match kv
                .get::<AccountStateSnapshot>(account_id, keys::CONNECTION_STATE)
                .await
            {
                Ok(Some(saved)) => {
                    // 统计延续上个进程，状态一律从未连接开始
                    snapshot.stats = saved.stats;
                    snapshot.notes = saved.notes;
                }
                Ok(None) => {}
                Err(e) => warn!("恢复账号状态快照失败: account={}, err={}", account_id, e),
            }
        }

        let mut states = self.states.write().await;
        states.entry(account_id.to_string()).or_insert(snapshot);
    }

    /// 更新状态；发生变化时广播 ConnectionStateChanged 并持久化快照
    pub async fn set_status(&self, account_id: &str, status: AccountStatus) {
        let (old_status, snapshot) = {
            let mut states = self.states.write().await;
            let state = states
                .entry(account_id.to_string())
                .or_insert_with(|| AccountStateSnapshot::new(account_id));
            let old = state.status;
            state.status = status;
            match status {
                AccountStatus::Connected => {
                    if state.connected_at.is_none() {
                        state.connected_at = Some(Utc::now().timestamp_millis());
                    }
                }
                AccountStatus::Disconnected
                | AccountStatus::AuthRequired
                | AccountStatus::Failed => {
                    state.connected_at = None;
                }
                _ => {}
            }
            (old, state.clone())
        };

        if old_status != status {
            self.events
                .emit(event_builders::connection_state_changed(
                    account_id, old_status, status,
                ))
                .await;
        }
        self.persist(account_id, &snapshot).await;
    }

    /// 设置备注（最近一次错误等）
    pub async fn set_notes(&self, account_id: &str, notes: String) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(account_id) {
            state.notes = Some(notes);
        }
    }

    /// 推送更新计数 +1
    pub async fn increment_updates(&self, account_id: &str) {
        self.touch(account_id, |stats| stats.updates_processed += 1).await;
    }

    /// 镜像消息计数 +n
    pub async fn increment_mirrored(&self, account_id: &str, n: u64) {
        self.touch(account_id, |stats| stats.messages_mirrored += n).await;
    }

    /// 外发计数 +1
    pub async fn increment_sent(&self, account_id: &str) {
        self.touch(account_id, |stats| stats.messages_sent += 1).await;
    }

    /// 重连计数 +1
    pub async fn increment_reconnects(&self, account_id: &str) {
        self.touch(account_id, |stats| stats.reconnect_attempts += 1).await;
    }

    async fn touch<F>(&self, account_id: &str, f: F)
    where
        F: FnOnce(&mut AccountActivityStats),
    {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(account_id) {
            f(&mut state.stats);
            state.stats.last_activity_time = Some(Utc::now().timestamp_millis());
        }
    }

    /// 获取单个账号状态快照
    pub async fn get_state(&self, account_id: &str) -> Option<AccountStateSnapshot> {
        self.states.read().await.get(account_id).cloned()
    }

    /// 获取全部账号状态快照
    pub async fn get_all(&self) -> Vec<AccountStateSnapshot> {
        let mut all: Vec<_> = self.states.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        all
    }

    /// 打印状态到日志
    pub async fn log_state(&self, account_id: &str) {
        if let Some(state) = self.get_state(account_id).await {
            tracing::info!("\n{}", state.summary());
        }
    }

    /// 快照持久化是尽力而为：失败只告警，不影响状态机
    async fn persist(&self, account_id: &str, snapshot: &AccountStateSnapshot) {
        if let Some(kv) = &self.kv {
            if let Err(e) = kv.set(account_id, keys::CONNECTION_STATE, snapshot).await {
                warn!("持久化账号状态快照失败: account={}, err={}", account_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InboxEvent;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_status_change_emits_event() {
        let events = Arc::new(EventManager::new(16));
        let manager = AccountStateManager::new(events.clone());
        let mut receiver = events.subscribe();

        manager.register_account("acct1").await;
        manager.set_status("acct1", AccountStatus::Connecting).await;
        manager.set_status("acct1", AccountStatus::Connected).await;
        // 同状态重复设置不再广播
        manager.set_status("acct1", AccountStatus::Connected).await;

        let first = receiver.recv().await.unwrap();
        match first {
            InboxEvent::ConnectionStateChanged { old_status, new_status, .. } => {
                assert_eq!(old_status, AccountStatus::Disconnected);
                assert_eq!(new_status, AccountStatus::Connecting);
            }
            other => panic!("意外事件: {:?}", other),
        }
        let second = receiver.recv().await.unwrap();
        assert_eq!(second.event_type(), "connection_state_changed");
        assert!(receiver.try_recv().is_err());

        let state = manager.get_state("acct1").await.unwrap();
        assert_eq!(state.status, AccountStatus::Connected);
        assert!(state.connected_at.is_some());
    }

    #[tokio::test]
    async fn test_stats_accumulate() {
        let events = Arc::new(EventManager::new(16));
        let manager = AccountStateManager::new(events);
        manager.register_account("acct1").await;

        manager.increment_updates("acct1").await;
        manager.increment_updates("acct1").await;
        manager.increment_mirrored("acct1", 5).await;
        manager.increment_sent("acct1").await;

        let state = manager.get_state("acct1").await.unwrap();
        assert_eq!(state.stats.updates_processed, 2);
        assert_eq!(state.stats.messages_mirrored, 5);
        assert_eq!(state.stats.messages_sent, 1);
        assert!(state.stats.last_activity_time.is_some());
        println!("\n{}", state.summary());
    }

    #[tokio::test]
    async fn test_snapshot_restored_from_kv() {
        let dir = TempDir::new().unwrap();
        let kv = StateKv::new(dir.path()).await.unwrap();
        let events = Arc::new(EventManager::new(16));

        {
            let manager = AccountStateManager::with_kv(events.clone(), kv.clone());
            manager.register_account("acct1").await;
            manager.increment_mirrored("acct1", 7).await;
            manager.set_status("acct1", AccountStatus::Connected).await;
        }

        // 新的管理器（模拟进程重启）：统计延续，状态回到未连接
        let manager = AccountStateManager::with_kv(events, kv);
        manager.register_account("acct1").await;
        let state = manager.get_state("acct1").await.unwrap();
        assert_eq!(state.stats.messages_mirrored, 7);
        assert_eq!(state.status, AccountStatus::Disconnected);
    }
}
