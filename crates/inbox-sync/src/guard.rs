//! 外发守卫 - 发送路径的去重与频控
//!
//! 判定顺序（按账号隔离）：
//! 1. 进程内已发对端集合（最快路径，进程生命周期）
//! 2. 镜像库 outbound_history 的 (peer, campaign) 唯一行（跨重启）
//! 3. 滚动窗口计数，默认 24 小时 40 条；窗口内回复率达标时豁免
//! 4. 两次外发的最小间隔，默认 30 秒
//!
//! 守卫拒绝不是错误：返回 `GuardDecision`，调用方据此决定展示与重试。

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::storage::entities::{now_ms, EventKind};
use crate::storage::{DaoFactory, MirrorStore};

/// 守卫配置
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// 滚动窗口内的外发上限
    pub window_max_sends: u32,
    /// 滚动窗口长度
    pub window: Duration,
    /// 两次外发的最小间隔
    pub min_spacing: Duration,
    /// 窗口内回复率达到该值时豁免窗口上限（去重与间隔不豁免）
    pub reply_rate_bypass: f64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            window_max_sends: 40,
            window: Duration::from_secs(24 * 60 * 60),
            min_spacing: Duration::from_secs(30),
            reply_rate_bypass: 0.30,
        }
    }
}

/// 守卫判定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardDecision {
    /// 放行
    Allowed,
    /// 重复外发（任一去重层命中）
    DuplicateBlocked,
    /// 频控拦截；retry_at 为预计可再发的毫秒时间戳
    RateLimited { retry_at: i64 },
}

/// 守卫状态报告（UI / 巡检用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardStatus {
    pub account_id: String,
    /// 窗口内已发条数
    pub sent_in_window: u32,
    /// 窗口内剩余额度
    pub remaining: u32,
    pub window_max: u32,
    pub window_secs: u64,
    pub min_spacing_secs: u64,
    /// 最早可再发时间（毫秒）；当前无约束时为 None
    pub next_send_at: Option<i64>,
    /// 窗口内回复率（首次回复数 / 触达对端数）
    pub reply_rate: f64,
    /// 回复率豁免是否生效
    pub bypass_active: bool,
}

/// 单账号的进程内守卫状态
#[derive(Default)]
struct AccountGuardState {
    /// 本进程已外发过的对端
    sent_peers: HashSet<u64>,
    /// 最近一次外发时间（毫秒）；进程启动后从持久层惰性回填
    last_sent_at: Option<i64>,
}

/// 持久层一次读出的判定材料
struct DurableSnapshot {
    duplicate: bool,
    sent_in_window: i64,
    last_sent: Option<i64>,
    oldest_in_window: Option<i64>,
    reply_rate: f64,
}

/// 外发守卫
pub struct OutboundGuard {
    store: MirrorStore,
    config: GuardConfig,
    accounts: Mutex<HashMap<String, AccountGuardState>>,
}

impl OutboundGuard {
    pub fn new(store: MirrorStore, config: GuardConfig) -> Self {
        Self {
            store,
            config,
            accounts: Mutex::new(HashMap::new()),
        }
    }

    /// 判定能否向 peer 外发
    pub async fn check(
        &self,
        account_id: &str,
        peer_id: u64,
        campaign_id: Option<u64>,
    ) -> Result<GuardDecision> {
        // 第一层：进程内集合
        {
            let mut accounts = self.accounts.lock();
            let state = accounts.entry(account_id.to_string()).or_default();
            if state.sent_peers.contains(&peer_id) {
                debug!(
                    "守卫拦截（进程内已发）: account={}, peer={}",
                    account_id, peer_id
                );
                return Ok(GuardDecision::DuplicateBlocked);
            }
        }

        let now = now_ms();
        let window_ms = self.config.window.as_millis() as i64;
        let window_start = now - window_ms;
        let snapshot = self
            .durable_snapshot(account_id, Some((peer_id, campaign_id.unwrap_or(0))), window_start)
            .await?;

        // 第二层：跨重启去重
        if snapshot.duplicate {
            debug!(
                "守卫拦截（历史已发）: account={}, peer={}, campaign={:?}",
                account_id, peer_id, campaign_id
            );
            return Ok(GuardDecision::DuplicateBlocked);
        }

        // 第三层：滚动窗口，回复率达标时豁免
        if snapshot.sent_in_window >= self.config.window_max_sends as i64 {
            if snapshot.reply_rate >= self.config.reply_rate_bypass {
                debug!(
                    "窗口已满但回复率 {:.2} 达标，豁免: account={}",
                    snapshot.reply_rate, account_id
                );
            } else {
                // 窗口名额在最早一条滑出窗口时释放
                let retry_at = snapshot
                    .oldest_in_window
                    .map(|t| t + window_ms)
                    .unwrap_or(now + window_ms);
                return Ok(GuardDecision::RateLimited { retry_at });
            }
        }

        // 第四层：最小间隔（内存值优先，持久层兜底）
        let last_sent = {
            let mut accounts = self.accounts.lock();
            let state = accounts.entry(account_id.to_string()).or_default();
            if state.last_sent_at.is_none() {
                state.last_sent_at = snapshot.last_sent;
            }
            state.last_sent_at
        };
        if let Some(last) = last_sent {
            let next_ok = last + self.config.min_spacing.as_millis() as i64;
            if now < next_ok {
                return Ok(GuardDecision::RateLimited { retry_at: next_ok });
            }
        }

        Ok(GuardDecision::Allowed)
    }

    /// 记录一次成功外发；返回该 (peer, campaign) 是否首次入库
    ///
    /// 历史行与活动触达计数在同一事务内落库，之后才推进内存态。
    pub async fn record_sent(
        &self,
        account_id: &str,
        peer_id: u64,
        campaign_id: Option<u64>,
    ) -> Result<bool> {
        let campaign = campaign_id.unwrap_or(0);
        let now = now_ms();
        let first = self
            .store
            .with_tx(account_id, move |conn| {
                let first = DaoFactory::outbound_dao(conn).record_sent(peer_id, campaign, now)?;
                if first && campaign != 0 {
                    DaoFactory::campaign_dao(conn).increment_reached(campaign)?;
                }
                Ok(first)
            })
            .await?;

        {
            let mut accounts = self.accounts.lock();
            let state = accounts.entry(account_id.to_string()).or_default();
            state.sent_peers.insert(peer_id);
            state.last_sent_at = Some(now);
        }
        if first {
            info!(
                "外发已记录: account={}, peer={}, campaign={}",
                account_id, peer_id, campaign
            );
        }
        Ok(first)
    }

    /// 当前守卫状态
    pub async fn status(&self, account_id: &str) -> Result<GuardStatus> {
        let now = now_ms();
        let window_ms = self.config.window.as_millis() as i64;
        let window_start = now - window_ms;
        let snapshot = self.durable_snapshot(account_id, None, window_start).await?;

        let sent_in_window = snapshot.sent_in_window.max(0) as u32;
        let bypass_active = snapshot.reply_rate >= self.config.reply_rate_bypass;

        let mut next_send_at: Option<i64> = None;
        if sent_in_window >= self.config.window_max_sends && !bypass_active {
            next_send_at = snapshot.oldest_in_window.map(|t| t + window_ms);
        }
        let last_sent = {
            let accounts = self.accounts.lock();
            accounts
                .get(account_id)
                .and_then(|s| s.last_sent_at)
                .or(snapshot.last_sent)
        };
        if let Some(last) = last_sent {
            let spacing_ok_at = last + self.config.min_spacing.as_millis() as i64;
            if spacing_ok_at > now && spacing_ok_at > next_send_at.unwrap_or(0) {
                next_send_at = Some(spacing_ok_at);
            }
        }

        Ok(GuardStatus {
            account_id: account_id.to_string(),
            sent_in_window,
            remaining: self.config.window_max_sends.saturating_sub(sent_in_window),
            window_max: self.config.window_max_sends,
            window_secs: self.config.window.as_secs(),
            min_spacing_secs: self.config.min_spacing.as_secs(),
            next_send_at,
            reply_rate: snapshot.reply_rate,
            bypass_active,
        })
    }

    /// 清掉某账号的进程内状态（登出时）；持久层不动
    pub fn forget_account(&self, account_id: &str) {
        self.accounts.lock().remove(account_id);
    }

    async fn durable_snapshot(
        &self,
        account_id: &str,
        dedupe_key: Option<(u64, u64)>,
        window_start: i64,
    ) -> Result<DurableSnapshot> {
        self.store
            .with_conn(account_id, move |conn| {
                let outbound = DaoFactory::outbound_dao(conn);
                let duplicate = match dedupe_key {
                    Some((peer_id, campaign)) => outbound.has_sent(peer_id, campaign)?,
                    None => false,
                };
                let sent_in_window = outbound.count_since(window_start)?;
                let last_sent = outbound.last_sent_at()?;
                let oldest_in_window = outbound.oldest_since(window_start)?;
                let replies = DaoFactory::event_dao(conn)
                    .count_since(EventKind::FirstReply, window_start)?;
                let reached = outbound.distinct_peers_since(window_start)?;
                let reply_rate = if reached > 0 {
                    replies as f64 / reached as f64
                } else {
                    0.0
                };
                Ok(DurableSnapshot {
                    duplicate,
                    sent_in_window,
                    last_sent,
                    oldest_in_window,
                    reply_rate,
                })
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::entities::EventRow;
    use tempfile::TempDir;

    async fn new_store() -> (TempDir, MirrorStore) {
        let dir = TempDir::new().unwrap();
        let store = MirrorStore::new(dir.path()).await.unwrap();
        store.init_account("acct1").await.unwrap();
        (dir, store)
    }

    fn no_spacing() -> GuardConfig {
        GuardConfig {
            min_spacing: Duration::ZERO,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_duplicate_blocked_in_process() {
        let (_dir, store) = new_store().await;
        let guard = OutboundGuard::new(store, no_spacing());

        assert_eq!(
            guard.check("acct1", 7, Some(3)).await.unwrap(),
            GuardDecision::Allowed
        );
        assert!(guard.record_sent("acct1", 7, Some(3)).await.unwrap());

        // 同对端换活动，进程内集合也拦
        assert_eq!(
            guard.check("acct1", 7, Some(4)).await.unwrap(),
            GuardDecision::DuplicateBlocked
        );
        println!("✅ 进程内去重测试通过");
    }

    #[tokio::test]
    async fn test_duplicate_survives_restart() {
        let (_dir, store) = new_store().await;
        {
            let guard = OutboundGuard::new(store.clone(), no_spacing());
            assert!(guard.record_sent("acct1", 7, Some(3)).await.unwrap());
        }

        // 守卫重建（模拟进程重启）：持久层仍然拦截同 (peer, campaign)
        let reborn = OutboundGuard::new(store.clone(), no_spacing());
        assert_eq!(
            reborn.check("acct1", 7, Some(3)).await.unwrap(),
            GuardDecision::DuplicateBlocked
        );
        // 换活动可以再发
        assert_eq!(
            reborn.check("acct1", 7, Some(4)).await.unwrap(),
            GuardDecision::Allowed
        );
        println!("✅ 跨重启去重测试通过");
    }

    #[tokio::test]
    async fn test_window_cap_and_retry_at() {
        let (_dir, store) = new_store().await;
        let guard = OutboundGuard::new(
            store,
            GuardConfig {
                window_max_sends: 3,
                min_spacing: Duration::ZERO,
                ..Default::default()
            },
        );

        let before = now_ms();
        for peer in [1u64, 2, 3] {
            assert_eq!(
                guard.check("acct1", peer, None).await.unwrap(),
                GuardDecision::Allowed
            );
            guard.record_sent("acct1", peer, None).await.unwrap();
        }

        let decision = guard.check("acct1", 4, None).await.unwrap();
        match decision {
            GuardDecision::RateLimited { retry_at } => {
                // 窗口在最早一条滑出时释放
                let window_ms = 24 * 60 * 60 * 1000;
                assert!(retry_at >= before + window_ms);
                assert!(retry_at <= now_ms() + window_ms);
            }
            other => panic!("期望频控拦截，得到 {:?}", other),
        }

        let status = guard.status("acct1").await.unwrap();
        assert_eq!(status.sent_in_window, 3);
        assert_eq!(status.remaining, 0);
        assert!(status.next_send_at.is_some());
        println!("✅ 滚动窗口测试通过");
    }

    #[tokio::test]
    async fn test_reply_rate_bypass_lifts_cap() {
        let (_dir, store) = new_store().await;
        let guard = OutboundGuard::new(
            store.clone(),
            GuardConfig {
                window_max_sends: 3,
                min_spacing: Duration::ZERO,
                ..Default::default()
            },
        );

        for peer in [1u64, 2, 3] {
            guard.record_sent("acct1", peer, None).await.unwrap();
        }
        assert!(matches!(
            guard.check("acct1", 4, None).await.unwrap(),
            GuardDecision::RateLimited { .. }
        ));

        // 一条首次回复进账：3 个触达里 1 个回复 = 0.33，越过 0.30 门槛
        store
            .with_conn("acct1", |conn| {
                DaoFactory::event_dao(conn)
                    .append(&EventRow::new(2, EventKind::FirstReply))
                    .map(|_| ())
            })
            .await
            .unwrap();

        assert_eq!(
            guard.check("acct1", 4, None).await.unwrap(),
            GuardDecision::Allowed
        );
        let status = guard.status("acct1").await.unwrap();
        assert!(status.bypass_active);
        assert!(status.reply_rate > 0.30);
        println!("✅ 回复率豁免测试通过");
    }

    #[tokio::test]
    async fn test_min_spacing_between_sends() {
        let (_dir, store) = new_store().await;
        let guard = OutboundGuard::new(store.clone(), GuardConfig::default());

        let before = now_ms();
        guard.record_sent("acct1", 1, None).await.unwrap();
        let after = now_ms();

        let decision = guard.check("acct1", 2, None).await.unwrap();
        match decision {
            GuardDecision::RateLimited { retry_at } => {
                assert!(retry_at >= before + 30_000);
                assert!(retry_at <= after + 30_000);
            }
            other => panic!("期望间隔拦截，得到 {:?}", other),
        }

        // 间隔约束跨重启依然成立（最近外发时间从持久层兜底）
        let reborn = OutboundGuard::new(store, GuardConfig::default());
        assert!(matches!(
            reborn.check("acct1", 2, None).await.unwrap(),
            GuardDecision::RateLimited { .. }
        ));
        println!("✅ 最小间隔测试通过");
    }

    #[tokio::test]
    async fn test_status_without_history() {
        let (_dir, store) = new_store().await;
        let guard = OutboundGuard::new(store, GuardConfig::default());

        let status = guard.status("acct1").await.unwrap();
        assert_eq!(status.sent_in_window, 0);
        assert_eq!(status.remaining, 40);
        assert_eq!(status.window_secs, 86_400);
        assert_eq!(status.min_spacing_secs, 30);
        assert!(status.next_send_at.is_none());
        assert_eq!(status.reply_rate, 0.0);
        assert!(!status.bypass_active);
    }
}
