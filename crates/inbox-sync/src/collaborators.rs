//! 协作方边界 - 账号目录、联系人分类、活动指标
//!
//! 镜像引擎不拥有账号与联系人数据，只通过三个 trait 消费：
//! - `AccountDirectory`: 哪些账号应保持在线，用什么凭据接入
//! - `ContactClassification`: 联系人的类型/状态/归属活动，首次回复时引擎回写状态
//! - `CampaignMetrics`: 触达 / 回复 / 已读三个漏斗计数的上报出口
//!
//! 每个 trait 都带内存实现，独立运行与测试时直接可用。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::transport::Credentials;

/// 外部系统里一个联系人的分类信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// 联系人类型（如 dev / kol）
    pub contact_type: String,
    /// 状态标签（如 blue = 已触达未回复）
    pub status: String,
    /// 归属的营销活动
    pub campaign_id: Option<u64>,
}

/// 账号目录：谁在册、用什么凭据接入
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// 应当保持连接的活跃账号列表
    async fn list_active(&self) -> Vec<String>;

    /// 账号的接入凭据；不在册返回 None
    async fn credentials(&self, account_id: &str) -> Option<Credentials>;
}

/// 联系人分类：引擎据此判定首次回复，并在翻转时回写状态
#[async_trait]
pub trait ContactClassification: Send + Sync {
    /// 查询联系人分类；外部系统不认识该联系人时返回 None
    async fn classification(&self, account_id: &str, peer_id: u64) -> Option<Classification>;

    /// 状态翻转回写（如 blue → yellow）；失败由实现方自行记录，引擎不重试
    async fn set_status(&self, account_id: &str, peer_id: u64, status: &str);
}

/// 活动漏斗指标上报
#[async_trait]
pub trait CampaignMetrics: Send + Sync {
    async fn increment_reached(&self, campaign_id: u64);
    async fn increment_replied(&self, campaign_id: u64);
    async fn increment_read(&self, campaign_id: u64);
}

/// 一组协作方句柄（管理器的构造参数）
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn AccountDirectory>,
    pub classification: Arc<dyn ContactClassification>,
    pub metrics: Arc<dyn CampaignMetrics>,
}

impl Collaborators {
    pub fn new(
        directory: Arc<dyn AccountDirectory>,
        classification: Arc<dyn ContactClassification>,
        metrics: Arc<dyn CampaignMetrics>,
    ) -> Self {
        Self {
            directory,
            classification,
            metrics,
        }
    }

    /// 只有账号目录、不关心分类与指标的独立运行形态
    pub fn standalone(directory: Arc<dyn AccountDirectory>) -> Self {
        Self {
            directory,
            classification: Arc::new(NoopClassification),
            metrics: Arc::new(NoopMetrics),
        }
    }
}

/// 内存账号目录
#[derive(Default)]
pub struct StaticDirectory {
    accounts: Mutex<HashMap<String, Credentials>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个账号
    pub fn insert(&self, account_id: &str, credentials: Credentials) {
        self.accounts
            .lock()
            .insert(account_id.to_string(), credentials);
    }

    pub fn remove(&self, account_id: &str) {
        self.accounts.lock().remove(account_id);
    }
}

#[async_trait]
impl AccountDirectory for StaticDirectory {
    async fn list_active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.accounts.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn credentials(&self, account_id: &str) -> Option<Credentials> {
        self.accounts.lock().get(account_id).cloned()
    }
}

/// 内存分类表：预置分类，并记录每次状态回写（断言用）
#[derive(Default)]
pub struct MemoryClassification {
    table: Mutex<HashMap<(String, u64), Classification>>,
    flips: Mutex<Vec<(String, u64, String)>>,
}

impl MemoryClassification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, account_id: &str, peer_id: u64, classification: Classification) {
        self.table
            .lock()
            .insert((account_id.to_string(), peer_id), classification);
    }

    /// 已发生的状态回写 (account, peer, 新状态)
    pub fn flips(&self) -> Vec<(String, u64, String)> {
        self.flips.lock().clone()
    }
}

#[async_trait]
impl ContactClassification for MemoryClassification {
    async fn classification(&self, account_id: &str, peer_id: u64) -> Option<Classification> {
        self.table
            .lock()
            .get(&(account_id.to_string(), peer_id))
            .cloned()
    }

    async fn set_status(&self, account_id: &str, peer_id: u64, status: &str) {
        let key = (account_id.to_string(), peer_id);
        let mut table = self.table.lock();
        if let Some(entry) = table.get_mut(&key) {
            entry.status = status.to_string();
        }
        drop(table);
        debug!(
            "分类状态回写: account={}, peer={}, status={}",
            account_id, peer_id, status
        );
        self.flips
            .lock()
            .push((account_id.to_string(), peer_id, status.to_string()));
    }
}

/// 内存活动指标：(触达, 回复, 已读) 三元组
#[derive(Default)]
pub struct MemoryMetrics {
    counters: Mutex<HashMap<u64, (u32, u32, u32)>>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 某活动的 (reached, replied, read) 计数
    pub fn snapshot(&self, campaign_id: u64) -> (u32, u32, u32) {
        self.counters
            .lock()
            .get(&campaign_id)
            .copied()
            .unwrap_or((0, 0, 0))
    }
}

#[async_trait]
impl CampaignMetrics for MemoryMetrics {
    async fn increment_reached(&self, campaign_id: u64) {
        self.counters.lock().entry(campaign_id).or_default().0 += 1;
    }

    async fn increment_replied(&self, campaign_id: u64) {
        self.counters.lock().entry(campaign_id).or_default().1 += 1;
    }

    async fn increment_read(&self, campaign_id: u64) {
        self.counters.lock().entry(campaign_id).or_default().2 += 1;
    }
}

/// 不提供分类信息的空实现
pub struct NoopClassification;

#[async_trait]
impl ContactClassification for NoopClassification {
    async fn classification(&self, _account_id: &str, _peer_id: u64) -> Option<Classification> {
        None
    }

    async fn set_status(&self, _account_id: &str, _peer_id: u64, _status: &str) {}
}

/// 不上报指标的空实现
pub struct NoopMetrics;

#[async_trait]
impl CampaignMetrics for NoopMetrics {
    async fn increment_reached(&self, _campaign_id: u64) {}
    async fn increment_replied(&self, _campaign_id: u64) {}
    async fn increment_read(&self, _campaign_id: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_credentials(secret: &str) -> Credentials {
        Credentials {
            api_id: 12345,
            api_secret: secret.to_string(),
            proxy: None,
        }
    }

    #[tokio::test]
    async fn test_static_directory() {
        let directory = StaticDirectory::new();
        directory.insert("acct2", test_credentials("b"));
        directory.insert("acct1", test_credentials("a"));

        assert_eq!(directory.list_active().await, vec!["acct1", "acct2"]);
        let creds = directory.credentials("acct1").await.unwrap();
        assert_eq!(creds.api_secret, "a");
        assert!(directory.credentials("ghost").await.is_none());

        directory.remove("acct2");
        assert_eq!(directory.list_active().await, vec!["acct1"]);
        println!("✅ 内存账号目录测试通过");
    }

    #[tokio::test]
    async fn test_memory_classification_flip() {
        let classification = MemoryClassification::new();
        classification.insert(
            "acct1",
            7,
            Classification {
                contact_type: "dev".to_string(),
                status: "blue".to_string(),
                campaign_id: Some(3),
            },
        );

        classification.set_status("acct1", 7, "yellow").await;

        let entry = classification.classification("acct1", 7).await.unwrap();
        assert_eq!(entry.status, "yellow");
        assert_eq!(entry.campaign_id, Some(3));
        assert_eq!(
            classification.flips(),
            vec![("acct1".to_string(), 7, "yellow".to_string())]
        );
        println!("✅ 内存分类表测试通过");
    }

    #[tokio::test]
    async fn test_memory_metrics_counts() {
        let metrics = MemoryMetrics::new();
        metrics.increment_reached(3).await;
        metrics.increment_reached(3).await;
        metrics.increment_replied(3).await;
        metrics.increment_read(9).await;

        assert_eq!(metrics.snapshot(3), (2, 1, 0));
        assert_eq!(metrics.snapshot(9), (0, 0, 1));
        assert_eq!(metrics.snapshot(404), (0, 0, 0));
        println!("✅ 内存活动指标测试通过");
    }
}
