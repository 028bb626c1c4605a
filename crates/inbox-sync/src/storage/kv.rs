//! KV 存储模块 - 基于 sled 的账号状态与同步检查点存储
//!
//! 本模块提供：
//! - 账号隔离的命名空间（每账号一棵 Tree）
//! - 连接状态快照的持久化（进程重启后恢复展示）
//! - 同步检查点（上次会话同步/全量同步时间）
//!
//! 与镜像库的分工：镜像库存业务数据，这里只存轻量运行状态。

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};
use tokio::sync::RwLock;

use crate::error::{InboxSyncError, Result};

/// 账号状态 KV 存储
#[derive(Debug, Clone)]
pub struct StateKv {
    base_path: PathBuf,
    db: Arc<Db>,
    /// 账号专属的 Tree 实例
    account_trees: Arc<RwLock<HashMap<String, Tree>>>,
}

impl StateKv {
    /// 创建 KV 存储实例
    pub async fn new(base_path: &Path) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("state-kv");

        tokio::fs::create_dir_all(&kv_path)
            .await
            .map_err(|e| InboxSyncError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 打开 sled 数据库（上个实例可能刚释放锁，重试多次带退避）
        const MAX_OPEN_RETRIES: u32 = 8;
        const RETRY_DELAY_MS: u64 = 300;
        let mut db_opt: Option<sled::Db> = None;
        let mut last_err: Option<sled::Error> = None;
        for attempt in 0..MAX_OPEN_RETRIES {
            match sled::open(&kv_path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = format!("{}", e);
                    last_err = Some(e);
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    if is_lock && attempt + 1 < MAX_OPEN_RETRIES {
                        let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                        tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }
        let db = db_opt.ok_or_else(|| {
            InboxSyncError::KvStore(
                last_err
                    .map(|e| format!("打开 sled 数据库失败: {}", e))
                    .unwrap_or_else(|| "打开 sled 数据库失败".to_string()),
            )
        })?;

        Ok(Self {
            base_path,
            db: Arc::new(db),
            account_trees: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// 获取（按需打开）账号 Tree
    async fn account_tree(&self, account_id: &str) -> Result<Tree> {
        {
            let trees = self.account_trees.read().await;
            if let Some(tree) = trees.get(account_id) {
                return Ok(tree.clone());
            }
        }
        let tree_name = format!("account_{}", account_id);
        let tree = self
            .db
            .open_tree(&tree_name)
            .map_err(|e| InboxSyncError::KvStore(format!("打开账号 Tree 失败: {}", e)))?;
        let mut trees = self.account_trees.write().await;
        let tree = trees.entry(account_id.to_string()).or_insert(tree).clone();
        Ok(tree)
    }

    /// 设置键值对
    pub async fn set<V>(&self, account_id: &str, key: &str, value: &V) -> Result<()>
    where
        V: Serialize,
    {
        let tree = self.account_tree(account_id).await?;
        let value_bytes = serde_json::to_vec(value)
            .map_err(|e| InboxSyncError::JsonError(format!("序列化值失败: {}", e)))?;
        tree.insert(key, value_bytes)
            .map_err(|e| InboxSyncError::KvStore(format!("设置键值对失败: {}", e)))?;
        Ok(())
    }

    /// 获取键值对
    pub async fn get<V>(&self, account_id: &str, key: &str) -> Result<Option<V>>
    where
        V: for<'de> Deserialize<'de>,
    {
        let tree = self.account_tree(account_id).await?;
        let result = tree
            .get(key)
            .map_err(|e| InboxSyncError::KvStore(format!("获取键值对失败: {}", e)))?;
        match result {
            Some(value_bytes) => {
                let value = serde_json::from_slice(&value_bytes)
                    .map_err(|e| InboxSyncError::JsonError(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 删除键值对
    pub async fn delete(&self, account_id: &str, key: &str) -> Result<()> {
        let tree = self.account_tree(account_id).await?;
        tree.remove(key)
            .map_err(|e| InboxSyncError::KvStore(format!("删除键值对失败: {}", e)))?;
        Ok(())
    }

    /// 清理账号数据（登出/换凭据后）
    pub async fn cleanup_account(&self, account_id: &str) -> Result<()> {
        let mut trees = self.account_trees.write().await;
        trees.remove(account_id);
        let tree_name = format!("account_{}", account_id);
        self.db
            .drop_tree(&tree_name)
            .map_err(|e| InboxSyncError::KvStore(format!("删除账号 Tree 失败: {}", e)))?;
        Ok(())
    }

    /// KV 根目录（诊断用）
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

/// 常用键名常量
pub mod keys {
    /// 连接状态快照
    pub const CONNECTION_STATE: &str = "connection_state";
    /// 上次会话列表同步完成时间（毫秒）
    pub const LAST_DIALOG_SYNC: &str = "last_dialog_sync";
    /// 上次全量同步完成时间（毫秒）
    pub const LAST_FULL_SYNC: &str = "last_full_sync";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_kv_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let kv = StateKv::new(temp_dir.path()).await.unwrap();

        let payload = json!({"status": "connected", "since": 1720000000});
        kv.set("acct1", keys::CONNECTION_STATE, &payload).await.unwrap();

        let loaded: serde_json::Value = kv
            .get("acct1", keys::CONNECTION_STATE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, payload);

        kv.delete("acct1", keys::CONNECTION_STATE).await.unwrap();
        let gone: Option<serde_json::Value> = kv.get("acct1", keys::CONNECTION_STATE).await.unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn test_accounts_are_isolated() {
        let temp_dir = TempDir::new().unwrap();
        let kv = StateKv::new(temp_dir.path()).await.unwrap();

        kv.set("acct1", keys::LAST_FULL_SYNC, &100i64).await.unwrap();
        kv.set("acct2", keys::LAST_FULL_SYNC, &200i64).await.unwrap();

        let t1: i64 = kv.get("acct1", keys::LAST_FULL_SYNC).await.unwrap().unwrap();
        let t2: i64 = kv.get("acct2", keys::LAST_FULL_SYNC).await.unwrap().unwrap();
        assert_eq!(t1, 100);
        assert_eq!(t2, 200);

        // 清理一个账号不影响另一个
        kv.cleanup_account("acct1").await.unwrap();
        let gone: Option<i64> = kv.get("acct1", keys::LAST_FULL_SYNC).await.unwrap();
        assert!(gone.is_none());
        let kept: Option<i64> = kv.get("acct2", keys::LAST_FULL_SYNC).await.unwrap();
        assert_eq!(kept, Some(200));
    }
}
