//! 会话令牌存储 - 每账号一个不透明令牌文件，原子落盘
//!
//! 约定：
//! - 路径 `{data_dir}/sessions/{account}.session`，内容为平台导出的不透明令牌串
//! - 写入必须原子：先写 `.session.tmp` 再 rename，崩溃不会留下半个令牌
//! - 读到格式不对的令牌按"不存在"处理（强制重新登录），文件保留以便人工排查
//! - 只有识别出旧版二进制库文件（SQLite 头）才判定 StorageCorruption，
//!   由调用方决定是否丢弃文件
//! - 无需加锁：同一账号的令牌在任一时刻只有持有该账号连接的一方会写

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{InboxSyncError, Result};

/// 可用令牌的最小长度（平台导出的令牌远长于此；过短视为残缺）
const MIN_TOKEN_LEN: usize = 100;

/// 可用令牌的版本前缀（平台令牌格式第一位固定为 '1'）
const TOKEN_VERSION_PREFIX: char = '1';

/// 旧版客户端的二进制会话库文件头，出现即判定损坏
const LEGACY_DB_HEADER: &[u8] = b"SQLite format 3";

const SESSION_SUFFIX: &str = ".session";
const TMP_SUFFIX: &str = ".session.tmp";

/// 会话令牌存储
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// 创建存储，确保目录存在
    pub async fn new(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("sessions");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| InboxSyncError::IO(format!("创建会话目录失败: {}", e)))?;
        Ok(Self { dir })
    }

    fn session_path(&self, account_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}", sanitize_account(account_id), SESSION_SUFFIX))
    }

    fn tmp_path(&self, account_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}", sanitize_account(account_id), TMP_SUFFIX))
    }

    /// 读取令牌
    ///
    /// - 文件不存在 → Ok(None)
    /// - 格式不对（过短 / 前缀不符 / 非文本）→ Ok(None)，文件保留
    /// - 旧版二进制库文件 → Err(StorageCorruption)，是否丢弃由调用方定夺
    pub async fn load(&self, account_id: &str) -> Result<Option<String>> {
        let path = self.session_path(account_id);
        let raw = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(InboxSyncError::IO(format!("读取会话文件失败: {}", e))),
        };

        if raw.starts_with(LEGACY_DB_HEADER) {
            return Err(InboxSyncError::StorageCorruption(format!(
                "会话文件是旧版二进制库: {}",
                path.display()
            )));
        }

        let text = match String::from_utf8(raw) {
            Ok(s) => s,
            Err(_) => {
                warn!("⚠️ 会话文件不是合法文本，按缺失处理: account={}", account_id);
                return Ok(None);
            }
        };
        let token = text.trim().to_string();
        if token.len() <= MIN_TOKEN_LEN || !token.starts_with(TOKEN_VERSION_PREFIX) {
            warn!(
                "⚠️ 会话令牌格式不对（len={}），按缺失处理: account={}",
                token.len(),
                account_id
            );
            return Ok(None);
        }
        debug!("已加载会话令牌: account={}", account_id);
        Ok(Some(token))
    }

    /// 原子写入令牌：先写临时文件再 rename
    pub async fn save(&self, account_id: &str, token: &str) -> Result<()> {
        let tmp = self.tmp_path(account_id);
        let path = self.session_path(account_id);
        tokio::fs::write(&tmp, token.as_bytes())
            .await
            .map_err(|e| InboxSyncError::IO(format!("写入会话临时文件失败: {}", e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| InboxSyncError::IO(format!("会话文件 rename 失败: {}", e)))?;
        debug!("会话令牌已保存: account={}", account_id);
        Ok(())
    }

    /// 删除令牌文件（仅 StorageCorruption 处置路径调用）
    pub async fn delete(&self, account_id: &str) -> Result<()> {
        let path = self.session_path(account_id);
        match tokio::fs::remove_file(&path).await {
            Ok(_) => {
                warn!("🧹 已丢弃会话令牌文件: account={}", account_id);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(InboxSyncError::IO(format!("删除会话文件失败: {}", e))),
        }
    }

    /// 枚举已有令牌文件的账号（文件名即账号）
    pub fn list(&self) -> Vec<String> {
        let mut accounts = Vec::new();
        for entry in WalkDir::new(&self.dir).max_depth(1).into_iter().flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if let Some(account) = name.strip_suffix(SESSION_SUFFIX) {
                    if !account.is_empty() && !name.ends_with(TMP_SUFFIX) {
                        accounts.push(account.to_string());
                    }
                }
            }
        }
        accounts.sort();
        accounts
    }
}

/// 账号 id 作为文件名使用前的清洗（路径分隔符替换为下划线）
fn sanitize_account(account_id: &str) -> String {
    account_id.replace(['/', '\\'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn valid_token() -> String {
        format!("1{}", "a".repeat(120))
    }

    async fn new_store() -> (TempDir, SessionStore) {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_save_and_load_roundtrip() {
        let (_dir, store) = new_store().await;
        let token = valid_token();
        store.save("+15550001", &token).await.unwrap();

        let loaded = store.load("+15550001").await.unwrap();
        assert_eq!(loaded, Some(token));

        // 临时文件不应残留
        assert!(!store.tmp_path("+15550001").exists());
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let (_dir, store) = new_store().await;
        assert!(store.load("+15559999").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_token_treated_as_absent() {
        let (_dir, store) = new_store().await;
        // 过短
        tokio::fs::write(store.session_path("a1"), b"1short")
            .await
            .unwrap();
        assert!(store.load("a1").await.unwrap().is_none());
        // 前缀不符
        let bad = format!("2{}", "b".repeat(120));
        tokio::fs::write(store.session_path("a2"), bad.as_bytes())
            .await
            .unwrap();
        assert!(store.load("a2").await.unwrap().is_none());
        // 文件保留，未被删除
        assert!(store.session_path("a1").exists());
        assert!(store.session_path("a2").exists());
    }

    #[tokio::test]
    async fn test_legacy_binary_is_corruption() {
        let (_dir, store) = new_store().await;
        let mut blob = Vec::from(&b"SQLite format 3\0"[..]);
        blob.extend_from_slice(&[0u8; 64]);
        tokio::fs::write(store.session_path("legacy"), &blob)
            .await
            .unwrap();

        let err = store.load("legacy").await.err().unwrap();
        assert!(matches!(err, InboxSyncError::StorageCorruption(_)));

        // 处置后按缺失处理
        store.delete("legacy").await.unwrap();
        assert!(store.load("legacy").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_overwrites_atomically() {
        let (_dir, store) = new_store().await;
        let first = valid_token();
        let second = format!("1{}", "c".repeat(150));
        store.save("acct", &first).await.unwrap();
        store.save("acct", &second).await.unwrap();
        assert_eq!(store.load("acct").await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_list_accounts() {
        let (_dir, store) = new_store().await;
        store.save("acct_b", &valid_token()).await.unwrap();
        store.save("acct_a", &valid_token()).await.unwrap();
        assert_eq!(store.list(), vec!["acct_a".to_string(), "acct_b".to_string()]);
        println!("✅ 会话目录扫描正常");
    }
}
