//! 连接管理器 - 每账号至多一条活跃连接
//!
//! 注册表以 (账号, 凭据指纹) 为键。取连接的竞争发生在注册表上，
//! 不发生在传输层上：同账号的建立过程互斥，后到者直接复用。
//!
//! 生命周期：
//! - `acquire`: 计数 +1 复用，或走「读令牌 → 拨号（退避重试）→ 注册」
//! - `release`: 计数 -1；归零不拆连接，留给空闲回收
//! - `evict_idle`: 计数为零且空闲超阈值的连接，保存令牌后拆除
//!
//! 并存活跃账号有上限（信号量），满员时 `acquire` 排队等待。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection_state::{AccountStateManager, AccountStatus};
use crate::error::{InboxSyncError, Result};
use crate::session::SessionStore;
use crate::storage::entities::now_ms;
use crate::transport::{
    Credentials, DialogSummary, PushUpdate, RemoteMessage, SentReceipt, Transport, TransportError,
    TransportSession,
};

/// 连接管理器配置
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// 并存活跃账号上限（超出时 acquire 排队）
    pub max_live_accounts: usize,
    /// 单次拨号超时
    pub connect_timeout: Duration,
    /// 退避初始延迟
    pub backoff_initial: Duration,
    /// 退避倍率
    pub backoff_factor: f64,
    /// 退避上限
    pub backoff_max: Duration,
    /// 建连/重连尝试次数上限
    pub max_attempts: u32,
    /// 空闲回收阈值（计数为零超过该时长才拆）
    pub idle_threshold: Duration,
    /// 空闲回收扫描间隔
    pub eviction_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_live_accounts: 100,
            connect_timeout: Duration::from_secs(30),
            backoff_initial: Duration::from_secs(1),
            backoff_factor: 2.0,
            backoff_max: Duration::from_secs(30),
            max_attempts: 5,
            idle_threshold: Duration::from_secs(2 * 60 * 60),
            eviction_interval: Duration::from_secs(10 * 60),
        }
    }
}

/// 注册表键：同账号换凭据（指纹变化）视同新连接
type ConnKey = (String, String);

/// 凭据指纹：api_id + api_secret + 代理，任一变化指纹即不同
pub fn credential_fingerprint(credentials: &Credentials) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credentials.api_id.to_be_bytes());
    hasher.update(credentials.api_secret.as_bytes());
    if let Some(proxy) = &credentials.proxy {
        hasher.update(proxy.to_url().as_bytes());
    }
    hex::encode(hasher.finalize())
}

struct ConnMeta {
    refcount: u32,
    last_active_ms: i64,
}

/// 一条受管连接
///
/// 持有活跃账号名额（信号量许可），连接彻底拆除后名额自动归还。
pub struct ManagedConnection {
    conn_id: String,
    account_id: String,
    fingerprint: String,
    session: Arc<dyn TransportSession>,
    meta: parking_lot::Mutex<ConnMeta>,
    _permit: OwnedSemaphorePermit,
}

impl ManagedConnection {
    fn touch(&self) {
        self.meta.lock().last_active_ms = now_ms();
    }

    fn refcount(&self) -> u32 {
        self.meta.lock().refcount
    }
}

/// 连接句柄 - 借用会话能力，不转移所有权
///
/// 克隆不增加占用计数；计数只跟 `acquire` / `release` 走。
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<ManagedConnection>,
}

impl ConnectionHandle {
    pub fn account_id(&self) -> &str {
        &self.inner.account_id
    }

    /// 连接实例 id（每次建立都不同，诊断用）
    pub fn connection_id(&self) -> &str {
        &self.inner.conn_id
    }

    pub fn is_alive(&self) -> bool {
        self.inner.session.is_alive()
    }

    pub fn export_session(&self) -> String {
        self.inner.session.export_session()
    }

    /// 推送流订阅（事件泵独占消费）
    pub fn subscribe_updates(&self) -> UpdateStream {
        UpdateStream {
            session: self.inner.session.clone(),
        }
    }

    pub async fn fetch_dialogs(
        &self,
        limit: u32,
    ) -> std::result::Result<Vec<DialogSummary>, TransportError> {
        self.inner.touch();
        self.inner.session.fetch_dialogs(limit).await
    }

    pub async fn fetch_messages(
        &self,
        peer_id: u64,
        min_id: u64,
        limit: u32,
    ) -> std::result::Result<Vec<RemoteMessage>, TransportError> {
        self.inner.touch();
        self.inner.session.fetch_messages(peer_id, min_id, limit).await
    }

    pub async fn fetch_message_count(
        &self,
        peer_id: u64,
    ) -> std::result::Result<u64, TransportError> {
        self.inner.touch();
        self.inner.session.fetch_message_count(peer_id).await
    }

    pub async fn send_message(
        &self,
        peer_id: u64,
        text: &str,
    ) -> std::result::Result<SentReceipt, TransportError> {
        self.inner.touch();
        self.inner.session.send_message(peer_id, text).await
    }

    /// 断开底层会话。只给注册表之外的隔离连接（`force_new`）用，
    /// 注册表内的连接交给管理器拆。
    pub async fn disconnect(&self) -> std::result::Result<(), TransportError> {
        self.inner.session.disconnect().await
    }
}

/// 推送更新流
pub struct UpdateStream {
    session: Arc<dyn TransportSession>,
}

impl UpdateStream {
    /// 下一条推送；Ok(None) 表示流正常结束
    pub async fn next(&mut self) -> std::result::Result<Option<PushUpdate>, TransportError> {
        self.session.next_update().await
    }
}

/// 连接管理器
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    sessions: SessionStore,
    states: AccountStateManager,
    config: ConnectionConfig,
    registry: Mutex<HashMap<ConnKey, Arc<ManagedConnection>>>,
    /// 同账号建立互斥
    establish_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    pool: Arc<Semaphore>,
    shutdown: CancellationToken,
    evictor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        sessions: SessionStore,
        states: AccountStateManager,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        let pool = Arc::new(Semaphore::new(config.max_live_accounts));
        Arc::new(Self {
            transport,
            sessions,
            states,
            config,
            registry: Mutex::new(HashMap::new()),
            establish_locks: Mutex::new(HashMap::new()),
            pool,
            shutdown: CancellationToken::new(),
            evictor: Mutex::new(None),
        })
    }

    /// 启动后台空闲回收循环
    pub async fn start(self: &Arc<Self>) {
        let mgr = Arc::clone(self);
        let token = self.shutdown.clone();
        let interval = self.config.eviction_interval;
        let threshold = self.config.idle_threshold;
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        let evicted = mgr.evict_idle(threshold).await;
                        if evicted > 0 {
                            info!("空闲连接回收: {} 条", evicted);
                        }
                    }
                }
            }
        });
        *self.evictor.lock().await = Some(handle);
        info!(
            "连接管理器已启动（空闲阈值 {:?}，扫描间隔 {:?}）",
            threshold, interval
        );
    }

    /// 停止：取消回收循环并拆除全部连接（令牌落盘）
    pub async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.evictor.lock().await.take() {
            let _ = handle.await;
        }
        let all: Vec<Arc<ManagedConnection>> = {
            let mut registry = self.registry.lock().await;
            registry.drain().map(|(_, conn)| conn).collect()
        };
        for conn in all {
            self.teardown(&conn).await;
        }
        info!("连接管理器已停止");
    }

    /// 取该账号的连接：有活跃注册则计数 +1 复用，否则建立新连接
    pub async fn acquire(
        &self,
        account_id: &str,
        credentials: &Credentials,
    ) -> Result<ConnectionHandle> {
        if self.shutdown.is_cancelled() {
            return Err(InboxSyncError::ShuttingDown);
        }
        self.states.register_account(account_id).await;

        let fingerprint = credential_fingerprint(credentials);
        let lock = self.establish_lock(account_id).await;
        let _guard = lock.lock().await;

        let key: ConnKey = (account_id.to_string(), fingerprint.clone());
        let reuse = {
            let registry = self.registry.lock().await;
            match registry.get(&key) {
                Some(existing) if existing.session.is_alive() => {
                    let mut meta = existing.meta.lock();
                    meta.refcount += 1;
                    meta.last_active_ms = now_ms();
                    Some((existing.clone(), meta.refcount))
                }
                _ => None,
            }
        };
        if let Some((existing, refcount)) = reuse {
            debug!(
                "复用已注册连接: account={}, conn={}, refcount={}",
                account_id, existing.conn_id, refcount
            );
            return Ok(ConnectionHandle { inner: existing });
        }

        // 同账号的死连接和换凭据的旧连接一并摘除
        let stale: Vec<Arc<ManagedConnection>> = {
            let mut registry = self.registry.lock().await;
            let keys: Vec<ConnKey> = registry
                .keys()
                .filter(|k| k.0 == account_id)
                .cloned()
                .collect();
            keys.into_iter().filter_map(|k| registry.remove(&k)).collect()
        };
        for old in stale {
            warn!(
                "拆除失效/换凭据的旧连接: account={}, conn={}",
                account_id, old.conn_id
            );
            self.teardown(&old).await;
        }

        self.establish(account_id, credentials, fingerprint, true).await
    }

    /// 归还句柄；计数归零不立即拆连接，便于突发复用
    pub fn release(&self, handle: ConnectionHandle) {
        let mut meta = handle.inner.meta.lock();
        meta.refcount = meta.refcount.saturating_sub(1);
        meta.last_active_ms = now_ms();
        debug!(
            "连接句柄已归还: account={}, refcount={}",
            handle.inner.account_id, meta.refcount
        );
    }

    /// 注册表之外的隔离连接，调用方自管生命周期（用后 `ConnectionHandle::disconnect`）
    pub async fn force_new(
        &self,
        account_id: &str,
        credentials: &Credentials,
    ) -> Result<ConnectionHandle> {
        if self.shutdown.is_cancelled() {
            return Err(InboxSyncError::ShuttingDown);
        }
        self.states.register_account(account_id).await;
        let fingerprint = credential_fingerprint(credentials);
        self.establish(account_id, credentials, fingerprint, false).await
    }

    /// 意外断开后的重连：退避重试，耗尽后摘除注册并置失败状态
    pub async fn reconnect(&self, handle: &ConnectionHandle) -> Result<()> {
        let account_id = handle.inner.account_id.clone();
        self.states
            .set_status(&account_id, AccountStatus::Reconnecting)
            .await;

        let mut attempt: u32 = 0;
        let mut last_error = String::new();
        loop {
            if self.shutdown.is_cancelled() {
                return Err(InboxSyncError::ShuttingDown);
            }
            attempt += 1;
            self.states.increment_reconnects(&account_id).await;
            match handle.inner.session.reconnect().await {
                Ok(()) => {
                    handle.inner.touch();
                    self.states
                        .set_status(&account_id, AccountStatus::Connected)
                        .await;
                    info!("重连成功: account={}, attempts={}", account_id, attempt);
                    return Ok(());
                }
                Err(TransportError::Unauthorized) => {
                    // 令牌已失效：连接不可救，留文件等人工排查
                    self.states
                        .set_status(&account_id, AccountStatus::AuthRequired)
                        .await;
                    self.unregister(handle).await;
                    return Err(InboxSyncError::AuthRequired(account_id));
                }
                Err(e) => last_error = e.to_string(),
            }
            if attempt >= self.config.max_attempts {
                self.states
                    .set_status(&account_id, AccountStatus::Failed)
                    .await;
                self.states
                    .set_notes(&account_id, format!("重连失败: {}", last_error))
                    .await;
                self.unregister(handle).await;
                return Err(InboxSyncError::ConnectFailed {
                    account: account_id,
                    attempts: attempt,
                    last: last_error,
                });
            }
            let delay = self.backoff_delay(attempt - 1);
            debug!(
                "重连失败，{} ms 后再试: account={}, attempt={}/{}, err={}",
                delay.as_millis(),
                account_id,
                attempt,
                self.config.max_attempts,
                last_error
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// 扫描一轮空闲连接；返回拆除条数
    pub async fn evict_idle(&self, threshold: Duration) -> usize {
        let cutoff = now_ms() - threshold.as_millis() as i64;
        let victims: Vec<Arc<ManagedConnection>> = {
            let mut registry = self.registry.lock().await;
            let keys: Vec<ConnKey> = registry
                .iter()
                .filter(|(_, conn)| {
                    let meta = conn.meta.lock();
                    meta.refcount == 0 && meta.last_active_ms <= cutoff
                })
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter().filter_map(|k| registry.remove(&k)).collect()
        };
        let count = victims.len();
        for conn in victims {
            info!(
                "回收空闲连接: account={}, conn={}",
                conn.account_id, conn.conn_id
            );
            self.teardown(&conn).await;
        }
        count
    }

    /// 主动断开某账号的全部注册连接（无视计数）
    pub async fn disconnect_account(&self, account_id: &str) {
        let victims: Vec<Arc<ManagedConnection>> = {
            let mut registry = self.registry.lock().await;
            let keys: Vec<ConnKey> = registry
                .keys()
                .filter(|k| k.0 == account_id)
                .cloned()
                .collect();
            keys.into_iter().filter_map(|k| registry.remove(&k)).collect()
        };
        for conn in victims {
            self.teardown(&conn).await;
        }
    }

    /// 某账号当前的注册计数；无注册返回 None
    pub async fn refcount(&self, account_id: &str) -> Option<u32> {
        let registry = self.registry.lock().await;
        registry
            .iter()
            .find(|(k, _)| k.0 == account_id)
            .map(|(_, conn)| conn.refcount())
    }

    /// 注册表内的账号列表
    pub async fn registered_accounts(&self) -> Vec<String> {
        let registry = self.registry.lock().await;
        let mut ids: Vec<String> = registry.keys().map(|k| k.0.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// 注册表规模（诊断）
    pub async fn live_connections(&self) -> usize {
        self.registry.lock().await.len()
    }

    async fn establish(
        &self,
        account_id: &str,
        credentials: &Credentials,
        fingerprint: String,
        register: bool,
    ) -> Result<ConnectionHandle> {
        self.states
            .set_status(account_id, AccountStatus::Connecting)
            .await;

        // 读会话令牌。损坏的令牌文件当场丢弃，这是唯一丢文件的错误类；
        // 单纯缺失或失效的令牌一律保留，等重新登录流程补发。
        let token = match self.sessions.load(account_id).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                self.states
                    .set_status(account_id, AccountStatus::AuthRequired)
                    .await;
                return Err(InboxSyncError::AuthRequired(account_id.to_string()));
            }
            Err(InboxSyncError::StorageCorruption(detail)) => {
                warn!("会话令牌损坏，丢弃文件: account={}, {}", account_id, detail);
                self.sessions.delete(account_id).await?;
                self.states
                    .set_status(account_id, AccountStatus::AuthRequired)
                    .await;
                return Err(InboxSyncError::AuthRequired(account_id.to_string()));
            }
            Err(e) => return Err(e),
        };

        // 活跃账号名额；满员时排队而不是悄悄丢弃
        let permit = self
            .pool
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| InboxSyncError::ShuttingDown)?;

        // 拨号：指数退避 + 抖动；Unauthorized 不重试
        let mut attempt: u32 = 0;
        let mut last_error = String::new();
        let session: Box<dyn TransportSession> = loop {
            if self.shutdown.is_cancelled() {
                return Err(InboxSyncError::ShuttingDown);
            }
            attempt += 1;
            let dial = self.transport.connect(account_id, credentials, Some(&token));
            match tokio::time::timeout(self.config.connect_timeout, dial).await {
                Ok(Ok(session)) => {
                    if !session.is_authorized() {
                        let _ = session.disconnect().await;
                        self.states
                            .set_status(account_id, AccountStatus::AuthRequired)
                            .await;
                        return Err(InboxSyncError::AuthRequired(account_id.to_string()));
                    }
                    break session;
                }
                Ok(Err(TransportError::Unauthorized)) => {
                    self.states
                        .set_status(account_id, AccountStatus::AuthRequired)
                        .await;
                    return Err(InboxSyncError::AuthRequired(account_id.to_string()));
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("拨号超时（>{:?}）", self.config.connect_timeout);
                }
            }
            if attempt >= self.config.max_attempts {
                self.states
                    .set_status(account_id, AccountStatus::Failed)
                    .await;
                self.states.set_notes(account_id, last_error.clone()).await;
                return Err(InboxSyncError::ConnectFailed {
                    account: account_id.to_string(),
                    attempts: attempt,
                    last: last_error,
                });
            }
            let delay = self.backoff_delay(attempt - 1);
            debug!(
                "拨号失败，{} ms 后重试: account={}, attempt={}/{}, err={}",
                delay.as_millis(),
                account_id,
                attempt,
                self.config.max_attempts,
                last_error
            );
            tokio::time::sleep(delay).await;
        };

        // 平台可能在连接过程中轮换令牌，成功即落一次盘
        self.sessions
            .save(account_id, &session.export_session())
            .await?;

        let conn = Arc::new(ManagedConnection {
            conn_id: Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            fingerprint,
            session: Arc::from(session),
            meta: parking_lot::Mutex::new(ConnMeta {
                refcount: 1,
                last_active_ms: now_ms(),
            }),
            _permit: permit,
        });

        if register {
            let key: ConnKey = (account_id.to_string(), conn.fingerprint.clone());
            self.registry.lock().await.insert(key, conn.clone());
        }
        self.states
            .set_status(account_id, AccountStatus::Connected)
            .await;
        info!(
            "账号连接建立完成: account={}, conn={}, attempts={}",
            account_id, conn.conn_id, attempt
        );
        Ok(ConnectionHandle { inner: conn })
    }

    /// 拆除一条连接：令牌落盘、断开、状态置未连接
    async fn teardown(&self, conn: &Arc<ManagedConnection>) {
        if conn.session.is_alive() {
            if let Err(e) = self
                .sessions
                .save(&conn.account_id, &conn.session.export_session())
                .await
            {
                warn!(
                    "拆除前保存令牌失败: account={}, err={}",
                    conn.account_id, e
                );
            }
        }
        if let Err(e) = conn.session.disconnect().await {
            debug!("断开连接出错（忽略）: account={}, err={}", conn.account_id, e);
        }
        self.states
            .set_status(&conn.account_id, AccountStatus::Disconnected)
            .await;
    }

    /// 摘除注册但不动账号状态（状态已由调用方设好）
    async fn unregister(&self, handle: &ConnectionHandle) {
        let key: ConnKey = (
            handle.inner.account_id.clone(),
            handle.inner.fingerprint.clone(),
        );
        self.registry.lock().await.remove(&key);
        let _ = handle.inner.session.disconnect().await;
    }

    async fn establish_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.establish_locks.lock().await;
        locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// 第 n 次失败后的退避时长（指数 + 20% 以内抖动）
    fn backoff_delay(&self, failures: u32) -> Duration {
        let base = self.config.backoff_initial.as_millis() as f64
            * self.config.backoff_factor.powi(failures as i32);
        let capped = base.min(self.config.backoff_max.as_millis() as f64);
        let jitter = rand::thread_rng().gen_range(0.0..=0.2);
        Duration::from_millis((capped * (1.0 + jitter)) as u64)
    }
}
