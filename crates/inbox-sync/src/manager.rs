//! 收件箱管理器 - 对外的统一门面
//!
//! 持有连接管理、推送处理、对账引擎、外发守卫与事件系统，
//! 负责按账号编排事件泵和三个周期调度循环。
//!
//! 生命周期：`initialize` 逐层装配 → `start` 拉起后台任务 →
//! `connect`/`connect_all` 接入账号 → `stop` 有序收尾（令牌落盘）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collaborators::{AccountDirectory, CampaignMetrics, Collaborators};
use crate::connection::{ConnectionConfig, ConnectionHandle, ConnectionManager};
use crate::connection_state::{AccountStateManager, AccountStateSnapshot};
use crate::error::{InboxSyncError, Result};
use crate::events::{EventFilter, EventManager, FilteredEventReceiver, InboxEvent};
use crate::guard::{GuardConfig, GuardDecision, GuardStatus, OutboundGuard};
use crate::processor::{EventProcessor, ProcessorConfig};
use crate::session::SessionStore;
use crate::storage::entities::{ConversationRow, EventRow, MessageRow};
use crate::storage::{ListQuery, MessageQuery, MirrorStore};
use crate::sync::{SyncConfig, SyncEngine, SyncStats};
use crate::transport::{Transport, TransportError};

/// 一次发送的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// 已发出，携带平台分配的消息 id；镜像行由回显推送写入
    Sent { message_id: u64 },
    /// 幂等保护：该 (对端, 活动) 已发过
    DuplicateBlocked,
    /// 守卫限速：retry_at（UTC 毫秒）之后再试
    RateLimited { retry_at: i64 },
}

/// 引擎配置
#[derive(Debug, Clone)]
pub struct InboxConfig {
    /// 数据根目录（镜像库、会话令牌、KV 都在这下面）
    pub data_dir: PathBuf,
    /// 事件广播通道容量
    pub event_capacity: usize,
    /// connect_all 相邻账号之间的错峰间隔
    pub connect_stagger: Duration,
    /// 平台 FloodWait 之上追加的安全缓冲
    pub flood_wait_buffer: Duration,
    pub connection: ConnectionConfig,
    pub sync: SyncConfig,
    pub guard: GuardConfig,
    pub processor: ProcessorConfig,
}

impl InboxConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            event_capacity: 1024,
            connect_stagger: Duration::from_millis(500),
            flood_wait_buffer: Duration::from_secs(5),
            connection: ConnectionConfig::default(),
            sync: SyncConfig::default(),
            guard: GuardConfig::default(),
            processor: ProcessorConfig::default(),
        }
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_guard(mut self, guard: GuardConfig) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_processor(mut self, processor: ProcessorConfig) -> Self {
        self.processor = processor;
        self
    }
}

/// 一个账号的事件泵：独占消费推送流
struct AccountPump {
    handle: ConnectionHandle,
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

/// 收件箱管理器
pub struct InboxManager {
    config: InboxConfig,
    store: MirrorStore,
    events: Arc<EventManager>,
    states: AccountStateManager,
    connections: Arc<ConnectionManager>,
    processor: Arc<EventProcessor>,
    engine: Arc<SyncEngine>,
    guard: Arc<OutboundGuard>,
    directory: Arc<dyn AccountDirectory>,
    metrics: Arc<dyn CampaignMetrics>,
    pumps: Mutex<HashMap<String, AccountPump>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
    running: AtomicBool,
}

impl InboxManager {
    /// 逐层装配引擎
    pub async fn initialize(
        config: InboxConfig,
        transport: Arc<dyn Transport>,
        collaborators: Collaborators,
    ) -> Result<Arc<Self>> {
        if config.data_dir.as_os_str().is_empty() {
            return Err(InboxSyncError::Config("数据目录不能为空".to_string()));
        }
        info!("🚀 初始化收件箱引擎: data_dir={}", config.data_dir.display());

        // === 第1层：存储 ===
        let store = MirrorStore::new(&config.data_dir).await?;
        let sessions = SessionStore::new(&config.data_dir).await?;

        // === 第2层：事件 ===
        let events = Arc::new(EventManager::new(config.event_capacity));

        // === 第3层：状态 ===
        let states = AccountStateManager::with_kv(events.clone(), store.kv().clone());

        // === 第4层：连接 ===
        let connections = ConnectionManager::new(
            transport,
            sessions,
            states.clone(),
            config.connection.clone(),
        );

        // === 第5层：业务 ===
        let processor = Arc::new(EventProcessor::new(
            store.clone(),
            events.clone(),
            states.clone(),
            collaborators.classification.clone(),
            collaborators.metrics.clone(),
            config.processor.clone(),
        ));
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            events.clone(),
            states.clone(),
            config.sync.clone(),
        ));
        let guard = Arc::new(OutboundGuard::new(store.clone(), config.guard.clone()));

        info!("✅ 收件箱引擎初始化完成");
        Ok(Arc::new(Self {
            config,
            store,
            events,
            states,
            connections,
            processor,
            engine,
            guard,
            directory: collaborators.directory,
            metrics: collaborators.metrics,
            pumps: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
        }))
    }

    /// 启动后台任务（重复调用是空操作）
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("▶️ 收件箱引擎启动");
        self.connections.start().await;

        let mut tasks = self.tasks.lock().await;

        // 会话同步调度
        {
            let mgr = Arc::clone(self);
            let token = self.shutdown.clone();
            let interval = self.config.sync.dialog_sync_interval;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {
                            for account_id in mgr.pumped_accounts().await {
                                if let Err(e) = mgr.trigger_dialog_sync(&account_id).await {
                                    warn!("周期会话同步失败: account={}, {}", account_id, e);
                                }
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                }
            }));
        }

        // 补拉扫描调度
        {
            let mgr = Arc::clone(self);
            let token = self.shutdown.clone();
            let interval = self.config.sync.backfill_check_interval;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {
                            for account_id in mgr.pumped_accounts().await {
                                if let Err(e) = mgr.trigger_backfill_sweep(&account_id).await {
                                    warn!("周期补拉失败: account={}, {}", account_id, e);
                                }
                                tokio::time::sleep(Duration::from_secs(1)).await;
                            }
                        }
                    }
                }
            }));
        }

        // 全量同步调度
        {
            let mgr = Arc::clone(self);
            let token = self.shutdown.clone();
            let interval = self.config.sync.full_sync_interval;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {
                            for account_id in mgr.pumped_accounts().await {
                                if let Err(e) = mgr.trigger_full_sync(&account_id).await {
                                    warn!("周期全量同步失败: account={}, {}", account_id, e);
                                }
                                tokio::time::sleep(Duration::from_secs(2)).await;
                            }
                        }
                    }
                }
            }));
        }

        Ok(())
    }

    /// 有序停机：调度循环 → 事件泵 → 连接（令牌落盘）
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("⏹ 收件箱引擎停止中...");
        self.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        futures::future::join_all(tasks).await;

        let pumps: Vec<(String, AccountPump)> = self.pumps.lock().await.drain().collect();
        for (account_id, pump) in pumps {
            pump.cancel.cancel();
            let _ = pump.task.await;
            self.connections.release(pump.handle);
            debug!("事件泵已停止: {}", account_id);
        }

        self.connections.stop().await;
        info!("✅ 收件箱引擎已停止");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 接入一个账号：建连、起事件泵、先同步一轮会话
    pub async fn connect(self: &Arc<Self>, account_id: &str) -> Result<()> {
        let credentials = self
            .directory
            .credentials(account_id)
            .await
            .ok_or_else(|| {
                InboxSyncError::Config(format!("账号不在目录中: {}", account_id))
            })?;
        self.store.init_account(account_id).await?;
        self.states.register_account(account_id).await;

        let handle = self.connections.acquire(account_id, &credentials).await?;
        self.spawn_pump(account_id, handle).await;

        // 建立后立即对账一轮，离线期间的变化尽快补平
        if let Err(e) = self.trigger_dialog_sync(account_id).await {
            warn!("接入后的首次会话同步失败: account={}, {}", account_id, e);
        }
        Ok(())
    }

    /// 断开一个账号：停事件泵、拆连接
    pub async fn disconnect(&self, account_id: &str) -> Result<()> {
        let pump = self.pumps.lock().await.remove(account_id);
        if let Some(pump) = pump {
            pump.cancel.cancel();
            let _ = pump.task.await;
            self.connections.release(pump.handle);
        }
        self.connections.disconnect_account(account_id).await;
        info!("账号已断开: {}", account_id);
        Ok(())
    }

    /// 接入目录中的全部活跃账号，账号间错峰
    pub async fn connect_all(self: &Arc<Self>) -> HashMap<String, bool> {
        let accounts = self.directory.list_active().await;
        let total = accounts.len();
        let mut results = HashMap::new();
        for (index, account_id) in accounts.iter().enumerate() {
            let ok = match self.connect(account_id).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("账号接入失败: account={}, {}", account_id, e);
                    false
                }
            };
            results.insert(account_id.clone(), ok);
            if index + 1 < total && !self.config.connect_stagger.is_zero() {
                tokio::time::sleep(self.config.connect_stagger).await;
            }
        }
        let succeeded = results.values().filter(|ok| **ok).count();
        info!("📱 账号接入完成: {}/{} 成功", succeeded, total);
        results
    }

    /// 发送文本消息（守卫前置，镜像行由回显推送写入）
    pub async fn send_message(
        &self,
        account_id: &str,
        peer_id: u64,
        text: &str,
        campaign_id: Option<u64>,
    ) -> Result<SendOutcome> {
        let handle = self
            .pump_handle(account_id)
            .await
            .ok_or_else(|| InboxSyncError::NotConnected(account_id.to_string()))?;

        match self.guard.check(account_id, peer_id, campaign_id).await? {
            GuardDecision::Allowed => {}
            GuardDecision::DuplicateBlocked => return Ok(SendOutcome::DuplicateBlocked),
            GuardDecision::RateLimited { retry_at } => {
                return Ok(SendOutcome::RateLimited { retry_at })
            }
        }

        let receipt = match handle.send_message(peer_id, text).await {
            Ok(receipt) => receipt,
            Err(TransportError::FloodWait { wait_secs }) => {
                // 平台等待时间之上再加安全缓冲，宁可多等不可顶撞
                return Err(InboxSyncError::RateLimitedByPlatform {
                    wait: Duration::from_secs(wait_secs) + self.config.flood_wait_buffer,
                });
            }
            Err(TransportError::Unauthorized) => {
                return Err(InboxSyncError::AuthRequired(account_id.to_string()))
            }
            Err(e) => return Err(InboxSyncError::Transport(e.to_string())),
        };

        let first = self
            .guard
            .record_sent(account_id, peer_id, campaign_id)
            .await?;
        if first {
            if let Some(campaign) = campaign_id {
                self.metrics.increment_reached(campaign).await;
            }
        }
        self.states.increment_sent(account_id).await;
        debug!(
            "消息已发出: account={}, peer={}, msg={}",
            account_id, peer_id, receipt.message_id
        );
        Ok(SendOutcome::Sent {
            message_id: receipt.message_id,
        })
    }

    /// 按需触发会话同步；发现缺口立即补一轮，不等下一次扫描
    pub async fn trigger_dialog_sync(&self, account_id: &str) -> Result<SyncStats> {
        let handle = self.require_handle(account_id).await?;
        let mut stats = self.engine.sync_dialogs(account_id, &handle).await?;
        if stats.gaps_flagged > 0 {
            match self.engine.process_backfills(account_id, &handle).await {
                Ok(backfill) => {
                    stats.messages_backfilled += backfill.messages_backfilled;
                    stats.errors.extend(backfill.errors);
                }
                Err(e) => warn!("缺口即时补拉失败: account={}, {}", account_id, e),
            }
        }
        Ok(stats)
    }

    /// 按需触发全量同步
    pub async fn trigger_full_sync(&self, account_id: &str) -> Result<SyncStats> {
        let handle = self.require_handle(account_id).await?;
        self.engine.full_sync(account_id, &handle).await
    }

    /// 按需触发一轮补拉扫描
    pub async fn trigger_backfill_sweep(&self, account_id: &str) -> Result<SyncStats> {
        let handle = self.require_handle(account_id).await?;
        self.engine.process_backfills(account_id, &handle).await
    }

    // ---- 查询面 ----

    pub async fn list_conversations(
        &self,
        account_id: &str,
        query: ListQuery,
    ) -> Result<Vec<ConversationRow>> {
        self.store.list_conversations(account_id, query).await
    }

    pub async fn get_conversation(
        &self,
        account_id: &str,
        peer_id: u64,
    ) -> Result<Option<ConversationRow>> {
        self.store.get_conversation(account_id, peer_id).await
    }

    pub async fn list_messages(
        &self,
        account_id: &str,
        peer_id: u64,
        query: MessageQuery,
    ) -> Result<Vec<MessageRow>> {
        self.store.messages_page(account_id, peer_id, query).await
    }

    pub async fn total_unread(&self, account_id: &str) -> Result<i64> {
        self.store.total_unread(account_id).await
    }

    /// 未通知的事件日志（轮询消费面）
    pub async fn pending_events(&self, account_id: &str, limit: u32) -> Result<Vec<EventRow>> {
        self.store.pending_events(account_id, limit).await
    }

    pub async fn mark_events_notified(&self, account_id: &str, ids: Vec<i64>) -> Result<()> {
        self.store.mark_events_notified(account_id, ids).await
    }

    pub async fn connection_status(&self, account_id: &str) -> Option<AccountStateSnapshot> {
        self.states.get_state(account_id).await
    }

    pub async fn connection_status_all(&self) -> Vec<AccountStateSnapshot> {
        self.states.get_all().await
    }

    pub async fn guard_status(&self, account_id: &str) -> Result<GuardStatus> {
        self.guard.status(account_id).await
    }

    /// 订阅全部实时事件
    pub fn subscribe(&self) -> broadcast::Receiver<InboxEvent> {
        self.events.subscribe()
    }

    /// 按条件订阅实时事件
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        self.events.subscribe_filtered(filter)
    }

    // ---- 内部 ----

    /// 起一个账号的事件泵；同账号的旧泵先停掉
    async fn spawn_pump(self: &Arc<Self>, account_id: &str, handle: ConnectionHandle) {
        let cancel = self.shutdown.child_token();
        let mgr = Arc::clone(self);
        let acct = account_id.to_string();
        let pump_handle = handle.clone();
        let pump_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let mut stream = pump_handle.subscribe_updates();
            loop {
                tokio::select! {
                    _ = pump_cancel.cancelled() => break,
                    next = stream.next() => match next {
                        Ok(Some(update)) => {
                            if let Err(e) = mgr.processor.apply(&acct, update).await {
                                error!("推送处理失败: account={}, {}", acct, e);
                            }
                        }
                        Ok(None) => {
                            info!("推送流正常结束: account={}", acct);
                            break;
                        }
                        Err(e) => {
                            warn!("推送流中断: account={}, {}", acct, e);
                            match mgr.connections.reconnect(&pump_handle).await {
                                Ok(()) => continue,
                                Err(e) => {
                                    error!("重连失败，事件泵退出: account={}, {}", acct, e);
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        });

        let old = self.pumps.lock().await.insert(
            account_id.to_string(),
            AccountPump {
                handle,
                task,
                cancel,
            },
        );
        if let Some(old) = old {
            old.cancel.cancel();
            old.task.abort();
            self.connections.release(old.handle);
        }
    }

    async fn pumped_accounts(&self) -> Vec<String> {
        self.pumps.lock().await.keys().cloned().collect()
    }

    async fn pump_handle(&self, account_id: &str) -> Option<ConnectionHandle> {
        self.pumps
            .lock()
            .await
            .get(account_id)
            .map(|pump| pump.handle.clone())
    }

    async fn require_handle(&self, account_id: &str) -> Result<ConnectionHandle> {
        self.pump_handle(account_id)
            .await
            .ok_or_else(|| InboxSyncError::NotConnected(account_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::StaticDirectory;
    use crate::transport::{Credentials, DialogSummary, MockTransport, RemoteMessage};
    use tempfile::TempDir;

    fn valid_token() -> String {
        format!("1{}", "a".repeat(120))
    }

    fn test_credentials() -> Credentials {
        Credentials {
            api_id: 1,
            api_secret: "s".to_string(),
            proxy: None,
        }
    }

    async fn seed_token(dir: &TempDir, account_id: &str) {
        let sessions = SessionStore::new(dir.path()).await.unwrap();
        sessions.save(account_id, &valid_token()).await.unwrap();
    }

    fn fast_config(dir: &TempDir) -> InboxConfig {
        InboxConfig::new(dir.path())
            .with_guard(GuardConfig {
                min_spacing: Duration::ZERO,
                ..Default::default()
            })
            .with_sync(SyncConfig {
                backfill_pacing: Duration::ZERO,
                ..Default::default()
            })
    }

    #[tokio::test]
    async fn test_end_to_end_send_and_mirror() {
        let dir = TempDir::new().unwrap();
        seed_token(&dir, "acct1").await;

        let directory = Arc::new(StaticDirectory::new());
        directory.insert("acct1", test_credentials());
        let transport = Arc::new(MockTransport::new());
        transport.set_echo_outgoing(true);

        let manager = InboxManager::initialize(
            fast_config(&dir),
            transport.clone(),
            Collaborators::standalone(directory),
        )
        .await
        .unwrap();
        manager.start().await.unwrap();
        manager.connect("acct1").await.unwrap();

        // 发送：守卫放行 → 平台回执
        let outcome = manager
            .send_message("acct1", 7, "你好", Some(1))
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::Sent { message_id: 1001 });

        // 回显推送异步落镜像，轮询等它就位
        let mut mirrored = false;
        for _ in 0..50 {
            let rows = manager
                .list_messages("acct1", 7, MessageQuery::default())
                .await
                .unwrap();
            if rows.iter().any(|m| m.message_id == 1001) {
                mirrored = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(mirrored, "回显推送应把外发消息写进镜像");
        let conv = manager.get_conversation("acct1", 7).await.unwrap().unwrap();
        assert_eq!(conv.last_msg_id, 1001);
        assert_eq!(conv.unread_count, 0);

        // 同一 (对端, 活动) 再发：幂等保护
        let outcome = manager
            .send_message("acct1", 7, "重发", Some(1))
            .await
            .unwrap();
        assert_eq!(outcome, SendOutcome::DuplicateBlocked);

        // 平台限速：等待时间带上安全缓冲
        transport.set_send_flood_wait(Some(30));
        let err = manager
            .send_message("acct1", 8, "另一位", None)
            .await
            .err()
            .unwrap();
        match err {
            InboxSyncError::RateLimitedByPlatform { wait } => {
                assert_eq!(wait, Duration::from_secs(35));
            }
            other => panic!("期望平台限速错误，得到 {:?}", other),
        }

        manager.stop().await;
        assert_eq!(transport.live_sessions(), 0);
        assert!(!manager.is_running());
        // 令牌在拆连前落盘
        let sessions = SessionStore::new(dir.path()).await.unwrap();
        assert!(sessions.load("acct1").await.unwrap().is_some());
        println!("✅ 端到端发送与镜像测试通过");
    }

    #[tokio::test]
    async fn test_connect_synchronizes_dialogs() {
        let dir = TempDir::new().unwrap();
        seed_token(&dir, "acct1").await;

        let directory = Arc::new(StaticDirectory::new());
        directory.insert("acct1", test_credentials());
        let transport = Arc::new(MockTransport::new());
        // 远端已有一个 5 条消息的会话，本地一无所知
        let all: Vec<RemoteMessage> = (1..=5u64)
            .map(|id| RemoteMessage::incoming(9, id, &format!("m{}", id), 7_000 + id as i64))
            .collect();
        let last = all.last().cloned().unwrap();
        transport.set_peer_messages(9, all);
        transport.set_dialogs(vec![DialogSummary {
            peer_id: 9,
            peer_name: "老朋友".to_string(),
            peer_handle: None,
            is_private: true,
            last_message: Some(last),
            peer_last_read_id: 0,
            unread_count: 5,
        }]);

        let manager = InboxManager::initialize(
            fast_config(&dir),
            transport.clone(),
            Collaborators::standalone(directory),
        )
        .await
        .unwrap();
        manager.start().await.unwrap();
        // connect 内部先同步一轮；新会话只镜像摘要这一条，不回拉历史
        manager.connect("acct1").await.unwrap();

        let conv = manager.get_conversation("acct1", 9).await.unwrap().unwrap();
        assert_eq!(conv.peer_name, "老朋友");
        assert_eq!(conv.last_msg_id, 5);
        assert_eq!(conv.unread_count, 5);
        assert!(!conv.needs_backfill);
        let rows = manager
            .list_messages("acct1", 9, MessageQuery::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].message_id, 5);
        assert!(transport.fetch_message_calls().is_empty());
        assert_eq!(manager.total_unread("acct1").await.unwrap(), 5);

        manager.stop().await;
        println!("✅ 接入即同步测试通过");
    }

    #[tokio::test]
    async fn test_connect_unknown_account_rejected() {
        let dir = TempDir::new().unwrap();
        let directory = Arc::new(StaticDirectory::new());
        let transport = Arc::new(MockTransport::new());

        let manager = InboxManager::initialize(
            fast_config(&dir),
            transport,
            Collaborators::standalone(directory),
        )
        .await
        .unwrap();

        let err = manager.connect("ghost").await.err().unwrap();
        assert!(matches!(err, InboxSyncError::Config(_)));

        // 未接入的账号不能发送
        let err = manager
            .send_message("ghost", 1, "x", None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, InboxSyncError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let dir = TempDir::new().unwrap();
        let directory = Arc::new(StaticDirectory::new());
        let transport = Arc::new(MockTransport::new());

        let manager = InboxManager::initialize(
            fast_config(&dir),
            transport,
            Collaborators::standalone(directory),
        )
        .await
        .unwrap();

        manager.start().await.unwrap();
        manager.start().await.unwrap();
        assert!(manager.is_running());

        manager.stop().await;
        manager.stop().await;
        assert!(!manager.is_running());
    }

    #[tokio::test]
    async fn test_disconnect_stops_pump_and_connection() {
        let dir = TempDir::new().unwrap();
        seed_token(&dir, "acct1").await;
        let directory = Arc::new(StaticDirectory::new());
        directory.insert("acct1", test_credentials());
        let transport = Arc::new(MockTransport::new());

        let manager = InboxManager::initialize(
            fast_config(&dir),
            transport.clone(),
            Collaborators::standalone(directory),
        )
        .await
        .unwrap();
        manager.start().await.unwrap();
        manager.connect("acct1").await.unwrap();
        assert_eq!(transport.live_sessions(), 1);

        manager.disconnect("acct1").await.unwrap();
        assert_eq!(transport.live_sessions(), 0);
        // 断开后发送立即报未连接
        let err = manager
            .send_message("acct1", 1, "x", None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, InboxSyncError::NotConnected(_)));

        manager.stop().await;
    }
}
