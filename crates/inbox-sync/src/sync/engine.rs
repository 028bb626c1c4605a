//! 对账引擎：会话同步、补拉收敛、全量审计
//!
//! 远端调用预算是设计底线：
//! - 会话同步整轮只打一次 `fetch_dialogs`，其余全靠缺口算术
//! - 首次见到的会话只收摘要内联的那条，不回拉历史
//! - 缺口 >= 2 不内联拉取，置标记交给补拉扫描分页收敛
//! - 补拉每会话一页，页间有步调间隔，永远不抱着远端狂拉

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::connection::ConnectionHandle;
use crate::connection_state::AccountStateManager;
use crate::error::{InboxSyncError, Result};
use crate::events::{event_builders, EventManager};
use crate::processor::truncate_summary;
use crate::storage::dao::DaoFactory;
use crate::storage::entities::{now_ms, EventKind, EventRow, MessageRow, Provenance};
use crate::storage::kv::keys;
use crate::storage::MirrorStore;
use crate::sync::{SyncConfig, SyncStats};
use crate::transport::DialogSummary;

/// 单个对话处理后续动作的去向
enum GapAction {
    /// 缺口 0：本地已平齐
    Skipped,
    /// 缺口 1：最新一条已内联写入
    Inline,
    /// 缺口 >= 2：置补拉标记
    Flagged,
    /// 远端指针回退：本地删尾，携带被软删的 id
    Truncated(Vec<u64>),
}

struct DialogOutcome {
    created: bool,
    action: GapAction,
    receipts_flipped: u32,
    first_read_campaign: Option<u64>,
}

/// 对账引擎
pub struct SyncEngine {
    store: MirrorStore,
    events: Arc<EventManager>,
    states: AccountStateManager,
    config: SyncConfig,
    /// 同账号的同步互斥（会话同步/补拉/全量不允许交叠）
    sync_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SyncEngine {
    pub fn new(
        store: MirrorStore,
        events: Arc<EventManager>,
        states: AccountStateManager,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            events,
            states,
            config,
            sync_locks: Mutex::new(HashMap::new()),
        }
    }

    /// 会话列表同步：一次远端调用 + 缺口算术
    pub async fn sync_dialogs(
        &self,
        account_id: &str,
        handle: &ConnectionHandle,
    ) -> Result<SyncStats> {
        let lock = self.sync_lock(account_id).await;
        let _guard = lock.lock().await;

        let mut stats = SyncStats::default();
        self.dialog_pass(account_id, handle, false, &mut stats).await?;
        self.store
            .kv()
            .set(account_id, keys::LAST_DIALOG_SYNC, &now_ms())
            .await?;
        info!("🔄 会话同步完成: account={}, {}", account_id, stats.summary());
        self.events
            .emit(event_builders::sync_completed(account_id, stats.clone()))
            .await;
        Ok(stats)
    }

    /// 消费补拉标记：每个待补会话拉一页
    pub async fn process_backfills(
        &self,
        account_id: &str,
        handle: &ConnectionHandle,
    ) -> Result<SyncStats> {
        let lock = self.sync_lock(account_id).await;
        let _guard = lock.lock().await;

        let mut stats = SyncStats::default();
        self.backfill_pass(account_id, handle, &mut stats).await?;
        if stats.messages_backfilled > 0 {
            info!("⬇️ 补拉完成: account={}, {}", account_id, stats.summary());
            self.events
                .emit(event_builders::sync_completed(account_id, stats.clone()))
                .await;
        }
        Ok(stats)
    }

    /// 全量同步：会话同步 + 强制补拉 + 读位补偿 + 计数审计
    pub async fn full_sync(
        &self,
        account_id: &str,
        handle: &ConnectionHandle,
    ) -> Result<SyncStats> {
        let lock = self.sync_lock(account_id).await;
        let _guard = lock.lock().await;

        let mut stats = SyncStats::default();
        self.dialog_pass(account_id, handle, true, &mut stats).await?;
        self.backfill_pass(account_id, handle, &mut stats).await?;
        self.audit_counts(account_id, handle, &mut stats).await?;
        self.store
            .kv()
            .set(account_id, keys::LAST_FULL_SYNC, &now_ms())
            .await?;
        info!("📇 全量同步完成: account={}, {}", account_id, stats.summary());
        self.events
            .emit(event_builders::sync_completed(account_id, stats.clone()))
            .await;
        Ok(stats)
    }

    /// 上次会话同步时间（UTC 毫秒），从未同步过为 None
    pub async fn last_dialog_sync(&self, account_id: &str) -> Result<Option<i64>> {
        self.store.kv().get(account_id, keys::LAST_DIALOG_SYNC).await
    }

    /// 上次全量同步时间（UTC 毫秒）
    pub async fn last_full_sync(&self, account_id: &str) -> Result<Option<i64>> {
        self.store.kv().get(account_id, keys::LAST_FULL_SYNC).await
    }

    async fn dialog_pass(
        &self,
        account_id: &str,
        handle: &ConnectionHandle,
        reconcile_reads: bool,
        stats: &mut SyncStats,
    ) -> Result<()> {
        let dialogs = handle
            .fetch_dialogs(self.config.dialog_fetch_limit)
            .await
            .map_err(InboxSyncError::fetch_failure)?;
        stats.dialogs_fetched += dialogs.len() as u32;

        let inline_before = stats.applied_inline;
        for dialog in dialogs {
            if !dialog.is_private {
                continue;
            }
            let peer_id = dialog.peer_id;
            let outcome = self
                .store
                .with_tx(account_id, move |conn| {
                    Self::apply_dialog(conn, dialog, reconcile_reads)
                })
                .await?;

            if outcome.created {
                stats.conversations_created += 1;
                self.events
                    .emit(event_builders::conversation_created(account_id, peer_id))
                    .await;
            }
            stats.receipts_reconciled += outcome.receipts_flipped;
            if let Some(campaign_id) = outcome.first_read_campaign {
                debug!(
                    "读位补偿触发活动已读计数: account={}, peer={}, campaign={}",
                    account_id, peer_id, campaign_id
                );
            }
            match outcome.action {
                GapAction::Skipped => stats.skipped += 1,
                GapAction::Inline => stats.applied_inline += 1,
                GapAction::Flagged => stats.gaps_flagged += 1,
                GapAction::Truncated(deleted) => {
                    stats.deletions_reconciled += 1;
                    self.events
                        .emit(event_builders::message_deleted(account_id, peer_id, deleted))
                        .await;
                }
            }
        }

        let inline_delta = stats.applied_inline - inline_before;
        if inline_delta > 0 {
            self.states
                .increment_mirrored(account_id, inline_delta as u64)
                .await;
        }
        Ok(())
    }

    /// 单个对话摘要的对账（一个事务）
    fn apply_dialog(
        conn: &rusqlite::Connection,
        dialog: DialogSummary,
        reconcile_reads: bool,
    ) -> Result<DialogOutcome> {
        let convs = DaoFactory::conversation_dao(conn);
        let msgs = DaoFactory::message_dao(conn);
        let events = DaoFactory::event_dao(conn);
        let campaigns = DaoFactory::campaign_dao(conn);

        let peer_id = dialog.peer_id;
        let existed = convs.get_by_peer(peer_id)?.is_some();
        let before = convs.upsert_profile(peer_id, &dialog.peer_name, dialog.peer_handle.as_deref())?;
        if !existed {
            events.append(&EventRow::new(peer_id, EventKind::ConversationCreated))?;
        }
        let local = before.last_msg_id;

        let action = match &dialog.last_message {
            None => {
                // 空会话：没有可对账的指针
                GapAction::Skipped
            }
            Some(last) if !existed => {
                // 首次见到的会话按缺口 1 处理：只镜像摘要自带的这一条，
                // 更早的历史不回拉，镜像从首次观察点开始向前走
                let inserted =
                    msgs.insert_mirror(&MessageRow::from_remote(last, Provenance::DialogSync))?;
                convs.apply_new_message(
                    peer_id,
                    last.message_id,
                    last.date,
                    &truncate_summary(&last.text),
                    last.direction,
                    false,
                )?;
                convs.set_unread_count(peer_id, dialog.unread_count)?;
                if inserted {
                    GapAction::Inline
                } else {
                    GapAction::Skipped
                }
            }
            Some(last) => {
                let remote = last.message_id;
                if remote == local {
                    // 平齐。摘要为空而远端有文案时补一下
                    if before.last_msg_text.is_empty() && !last.text.is_empty() {
                        convs.apply_new_message(
                            peer_id,
                            remote,
                            last.date,
                            &truncate_summary(&last.text),
                            last.direction,
                            false,
                        )?;
                    }
                    convs.set_unread_count(peer_id, dialog.unread_count)?;
                    GapAction::Skipped
                } else if remote == local + 1 {
                    // 缺口恰好 1：内联镜像这一条，不打额外远端调用
                    let inserted =
                        msgs.insert_mirror(&MessageRow::from_remote(last, Provenance::DialogSync))?;
                    convs.apply_new_message(
                        peer_id,
                        remote,
                        last.date,
                        &truncate_summary(&last.text),
                        last.direction,
                        false,
                    )?;
                    convs.set_unread_count(peer_id, dialog.unread_count)?;
                    if inserted {
                        GapAction::Inline
                    } else {
                        GapAction::Skipped
                    }
                } else if remote > local {
                    // 缺口 >= 2：指针先走到远端，中间段交给补拉
                    convs.apply_new_message(
                        peer_id,
                        remote,
                        last.date,
                        &truncate_summary(&last.text),
                        last.direction,
                        false,
                    )?;
                    convs.set_unread_count(peer_id, dialog.unread_count)?;
                    convs.set_needs_backfill(peer_id, local)?;
                    GapAction::Flagged
                } else {
                    // 远端指针回退：本地对 id > remote 的镜像做删尾
                    let deleted = msgs.mark_deleted_above(peer_id, remote)?;
                    convs.truncate_local_pointer(peer_id, remote)?;
                    convs.apply_new_message(
                        peer_id,
                        remote,
                        last.date,
                        &truncate_summary(&last.text),
                        last.direction,
                        false,
                    )?;
                    convs.set_unread_count(peer_id, dialog.unread_count)?;
                    if !deleted.is_empty() {
                        events.append(
                            &EventRow::new(peer_id, EventKind::MessageDeleted).with_payload(
                                json!({ "message_ids": deleted, "source": "dialog_sync" }),
                            ),
                        )?;
                    }
                    GapAction::Truncated(deleted)
                }
            }
        };

        // 读位补偿（全量同步）：摘要携带的对端读指针走单调推进
        let mut receipts_flipped = 0u32;
        let mut first_read_campaign = None;
        if reconcile_reads && dialog.peer_last_read_id > 0 {
            receipts_flipped = msgs.mark_read_up_to(peer_id, dialog.peer_last_read_id)? as u32;
            let read_before = convs.advance_peer_read(peer_id, dialog.peer_last_read_id)?;
            if read_before == 0 {
                if let Some(campaign_id) = before.campaign_id {
                    campaigns.increment_reads(campaign_id)?;
                    first_read_campaign = Some(campaign_id);
                }
            }
        }

        convs.touch_synced(peer_id)?;
        Ok(DialogOutcome {
            created: !existed,
            action,
            receipts_flipped,
            first_read_campaign,
        })
    }

    async fn backfill_pass(
        &self,
        account_id: &str,
        handle: &ConnectionHandle,
        stats: &mut SyncStats,
    ) -> Result<()> {
        let pending = self
            .store
            .with_conn(account_id, |conn| {
                DaoFactory::conversation_dao(conn).list_needs_backfill()
            })
            .await?;
        if pending.is_empty() {
            return Ok(());
        }
        debug!(
            "补拉扫描: account={}, 待补会话 {} 个",
            account_id,
            pending.len()
        );

        let mut backfilled = 0u32;
        for (index, conv) in pending.iter().enumerate() {
            match self
                .backfill_conversation(account_id, handle, conv.peer_id, conv.backfill_from_id)
                .await
            {
                Ok(count) => backfilled += count,
                Err(InboxSyncError::RateLimitedByPlatform { wait }) => {
                    // 平台限速：整轮立即收手，剩余会话留到下一轮
                    warn!(
                        "补拉被平台限速: account={}, peer={}, 等待 {}s",
                        account_id,
                        conv.peer_id,
                        wait.as_secs()
                    );
                    stats.errors.push(format!(
                        "peer {} 补拉被限速，{}s 后再试",
                        conv.peer_id,
                        wait.as_secs()
                    ));
                    break;
                }
                Err(InboxSyncError::TransientFetchFailure(detail)) => {
                    // 单会话失败不拖累整轮
                    warn!(
                        "补拉暂时失败: account={}, peer={}, {}",
                        account_id, conv.peer_id, detail
                    );
                    stats
                        .errors
                        .push(format!("peer {} 补拉失败: {}", conv.peer_id, detail));
                    continue;
                }
                Err(e) => return Err(e),
            }
            if !self.config.backfill_pacing.is_zero() && index + 1 < pending.len() {
                tokio::time::sleep(self.config.backfill_pacing).await;
            }
        }

        stats.messages_backfilled += backfilled;
        if backfilled > 0 {
            self.states
                .increment_mirrored(account_id, backfilled as u64)
                .await;
        }
        Ok(())
    }

    /// 补一个会话的一页；返回实际写入条数
    async fn backfill_conversation(
        &self,
        account_id: &str,
        handle: &ConnectionHandle,
        peer_id: u64,
        from_id: u64,
    ) -> Result<u32> {
        let page_size = self.config.backfill_page;
        let page = handle
            .fetch_messages(peer_id, from_id, page_size)
            .await
            .map_err(InboxSyncError::fetch_failure)?;

        self.store
            .with_tx(account_id, move |conn| {
                let convs = DaoFactory::conversation_dao(conn);
                let msgs = DaoFactory::message_dao(conn);

                if page.is_empty() {
                    // 没有可补的了：缺口其实已经收敛
                    convs.clear_needs_backfill(peer_id)?;
                    convs.touch_synced(peer_id)?;
                    return Ok(0);
                }

                let mut inserted = 0u32;
                let mut highest = from_id;
                for remote in &page {
                    if msgs.insert_mirror(&MessageRow::from_remote(remote, Provenance::Backfill))? {
                        inserted += 1;
                    }
                    highest = highest.max(remote.message_id);
                }
                if let Some(last) = page.last() {
                    convs.apply_new_message(
                        peer_id,
                        last.message_id,
                        last.date,
                        &truncate_summary(&last.text),
                        last.direction,
                        false,
                    )?;
                }

                // 先清后置：clear 把 from 归零，整页填满时用新高点重新挂标记
                convs.clear_needs_backfill(peer_id)?;
                if page.len() as u32 >= page_size {
                    convs.set_needs_backfill(peer_id, highest)?;
                }
                convs.touch_synced(peer_id)?;
                Ok(inserted)
            })
            .await
    }

    /// 计数审计：远端口径 vs 本地未删镜像，不一致只记不修
    async fn audit_counts(
        &self,
        account_id: &str,
        handle: &ConnectionHandle,
        stats: &mut SyncStats,
    ) -> Result<()> {
        let conversations = self
            .store
            .with_conn(account_id, |conn| {
                DaoFactory::conversation_dao(conn).list_all()
            })
            .await?;

        for conv in conversations {
            let peer_id = conv.peer_id;
            let remote = match handle.fetch_message_count(peer_id).await {
                Ok(count) => count,
                Err(e) => {
                    debug!(
                        "计数审计取数失败（跳过）: account={}, peer={}, {}",
                        account_id, peer_id, e
                    );
                    continue;
                }
            };
            let local = self
                .store
                .with_conn(account_id, move |conn| {
                    DaoFactory::message_dao(conn).count_active(peer_id)
                })
                .await?;
            if local.max(0) as u64 != remote {
                warn!(
                    "📊 消息数不一致: account={}, peer={}, local={}, remote={}",
                    account_id, peer_id, local, remote
                );
                stats.count_mismatches += 1;
            }
        }
        Ok(())
    }

    async fn sync_lock(&self, account_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.sync_locks.lock().await;
        locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{MemoryClassification, NoopMetrics};
    use crate::connection::{ConnectionConfig, ConnectionManager};
    use crate::connection_state::AccountStateManager;
    use crate::processor::{EventProcessor, ProcessorConfig};
    use crate::session::SessionStore;
    use crate::storage::entities::DELETED_PLACEHOLDER;
    use crate::transport::{
        Credentials, Direction, MockTransport, PushUpdate, RemoteMessage, Transport,
    };
    use std::time::Duration;
    use tempfile::TempDir;

    const ACCT: &str = "acct1";

    struct Rig {
        _dir: TempDir,
        store: MirrorStore,
        engine: SyncEngine,
        transport: Arc<MockTransport>,
        handle: ConnectionHandle,
        states: AccountStateManager,
    }

    fn dialog(peer_id: u64, last: Option<RemoteMessage>, unread: u32) -> DialogSummary {
        DialogSummary {
            peer_id,
            peer_name: format!("peer-{}", peer_id),
            peer_handle: None,
            is_private: true,
            last_message: last,
            peer_last_read_id: 0,
            unread_count: unread,
        }
    }

    async fn setup(config: SyncConfig) -> Rig {
        let dir = TempDir::new().unwrap();
        let store = MirrorStore::new(dir.path()).await.unwrap();
        store.init_account(ACCT).await.unwrap();
        let sessions = SessionStore::new(dir.path()).await.unwrap();
        sessions.save(ACCT, &format!("1{}", "a".repeat(120))).await.unwrap();

        let events = Arc::new(EventManager::new(64));
        let states = AccountStateManager::new(events.clone());
        let transport = Arc::new(MockTransport::new());
        let connections = ConnectionManager::new(
            transport.clone() as Arc<dyn Transport>,
            sessions,
            states.clone(),
            ConnectionConfig::default(),
        );
        let handle = connections
            .acquire(
                ACCT,
                &Credentials {
                    api_id: 1,
                    api_secret: "s".to_string(),
                    proxy: None,
                },
            )
            .await
            .unwrap();

        let engine = SyncEngine::new(store.clone(), events, states.clone(), config);
        Rig {
            _dir: dir,
            store,
            engine,
            transport,
            handle,
            states,
        }
    }

    fn no_pacing() -> SyncConfig {
        SyncConfig {
            backfill_pacing: Duration::ZERO,
            ..Default::default()
        }
    }

    async fn conv_row(rig: &Rig, peer_id: u64) -> crate::storage::entities::ConversationRow {
        rig.store
            .with_conn(ACCT, move |conn| {
                DaoFactory::conversation_dao(conn).get_by_peer(peer_id)
            })
            .await
            .unwrap()
            .unwrap()
    }

    /// 本地搭一个指针停在 40 的会话（1..=40 全部镜像齐）
    async fn seed_local_upto_40(rig: &Rig, peer_id: u64) {
        rig.store
            .with_tx(ACCT, move |conn| {
                let convs = DaoFactory::conversation_dao(conn);
                let msgs = DaoFactory::message_dao(conn);
                convs.upsert_profile(peer_id, "seed", None)?;
                for id in 1..=40u64 {
                    let remote = RemoteMessage::incoming(peer_id, id, &format!("m{}", id), 1_000 + id as i64);
                    msgs.insert_mirror(&MessageRow::from_remote(&remote, Provenance::Push))?;
                }
                convs.apply_new_message(peer_id, 40, 1_040, "m40", Direction::Incoming, false)?;
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_gap_zero_skips_without_fetch() {
        let rig = setup(no_pacing()).await;
        seed_local_upto_40(&rig, 7).await;
        rig.transport.set_dialogs(vec![dialog(
            7,
            Some(RemoteMessage::incoming(7, 40, "m40", 1_040)),
            0,
        )]);

        let stats = rig.engine.sync_dialogs(ACCT, &rig.handle).await.unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.applied_inline, 0);
        assert_eq!(stats.gaps_flagged, 0);
        // 整轮只打了一次 fetch_dialogs，没碰 fetch_messages
        assert_eq!(rig.transport.fetch_dialog_calls(), 1);
        assert!(rig.transport.fetch_message_calls().is_empty());
        println!("✅ 缺口 0 跳过测试通过");
    }

    #[tokio::test]
    async fn test_gap_one_applies_inline() {
        let rig = setup(no_pacing()).await;
        seed_local_upto_40(&rig, 7).await;
        rig.transport.set_dialogs(vec![dialog(
            7,
            Some(RemoteMessage::incoming(7, 41, "新来的", 1_041)),
            1,
        )]);

        let stats = rig.engine.sync_dialogs(ACCT, &rig.handle).await.unwrap();
        assert_eq!(stats.applied_inline, 1);
        assert!(rig.transport.fetch_message_calls().is_empty());

        let conv = conv_row(&rig, 7).await;
        assert_eq!(conv.last_msg_id, 41);
        assert_eq!(conv.last_msg_text, "新来的");
        assert_eq!(conv.unread_count, 1);
        assert!(!conv.needs_backfill);

        let row = rig
            .store
            .with_conn(ACCT, |conn| DaoFactory::message_dao(conn).get(7, 41))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.synced_via, Provenance::DialogSync);
    }

    #[tokio::test]
    async fn test_gap_two_or_more_flags_backfill() {
        let rig = setup(no_pacing()).await;
        seed_local_upto_40(&rig, 7).await;
        rig.transport.set_dialogs(vec![dialog(
            7,
            Some(RemoteMessage::incoming(7, 55, "最新", 1_055)),
            15,
        )]);

        let stats = rig.engine.sync_dialogs(ACCT, &rig.handle).await.unwrap();
        assert_eq!(stats.gaps_flagged, 1);
        // 会话同步自己不拉消息
        assert!(rig.transport.fetch_message_calls().is_empty());

        let conv = conv_row(&rig, 7).await;
        assert!(conv.needs_backfill);
        assert_eq!(conv.backfill_from_id, 40);
        // 指针与摘要先走到远端
        assert_eq!(conv.last_msg_id, 55);
        assert_eq!(conv.last_msg_text, "最新");
        assert_eq!(conv.unread_count, 15);
        println!("✅ 缺口置标记测试通过");
    }

    #[tokio::test]
    async fn test_negative_gap_truncates_tail() {
        let rig = setup(no_pacing()).await;
        seed_local_upto_40(&rig, 7).await;
        // 远端指针回退到 30：31..=40 在远端已不存在
        rig.transport.set_dialogs(vec![dialog(
            7,
            Some(RemoteMessage::incoming(7, 30, "m30", 1_030)),
            0,
        )]);

        let stats = rig.engine.sync_dialogs(ACCT, &rig.handle).await.unwrap();
        assert_eq!(stats.deletions_reconciled, 1);

        let conv = conv_row(&rig, 7).await;
        assert_eq!(conv.last_msg_id, 30);
        assert_eq!(conv.last_msg_text, "m30");

        let (deleted, kept) = rig
            .store
            .with_conn(ACCT, |conn| {
                let msgs = DaoFactory::message_dao(conn);
                let d = msgs.get(7, 35)?.unwrap();
                let k = msgs.get(7, 30)?.unwrap();
                Ok((d, k))
            })
            .await
            .unwrap();
        assert!(deleted.is_deleted);
        assert_eq!(deleted.text, DELETED_PLACEHOLDER);
        assert!(!kept.is_deleted);
        println!("✅ 删尾对账测试通过");
    }

    #[tokio::test]
    async fn test_bootstrap_unknown_conversation() {
        let rig = setup(no_pacing()).await;
        // 本地一无所知，远端已聊到第 5 条。历史段就算远端有也不碰
        let history: Vec<RemoteMessage> = (1..=5u64)
            .map(|id| RemoteMessage::incoming(9, id, &format!("m{}", id), 2_000 + id as i64))
            .collect();
        rig.transport.set_peer_messages(9, history);
        rig.transport.set_dialogs(vec![dialog(
            9,
            Some(RemoteMessage::incoming(9, 5, "第五条", 2_005)),
            5,
        )]);

        let stats = rig.engine.sync_dialogs(ACCT, &rig.handle).await.unwrap();
        assert_eq!(stats.conversations_created, 1);
        assert_eq!(stats.applied_inline, 1);
        assert_eq!(stats.gaps_flagged, 0);

        // 新会话按缺口 1 处理：只有摘要那条进镜像，镜像从这里向前走
        let conv = conv_row(&rig, 9).await;
        assert_eq!(conv.peer_name, "peer-9");
        assert_eq!(conv.last_msg_id, 5);
        assert_eq!(conv.unread_count, 5);
        assert!(!conv.needs_backfill);

        rig.engine.process_backfills(ACCT, &rig.handle).await.unwrap();
        assert!(rig.transport.fetch_message_calls().is_empty());
        let count = rig
            .store
            .with_conn(ACCT, |conn| DaoFactory::message_dao(conn).count_active(9))
            .await
            .unwrap();
        assert_eq!(count, 1);
        println!("✅ 新会话引导测试通过");
    }

    #[tokio::test]
    async fn test_backfill_converges_across_sweeps() {
        let rig = setup(no_pacing()).await;
        seed_local_upto_40(&rig, 7).await;
        // 远端最新 290：缺口 250，页大小 100 ⇒ 三轮收敛
        let all: Vec<RemoteMessage> = (41..=290u64)
            .map(|id| RemoteMessage::incoming(7, id, &format!("m{}", id), 1_000 + id as i64))
            .collect();
        rig.transport.set_peer_messages(7, all);
        rig.transport.set_dialogs(vec![dialog(
            7,
            Some(RemoteMessage::incoming(7, 290, "m290", 1_290)),
            250,
        )]);
        rig.engine.sync_dialogs(ACCT, &rig.handle).await.unwrap();

        let mut total = 0u32;
        for _ in 0..3 {
            let stats = rig.engine.process_backfills(ACCT, &rig.handle).await.unwrap();
            total += stats.messages_backfilled;
        }
        assert_eq!(total, 250);
        // 三页各从上一页的高点继续
        assert_eq!(
            rig.transport.fetch_message_calls(),
            vec![(7, 40, 100), (7, 140, 100), (7, 240, 100)]
        );

        let conv = conv_row(&rig, 7).await;
        assert!(!conv.needs_backfill);
        assert_eq!(conv.last_msg_id, 290);
        let count = rig
            .store
            .with_conn(ACCT, |conn| DaoFactory::message_dao(conn).count_active(7))
            .await
            .unwrap();
        assert_eq!(count, 290);

        // 第四轮没有工作可做，也不再打远端
        let stats = rig.engine.process_backfills(ACCT, &rig.handle).await.unwrap();
        assert_eq!(stats.messages_backfilled, 0);
        assert_eq!(rig.transport.fetch_message_calls().len(), 3);
        println!("✅ 补拉收敛测试通过");
    }

    #[tokio::test]
    async fn test_same_message_single_row_across_provenances() {
        let rig = setup(no_pacing()).await;
        let events = Arc::new(EventManager::new(64));
        let states = AccountStateManager::new(events.clone());
        states.register_account(ACCT).await;
        let processor = EventProcessor::new(
            rig.store.clone(),
            events,
            states,
            Arc::new(MemoryClassification::new()),
            Arc::new(NoopMetrics),
            ProcessorConfig::default(),
        );
        seed_local_upto_40(&rig, 7).await;
        // 远端聊到 43；会话同步先发现缺口并置标记
        let tail: Vec<RemoteMessage> = (41..=43u64)
            .map(|id| RemoteMessage::incoming(7, id, &format!("m{}", id), 3_000 + id as i64))
            .collect();
        rig.transport.set_peer_messages(7, tail);
        rig.transport.set_dialogs(vec![dialog(
            7,
            Some(RemoteMessage::incoming(7, 43, "m43", 3_043)),
            3,
        )]);
        rig.engine.sync_dialogs(ACCT, &rig.handle).await.unwrap();

        // 43 接着从推送路径抵达，补拉随后把 41..=43 整段扫一遍
        processor
            .apply(
                ACCT,
                PushUpdate::NewMessage(RemoteMessage::incoming(7, 43, "m43", 3_043)),
            )
            .await
            .unwrap();
        rig.engine.process_backfills(ACCT, &rig.handle).await.unwrap();

        // 同一条消息走了两条路径，镜像里只有一行，保留首次写入的来源
        let (count, row) = rig
            .store
            .with_conn(ACCT, |conn| {
                let msgs = DaoFactory::message_dao(conn);
                Ok((msgs.count_active(7)?, msgs.get(7, 43)?.unwrap()))
            })
            .await
            .unwrap();
        assert_eq!(count, 43);
        assert_eq!(row.synced_via, Provenance::Push);

        // 缺口恰好 1 的下一条：内联写入后推送又重复抵达，同样只有一行
        rig.transport.set_dialogs(vec![dialog(
            7,
            Some(RemoteMessage::incoming(7, 44, "m44", 3_044)),
            4,
        )]);
        rig.engine.sync_dialogs(ACCT, &rig.handle).await.unwrap();
        processor
            .apply(
                ACCT,
                PushUpdate::NewMessage(RemoteMessage::incoming(7, 44, "m44", 3_044)),
            )
            .await
            .unwrap();
        let (count, row) = rig
            .store
            .with_conn(ACCT, |conn| {
                let msgs = DaoFactory::message_dao(conn);
                Ok((msgs.count_active(7)?, msgs.get(7, 44)?.unwrap()))
            })
            .await
            .unwrap();
        assert_eq!(count, 44);
        assert_eq!(row.synced_via, Provenance::DialogSync);
        println!("✅ 跨来源唯一行测试通过");
    }

    #[tokio::test]
    async fn test_full_sync_reconciles_reads_and_audits() {
        let rig = setup(no_pacing()).await;
        // 本地三条外发已镜像，回执在断线期间丢了
        rig.store
            .with_tx(ACCT, move |conn| {
                let convs = DaoFactory::conversation_dao(conn);
                let msgs = DaoFactory::message_dao(conn);
                convs.upsert_profile(7, "peer", None)?;
                for id in [1u64, 2, 3] {
                    let remote = RemoteMessage::outgoing(7, id, "hi", 4_000 + id as i64);
                    msgs.insert_mirror(&MessageRow::from_remote(&remote, Provenance::Push))?;
                }
                convs.apply_new_message(7, 3, 4_003, "hi", crate::transport::Direction::Outgoing, false)?;
                Ok(())
            })
            .await
            .unwrap();

        let mut summary = dialog(7, Some(RemoteMessage::outgoing(7, 3, "hi", 4_003)), 0);
        summary.peer_last_read_id = 3;
        rig.transport.set_dialogs(vec![summary]);
        rig.transport.set_message_count(7, 3);

        let stats = rig.engine.full_sync(ACCT, &rig.handle).await.unwrap();
        assert_eq!(stats.receipts_reconciled, 3);
        assert_eq!(stats.count_mismatches, 0);

        let conv = conv_row(&rig, 7).await;
        assert_eq!(conv.peer_last_read_id, 3);
        let row = rig
            .store
            .with_conn(ACCT, |conn| DaoFactory::message_dao(conn).get(7, 2))
            .await
            .unwrap()
            .unwrap();
        assert!(row.is_read);

        // 检查点落盘：全量有自己的检查点，不碰会话同步的
        assert!(rig.engine.last_full_sync(ACCT).await.unwrap().is_some());
        assert!(rig.engine.last_dialog_sync(ACCT).await.unwrap().is_none());
        println!("✅ 全量同步读位补偿测试通过");
    }

    #[tokio::test]
    async fn test_full_sync_flags_count_mismatch() {
        let rig = setup(no_pacing()).await;
        seed_local_upto_40(&rig, 7).await;
        rig.transport.set_dialogs(vec![dialog(
            7,
            Some(RemoteMessage::incoming(7, 40, "m40", 1_040)),
            0,
        )]);
        // 远端号称 60 条，本地只有 40：中段漏了，审计记一笔
        rig.transport.set_message_count(7, 60);

        let stats = rig.engine.full_sync(ACCT, &rig.handle).await.unwrap();
        assert_eq!(stats.count_mismatches, 1);
    }

    #[tokio::test]
    async fn test_empty_backfill_page_clears_flag() {
        let rig = setup(no_pacing()).await;
        seed_local_upto_40(&rig, 7).await;
        rig.transport.set_dialogs(vec![dialog(
            7,
            Some(RemoteMessage::incoming(7, 55, "x", 1_055)),
            0,
        )]);
        rig.engine.sync_dialogs(ACCT, &rig.handle).await.unwrap();

        // 远端在补拉前把缺口段删光了：空页视为缺口已收敛
        rig.transport.set_peer_messages(7, vec![]);
        let stats = rig.engine.process_backfills(ACCT, &rig.handle).await.unwrap();
        assert_eq!(stats.messages_backfilled, 0);
        let conv = conv_row(&rig, 7).await;
        assert!(!conv.needs_backfill);
    }

    #[tokio::test]
    async fn test_non_private_dialogs_ignored() {
        let rig = setup(no_pacing()).await;
        let mut group = dialog(77, Some(RemoteMessage::incoming(77, 9, "群聊", 5_009)), 3);
        group.is_private = false;
        rig.transport.set_dialogs(vec![group]);

        let stats = rig.engine.sync_dialogs(ACCT, &rig.handle).await.unwrap();
        assert_eq!(stats.dialogs_fetched, 1);
        assert_eq!(stats.conversations_created, 0);
        let conv = rig
            .store
            .with_conn(ACCT, |conn| DaoFactory::conversation_dao(conn).get_by_peer(77))
            .await
            .unwrap();
        assert!(conv.is_none());
    }
}
