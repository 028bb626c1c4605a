//! 推送更新处理器
//!
//! 连接上的每条推送都走这里落库。单条推送的全部写入
//! （消息镜像 + 会话指针 + 事件日志 + 活动计数）在一个事务内完成，
//! 崩溃后不会留下半个事件；edge 广播只在提交后发出。
//!
//! 处理是幂等的：重复推送靠 (peer_id, message_id) 唯一键吸收，
//! 未读数与事件日志都不会重复记账。

use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use crate::collaborators::{CampaignMetrics, ContactClassification};
use crate::connection_state::AccountStateManager;
use crate::error::{InboxSyncError, Result};
use crate::events::{event_builders, EventManager};
use crate::storage::dao::DaoFactory;
use crate::storage::entities::{
    now_ms, ConversationRow, EventKind, EventRow, MessageRow, Provenance, DELETED_PLACEHOLDER,
};
use crate::storage::MirrorStore;
use crate::transport::{Direction, PushUpdate, RemoteMessage};

/// 会话摘要最大长度（按字符计，不按字节）
pub const SUMMARY_MAX_CHARS: usize = 100;

/// 摘要截断：中文等多字节文本按字符数截，不会切断 UTF-8
pub fn truncate_summary(text: &str) -> String {
    text.chars().take(SUMMARY_MAX_CHARS).collect()
}

/// 处理器配置
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// 「等待回复」的联系人状态标签
    pub awaiting_status: String,
    /// 首次回复后联系人翻到的状态标签
    pub replied_status: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            awaiting_status: "blue".to_string(),
            replied_status: "yellow".to_string(),
        }
    }
}

struct NewMessageOutcome {
    created: bool,
    inserted: bool,
    unread_count: u32,
    first_reply: bool,
    campaign_id: Option<u64>,
}

struct ReceiptOutcome {
    first_read_campaign: Option<u64>,
}

/// 推送更新处理器
pub struct EventProcessor {
    store: MirrorStore,
    events: Arc<EventManager>,
    states: AccountStateManager,
    classification: Arc<dyn ContactClassification>,
    metrics: Arc<dyn CampaignMetrics>,
    config: ProcessorConfig,
}

impl EventProcessor {
    pub fn new(
        store: MirrorStore,
        events: Arc<EventManager>,
        states: AccountStateManager,
        classification: Arc<dyn ContactClassification>,
        metrics: Arc<dyn CampaignMetrics>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            store,
            events,
            states,
            classification,
            metrics,
            config,
        }
    }

    /// 处理一条推送更新
    pub async fn apply(&self, account_id: &str, update: PushUpdate) -> Result<()> {
        self.states.increment_updates(account_id).await;
        match update {
            PushUpdate::NewMessage(msg) => self.apply_new_message(account_id, msg).await,
            PushUpdate::ReadReceipt { peer_id, max_id } => {
                self.apply_read_receipt(account_id, peer_id, max_id).await
            }
            PushUpdate::MessageEdited {
                peer_id,
                message_id,
                new_text,
                edited_at,
            } => {
                self.apply_edit(account_id, peer_id, message_id, new_text, edited_at)
                    .await
            }
            PushUpdate::MessageDeleted {
                peer_id,
                message_ids,
            } => self.apply_deletion(account_id, peer_id, message_ids).await,
        }
    }

    async fn apply_new_message(&self, account_id: &str, msg: RemoteMessage) -> Result<()> {
        if !msg.is_private {
            debug!(
                "忽略非私聊消息: account={}, peer={}, msg={}",
                account_id, msg.peer_id, msg.message_id
            );
            return Ok(());
        }

        let peer_id = msg.peer_id;
        let message_id = msg.message_id;
        let text = msg.text.clone();
        let direction = msg.direction;
        let incoming = direction == Direction::Incoming;

        // 新会话才去外部查分类，已知会话不再反查（不覆盖已有标签）
        let known = self
            .store
            .with_conn(account_id, move |conn| {
                Ok(DaoFactory::conversation_dao(conn).get_by_peer(peer_id)?.is_some())
            })
            .await?;
        let profile = if known {
            None
        } else {
            self.classification.classification(account_id, peer_id).await
        };

        let summary = truncate_summary(&text);
        let awaiting = self.config.awaiting_status.clone();
        let replied = self.config.replied_status.clone();

        let outcome = self
            .store
            .with_tx(account_id, move |conn| {
                let convs = DaoFactory::conversation_dao(conn);
                let msgs = DaoFactory::message_dao(conn);
                let events = DaoFactory::event_dao(conn);
                let campaigns = DaoFactory::campaign_dao(conn);

                let mut created = false;
                if convs.get_by_peer(peer_id)?.is_none() {
                    convs.insert(&ConversationRow::new(peer_id, &peer_id.to_string(), None))?;
                    created = true;
                    if let Some(p) = &profile {
                        convs.set_classification(peer_id, Some(&p.contact_type), Some(&p.status))?;
                        convs.set_campaign(peer_id, p.campaign_id)?;
                    }
                    events.append(&EventRow::new(peer_id, EventKind::ConversationCreated))?;
                }

                let inserted = msgs.insert_mirror(&MessageRow::from_remote(&msg, Provenance::Push))?;
                convs.apply_new_message(
                    peer_id,
                    message_id,
                    msg.date,
                    &summary,
                    direction,
                    incoming && inserted,
                )?;
                let conv = convs.get_by_peer(peer_id)?.ok_or_else(|| {
                    InboxSyncError::Database(format!("会话行丢失: peer={}", peer_id))
                })?;

                if inserted {
                    let kind = if incoming {
                        EventKind::MessageReceived
                    } else {
                        EventKind::MessageSent
                    };
                    events.append(
                        &EventRow::new(peer_id, kind)
                            .with_message(message_id)
                            .with_campaign(conv.campaign_id),
                    )?;
                }

                // 首次回复：被分类过的对端，在等待状态下的第一条来信
                let mut first_reply = false;
                if incoming
                    && inserted
                    && conv.contact_type.is_some()
                    && conv.contact_status.as_deref() == Some(awaiting.as_str())
                    && !events.has_first_reply(peer_id)?
                {
                    events.append(
                        &EventRow::new(peer_id, EventKind::FirstReply)
                            .with_message(message_id)
                            .with_campaign(conv.campaign_id),
                    )?;
                    convs.set_status(peer_id, &replied)?;
                    if let Some(campaign_id) = conv.campaign_id {
                        campaigns.increment_replies(campaign_id)?;
                    }
                    first_reply = true;
                }

                Ok(NewMessageOutcome {
                    created,
                    inserted,
                    unread_count: conv.unread_count,
                    first_reply,
                    campaign_id: conv.campaign_id,
                })
            })
            .await?;

        if !outcome.inserted {
            debug!(
                "重复推送已吸收: account={}, peer={}, msg={}",
                account_id, peer_id, message_id
            );
            return Ok(());
        }

        self.states.increment_mirrored(account_id, 1).await;
        if outcome.created {
            self.events
                .emit(event_builders::conversation_created(account_id, peer_id))
                .await;
        }
        if incoming {
            self.events
                .emit(event_builders::message_received(
                    account_id, peer_id, message_id, &text,
                ))
                .await;
            self.events
                .emit(event_builders::unread_count_changed(
                    account_id,
                    peer_id,
                    outcome.unread_count,
                ))
                .await;
        } else {
            self.events
                .emit(event_builders::message_sent(account_id, peer_id, message_id))
                .await;
        }
        if outcome.first_reply {
            info!("🎉 对端首次回复: account={}, peer={}", account_id, peer_id);
            self.classification
                .set_status(account_id, peer_id, &self.config.replied_status)
                .await;
            if let Some(campaign_id) = outcome.campaign_id {
                self.metrics.increment_replied(campaign_id).await;
            }
            self.events
                .emit(event_builders::first_reply(
                    account_id,
                    peer_id,
                    message_id,
                    outcome.campaign_id,
                ))
                .await;
        }
        Ok(())
    }

    async fn apply_read_receipt(&self, account_id: &str, peer_id: u64, max_id: u64) -> Result<()> {
        let outcome = self
            .store
            .with_tx(account_id, move |conn| {
                let convs = DaoFactory::conversation_dao(conn);
                let msgs = DaoFactory::message_dao(conn);
                let events = DaoFactory::event_dao(conn);
                let campaigns = DaoFactory::campaign_dao(conn);

                let conv = match convs.get_by_peer(peer_id)? {
                    Some(conv) => conv,
                    None => return Ok(None),
                };

                let flipped = msgs.mark_read_up_to(peer_id, max_id)?;
                let read_before = convs.advance_peer_read(peer_id, max_id)?;
                events.append(
                    &EventRow::new(peer_id, EventKind::ReadReceipt)
                        .with_payload(json!({ "max_id": max_id, "flipped": flipped }))
                        .with_campaign(conv.campaign_id),
                )?;

                // 读指针 0 → 正数 仅发生一次，计入活动已读数
                let mut first_read_campaign = None;
                if read_before == 0 && max_id > 0 {
                    if let Some(campaign_id) = conv.campaign_id {
                        campaigns.increment_reads(campaign_id)?;
                        first_read_campaign = Some(campaign_id);
                    }
                }
                Ok(Some(ReceiptOutcome { first_read_campaign }))
            })
            .await?;

        match outcome {
            None => {
                debug!(
                    "未知会话的回执已忽略: account={}, peer={}",
                    account_id, peer_id
                );
                Ok(())
            }
            Some(outcome) => {
                if let Some(campaign_id) = outcome.first_read_campaign {
                    self.metrics.increment_read(campaign_id).await;
                }
                self.events
                    .emit(event_builders::read_receipt(account_id, peer_id, max_id))
                    .await;
                Ok(())
            }
        }
    }

    async fn apply_edit(
        &self,
        account_id: &str,
        peer_id: u64,
        message_id: u64,
        new_text: String,
        edited_at: i64,
    ) -> Result<()> {
        let changed = self
            .store
            .with_tx(account_id, move |conn| {
                let convs = DaoFactory::conversation_dao(conn);
                let msgs = DaoFactory::message_dao(conn);
                let events = DaoFactory::event_dao(conn);

                let changed = msgs.apply_edit(peer_id, message_id, &new_text, Some(edited_at))?;
                if !changed {
                    return Ok(false);
                }
                // 编辑的恰好是最新一条时，会话摘要跟着换
                if let Some(conv) = convs.get_by_peer(peer_id)? {
                    if conv.last_msg_id == message_id {
                        if let Some(row) = msgs.get(peer_id, message_id)? {
                            convs.apply_new_message(
                                peer_id,
                                message_id,
                                row.date,
                                &truncate_summary(&row.text),
                                row.direction,
                                false,
                            )?;
                        }
                    }
                }
                events.append(&EventRow::new(peer_id, EventKind::MessageEdited).with_message(message_id))?;
                Ok(true)
            })
            .await?;

        if changed {
            self.events
                .emit(event_builders::message_edited(account_id, peer_id, message_id))
                .await;
        } else {
            debug!(
                "编辑目标不在镜像中或已删除: account={}, peer={}, msg={}",
                account_id, peer_id, message_id
            );
        }
        Ok(())
    }

    async fn apply_deletion(
        &self,
        account_id: &str,
        peer_id: u64,
        message_ids: Vec<u64>,
    ) -> Result<()> {
        let ids = message_ids.clone();
        let flipped = self
            .store
            .with_tx(account_id, move |conn| {
                let convs = DaoFactory::conversation_dao(conn);
                let msgs = DaoFactory::message_dao(conn);
                let events = DaoFactory::event_dao(conn);

                let flipped = msgs.mark_deleted(peer_id, &message_ids)?;
                if flipped == 0 {
                    return Ok(0);
                }
                // 最新一条被删：指针不回退，摘要换成占位文案
                if let Some(conv) = convs.get_by_peer(peer_id)? {
                    if message_ids.contains(&conv.last_msg_id) {
                        convs.apply_new_message(
                            peer_id,
                            conv.last_msg_id,
                            conv.last_msg_date.unwrap_or_else(now_ms),
                            DELETED_PLACEHOLDER,
                            conv.last_msg_direction.unwrap_or(Direction::Incoming),
                            false,
                        )?;
                    }
                }
                events.append(
                    &EventRow::new(peer_id, EventKind::MessageDeleted)
                        .with_payload(json!({ "message_ids": message_ids, "flipped": flipped })),
                )?;
                Ok(flipped)
            })
            .await?;

        if flipped > 0 {
            self.events
                .emit(event_builders::message_deleted(account_id, peer_id, ids))
                .await;
        } else {
            debug!(
                "删除目标不在镜像中: account={}, peer={}",
                account_id, peer_id
            );
        }
        Ok(())
    }
}
