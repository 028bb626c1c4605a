//! 数据实体定义 - 对应镜像库表结构
//!
//! 这里定义了镜像库各表对应的 Rust 结构体，用于：
//! - 类型安全的数据传输
//! - 统一的数据表示
//! - 序列化/反序列化支持
//!
//! 时间口径约定：
//! - 消息的 `date` / `edited_at` 为远端给出的 Unix 秒
//! - 本地记账字段（created_at / updated_at / sent_at / read_at / last_synced_at）为本地毫秒

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::transport::Direction;

/// 删除消息的占位文案（破坏性覆盖，原文不保留）
pub const DELETED_PLACEHOLDER: &str = "[消息已删除]";

/// 当前本地毫秒时间戳
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 会话实体 - 对应 conversation 表（每账号一库，故无 account 列）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRow {
    pub id: Option<i64>,
    pub peer_id: u64,
    pub peer_name: String,
    pub peer_handle: Option<String>,
    /// 本地已镜像的最新消息 id（本地指针 L）
    pub last_msg_id: u64,
    pub last_msg_date: Option<i64>,
    pub last_msg_text: String,
    pub last_msg_direction: Option<Direction>,
    /// 我方读到的最大消息 id
    pub our_last_read_id: u64,
    /// 对端读到的最大消息 id（回执与会话摘要共同推进，只增不减）
    pub peer_last_read_id: u64,
    pub unread_count: u32,
    pub last_synced_at: Option<i64>,
    /// 缺口 >= 2 时置位，由补拉扫描消费
    pub needs_backfill: bool,
    pub backfill_from_id: u64,
    pub contact_type: Option<String>,
    pub contact_status: Option<String>,
    pub campaign_id: Option<u64>,
    pub archived: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ConversationRow {
    /// 新会话的初始行（指针全零，未读从摘要回填）
    pub fn new(peer_id: u64, peer_name: &str, peer_handle: Option<&str>) -> Self {
        let now = now_ms();
        Self {
            id: None,
            peer_id,
            peer_name: peer_name.to_string(),
            peer_handle: peer_handle.map(|s| s.to_string()),
            last_msg_id: 0,
            last_msg_date: None,
            last_msg_text: String::new(),
            last_msg_direction: None,
            our_last_read_id: 0,
            peer_last_read_id: 0,
            unread_count: 0,
            last_synced_at: None,
            needs_backfill: false,
            backfill_from_id: 0,
            contact_type: None,
            contact_status: None,
            campaign_id: None,
            archived: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 消息实体 - 对应 message 表
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRow {
    pub id: Option<i64>,
    pub peer_id: u64,
    /// 平台消息 id，对话内严格递增
    pub message_id: u64,
    pub direction: Direction,
    pub sender_id: u64,
    pub text: String,
    /// Unix 秒（远端口径）
    pub date: i64,
    pub reply_to_id: Option<u64>,
    pub media_kind: Option<String>,
    pub edited_at: Option<i64>,
    pub is_deleted: bool,
    pub is_read: bool,
    pub read_at: Option<i64>,
    /// 这条镜像是经哪条路径进来的
    pub synced_via: Provenance,
    pub created_at: i64,
}

impl MessageRow {
    /// 由远端消息构造镜像行
    pub fn from_remote(remote: &crate::transport::RemoteMessage, via: Provenance) -> Self {
        Self {
            id: None,
            peer_id: remote.peer_id,
            message_id: remote.message_id,
            direction: remote.direction,
            sender_id: remote.sender_id,
            text: remote.text.clone(),
            date: remote.date,
            reply_to_id: remote.reply_to_id,
            media_kind: remote.media_kind.clone(),
            edited_at: remote.edited_at,
            is_deleted: false,
            is_read: false,
            read_at: None,
            synced_via: via,
            created_at: now_ms(),
        }
    }
}

/// 事件日志实体 - 对应 event_log 表
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRow {
    pub id: Option<i64>,
    pub peer_id: u64,
    pub kind: EventKind,
    /// 事件附加数据，JSON 文本
    pub payload: String,
    pub message_id: Option<u64>,
    pub campaign_id: Option<u64>,
    pub notified: bool,
    pub created_at: i64,
}

impl EventRow {
    pub fn new(peer_id: u64, kind: EventKind) -> Self {
        Self {
            id: None,
            peer_id,
            kind,
            payload: "{}".to_string(),
            message_id: None,
            campaign_id: None,
            notified: false,
            created_at: now_ms(),
        }
    }

    pub fn with_message(mut self, message_id: u64) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn with_campaign(mut self, campaign_id: Option<u64>) -> Self {
        self.campaign_id = campaign_id;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload.to_string();
        self
    }
}

/// 营销活动计数实体 - 对应 campaign 表
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignStatsRow {
    pub campaign_id: u64,
    /// 触达人数（成功发出首条消息的对端数）
    pub reached: u32,
    /// 回复人数（首次回复触发，每对端至多一次）
    pub replies: u32,
    /// 已读人数（对端读指针从 0 变为正数触发，每对端至多一次）
    pub reads: u32,
    pub updated_at: i64,
}

impl CampaignStatsRow {
    /// 回复率（回复 ÷ 触达）；未触达任何人时为 0
    pub fn reply_rate(&self) -> f64 {
        if self.reached == 0 {
            0.0
        } else {
            self.replies as f64 / self.reached as f64
        }
    }

    /// 已读率（已读 ÷ 触达）
    pub fn read_rate(&self) -> f64 {
        if self.reached == 0 {
            0.0
        } else {
            self.reads as f64 / self.reached as f64
        }
    }
}

/// 外发历史实体 - 对应 outbound_history 表
///
/// campaign_id = 0 表示非活动外发（人工/零散发送），同样参与频控窗口统计。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundRecord {
    pub id: Option<i64>,
    pub peer_id: u64,
    pub campaign_id: u64,
    pub sent_at: i64,
}

/// 镜像来源 - message.synced_via 列
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    /// 实时推送
    Push,
    /// 缺口补拉
    Backfill,
    /// 会话列表同步时内联写入
    DialogSync,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Push => "push",
            Provenance::Backfill => "backfill",
            Provenance::DialogSync => "dialog",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "push" => Some(Provenance::Push),
            "backfill" => Some(Provenance::Backfill),
            "dialog" => Some(Provenance::DialogSync),
            _ => None,
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 事件类别 - event_log.kind 列
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// 收到对端消息
    MessageReceived,
    /// 我方（本端或他端）发出消息
    MessageSent,
    /// 对端首次回复（会话內至多一次）
    FirstReply,
    /// 对端已读回执推进
    ReadReceipt,
    /// 消息被编辑
    MessageEdited,
    /// 消息被删除
    MessageDeleted,
    /// 会话首次被观察到
    ConversationCreated,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MessageReceived => "message_received",
            EventKind::MessageSent => "message_sent",
            EventKind::FirstReply => "first_reply",
            EventKind::ReadReceipt => "read_receipt",
            EventKind::MessageEdited => "message_edited",
            EventKind::MessageDeleted => "message_deleted",
            EventKind::ConversationCreated => "conversation_created",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message_received" => Some(EventKind::MessageReceived),
            "message_sent" => Some(EventKind::MessageSent),
            "first_reply" => Some(EventKind::FirstReply),
            "read_receipt" => Some(EventKind::ReadReceipt),
            "message_edited" => Some(EventKind::MessageEdited),
            "message_deleted" => Some(EventKind::MessageDeleted),
            "conversation_created" => Some(EventKind::ConversationCreated),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---- rusqlite 映射：TEXT 列与枚举互转 ----

impl ToSql for Direction {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Direction {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Direction::parse(s).ok_or(FromSqlError::InvalidType)
    }
}

impl ToSql for Provenance {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Provenance {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Provenance::parse(s).ok_or(FromSqlError::InvalidType)
    }
}

impl ToSql for EventKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for EventKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        EventKind::parse(s).ok_or(FromSqlError::InvalidType)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provenance_roundtrip() {
        for p in [Provenance::Push, Provenance::Backfill, Provenance::DialogSync] {
            assert_eq!(Provenance::parse(p.as_str()), Some(p));
        }
        assert_eq!(Provenance::parse("smoke"), None);
    }

    #[test]
    fn test_event_kind_roundtrip() {
        for k in [
            EventKind::MessageReceived,
            EventKind::MessageSent,
            EventKind::FirstReply,
            EventKind::ReadReceipt,
            EventKind::MessageEdited,
            EventKind::MessageDeleted,
            EventKind::ConversationCreated,
        ] {
            assert_eq!(EventKind::parse(k.as_str()), Some(k));
        }
    }

    #[test]
    fn test_event_row_builders() {
        let row = EventRow::new(42, EventKind::FirstReply)
            .with_message(7)
            .with_campaign(Some(3))
            .with_payload(serde_json::json!({"text": "你好"}));
        assert_eq!(row.peer_id, 42);
        assert_eq!(row.message_id, Some(7));
        assert_eq!(row.campaign_id, Some(3));
        assert!(row.payload.contains("你好"));
        assert!(!row.notified);
    }
}
