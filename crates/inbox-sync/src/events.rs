//! 事件系统模块 - 镜像引擎对上层的事件出口
//!
//! 功能包括：
//! - 新消息 / 首次回复 / 已读回执 / 编辑 / 删除事件
//! - 账号连接状态变更事件
//! - 同步完成事件
//! - 事件广播和订阅机制
//!
//! 订阅是显式的：没有订阅者时事件直接丢弃，引擎不为通知阻塞。

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::connection_state::AccountStatus;
use crate::storage::entities::now_ms;
use crate::sync::SyncStats;

/// 镜像引擎事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InboxEvent {
    /// 收到对端消息（已镜像落库后发出）
    MessageReceived {
        account_id: String,
        peer_id: u64,
        message_id: u64,
        text: String,
        timestamp: i64,
    },
    /// 我方消息进入镜像（本端发送或他端同号发送）
    MessageSent {
        account_id: String,
        peer_id: u64,
        message_id: u64,
        timestamp: i64,
    },
    /// 对端首次回复（每会话至多一次）
    FirstReply {
        account_id: String,
        peer_id: u64,
        message_id: u64,
        campaign_id: Option<u64>,
        timestamp: i64,
    },
    /// 对端已读回执推进
    ReadReceiptReceived {
        account_id: String,
        peer_id: u64,
        max_id: u64,
        timestamp: i64,
    },
    /// 消息被编辑
    MessageEdited {
        account_id: String,
        peer_id: u64,
        message_id: u64,
        timestamp: i64,
    },
    /// 消息被删除（本地已替换为占位文案）
    MessageDeleted {
        account_id: String,
        peer_id: u64,
        message_ids: Vec<u64>,
        timestamp: i64,
    },
    /// 会话未读数变更
    UnreadCountChanged {
        account_id: String,
        peer_id: u64,
        unread_count: u32,
        timestamp: i64,
    },
    /// 会话首次被观察到（推送或同步路径新建）
    ConversationCreated {
        account_id: String,
        peer_id: u64,
        timestamp: i64,
    },
    /// 账号连接状态变更
    ConnectionStateChanged {
        account_id: String,
        old_status: AccountStatus,
        new_status: AccountStatus,
        timestamp: i64,
    },
    /// 一轮同步完成
    SyncCompleted {
        account_id: String,
        stats: SyncStats,
        timestamp: i64,
    },
}

impl InboxEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            InboxEvent::MessageReceived { .. } => "message_received",
            InboxEvent::MessageSent { .. } => "message_sent",
            InboxEvent::FirstReply { .. } => "first_reply",
            InboxEvent::ReadReceiptReceived { .. } => "read_receipt_received",
            InboxEvent::MessageEdited { .. } => "message_edited",
            InboxEvent::MessageDeleted { .. } => "message_deleted",
            InboxEvent::UnreadCountChanged { .. } => "unread_count_changed",
            InboxEvent::ConversationCreated { .. } => "conversation_created",
            InboxEvent::ConnectionStateChanged { .. } => "connection_state_changed",
            InboxEvent::SyncCompleted { .. } => "sync_completed",
        }
    }

    /// 事件所属账号
    pub fn account_id(&self) -> &str {
        match self {
            InboxEvent::MessageReceived { account_id, .. } => account_id,
            InboxEvent::MessageSent { account_id, .. } => account_id,
            InboxEvent::FirstReply { account_id, .. } => account_id,
            InboxEvent::ReadReceiptReceived { account_id, .. } => account_id,
            InboxEvent::MessageEdited { account_id, .. } => account_id,
            InboxEvent::MessageDeleted { account_id, .. } => account_id,
            InboxEvent::UnreadCountChanged { account_id, .. } => account_id,
            InboxEvent::ConversationCreated { account_id, .. } => account_id,
            InboxEvent::ConnectionStateChanged { account_id, .. } => account_id,
            InboxEvent::SyncCompleted { account_id, .. } => account_id,
        }
    }

    /// 事件关联的对端；账号级事件返回 None
    pub fn peer_id(&self) -> Option<u64> {
        match self {
            InboxEvent::MessageReceived { peer_id, .. } => Some(*peer_id),
            InboxEvent::MessageSent { peer_id, .. } => Some(*peer_id),
            InboxEvent::FirstReply { peer_id, .. } => Some(*peer_id),
            InboxEvent::ReadReceiptReceived { peer_id, .. } => Some(*peer_id),
            InboxEvent::MessageEdited { peer_id, .. } => Some(*peer_id),
            InboxEvent::MessageDeleted { peer_id, .. } => Some(*peer_id),
            InboxEvent::UnreadCountChanged { peer_id, .. } => Some(*peer_id),
            InboxEvent::ConversationCreated { peer_id, .. } => Some(*peer_id),
            InboxEvent::ConnectionStateChanged { .. } => None,
            InboxEvent::SyncCompleted { .. } => None,
        }
    }

    /// 事件时间戳（毫秒）
    pub fn timestamp(&self) -> i64 {
        match self {
            InboxEvent::MessageReceived { timestamp, .. } => *timestamp,
            InboxEvent::MessageSent { timestamp, .. } => *timestamp,
            InboxEvent::FirstReply { timestamp, .. } => *timestamp,
            InboxEvent::ReadReceiptReceived { timestamp, .. } => *timestamp,
            InboxEvent::MessageEdited { timestamp, .. } => *timestamp,
            InboxEvent::MessageDeleted { timestamp, .. } => *timestamp,
            InboxEvent::UnreadCountChanged { timestamp, .. } => *timestamp,
            InboxEvent::ConversationCreated { timestamp, .. } => *timestamp,
            InboxEvent::ConnectionStateChanged { timestamp, .. } => *timestamp,
            InboxEvent::SyncCompleted { timestamp, .. } => *timestamp,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFilter {
    /// 事件类型过滤器
    pub event_types: Option<Vec<String>>,
    /// 账号过滤器
    pub account_ids: Option<Vec<String>>,
    /// 对端过滤器
    pub peer_ids: Option<Vec<u64>>,
}

impl EventFilter {
    /// 创建新的事件过滤器
    pub fn new() -> Self {
        Self {
            event_types: None,
            account_ids: None,
            peer_ids: None,
        }
    }

    /// 添加事件类型过滤
    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    /// 添加账号过滤
    pub fn with_account_ids(mut self, account_ids: Vec<String>) -> Self {
        self.account_ids = Some(account_ids);
        self
    }

    /// 添加对端过滤
    pub fn with_peer_ids(mut self, peer_ids: Vec<u64>) -> Self {
        self.peer_ids = Some(peer_ids);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &InboxEvent) -> bool {
        // 检查事件类型
        if let Some(ref types) = self.event_types {
            if !types.contains(&event.event_type().to_string()) {
                return false;
            }
        }

        // 检查账号
        if let Some(ref account_ids) = self.account_ids {
            if !account_ids.iter().any(|a| a == event.account_id()) {
                return false;
            }
        }

        // 检查对端
        if let Some(ref peer_ids) = self.peer_ids {
            match event.peer_id() {
                Some(peer_id) => {
                    if !peer_ids.contains(&peer_id) {
                        return false;
                    }
                }
                // 事件没有对端但过滤器要求有
                None => return false,
            }
        }

        true
    }
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&InboxEvent) + Send + Sync>;

/// 事件管理器
pub struct EventManager {
    /// 广播发送器
    sender: broadcast::Sender<InboxEvent>,
    /// 事件监听器映射
    listeners: Arc<tokio::sync::RwLock<HashMap<String, Vec<EventListener>>>>,
    /// 事件统计
    stats: Arc<tokio::sync::RwLock<EventStats>>,
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 监听器数量
    pub listener_count: usize,
    /// 最后事件时间
    pub last_event_time: Option<i64>,
}

impl EventManager {
    /// 创建新的事件管理器
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);

        Self {
            sender,
            listeners: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            stats: Arc::new(tokio::sync::RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: InboxEvent) {
        debug!("发布事件: {}", event.event_type());

        // 更新统计
        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 广播事件（无订阅者时 send 会失败，属正常场景，仅打 debug）
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("广播事件无活跃订阅者: {}", e);
        }

        // 调用监听器
        let listeners = self.listeners.read().await;
        if let Some(event_listeners) = listeners.get(event.event_type()) {
            for listener in event_listeners {
                listener(&event);
            }
        }

        // 调用通用监听器
        if let Some(general_listeners) = listeners.get("*") {
            for listener in general_listeners {
                listener(&event);
            }
        }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<InboxEvent> {
        self.sender.subscribe()
    }

    /// 订阅特定类型的事件
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        let receiver = self.sender.subscribe();
        FilteredEventReceiver::new(receiver, filter)
    }

    /// 添加事件监听器
    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&InboxEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners
            .entry(event_type.to_string())
            .or_insert_with(Vec::new)
            .push(Box::new(listener));

        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(|v| v.len()).sum();

        info!("已添加事件监听器: {}", event_type);
    }

    /// 移除所有监听器
    pub async fn clear_listeners(&self) {
        let mut listeners = self.listeners.write().await;
        listeners.clear();

        let mut stats = self.stats.write().await;
        stats.listener_count = 0;

        info!("已清空事件监听器");
    }

    /// 获取事件统计
    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    /// 获取活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<InboxEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    /// 创建新的过滤事件接收器
    pub fn new(receiver: broadcast::Receiver<InboxEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<InboxEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<InboxEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// 事件生成器 - 辅助函数
pub mod event_builders {
    use super::*;

    /// 创建消息接收事件
    pub fn message_received(
        account_id: &str,
        peer_id: u64,
        message_id: u64,
        text: &str,
    ) -> InboxEvent {
        InboxEvent::MessageReceived {
            account_id: account_id.to_string(),
            peer_id,
            message_id,
            text: text.to_string(),
            timestamp: now_ms(),
        }
    }

    /// 创建消息发送事件
    pub fn message_sent(account_id: &str, peer_id: u64, message_id: u64) -> InboxEvent {
        InboxEvent::MessageSent {
            account_id: account_id.to_string(),
            peer_id,
            message_id,
            timestamp: now_ms(),
        }
    }

    /// 创建首次回复事件
    pub fn first_reply(
        account_id: &str,
        peer_id: u64,
        message_id: u64,
        campaign_id: Option<u64>,
    ) -> InboxEvent {
        InboxEvent::FirstReply {
            account_id: account_id.to_string(),
            peer_id,
            message_id,
            campaign_id,
            timestamp: now_ms(),
        }
    }

    /// 创建已读回执事件
    pub fn read_receipt(account_id: &str, peer_id: u64, max_id: u64) -> InboxEvent {
        InboxEvent::ReadReceiptReceived {
            account_id: account_id.to_string(),
            peer_id,
            max_id,
            timestamp: now_ms(),
        }
    }

    /// 创建消息编辑事件
    pub fn message_edited(account_id: &str, peer_id: u64, message_id: u64) -> InboxEvent {
        InboxEvent::MessageEdited {
            account_id: account_id.to_string(),
            peer_id,
            message_id,
            timestamp: now_ms(),
        }
    }

    /// 创建消息删除事件
    pub fn message_deleted(account_id: &str, peer_id: u64, message_ids: Vec<u64>) -> InboxEvent {
        InboxEvent::MessageDeleted {
            account_id: account_id.to_string(),
            peer_id,
            message_ids,
            timestamp: now_ms(),
        }
    }

    /// 创建未读数变更事件
    pub fn unread_count_changed(account_id: &str, peer_id: u64, unread_count: u32) -> InboxEvent {
        InboxEvent::UnreadCountChanged {
            account_id: account_id.to_string(),
            peer_id,
            unread_count,
            timestamp: now_ms(),
        }
    }

    /// 创建会话新建事件
    pub fn conversation_created(account_id: &str, peer_id: u64) -> InboxEvent {
        InboxEvent::ConversationCreated {
            account_id: account_id.to_string(),
            peer_id,
            timestamp: now_ms(),
        }
    }

    /// 创建连接状态变更事件
    pub fn connection_state_changed(
        account_id: &str,
        old_status: AccountStatus,
        new_status: AccountStatus,
    ) -> InboxEvent {
        InboxEvent::ConnectionStateChanged {
            account_id: account_id.to_string(),
            old_status,
            new_status,
            timestamp: now_ms(),
        }
    }

    /// 创建同步完成事件
    pub fn sync_completed(account_id: &str, stats: SyncStats) -> InboxEvent {
        InboxEvent::SyncCompleted {
            account_id: account_id.to_string(),
            stats,
            timestamp: now_ms(),
        }
    }
}
