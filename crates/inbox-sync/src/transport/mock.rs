//! 测试用内存传输实现
//!
//! 所有会话共享同一份脚本状态：预置对话/消息、注入推送更新、预设失败次数，
//! 并统计各类远端调用次数，供单元测试断言"恰好一次远端调用"这类性质。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{
    Credentials, DialogSummary, PushUpdate, RemoteMessage, SentReceipt, Transport, TransportError,
    TransportSession,
};

#[derive(Default)]
struct MockState {
    dialogs: Vec<DialogSummary>,
    messages: HashMap<u64, Vec<RemoteMessage>>,
    message_counts: HashMap<u64, u64>,
    pending_updates: VecDeque<PushUpdate>,
    next_update_error: Option<TransportError>,
    connect_failures_remaining: u32,
    reconnect_failures_remaining: u32,
    send_flood_wait: Option<u64>,
    echo_outgoing: bool,
    next_send_id: u64,
    sent: Vec<(u64, String, u64)>,
    connect_calls: u32,
    reconnect_calls: u32,
    fetch_dialog_calls: u32,
    fetch_message_calls: Vec<(u64, u64, u32)>,
    live_sessions: u32,
}

/// 内存 mock 拨号器
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    notify: Arc<Notify>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                next_send_id: 1000,
                ..MockState::default()
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// 预置 `fetch_dialogs` 返回的对话摘要
    pub fn set_dialogs(&self, dialogs: Vec<DialogSummary>) {
        self.state.lock().dialogs = dialogs;
    }

    /// 预置某个 peer 的完整消息历史（按 id 排序后存储，`fetch_messages` 按范围切片）
    pub fn set_peer_messages(&self, peer_id: u64, mut messages: Vec<RemoteMessage>) {
        messages.sort_by_key(|m| m.message_id);
        self.state.lock().messages.insert(peer_id, messages);
    }

    /// 覆盖 `fetch_message_count` 的返回值（不设置时取预置消息条数）
    pub fn set_message_count(&self, peer_id: u64, count: u64) {
        self.state.lock().message_counts.insert(peer_id, count);
    }

    /// 注入一条推送更新并唤醒事件泵
    pub fn push_update(&self, update: PushUpdate) {
        self.state.lock().pending_updates.push_back(update);
        self.notify.notify_one();
    }

    /// 让下一次 `next_update` 返回网络错误（测试重连路径）
    pub fn inject_update_error(&self, message: &str) {
        self.state.lock().next_update_error = Some(TransportError::Network(message.to_string()));
        self.notify.notify_one();
    }

    /// 预设接下来 n 次 `connect` 失败
    pub fn fail_next_connects(&self, n: u32) {
        self.state.lock().connect_failures_remaining = n;
    }

    /// 预设接下来 n 次 `reconnect` 失败
    pub fn fail_next_reconnects(&self, n: u32) {
        self.state.lock().reconnect_failures_remaining = n;
    }

    /// 设置发送路径的平台限流（None 解除）
    pub fn set_send_flood_wait(&self, wait_secs: Option<u64>) {
        self.state.lock().send_flood_wait = wait_secs;
    }

    /// 发送成功后是否回推一条 outgoing 推送（模拟平台回显）
    pub fn set_echo_outgoing(&self, on: bool) {
        self.state.lock().echo_outgoing = on;
    }

    pub fn connect_calls(&self) -> u32 {
        self.state.lock().connect_calls
    }

    pub fn reconnect_calls(&self) -> u32 {
        self.state.lock().reconnect_calls
    }

    pub fn fetch_dialog_calls(&self) -> u32 {
        self.state.lock().fetch_dialog_calls
    }

    /// 每次 `fetch_messages` 调用的 (peer_id, min_id, limit) 记录
    pub fn fetch_message_calls(&self) -> Vec<(u64, u64, u32)> {
        self.state.lock().fetch_message_calls.clone()
    }

    /// 已发送的 (peer_id, text, 分配的消息 id) 记录
    pub fn sent_messages(&self) -> Vec<(u64, String, u64)> {
        self.state.lock().sent.clone()
    }

    /// 当前存活的会话数（单例性质断言用）
    pub fn live_sessions(&self) -> u32 {
        self.state.lock().live_sessions
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        _account_id: &str,
        _credentials: &Credentials,
        session_token: Option<&str>,
    ) -> Result<Box<dyn TransportSession>, TransportError> {
        let token = {
            let mut st = self.state.lock();
            st.connect_calls += 1;
            if st.connect_failures_remaining > 0 {
                st.connect_failures_remaining -= 1;
                return Err(TransportError::ConnectFailed("mock: 预设连接失败".to_string()));
            }
            match session_token {
                Some(t) if !t.is_empty() => t.to_string(),
                _ => return Err(TransportError::Unauthorized),
            }
        };
        self.state.lock().live_sessions += 1;
        Ok(Box::new(MockSession {
            state: self.state.clone(),
            notify: self.notify.clone(),
            token,
            closed: AtomicBool::new(false),
        }))
    }
}

/// 一条 mock 会话，与拨号器共享脚本状态
pub struct MockSession {
    state: Arc<Mutex<MockState>>,
    notify: Arc<Notify>,
    token: String,
    closed: AtomicBool,
}

#[async_trait]
impl TransportSession for MockSession {
    fn is_authorized(&self) -> bool {
        !self.token.is_empty()
    }

    fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn export_session(&self) -> String {
        self.token.clone()
    }

    async fn next_update(&self) -> Result<Option<PushUpdate>, TransportError> {
        loop {
            let notified = {
                let mut st = self.state.lock();
                if let Some(e) = st.next_update_error.take() {
                    return Err(e);
                }
                if let Some(u) = st.pending_updates.pop_front() {
                    return Ok(Some(u));
                }
                if self.closed.load(Ordering::SeqCst) {
                    return Ok(None);
                }
                self.notify.clone()
            };
            notified.notified().await;
        }
    }

    async fn fetch_dialogs(&self, limit: u32) -> Result<Vec<DialogSummary>, TransportError> {
        let mut st = self.state.lock();
        st.fetch_dialog_calls += 1;
        Ok(st.dialogs.iter().take(limit as usize).cloned().collect())
    }

    async fn fetch_messages(
        &self,
        peer_id: u64,
        min_id: u64,
        limit: u32,
    ) -> Result<Vec<RemoteMessage>, TransportError> {
        let mut st = self.state.lock();
        st.fetch_message_calls.push((peer_id, min_id, limit));
        Ok(st
            .messages
            .get(&peer_id)
            .map(|v| {
                v.iter()
                    .filter(|m| m.message_id > min_id)
                    .take(limit as usize)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_message_count(&self, peer_id: u64) -> Result<u64, TransportError> {
        let st = self.state.lock();
        Ok(st.message_counts.get(&peer_id).copied().unwrap_or_else(|| {
            st.messages.get(&peer_id).map(|v| v.len() as u64).unwrap_or(0)
        }))
    }

    async fn send_message(&self, peer_id: u64, text: &str) -> Result<SentReceipt, TransportError> {
        let (receipt, echoed) = {
            let mut st = self.state.lock();
            if let Some(wait_secs) = st.send_flood_wait {
                return Err(TransportError::FloodWait { wait_secs });
            }
            st.next_send_id += 1;
            let id = st.next_send_id;
            st.sent.push((peer_id, text.to_string(), id));
            // 远端口径：date 为 Unix 秒
            let date = Utc::now().timestamp();
            let echoed = if st.echo_outgoing {
                st.pending_updates
                    .push_back(PushUpdate::NewMessage(RemoteMessage::outgoing(
                        peer_id, id, text, date,
                    )));
                true
            } else {
                false
            };
            (SentReceipt { message_id: id, date }, echoed)
        };
        if echoed {
            self.notify.notify_one();
        }
        Ok(receipt)
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        let mut st = self.state.lock();
        st.reconnect_calls += 1;
        if st.reconnect_failures_remaining > 0 {
            st.reconnect_failures_remaining -= 1;
            return Err(TransportError::ConnectFailed("mock: 预设重连失败".to_string()));
        }
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let mut st = self.state.lock();
            st.live_sessions = st.live_sessions.saturating_sub(1);
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_credentials() -> Credentials {
        Credentials {
            api_id: 12345,
            api_secret: "secret".to_string(),
            proxy: None,
        }
    }

    #[tokio::test]
    async fn test_connect_requires_token() {
        let transport = MockTransport::new();
        let err = transport
            .connect("acct_1", &test_credentials(), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Unauthorized));

        let session = transport
            .connect("acct_1", &test_credentials(), Some("1token"))
            .await
            .unwrap();
        assert!(session.is_authorized());
        assert_eq!(transport.live_sessions(), 1);
        session.disconnect().await.unwrap();
        assert_eq!(transport.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_push_and_next_update() {
        let transport = MockTransport::new();
        let session = transport
            .connect("acct_1", &test_credentials(), Some("1token"))
            .await
            .unwrap();

        transport.push_update(PushUpdate::ReadReceipt {
            peer_id: 7,
            max_id: 42,
        });
        let update = session.next_update().await.unwrap().unwrap();
        assert_eq!(
            update,
            PushUpdate::ReadReceipt {
                peer_id: 7,
                max_id: 42
            }
        );

        // 断开后返回 None
        session.disconnect().await.unwrap();
        assert!(session.next_update().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_messages_range() {
        let transport = MockTransport::new();
        let msgs: Vec<RemoteMessage> = (1..=10)
            .map(|i| RemoteMessage::incoming(5, i, &format!("m{}", i), 1000 + i as i64))
            .collect();
        transport.set_peer_messages(5, msgs);

        let session = transport
            .connect("acct_1", &test_credentials(), Some("1token"))
            .await
            .unwrap();
        let page = session.fetch_messages(5, 4, 3).await.unwrap();
        let ids: Vec<u64> = page.iter().map(|m| m.message_id).collect();
        // 严格大于 min_id，升序，受 limit 截断
        assert_eq!(ids, vec![5, 6, 7]);
        assert_eq!(transport.fetch_message_calls(), vec![(5, 4, 3)]);
    }

    #[tokio::test]
    async fn test_send_flood_wait() {
        let transport = MockTransport::new();
        let session = transport
            .connect("acct_1", &test_credentials(), Some("1token"))
            .await
            .unwrap();

        transport.set_send_flood_wait(Some(30));
        let err = session.send_message(9, "hello").await.err().unwrap();
        assert!(matches!(err, TransportError::FloodWait { wait_secs: 30 }));

        transport.set_send_flood_wait(None);
        let receipt = session.send_message(9, "hello").await.unwrap();
        assert_eq!(receipt.message_id, 1001);
        println!("✅ mock 发送与限流脚本工作正常");
    }
}
