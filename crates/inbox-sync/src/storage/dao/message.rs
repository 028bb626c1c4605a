//! 消息数据访问层 - 镜像消息的写入与状态翻转
//!
//! 写入原则：
//! - 以 (peer_id, message_id) 为唯一键，三条写入路径（推送/补拉/会话同步）
//!   全部走 `insert_mirror`，重复 id 静默忽略，天然幂等
//! - 删除是破坏性的：原文被占位文案覆盖，不保留

use rusqlite::{params, Connection, Row};

use crate::error::{InboxSyncError, Result};
use crate::storage::entities::{now_ms, MessageRow, DELETED_PLACEHOLDER};
use crate::storage::MessageQuery;

pub struct MessageDao<'a> {
    conn: &'a Connection,
}

impl<'a> MessageDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 写入镜像消息；已存在同 id 时忽略并返回 false
    pub fn insert_mirror(&self, msg: &MessageRow) -> Result<bool> {
        let sql = r#"
            INSERT OR IGNORE INTO message (
                peer_id, message_id, direction, sender_id, text, date, reply_to_id,
                media_kind, edited_at, is_deleted, is_read, read_at, synced_via, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
        "#;
        let changed = self.conn.execute(sql, params![
            msg.peer_id as i64,
            msg.message_id as i64,
            msg.direction,
            msg.sender_id as i64,
            msg.text,
            msg.date,
            msg.reply_to_id.map(|id| id as i64),
            msg.media_kind,
            msg.edited_at,
            msg.is_deleted,
            msg.is_read,
            msg.read_at,
            msg.synced_via,
            msg.created_at,
        ])?;
        Ok(changed > 0)
    }

    /// 按 (peer_id, message_id) 查询
    pub fn get(&self, peer_id: u64, message_id: u64) -> Result<Option<MessageRow>> {
        let sql = "SELECT * FROM message WHERE peer_id = ?1 AND message_id = ?2";
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query_map(params![peer_id as i64, message_id as i64], |row| {
            self.row_to_message(row)
        })?;
        match rows.next() {
            Some(Ok(msg)) => Ok(Some(msg)),
            Some(Err(e)) => Err(InboxSyncError::Database(format!("查询消息失败: {}", e))),
            None => Ok(None),
        }
    }

    pub fn exists(&self, peer_id: u64, message_id: u64) -> Result<bool> {
        let sql = "SELECT EXISTS(SELECT 1 FROM message WHERE peer_id = ?1 AND message_id = ?2)";
        let exists: bool = self
            .conn
            .query_row(sql, params![peer_id as i64, message_id as i64], |row| row.get(0))?;
        Ok(exists)
    }

    /// 应用编辑；消息不存在或已删除时返回 false（占位文案不被编辑复活）
    pub fn apply_edit(
        &self,
        peer_id: u64,
        message_id: u64,
        new_text: &str,
        edited_at: Option<i64>,
    ) -> Result<bool> {
        let sql = r#"
            UPDATE message SET text = ?3, edited_at = ?4
            WHERE peer_id = ?1 AND message_id = ?2 AND is_deleted = 0
        "#;
        let changed = self.conn.execute(sql, params![
            peer_id as i64,
            message_id as i64,
            new_text,
            edited_at,
        ])?;
        Ok(changed > 0)
    }

    /// 软删除一批消息：置 is_deleted 并用占位文案覆盖原文，返回实际翻转条数
    pub fn mark_deleted(&self, peer_id: u64, message_ids: &[u64]) -> Result<usize> {
        let sql = r#"
            UPDATE message SET is_deleted = 1, text = ?3, media_kind = NULL
            WHERE peer_id = ?1 AND message_id = ?2 AND is_deleted = 0
        "#;
        let mut total = 0;
        for &message_id in message_ids {
            total += self.conn.execute(sql, params![
                peer_id as i64,
                message_id as i64,
                DELETED_PLACEHOLDER,
            ])?;
        }
        Ok(total)
    }

    /// 软删除某 id 之上的全部消息（远端删尾截断），返回受影响的 message_id 列表
    pub fn mark_deleted_above(&self, peer_id: u64, above_id: u64) -> Result<Vec<u64>> {
        let mut ids = Vec::new();
        {
            let sql = "SELECT message_id FROM message WHERE peer_id = ?1 AND message_id > ?2 AND is_deleted = 0 ORDER BY message_id ASC";
            let mut stmt = self.conn.prepare(sql)?;
            let rows = stmt.query_map(params![peer_id as i64, above_id as i64], |row| {
                row.get::<_, i64>(0)
            })?;
            for row in rows {
                ids.push(row? as u64);
            }
        }
        if !ids.is_empty() {
            let sql = r#"
                UPDATE message SET is_deleted = 1, text = ?3, media_kind = NULL
                WHERE peer_id = ?1 AND message_id > ?2 AND is_deleted = 0
            "#;
            self.conn.execute(sql, params![
                peer_id as i64,
                above_id as i64,
                DELETED_PLACEHOLDER,
            ])?;
        }
        Ok(ids)
    }

    /// 对端已读回执：把我方外发消息标记为已读（id <= max_id），返回翻转条数
    pub fn mark_read_up_to(&self, peer_id: u64, max_id: u64) -> Result<usize> {
        let sql = r#"
            UPDATE message SET is_read = 1, read_at = ?3
            WHERE peer_id = ?1 AND message_id <= ?2 AND direction = 'outgoing' AND is_read = 0
        "#;
        let changed = self.conn.execute(sql, params![peer_id as i64, max_id as i64, now_ms()])?;
        Ok(changed)
    }

    /// 该会话本地已镜像的最大消息 id；无消息返回 0
    pub fn max_message_id(&self, peer_id: u64) -> Result<u64> {
        let max: Option<i64> = self.conn.query_row(
            "SELECT MAX(message_id) FROM message WHERE peer_id = ?1",
            params![peer_id as i64],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0).max(0) as u64)
    }

    /// 未删除消息条数（对账用：占位行不计入，远端侧也已不存在）
    pub fn count_active(&self, peer_id: u64) -> Result<i64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM message WHERE peer_id = ?1 AND is_deleted = 0",
            params![peer_id as i64],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// 最近消息，新的在前
    pub fn list_recent(&self, peer_id: u64, limit: u32) -> Result<Vec<MessageRow>> {
        let sql = "SELECT * FROM message WHERE peer_id = ?1 ORDER BY message_id DESC LIMIT ?2";
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![peer_id as i64, limit], |row| self.row_to_message(row))?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    /// 游标翻页：`before_message_id` 之前（不含）的消息，新的在前
    pub fn list_page(&self, peer_id: u64, query: &MessageQuery) -> Result<Vec<MessageRow>> {
        let before = query
            .before_message_id
            .map(|id| id as i64)
            .unwrap_or(i64::MAX);
        let sql = "SELECT * FROM message WHERE peer_id = ?1 AND message_id < ?2 ORDER BY message_id DESC LIMIT ?3";
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![peer_id as i64, before, query.limit], |row| {
            self.row_to_message(row)
        })?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    fn row_to_message(&self, row: &Row) -> rusqlite::Result<MessageRow> {
        Ok(MessageRow {
            id: Some(row.get("id")?),
            peer_id: row.get::<_, i64>("peer_id")? as u64,
            message_id: row.get::<_, i64>("message_id")? as u64,
            direction: row.get("direction")?,
            sender_id: row.get::<_, i64>("sender_id")? as u64,
            text: row.get("text")?,
            date: row.get("date")?,
            reply_to_id: row.get::<_, Option<i64>>("reply_to_id")?.map(|id| id as u64),
            media_kind: row.get("media_kind")?,
            edited_at: row.get("edited_at")?,
            is_deleted: row.get("is_deleted")?,
            is_read: row.get("is_read")?,
            read_at: row.get("read_at")?,
            synced_via: row.get("synced_via")?,
            created_at: row.get("created_at")?,
        })
    }
}
