//! 事件日志数据访问层 - 追加式业务事件流
//!
//! 事件日志有两个消费方：
//! - 通知外发（notified=0 扫描，推给上层后置位）
//! - 回复率统计（first_reply 在窗口内的条数 / 窗口内触达的对端数）

use rusqlite::{params, Connection, Row};

use crate::error::Result;
use crate::storage::entities::{EventKind, EventRow};

pub struct EventDao<'a> {
    conn: &'a Connection,
}

impl<'a> EventDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 追加事件，返回本地主键
    pub fn append(&self, event: &EventRow) -> Result<i64> {
        let sql = r#"
            INSERT INTO event_log (peer_id, kind, payload, message_id, campaign_id, notified, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#;
        self.conn.execute(sql, params![
            event.peer_id as i64,
            event.kind,
            event.payload,
            event.message_id.map(|id| id as i64),
            event.campaign_id.map(|id| id as i64),
            event.notified,
            event.created_at,
        ])?;
        Ok(self.conn.last_insert_rowid())
    }

    /// 未外发通知的事件，老的在前
    pub fn list_unnotified(&self, limit: u32) -> Result<Vec<EventRow>> {
        let sql = "SELECT * FROM event_log WHERE notified = 0 ORDER BY id ASC LIMIT ?1";
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![limit], |row| self.row_to_event(row))?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// 批量置已通知位
    pub fn mark_notified(&self, ids: &[i64]) -> Result<()> {
        let sql = "UPDATE event_log SET notified = 1 WHERE id = ?1";
        for &id in ids {
            self.conn.execute(sql, params![id])?;
        }
        Ok(())
    }

    /// 会话是否已记过首次回复（每会话至多一条 first_reply）
    pub fn has_first_reply(&self, peer_id: u64) -> Result<bool> {
        let sql = "SELECT EXISTS(SELECT 1 FROM event_log WHERE peer_id = ?1 AND kind = 'first_reply')";
        let exists: bool = self
            .conn
            .query_row(sql, params![peer_id as i64], |row| row.get(0))?;
        Ok(exists)
    }

    /// 某类事件在时间窗口内的条数
    pub fn count_since(&self, kind: EventKind, since_ms: i64) -> Result<i64> {
        let sql = "SELECT COUNT(*) FROM event_log WHERE kind = ?1 AND created_at >= ?2";
        let count: i64 = self.conn.query_row(sql, params![kind, since_ms], |row| row.get(0))?;
        Ok(count)
    }

    /// 某会话的事件流，老的在前
    pub fn list_for_peer(&self, peer_id: u64, limit: u32) -> Result<Vec<EventRow>> {
        let sql = "SELECT * FROM event_log WHERE peer_id = ?1 ORDER BY id ASC LIMIT ?2";
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![peer_id as i64, limit], |row| self.row_to_event(row))?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    fn row_to_event(&self, row: &Row) -> rusqlite::Result<EventRow> {
        Ok(EventRow {
            id: Some(row.get("id")?),
            peer_id: row.get::<_, i64>("peer_id")? as u64,
            kind: row.get("kind")?,
            payload: row.get("payload")?,
            message_id: row.get::<_, Option<i64>>("message_id")?.map(|id| id as u64),
            campaign_id: row.get::<_, Option<i64>>("campaign_id")?.map(|id| id as u64),
            notified: row.get("notified")?,
            created_at: row.get("created_at")?,
        })
    }
}
