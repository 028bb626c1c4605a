//! 会话数据访问层 - 管理私聊会话行与本地指针
//!
//! 指针语义：
//! - `last_msg_id` 是本地已镜像的最新消息 id，只增不减（除被远端删除截断）
//! - `peer_last_read_id` 只增不减，回执与会话摘要取最大值
//! - `unread_count` 以会话摘要为准，推送路径只做增量

use rusqlite::{params, Connection, Row};

use crate::error::{InboxSyncError, Result};
use crate::storage::entities::{now_ms, ConversationRow};
use crate::storage::ListQuery;
use crate::transport::Direction;

pub struct ConversationDao<'a> {
    conn: &'a Connection,
}

impl<'a> ConversationDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 按 peer_id 查询（表内 peer_id 唯一，一行一会话）
    pub fn get_by_peer(&self, peer_id: u64) -> Result<Option<ConversationRow>> {
        let sql = "SELECT * FROM conversation WHERE peer_id = ?1";
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query_map(params![peer_id as i64], |row| self.row_to_conversation(row))?;
        match rows.next() {
            Some(Ok(conv)) => Ok(Some(conv)),
            Some(Err(e)) => Err(InboxSyncError::Database(format!("查询会话失败: {}", e))),
            None => Ok(None),
        }
    }

    /// 插入新会话行，返回本地主键
    pub fn insert(&self, conv: &ConversationRow) -> Result<i64> {
        let sql = r#"
            INSERT INTO conversation (
                peer_id, peer_name, peer_handle, last_msg_id, last_msg_date, last_msg_text,
                last_msg_direction, our_last_read_id, peer_last_read_id, unread_count,
                last_synced_at, needs_backfill, backfill_from_id, contact_type, contact_status,
                campaign_id, archived, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
        "#;
        self.conn.execute(sql, params![
            conv.peer_id as i64,
            conv.peer_name,
            conv.peer_handle,
            conv.last_msg_id as i64,
            conv.last_msg_date,
            conv.last_msg_text,
            conv.last_msg_direction,
            conv.our_last_read_id as i64,
            conv.peer_last_read_id as i64,
            conv.unread_count,
            conv.last_synced_at,
            conv.needs_backfill,
            conv.backfill_from_id as i64,
            conv.contact_type,
            conv.contact_status,
            conv.campaign_id.map(|c| c as i64),
            conv.archived,
            conv.created_at,
            conv.updated_at,
        ])?;
        Ok(self.conn.last_insert_rowid())
    }

    /// 会话摘要落库：不存在则建行，存在则刷新名称/档案类字段
    ///
    /// 指针与未读不在这里动，由同步引擎按缺口算术单独推进。
    pub fn upsert_profile(
        &self,
        peer_id: u64,
        peer_name: &str,
        peer_handle: Option<&str>,
    ) -> Result<ConversationRow> {
        if let Some(existing) = self.get_by_peer(peer_id)? {
            let sql = "UPDATE conversation SET peer_name = ?1, peer_handle = ?2, updated_at = ?3 WHERE peer_id = ?4";
            self.conn.execute(sql, params![peer_name, peer_handle, now_ms(), peer_id as i64])?;
            return Ok(ConversationRow {
                peer_name: peer_name.to_string(),
                peer_handle: peer_handle.map(|s| s.to_string()),
                ..existing
            });
        }
        let conv = ConversationRow::new(peer_id, peer_name, peer_handle);
        self.insert(&conv)?;
        self.get_by_peer(peer_id)?
            .ok_or_else(|| InboxSyncError::Database(format!("会话行插入后不可见: peer={}", peer_id)))
    }

    /// 新消息落库后的会话刷新：推进 last_msg_*，可选未读 +1
    ///
    /// last_msg 字段只在 message_id 不小于当前指针时才覆盖（乱序补拉不回退指针）。
    pub fn apply_new_message(
        &self,
        peer_id: u64,
        message_id: u64,
        date: i64,
        text: &str,
        direction: Direction,
        bump_unread: bool,
    ) -> Result<()> {
        let sql = r#"
            UPDATE conversation SET
                last_msg_id = CASE WHEN ?2 >= last_msg_id THEN ?2 ELSE last_msg_id END,
                last_msg_date = CASE WHEN ?2 >= last_msg_id THEN ?3 ELSE last_msg_date END,
                last_msg_text = CASE WHEN ?2 >= last_msg_id THEN ?4 ELSE last_msg_text END,
                last_msg_direction = CASE WHEN ?2 >= last_msg_id THEN ?5 ELSE last_msg_direction END,
                unread_count = unread_count + ?6,
                updated_at = ?7
            WHERE peer_id = ?1
        "#;
        self.conn.execute(sql, params![
            peer_id as i64,
            message_id as i64,
            date,
            text,
            direction,
            if bump_unread { 1 } else { 0 },
            now_ms(),
        ])?;
        Ok(())
    }

    /// 会话摘要的权威未读数覆盖（同步路径专用）
    pub fn set_unread_count(&self, peer_id: u64, count: u32) -> Result<()> {
        let sql = "UPDATE conversation SET unread_count = ?1, updated_at = ?2 WHERE peer_id = ?3";
        self.conn.execute(sql, params![count, now_ms(), peer_id as i64])?;
        Ok(())
    }

    /// 我方读位推进（只增不减）
    pub fn advance_our_read(&self, peer_id: u64, max_id: u64) -> Result<()> {
        let sql = r#"
            UPDATE conversation SET
                our_last_read_id = CASE WHEN ?2 > our_last_read_id THEN ?2 ELSE our_last_read_id END,
                unread_count = 0,
                updated_at = ?3
            WHERE peer_id = ?1
        "#;
        self.conn.execute(sql, params![peer_id as i64, max_id as i64, now_ms()])?;
        Ok(())
    }

    /// 对端读位推进（只增不减），返回推进前的值用于 0 → 正数 判定
    pub fn advance_peer_read(&self, peer_id: u64, max_id: u64) -> Result<u64> {
        let before: i64 = self.conn.query_row(
            "SELECT peer_last_read_id FROM conversation WHERE peer_id = ?1",
            params![peer_id as i64],
            |row| row.get(0),
        )?;
        let sql = r#"
            UPDATE conversation SET
                peer_last_read_id = CASE WHEN ?2 > peer_last_read_id THEN ?2 ELSE peer_last_read_id END,
                updated_at = ?3
            WHERE peer_id = ?1
        "#;
        self.conn.execute(sql, params![peer_id as i64, max_id as i64, now_ms()])?;
        Ok(before.max(0) as u64)
    }

    /// 置补拉标记（缺口 >= 2 时走扫描，不内联拉取）
    pub fn set_needs_backfill(&self, peer_id: u64, from_id: u64) -> Result<()> {
        let sql = r#"
            UPDATE conversation SET
                needs_backfill = 1,
                backfill_from_id = CASE WHEN backfill_from_id = 0 OR ?2 < backfill_from_id THEN ?2 ELSE backfill_from_id END,
                updated_at = ?3
            WHERE peer_id = ?1
        "#;
        self.conn.execute(sql, params![peer_id as i64, from_id as i64, now_ms()])?;
        Ok(())
    }

    /// 清补拉标记（缺口收敛后）
    pub fn clear_needs_backfill(&self, peer_id: u64) -> Result<()> {
        let sql = "UPDATE conversation SET needs_backfill = 0, backfill_from_id = 0, updated_at = ?1 WHERE peer_id = ?2";
        self.conn.execute(sql, params![now_ms(), peer_id as i64])?;
        Ok(())
    }

    /// 待补拉会话列表（补拉扫描的工作队列）
    pub fn list_needs_backfill(&self) -> Result<Vec<ConversationRow>> {
        let sql = "SELECT * FROM conversation WHERE needs_backfill = 1 ORDER BY updated_at ASC";
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| self.row_to_conversation(row))?;
        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    /// 本地消息指针截断（远端删尾后回退）
    pub fn truncate_local_pointer(&self, peer_id: u64, new_last_id: u64) -> Result<()> {
        let sql = r#"
            UPDATE conversation SET
                last_msg_id = ?2,
                updated_at = ?3
            WHERE peer_id = ?1 AND last_msg_id > ?2
        "#;
        self.conn.execute(sql, params![peer_id as i64, new_last_id as i64, now_ms()])?;
        Ok(())
    }

    /// 标记同步完成时间
    pub fn touch_synced(&self, peer_id: u64) -> Result<()> {
        let sql = "UPDATE conversation SET last_synced_at = ?1 WHERE peer_id = ?2";
        self.conn.execute(sql, params![now_ms(), peer_id as i64])?;
        Ok(())
    }

    /// 更新联系人分类（类型 + 状态标签）
    pub fn set_classification(
        &self,
        peer_id: u64,
        contact_type: Option<&str>,
        contact_status: Option<&str>,
    ) -> Result<()> {
        let sql = "UPDATE conversation SET contact_type = ?1, contact_status = ?2, updated_at = ?3 WHERE peer_id = ?4";
        self.conn.execute(sql, params![contact_type, contact_status, now_ms(), peer_id as i64])?;
        Ok(())
    }

    /// 仅更新状态标签
    pub fn set_status(&self, peer_id: u64, contact_status: &str) -> Result<()> {
        let sql = "UPDATE conversation SET contact_status = ?1, updated_at = ?2 WHERE peer_id = ?3";
        self.conn.execute(sql, params![contact_status, now_ms(), peer_id as i64])?;
        Ok(())
    }

    /// 绑定营销活动
    pub fn set_campaign(&self, peer_id: u64, campaign_id: Option<u64>) -> Result<()> {
        let sql = "UPDATE conversation SET campaign_id = ?1, updated_at = ?2 WHERE peer_id = ?3";
        self.conn.execute(sql, params![campaign_id.map(|c| c as i64), now_ms(), peer_id as i64])?;
        Ok(())
    }

    /// 会话列表，最近活跃在前
    pub fn list_all(&self) -> Result<Vec<ConversationRow>> {
        let sql = "SELECT * FROM conversation WHERE archived = 0 ORDER BY COALESCE(last_msg_date, updated_at) DESC";
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| self.row_to_conversation(row))?;
        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    /// 条件过滤 + 分页的会话列表，最近活跃在前
    pub fn list_filtered(&self, query: &ListQuery) -> Result<Vec<ConversationRow>> {
        let mut sql = String::from("SELECT * FROM conversation WHERE archived = 0");
        if query.unread_only {
            sql.push_str(" AND unread_count > 0");
        }
        if query.classified_only {
            sql.push_str(" AND contact_type IS NOT NULL");
        }
        sql.push_str(" ORDER BY COALESCE(last_msg_date, updated_at) DESC LIMIT ?1 OFFSET ?2");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![query.limit as i64, query.offset as i64], |row| {
            self.row_to_conversation(row)
        })?;
        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    /// 总未读数（未归档会话之和）
    pub fn total_unread(&self) -> Result<i64> {
        let sql = "SELECT SUM(unread_count) FROM conversation WHERE archived = 0";
        let total: Option<i64> = self.conn.query_row(sql, [], |row| row.get(0))?;
        Ok(total.unwrap_or(0))
    }

    fn row_to_conversation(&self, row: &Row) -> rusqlite::Result<ConversationRow> {
        Ok(ConversationRow {
            id: Some(row.get("id")?),
            peer_id: row.get::<_, i64>("peer_id")? as u64,
            peer_name: row.get("peer_name")?,
            peer_handle: row.get("peer_handle")?,
            last_msg_id: row.get::<_, i64>("last_msg_id")? as u64,
            last_msg_date: row.get("last_msg_date")?,
            last_msg_text: row.get("last_msg_text")?,
            last_msg_direction: row.get("last_msg_direction")?,
            our_last_read_id: row.get::<_, i64>("our_last_read_id")? as u64,
            peer_last_read_id: row.get::<_, i64>("peer_last_read_id")? as u64,
            unread_count: row.get::<_, i64>("unread_count")?.max(0) as u32,
            last_synced_at: row.get("last_synced_at")?,
            needs_backfill: row.get("needs_backfill")?,
            backfill_from_id: row.get::<_, i64>("backfill_from_id")? as u64,
            contact_type: row.get("contact_type")?,
            contact_status: row.get("contact_status")?,
            campaign_id: row.get::<_, Option<i64>>("campaign_id")?.map(|c| c as u64),
            archived: row.get("archived")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::migrate;

    fn create_test_db() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate::init_db(&mut conn).unwrap();
        conn
    }

    #[test]
    fn test_upsert_profile_creates_then_updates() {
        let conn = create_test_db();
        let dao = ConversationDao::new(&conn);

        let created = dao.upsert_profile(501, "张三", Some("zhangsan")).unwrap();
        assert_eq!(created.peer_id, 501);
        assert_eq!(created.last_msg_id, 0);

        let updated = dao.upsert_profile(501, "张三丰", None).unwrap();
        assert_eq!(updated.peer_name, "张三丰");
        // 指针不被档案更新动到
        assert_eq!(updated.last_msg_id, 0);

        // 表内仍然只有一行
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM conversation", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_apply_new_message_advances_pointer_and_unread() {
        let conn = create_test_db();
        let dao = ConversationDao::new(&conn);
        dao.upsert_profile(7, "李四", None).unwrap();

        dao.apply_new_message(7, 40, 1720000000, "你好", Direction::Incoming, true)
            .unwrap();
        dao.apply_new_message(7, 41, 1720000060, "在吗", Direction::Incoming, true)
            .unwrap();

        let conv = dao.get_by_peer(7).unwrap().unwrap();
        assert_eq!(conv.last_msg_id, 41);
        assert_eq!(conv.last_msg_text, "在吗");
        assert_eq!(conv.unread_count, 2);

        // 乱序低 id 不回退指针，但外发不加未读
        dao.apply_new_message(7, 39, 1719990000, "旧消息", Direction::Outgoing, false)
            .unwrap();
        let conv = dao.get_by_peer(7).unwrap().unwrap();
        assert_eq!(conv.last_msg_id, 41);
        assert_eq!(conv.last_msg_text, "在吗");
        assert_eq!(conv.unread_count, 2);
    }

    #[test]
    fn test_peer_read_pointer_monotonic() {
        let conn = create_test_db();
        let dao = ConversationDao::new(&conn);
        dao.upsert_profile(9, "王五", None).unwrap();

        let before = dao.advance_peer_read(9, 50).unwrap();
        assert_eq!(before, 0);
        // 迟到的低位回执不回退
        let before = dao.advance_peer_read(9, 45).unwrap();
        assert_eq!(before, 50);

        let conv = dao.get_by_peer(9).unwrap().unwrap();
        assert_eq!(conv.peer_last_read_id, 50);
    }

    #[test]
    fn test_backfill_flag_lifecycle() {
        let conn = create_test_db();
        let dao = ConversationDao::new(&conn);
        dao.upsert_profile(11, "赵六", None).unwrap();
        dao.upsert_profile(12, "钱七", None).unwrap();

        dao.set_needs_backfill(11, 100).unwrap();
        // 更低的起点收紧 backfill_from_id
        dao.set_needs_backfill(11, 80).unwrap();

        let pending = dao.list_needs_backfill().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].peer_id, 11);
        assert_eq!(pending[0].backfill_from_id, 80);

        dao.clear_needs_backfill(11).unwrap();
        assert!(dao.list_needs_backfill().unwrap().is_empty());
        let conv = dao.get_by_peer(11).unwrap().unwrap();
        assert_eq!(conv.backfill_from_id, 0);
    }

    #[test]
    fn test_unread_override_and_total() {
        let conn = create_test_db();
        let dao = ConversationDao::new(&conn);
        dao.upsert_profile(21, "a", None).unwrap();
        dao.upsert_profile(22, "b", None).unwrap();

        dao.set_unread_count(21, 5).unwrap();
        dao.set_unread_count(22, 2).unwrap();
        assert_eq!(dao.total_unread().unwrap(), 7);

        dao.advance_our_read(21, 99).unwrap();
        assert_eq!(dao.total_unread().unwrap(), 2);
        let conv = dao.get_by_peer(21).unwrap().unwrap();
        assert_eq!(conv.our_last_read_id, 99);
        assert_eq!(conv.unread_count, 0);
    }
}
