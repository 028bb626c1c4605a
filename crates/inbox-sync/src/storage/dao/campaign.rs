//! 活动计数数据访问层 - 触达/回复/已读三个漏斗计数
//!
//! 三个计数都是"每对端至多一次"语义，翻转判定在上层做，
//! 这里只提供 upsert 自增原语。

use rusqlite::{params, Connection, Row};

use crate::error::Result;
use crate::storage::entities::{now_ms, CampaignStatsRow};

pub struct CampaignDao<'a> {
    conn: &'a Connection,
}

impl<'a> CampaignDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    pub fn get(&self, campaign_id: u64) -> Result<Option<CampaignStatsRow>> {
        let sql = "SELECT * FROM campaign WHERE campaign_id = ?1";
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query_map(params![campaign_id as i64], |row| self.row_to_stats(row))?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    /// 触达 +1（首条消息成功发出时）
    pub fn increment_reached(&self, campaign_id: u64) -> Result<()> {
        self.increment(campaign_id, "reached")
    }

    /// 回复 +1（首次回复事件）
    pub fn increment_replies(&self, campaign_id: u64) -> Result<()> {
        self.increment(campaign_id, "replies")
    }

    /// 已读 +1（对端读位 0 → 正数）
    pub fn increment_reads(&self, campaign_id: u64) -> Result<()> {
        self.increment(campaign_id, "reads")
    }

    fn increment(&self, campaign_id: u64, column: &str) -> Result<()> {
        // column 取值固定为三列之一，不来自外部输入
        let sql = format!(
            r#"
            INSERT INTO campaign (campaign_id, {col}, updated_at) VALUES (?1, 1, ?2)
            ON CONFLICT(campaign_id) DO UPDATE SET {col} = {col} + 1, updated_at = excluded.updated_at
            "#,
            col = column
        );
        self.conn.execute(&sql, params![campaign_id as i64, now_ms()])?;
        Ok(())
    }

    fn row_to_stats(&self, row: &Row) -> rusqlite::Result<CampaignStatsRow> {
        Ok(CampaignStatsRow {
            campaign_id: row.get::<_, i64>("campaign_id")? as u64,
            reached: row.get::<_, i64>("reached")?.max(0) as u32,
            replies: row.get::<_, i64>("replies")?.max(0) as u32,
            reads: row.get::<_, i64>("reads")?.max(0) as u32,
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
    fn test_increment_creates_and_accumulates() {
        let conn = create_test_db();
        let dao = CampaignDao::new(&conn);

        assert!(dao.get(3).unwrap().is_none());

        dao.increment_reached(3).unwrap();
        dao.increment_reached(3).unwrap();
        dao.increment_replies(3).unwrap();
        dao.increment_reads(3).unwrap();

        let stats = dao.get(3).unwrap().unwrap();
        assert_eq!(stats.reached, 2);
        assert_eq!(stats.replies, 1);
        assert_eq!(stats.reads, 1);
        assert!((stats.reply_rate() - 0.5).abs() < f64::EPSILON);
        assert!((stats.read_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_campaigns_are_independent() {
        let conn = create_test_db();
        let dao = CampaignDao::new(&conn);

        dao.increment_reached(1).unwrap();
        dao.increment_replies(2).unwrap();

        assert_eq!(dao.get(1).unwrap().unwrap().reached, 1);
        assert_eq!(dao.get(1).unwrap().unwrap().replies, 0);
        assert_eq!(dao.get(2).unwrap().unwrap().replies, 1);
    }
}
