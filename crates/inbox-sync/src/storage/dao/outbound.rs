//! 外发历史数据访问层 - 频控窗口与去重的持久层
//!
//! (peer_id, campaign_id) 唯一：同一活动对同一对端只记一次，
//! 进程重启后去重依然成立。campaign_id=0 表示零散外发。

use rusqlite::{params, Connection, Row};

use crate::error::Result;
use crate::storage::entities::OutboundRecord;

pub struct OutboundDao<'a> {
    conn: &'a Connection,
}

impl<'a> OutboundDao<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// 记录一次成功外发；同 (peer, campaign) 已有记录时返回 false
    pub fn record_sent(&self, peer_id: u64, campaign_id: u64, sent_at: i64) -> Result<bool> {
        let sql = "INSERT OR IGNORE INTO outbound_history (peer_id, campaign_id, sent_at) VALUES (?1, ?2, ?3)";
        let changed = self.conn.execute(sql, params![peer_id as i64, campaign_id as i64, sent_at])?;
        Ok(changed > 0)
    }

    /// 该活动是否已对该对端发过
    pub fn has_sent(&self, peer_id: u64, campaign_id: u64) -> Result<bool> {
        let sql = "SELECT EXISTS(SELECT 1 FROM outbound_history WHERE peer_id = ?1 AND campaign_id = ?2)";
        let exists: bool = self.conn.query_row(
            sql,
            params![peer_id as i64, campaign_id as i64],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// 窗口内的外发条数（滚动频控的分子）
    pub fn count_since(&self, since_ms: i64) -> Result<i64> {
        let sql = "SELECT COUNT(*) FROM outbound_history WHERE sent_at >= ?1";
        let count: i64 = self.conn.query_row(sql, params![since_ms], |row| row.get(0))?;
        Ok(count)
    }

    /// 窗口内触达的去重对端数（回复率的分母）
    pub fn distinct_peers_since(&self, since_ms: i64) -> Result<i64> {
        let sql = "SELECT COUNT(DISTINCT peer_id) FROM outbound_history WHERE sent_at >= ?1";
        let count: i64 = self.conn.query_row(sql, params![since_ms], |row| row.get(0))?;
        Ok(count)
    }

    /// 最近一次外发时间；从未发过返回 None
    pub fn last_sent_at(&self) -> Result<Option<i64>> {
        let sql = "SELECT MAX(sent_at) FROM outbound_history";
        let last: Option<i64> = self.conn.query_row(sql, [], |row| row.get(0))?;
        Ok(last)
    }

    /// 窗口内最早一次外发的时间（窗口名额最早何时释放）
    pub fn oldest_since(&self, since_ms: i64) -> Result<Option<i64>> {
        let sql = "SELECT MIN(sent_at) FROM outbound_history WHERE sent_at >= ?1";
        let oldest: Option<i64> = self.conn.query_row(sql, params![since_ms], |row| row.get(0))?;
        Ok(oldest)
    }

    /// 某对端的外发记录，老的在前
    pub fn list_for_peer(&self, peer_id: u64) -> Result<Vec<OutboundRecord>> {
        let sql = "SELECT * FROM outbound_history WHERE peer_id = ?1 ORDER BY sent_at ASC";
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![peer_id as i64], |row| self.row_to_record(row))?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn row_to_record(&self, row: &Row) -> rusqlite::Result<OutboundRecord> {
        Ok(OutboundRecord {
            id: Some(row.get("id")?),
            peer_id: row.get::<_, i64>("peer_id")? as u64,
            campaign_id: row.get::<_, i64>("campaign_id")? as u64,
            sent_at: row.get("sent_at")?,
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
    fn test_record_sent_dedupes_per_campaign() {
        let conn = create_test_db();
        let dao = OutboundDao::new(&conn);

        assert!(dao.record_sent(7, 3, 1000).unwrap());
        // 同活动同对端：重启后也只记一次
        assert!(!dao.record_sent(7, 3, 2000).unwrap());
        // 不同活动可以再发
        assert!(dao.record_sent(7, 4, 3000).unwrap());

        assert!(dao.has_sent(7, 3).unwrap());
        assert!(!dao.has_sent(7, 99).unwrap());
        assert_eq!(dao.list_for_peer(7).unwrap().len(), 2);
    }

    #[test]
    fn test_window_counters() {
        let conn = create_test_db();
        let dao = OutboundDao::new(&conn);

        dao.record_sent(1, 0, 1_000).unwrap();
        dao.record_sent(2, 0, 5_000).unwrap();
        dao.record_sent(2, 9, 6_000).unwrap();

        assert_eq!(dao.count_since(0).unwrap(), 3);
        assert_eq!(dao.count_since(5_000).unwrap(), 2);
        // 对端 2 在窗口内出现两次也只算一个
        assert_eq!(dao.distinct_peers_since(0).unwrap(), 2);
        assert_eq!(dao.last_sent_at().unwrap(), Some(6_000));
        assert_eq!(dao.oldest_since(0).unwrap(), Some(1_000));
        assert_eq!(dao.oldest_since(2_000).unwrap(), Some(5_000));
        assert_eq!(dao.oldest_since(9_000).unwrap(), None);
    }

    #[test]
    fn test_empty_history() {
        let conn = create_test_db();
        let dao = OutboundDao::new(&conn);
        assert_eq!(dao.count_since(0).unwrap(), 0);
        assert!(dao.last_sent_at().unwrap().is_none());
    }
}
