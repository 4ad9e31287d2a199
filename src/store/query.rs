//! Read-only query interface over the event store
//!
//! Backs the `events` and `stats` CLI subcommands. Opens its own pool of
//! read-only connections; WAL mode lets these run while the writer thread
//! is appending.

use anyhow::{Context, Result};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;
use std::path::Path;

/// Maximum read connections; queries are short, two is plenty.
const POOL_SIZE: u32 = 2;

#[derive(Debug, Clone)]
pub struct StoredEventRow {
    pub id: i64,
    pub ts: i64,
    pub producer: String,
    pub pid: Option<i64>,
    pub pname: Option<String>,
    pub event_type: String,
    pub mcp_tag: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CountRow {
    pub key: String,
    pub count: i64,
}

pub struct StoreQuery {
    pool: Pool<SqliteConnectionManager>,
}

impl StoreQuery {
    pub fn open(path: &Path) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_flags(
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        );
        let pool = Pool::builder()
            .max_size(POOL_SIZE)
            .build(manager)
            .with_context(|| format!("opening read pool on {}", path.display()))?;
        Ok(Self { pool })
    }

    /// Most recent events, newest first, optionally restricted to one tag.
    pub fn recent(&self, limit: usize, tag: Option<&str>) -> Result<Vec<StoredEventRow>> {
        let conn = self.pool.get()?;
        let mut rows = Vec::new();
        let map = |r: &rusqlite::Row<'_>| {
            Ok(StoredEventRow {
                id: r.get(0)?,
                ts: r.get(1)?,
                producer: r.get(2)?,
                pid: r.get(3)?,
                pname: r.get(4)?,
                event_type: r.get(5)?,
                mcp_tag: r.get(6)?,
            })
        };
        match tag {
            Some(tag) => {
                let mut stmt = conn.prepare(
                    "SELECT id, ts, producer, pid, pname, event_type, mcpTag
                     FROM raw_events WHERE mcpTag = ?1 ORDER BY id DESC LIMIT ?2",
                )?;
                for row in stmt.query_map(rusqlite::params![tag, limit as i64], map)? {
                    rows.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, ts, producer, pid, pname, event_type, mcpTag
                     FROM raw_events ORDER BY id DESC LIMIT ?1",
                )?;
                for row in stmt.query_map([limit as i64], map)? {
                    rows.push(row?);
                }
            }
        }
        Ok(rows)
    }

    /// Event counts per MCP tag, descending.
    pub fn counts_by_tag(&self) -> Result<Vec<CountRow>> {
        self.grouped_counts("SELECT COALESCE(mcpTag, '(untagged)'), COUNT(*) FROM raw_events GROUP BY mcpTag ORDER BY COUNT(*) DESC")
    }

    /// Event counts per event type, descending.
    pub fn counts_by_type(&self) -> Result<Vec<CountRow>> {
        self.grouped_counts(
            "SELECT event_type, COUNT(*) FROM raw_events GROUP BY event_type ORDER BY COUNT(*) DESC",
        )
    }

    /// JSON-RPC method frequency, descending.
    pub fn rpc_methods(&self) -> Result<Vec<CountRow>> {
        self.grouped_counts(
            "SELECT COALESCE(method, '(none)'), COUNT(*) FROM rpc_events GROUP BY method ORDER BY COUNT(*) DESC",
        )
    }

    fn grouped_counts(&self, sql: &str) -> Result<Vec<CountRow>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(sql)?;
        let mut rows = Vec::new();
        for row in stmt.query_map([], |r| {
            Ok(CountRow {
                key: r.get(0)?,
                count: r.get(1)?,
            })
        })? {
            rows.push(row?);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EventStore;
    use serde_json::json;

    fn seeded_store(dir: &tempfile::TempDir) -> std::path::PathBuf {
        let path = dir.path().join("events.db");
        let mut store = EventStore::open(&path).unwrap();
        for (i, tag) in ["Github", "Github", "Weather"].iter().enumerate() {
            let event = json!({
                "ts": i as i64, "producer": "agent-core", "pid": i, "pname": "p",
                "eventType": "File",
                "data": {"task": "WRITE", "filePath": format!("/f{i}"), "mcpTag": tag}
            })
            .to_string();
            store.save_event(&event).unwrap();
        }
        let mcp = json!({
            "ts": 9, "producer": "proxy", "pid": 9, "pname": "p", "eventType": "MCP",
            "data": {"task": "SEND", "message": {"method": "tools/call", "id": 1}}
        })
        .to_string();
        store.save_event(&mcp).unwrap();
        path
    }

    #[test]
    fn test_recent_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded_store(&dir);
        let q = StoreQuery::open(&path).unwrap();

        let all = q.recent(10, None).unwrap();
        assert_eq!(all.len(), 4);
        // Newest first
        assert!(all[0].id > all[1].id);

        let github = q.recent(10, Some("Github")).unwrap();
        assert_eq!(github.len(), 2);
    }

    #[test]
    fn test_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = seeded_store(&dir);
        let q = StoreQuery::open(&path).unwrap();

        let tags = q.counts_by_tag().unwrap();
        assert_eq!(tags[0].key, "Github");
        assert_eq!(tags[0].count, 2);

        let types = q.counts_by_type().unwrap();
        assert_eq!(types[0].key, "File");
        assert_eq!(types[0].count, 3);

        let methods = q.rpc_methods().unwrap();
        assert_eq!(methods[0].key, "tools/call");
    }
}
