//! Event store - the relational sink behind the Collector
//!
//! Stores every envelope in `raw_events` and fans typed payloads into
//! child tables so engines and the UI can query without re-parsing JSON.
//! Uses a dedicated writer thread to keep SQLite work off the async
//! runtime.
//!
//! # Architecture
//!
//! ```text
//! CollectorServer (async, one reader task per producer)
//!     │
//!     └──→ StoreHandle (bounded tokio channel)
//!             │
//!             └──→ Dedicated Writer Thread
//!                     │
//!                     └──→ SQLite (WAL mode), one transaction per envelope
//! ```

pub mod query;

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::path::Path;
use std::thread::JoinHandle;
use tokio::sync::mpsc;

/// Current schema version, recorded in `system_metadata`.
const SCHEMA_VERSION: i32 = 1;

/// Events queued before the collector starts shedding to the writer.
const WRITER_QUEUE: usize = 10_000;

pub struct EventStore {
    conn: Connection,
}

impl EventStore {
    /// Open (creating if needed) the store at `path` and ensure the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening event store {}", path.display()))?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        // WAL lets the read-side pool run while the writer holds the pen
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA busy_timeout=5000;
            PRAGMA foreign_keys=ON;
            "#,
        )
        .context("applying store pragmas")?;
        Self::init_schema(&conn).context("creating event store schema")?;
        Ok(Self { conn })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS system_metadata (
                key TEXT PRIMARY KEY,
                value TEXT
            );

            CREATE TABLE IF NOT EXISTS raw_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                producer TEXT NOT NULL,
                pid INTEGER,
                pname TEXT,
                event_type TEXT NOT NULL,
                data_json TEXT,
                mcpTag TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_raw_ts ON raw_events(ts);
            CREATE INDEX IF NOT EXISTS idx_raw_type ON raw_events(event_type);
            CREATE INDEX IF NOT EXISTS idx_raw_tag ON raw_events(mcpTag);

            CREATE TABLE IF NOT EXISTS rpc_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                raw_event_id INTEGER NOT NULL,
                direction TEXT,
                method TEXT,
                message_id TEXT,
                params TEXT,
                result TEXT,
                error TEXT,
                FOREIGN KEY (raw_event_id) REFERENCES raw_events(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_rpc_direction ON rpc_events(direction);
            CREATE INDEX IF NOT EXISTS idx_rpc_method ON rpc_events(method);

            CREATE TABLE IF NOT EXISTS file_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                raw_event_id INTEGER NOT NULL,
                operation TEXT,
                file_path TEXT,
                old_path TEXT,
                new_path TEXT,
                size INTEGER,
                FOREIGN KEY (raw_event_id) REFERENCES raw_events(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_file_path ON file_events(file_path);

            CREATE TABLE IF NOT EXISTS process_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                raw_event_id INTEGER NOT NULL,
                operation TEXT,
                pid INTEGER,
                parent_pid INTEGER,
                command_line TEXT,
                exit_code INTEGER,
                FOREIGN KEY (raw_event_id) REFERENCES raw_events(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_process_pid ON process_events(pid);

            CREATE TABLE IF NOT EXISTS engine_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                raw_event_id INTEGER NOT NULL,
                engine_name TEXT,
                serverName TEXT,
                severity TEXT,
                score REAL,
                detail TEXT,
                FOREIGN KEY (raw_event_id) REFERENCES raw_events(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_engine_name ON engine_results(engine_name);
            CREATE INDEX IF NOT EXISTS idx_engine_server ON engine_results(serverName);
            "#,
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO system_metadata (key, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION.to_string()],
        )?;
        Ok(())
    }

    /// Persist one framed envelope. One transaction: the raw row plus at
    /// most one typed row. Returns the `raw_events` id, or `None` on any
    /// failure - a bad envelope must never take the Collector down.
    pub fn save_event(&mut self, json: &str) -> Option<i64> {
        match self.try_save(json) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!("Failed to store event: {e:#}");
                None
            }
        }
    }

    fn try_save(&mut self, json: &str) -> Result<i64> {
        let envelope: Value = serde_json::from_str(json).context("parsing envelope JSON")?;
        let data = envelope.get("data").cloned().unwrap_or(Value::Null);
        let event_type = envelope
            .get("eventType")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO raw_events (ts, producer, pid, pname, event_type, data_json, mcpTag, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                envelope.get("ts").and_then(Value::as_i64).unwrap_or(0),
                envelope.get("producer").and_then(Value::as_str).unwrap_or(""),
                envelope.get("pid").and_then(Value::as_i64),
                envelope.get("pname").and_then(Value::as_str),
                event_type,
                data.to_string(),
                data.get("mcpTag").and_then(Value::as_str),
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
        let raw_id = tx.last_insert_rowid();

        match event_type.to_ascii_lowercase().as_str() {
            "mcp" | "rpc" => Self::insert_rpc(&tx, raw_id, &data)?,
            "file" => Self::insert_file(&tx, raw_id, &data)?,
            "process" => Self::insert_process(&tx, raw_id, &data)?,
            _ => {} // unknown types live in raw_events only
        }

        tx.commit()?;
        Ok(raw_id)
    }

    fn insert_rpc(tx: &rusqlite::Transaction<'_>, raw_id: i64, data: &Value) -> Result<()> {
        let message = data.get("message").cloned().unwrap_or(Value::Null);
        let direction = match data.get("task").and_then(Value::as_str) {
            Some("SEND") => "Request",
            _ => "Response",
        };
        // JSON-RPC ids may be numbers or strings; store their text form
        let message_id = message.get("id").map(|id| match id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        tx.execute(
            "INSERT INTO rpc_events (raw_event_id, direction, method, message_id, params, result, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                raw_id,
                direction,
                message.get("method").and_then(Value::as_str),
                message_id,
                message.get("params").map(|v| v.to_string()),
                message.get("result").map(|v| v.to_string()),
                message.get("error").map(|v| v.to_string()),
            ],
        )?;
        Ok(())
    }

    fn insert_file(tx: &rusqlite::Transaction<'_>, raw_id: i64, data: &Value) -> Result<()> {
        let file_path = data
            .get("filePath")
            .or_else(|| data.get("path"))
            .and_then(Value::as_str);
        tx.execute(
            "INSERT INTO file_events (raw_event_id, operation, file_path, old_path, new_path, size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                raw_id,
                data.get("task").and_then(Value::as_str),
                file_path,
                data.get("oldPath").and_then(Value::as_str),
                data.get("newPath").and_then(Value::as_str),
                data.get("size").and_then(Value::as_i64),
            ],
        )?;
        Ok(())
    }

    fn insert_process(tx: &rusqlite::Transaction<'_>, raw_id: i64, data: &Value) -> Result<()> {
        tx.execute(
            "INSERT INTO process_events (raw_event_id, operation, pid, parent_pid, command_line, exit_code)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                raw_id,
                data.get("task").and_then(Value::as_str),
                data.get("pid").and_then(Value::as_i64),
                data.get("parent").and_then(|p| p.get("pid")).and_then(Value::as_i64),
                data.get("commandLine").and_then(Value::as_str),
                data.get("exitCode").and_then(Value::as_i64),
            ],
        )?;
        Ok(())
    }

    /// Delete raw events older than `days`; CASCADE cleans the children.
    /// Returns the number of raw rows removed.
    pub fn apply_retention(&mut self, days: u32) -> Result<usize> {
        if days == 0 {
            return Ok(0);
        }
        let cutoff_ns =
            (chrono::Utc::now() - chrono::Duration::days(days as i64)).timestamp_nanos_opt();
        let Some(cutoff_ns) = cutoff_ns else {
            return Ok(0);
        };
        let deleted = self
            .conn
            .execute("DELETE FROM raw_events WHERE ts < ?1", params![cutoff_ns])?;
        Ok(deleted)
    }

    #[cfg(test)]
    fn count(&self, table: &str) -> i64 {
        self.conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .unwrap()
    }
}

/// Commands for the writer thread.
enum WriterCommand {
    Save(String),
}

/// Clone-able handle the Collector gives to each connection reader.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<WriterCommand>,
}

impl StoreHandle {
    /// Queue one envelope for persistence, in send order per caller.
    pub async fn save(&self, json: String) {
        if self.tx.send(WriterCommand::Save(json)).await.is_err() {
            tracing::warn!("Store writer gone, dropping event");
        }
    }
}

/// Spawn the dedicated writer thread. The thread exits after the last
/// handle is dropped and the queue has drained.
pub fn spawn_writer(mut store: EventStore) -> Result<(StoreHandle, JoinHandle<()>)> {
    let (tx, mut rx) = mpsc::channel::<WriterCommand>(WRITER_QUEUE);
    let handle = std::thread::Builder::new()
        .name("store-writer".into())
        .spawn(move || {
            while let Some(WriterCommand::Save(json)) = rx.blocking_recv() {
                store.save_event(&json);
            }
            tracing::debug!("Store writer thread shutting down");
        })
        .context("spawning store writer thread")?;
    Ok((StoreHandle { tx }, handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mcp_event() -> String {
        json!({
            "ts": 1_700_000_000_000_000_000i64,
            "producer": "proxy",
            "pid": 42,
            "pname": "mcp-server-github",
            "eventType": "MCP",
            "data": {
                "task": "SEND",
                "transport": "stdio",
                "src": "client",
                "dst": "server",
                "mcpTag": "Github",
                "message": {"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": "x"}}
            }
        })
        .to_string()
    }

    #[test]
    fn test_mcp_event_creates_rpc_row() {
        let mut store = EventStore::open_in_memory().unwrap();
        let raw_id = store.save_event(&mcp_event()).unwrap();

        let (direction, method, message_id, rpc_raw_id): (String, String, String, i64) = store
            .conn
            .query_row(
                "SELECT direction, method, message_id, raw_event_id FROM rpc_events",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .unwrap();
        assert_eq!(direction, "Request");
        assert_eq!(method, "tools/call");
        assert_eq!(message_id, "1");
        assert_eq!(rpc_raw_id, raw_id);

        let tag: String = store
            .conn
            .query_row("SELECT mcpTag FROM raw_events WHERE id = ?1", [raw_id], |r| r.get(0))
            .unwrap();
        assert_eq!(tag, "Github");
    }

    #[test]
    fn test_recv_maps_to_response() {
        let mut store = EventStore::open_in_memory().unwrap();
        let event = json!({
            "ts": 1, "producer": "proxy", "pid": 1, "pname": "s", "eventType": "MCP",
            "data": {"task": "RECV", "transport": "stdio", "src": "server", "dst": "client",
                     "message": {"jsonrpc": "2.0", "id": "abc", "result": {}}}
        })
        .to_string();
        store.save_event(&event).unwrap();
        let (direction, message_id): (String, String) = store
            .conn
            .query_row("SELECT direction, message_id FROM rpc_events", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(direction, "Response");
        assert_eq!(message_id, "abc");
    }

    #[test]
    fn test_file_event_row() {
        let mut store = EventStore::open_in_memory().unwrap();
        let event = json!({
            "ts": 2, "producer": "agent-core", "pid": 9, "pname": "node", "eventType": "File",
            "data": {"task": "RENAME", "pid": 9, "filePath": "/d/new.csv", "mcpTag": "Weather",
                     "oldPath": "/d/old.tmp", "newPath": "/d/new.csv"}
        })
        .to_string();
        store.save_event(&event).unwrap();
        let (op, path, old): (String, String, String) = store
            .conn
            .query_row(
                "SELECT operation, file_path, old_path FROM file_events",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(op, "RENAME");
        assert_eq!(path, "/d/new.csv");
        assert_eq!(old, "/d/old.tmp");
    }

    #[test]
    fn test_process_event_row() {
        let mut store = EventStore::open_in_memory().unwrap();
        let event = json!({
            "ts": 3, "producer": "agent-core", "pid": 9, "pname": "python", "eventType": "Process",
            "data": {"task": "Stop", "pid": 9, "pname": "python",
                     "parent": {"pid": 4, "name": "claude"},
                     "imageFilename": "/py/python", "commandLine": "python -m x",
                     "mcpTag": "Weather", "exitCode": 0}
        })
        .to_string();
        store.save_event(&event).unwrap();
        let (op, pid, ppid, exit): (String, i64, i64, i64) = store
            .conn
            .query_row(
                "SELECT operation, pid, parent_pid, exit_code FROM process_events",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .unwrap();
        assert_eq!(op, "Stop");
        assert_eq!(pid, 9);
        assert_eq!(ppid, 4);
        assert_eq!(exit, 0);
    }

    #[test]
    fn test_typing_invariant_one_child_row_per_typed_event() {
        let mut store = EventStore::open_in_memory().unwrap();
        store.save_event(&mcp_event()).unwrap();
        assert_eq!(store.count("raw_events"), 1);
        assert_eq!(store.count("rpc_events"), 1);
        assert_eq!(store.count("file_events"), 0);
        assert_eq!(store.count("process_events"), 0);
    }

    #[test]
    fn test_unknown_type_stored_raw_only() {
        let mut store = EventStore::open_in_memory().unwrap();
        let event = json!({
            "ts": 4, "producer": "proxy", "pid": 1, "pname": "x",
            "eventType": "ProxyLog", "data": {"type": "proxy_exit", "message": "exit code 0"}
        })
        .to_string();
        assert!(store.save_event(&event).is_some());
        assert_eq!(store.count("raw_events"), 1);
        assert_eq!(store.count("rpc_events"), 0);
    }

    #[test]
    fn test_event_type_dispatch_is_case_insensitive() {
        let mut store = EventStore::open_in_memory().unwrap();
        let event = json!({
            "ts": 5, "producer": "mitm", "pid": 1, "pname": "x", "eventType": "mcp",
            "data": {"task": "SEND", "message": {"method": "ping"}}
        })
        .to_string();
        store.save_event(&event).unwrap();
        assert_eq!(store.count("rpc_events"), 1);
    }

    #[test]
    fn test_null_tolerance() {
        let mut store = EventStore::open_in_memory().unwrap();
        // Minimal file event with almost everything missing
        let event = json!({"eventType": "File", "data": {}}).to_string();
        assert!(store.save_event(&event).is_some());
        // Not JSON at all
        assert!(store.save_event("not json").is_none());
        assert_eq!(store.count("raw_events"), 1);
    }

    #[test]
    fn test_cascade_delete() {
        let mut store = EventStore::open_in_memory().unwrap();
        let raw_id = store.save_event(&mcp_event()).unwrap();
        store
            .conn
            .execute("DELETE FROM raw_events WHERE id = ?1", [raw_id])
            .unwrap();
        assert_eq!(store.count("rpc_events"), 0);
    }

    #[test]
    fn test_retention_removes_old_rows() {
        let mut store = EventStore::open_in_memory().unwrap();
        // ts of 1970 is long past any retention cutoff
        let old = json!({"ts": 1, "eventType": "ProxyLog", "producer": "proxy",
                         "pid": 1, "pname": "x", "data": {"type": "t", "message": "m"}})
            .to_string();
        let fresh = json!({"ts": crate::envelope::now_ns(), "eventType": "ProxyLog",
                           "producer": "proxy", "pid": 2, "pname": "x",
                           "data": {"type": "t", "message": "m"}})
            .to_string();
        store.save_event(&old).unwrap();
        store.save_event(&fresh).unwrap();
        let removed = store.apply_retention(30).unwrap();
        assert_eq!(removed, 1);
        assert!(store.apply_retention(0).unwrap() == 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_writer_thread_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");
        let store = EventStore::open(&path).unwrap();
        let (handle, join) = spawn_writer(store).unwrap();

        for i in 0..5 {
            let event = json!({"ts": i, "eventType": "ProxyLog", "producer": "proxy",
                               "pid": i, "pname": "x", "data": {"type": "t", "message": "m"}})
                .to_string();
            handle.save(event).await;
        }
        drop(handle);
        tokio::task::spawn_blocking(move || join.join().unwrap())
            .await
            .unwrap();

        let check = Connection::open(&path).unwrap();
        let pids: Vec<i64> = check
            .prepare("SELECT pid FROM raw_events ORDER BY id")
            .unwrap()
            .query_map([], |r| r.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(pids, vec![0, 1, 2, 3, 4]);
    }
}
