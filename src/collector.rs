// Collector server - the single fan-in point for all producers
//
// Listens on loopback, accepts any number of producer connections and
// spawns a reader task per connection. Each frame is a decimal length
// line followed by exactly that many payload bytes and one trailing
// newline. The collector forwards payloads to the store without
// interpreting them beyond frame boundaries; a bad frame costs that
// frame, never the connection, and a bad connection never the server.

use crate::store::StoreHandle;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// Upper bound on a single frame; anything bigger is a corrupt length line.
const MAX_FRAME: usize = 16 * 1024 * 1024;

pub struct CollectorServer {
    listener: TcpListener,
    store: StoreHandle,
}

impl CollectorServer {
    /// Bind the listener. Failing to bind is an operator error: without a
    /// collector nothing downstream can work.
    pub async fn bind(addr: SocketAddr, store: StoreHandle) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding collector on {addr}"))?;
        tracing::info!("Collector listening on {}", listener.local_addr()?);
        Ok(Self { listener, store })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop; runs until the stop signal flips.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((conn, peer)) => {
                            tracing::debug!("Producer connected from {peer}");
                            let store = self.store.clone();
                            tokio::spawn(async move {
                                if let Err(e) = read_frames(conn, store).await {
                                    tracing::debug!("Producer {peer} dropped: {e:#}");
                                }
                            });
                        }
                        Err(e) => tracing::warn!("Accept failed: {e}"),
                    }
                }
                changed = stop.changed() => {
                    // A dropped sender counts as a stop signal
                    if changed.is_err() || *stop.borrow() {
                        tracing::debug!("Collector accept loop stopping");
                        return;
                    }
                }
            }
        }
    }
}

/// Read framed envelopes until EOF. Within one connection, envelopes reach
/// the store in send order.
async fn read_frames(conn: TcpStream, store: StoreHandle) -> Result<()> {
    let mut reader = BufReader::new(conn);
    let mut length_line = String::new();

    loop {
        length_line.clear();
        let read = reader.read_line(&mut length_line).await?;
        if read == 0 {
            return Ok(()); // producer went away
        }

        let length: usize = match length_line.trim().parse() {
            Ok(n) if n <= MAX_FRAME => n,
            _ => {
                // Malformed length line: read_line already consumed up to
                // the next newline, so the stream is resynchronized.
                tracing::warn!("Malformed frame length {:?}, skipping", length_line.trim());
                continue;
            }
        };

        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await?;
        let mut newline = [0u8; 1];
        reader.read_exact(&mut newline).await?;

        match String::from_utf8(payload) {
            Ok(json) => store.save(json).await,
            Err(e) => tracing::warn!("Dropping non-UTF-8 frame: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{spawn_writer, EventStore};
    use crate::transport::frame;
    use rusqlite::Connection;
    use serde_json::json;
    use std::io::Write;
    use std::time::Duration;

    async fn collector_fixture(
        dir: &tempfile::TempDir,
    ) -> (SocketAddr, std::path::PathBuf, watch::Sender<bool>) {
        let db_path = dir.path().join("events.db");
        let store = EventStore::open(&db_path).unwrap();
        let (handle, _join) = spawn_writer(store).unwrap();
        let server = CollectorServer::bind("127.0.0.1:0".parse().unwrap(), handle)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(server.run(stop_rx));
        (addr, db_path, stop_tx)
    }

    fn envelope_json(pid: u32) -> String {
        json!({
            "ts": pid, "producer": "proxy", "pid": pid, "pname": "t",
            "eventType": "ProxyLog", "data": {"type": "t", "message": "m"}
        })
        .to_string()
    }

    async fn wait_for_rows(db_path: &std::path::Path, want: i64) -> Vec<(i64, i64)> {
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let conn = Connection::open(db_path).unwrap();
            let rows: Vec<(i64, i64)> = conn
                .prepare("SELECT id, pid FROM raw_events ORDER BY id")
                .unwrap()
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
                .unwrap()
                .collect::<std::result::Result<_, _>>()
                .unwrap();
            if rows.len() as i64 >= want {
                return rows;
            }
        }
        panic!("rows never arrived");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_two_frames_two_rows_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, db_path, _stop) = collector_fixture(&dir).await;

        let mut conn = std::net::TcpStream::connect(addr).unwrap();
        conn.write_all(&frame(envelope_json(1).as_bytes())).unwrap();
        conn.write_all(&frame(envelope_json(2).as_bytes())).unwrap();

        let rows = wait_for_rows(&db_path, 2).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].1, 1);
        assert_eq!(rows[1].1, 2);
        // Back-to-back frames land as consecutive rows
        assert_eq!(rows[1].0, rows[0].0 + 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mcp_envelope_lands_in_rpc_table() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, db_path, _stop) = collector_fixture(&dir).await;

        // The stdio proxy path end to end: framed client, collector, store
        let sink = crate::transport::EventSink::new(addr);
        let envelope = crate::envelope::EventEnvelope::new(
            crate::envelope::Producer::Proxy,
            42,
            "mcp-server-github",
            crate::envelope::EventData::Mcp(crate::envelope::McpData {
                task: crate::envelope::McpTask::Send,
                transport: "stdio".into(),
                src: "client".into(),
                dst: "server".into(),
                message: json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call",
                                "params": {"name": "search"}}),
                mcp_tag: Some("Github".into()),
            }),
        );
        sink.send(&envelope);

        wait_for_rows(&db_path, 1).await;
        let conn = Connection::open(&db_path).unwrap();
        let (direction, method, message_id): (String, String, String) = conn
            .query_row(
                "SELECT direction, method, message_id FROM rpc_events",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(direction, "Request");
        assert_eq!(method, "tools/call");
        assert_eq!(message_id, "1");
        let tag: String = conn
            .query_row("SELECT mcpTag FROM raw_events", [], |r| r.get(0))
            .unwrap();
        assert_eq!(tag, "Github");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_malformed_length_resyncs() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, db_path, _stop) = collector_fixture(&dir).await;

        let mut conn = std::net::TcpStream::connect(addr).unwrap();
        conn.write_all(b"not-a-number\n").unwrap();
        conn.write_all(&frame(envelope_json(7).as_bytes())).unwrap();

        let rows = wait_for_rows(&db_path, 1).await;
        assert_eq!(rows[0].1, 7);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_multiple_producers() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, db_path, _stop) = collector_fixture(&dir).await;

        let mut a = std::net::TcpStream::connect(addr).unwrap();
        let mut b = std::net::TcpStream::connect(addr).unwrap();
        a.write_all(&frame(envelope_json(10).as_bytes())).unwrap();
        b.write_all(&frame(envelope_json(20).as_bytes())).unwrap();

        let rows = wait_for_rows(&db_path, 2).await;
        let pids: Vec<i64> = rows.iter().map(|r| r.1).collect();
        assert!(pids.contains(&10) && pids.contains(&20));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_connection_loss_leaves_server_up() {
        let dir = tempfile::tempdir().unwrap();
        let (addr, db_path, _stop) = collector_fixture(&dir).await;

        {
            let mut doomed = std::net::TcpStream::connect(addr).unwrap();
            // Half a frame, then hang up
            doomed.write_all(b"100\npartial").unwrap();
        }
        let mut healthy = std::net::TcpStream::connect(addr).unwrap();
        healthy
            .write_all(&frame(envelope_json(3).as_bytes()))
            .unwrap();

        let rows = wait_for_rows(&db_path, 1).await;
        assert_eq!(rows[0].1, 3);
    }
}
