// Network proxy source - ingests MCP events from the HTTP(S) interceptor
//
// A transparent interceptor (mitm addon) watches HTTP MCP traffic and
// emits one JSON event per line on a loopback connection to us. The
// addon sees sockets, not processes, so each event is re-keyed here with
// the owning PID by querying the local TCP table. A failed lookup
// degrades to pid 0 / "unknown" rather than dropping the event.

use crate::envelope::{EventData, EventEnvelope, McpData, McpTask, Producer};
use crate::transport::EventSink;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// One line from the interceptor addon.
#[derive(Debug, Deserialize)]
struct AddonEvent {
    task: McpTask,
    /// Client endpoint as `ip:port`; local when the client is local.
    src: String,
    dst: String,
    message: serde_json::Value,
    #[serde(rename = "mcpTag")]
    mcp_tag: Option<String>,
}

pub struct NetProxySource {
    listen: SocketAddr,
    sink: Arc<EventSink>,
}

impl NetProxySource {
    pub fn new(listen: SocketAddr, sink: Arc<EventSink>) -> Self {
        Self { listen, sink }
    }

    pub async fn run(self, mut stop: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(self.listen)
            .await
            .with_context(|| format!("binding interceptor feed on {}", self.listen))?;
        tracing::info!("Interceptor feed listening on {}", listener.local_addr()?);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let Ok((conn, peer)) = accepted else { continue };
                    tracing::debug!("Interceptor connected from {peer}");
                    let sink = self.sink.clone();
                    tokio::spawn(async move {
                        let mut lines = tokio::io::BufReader::new(conn).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            handle_line(&line, &sink);
                        }
                    });
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn handle_line(line: &str, sink: &EventSink) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match serde_json::from_str::<AddonEvent>(line) {
        Ok(event) => sink.send(&to_envelope(event, &pid_for_endpoint)),
        Err(e) => tracing::debug!("Unparseable interceptor line: {e}"),
    }
}

/// Build the mitm envelope, re-keyed with the PID owning the local
/// endpoint. The lookup is injected so tests need no live sockets.
fn to_envelope(
    event: AddonEvent,
    lookup: &dyn Fn(&str) -> Option<(u32, String)>,
) -> EventEnvelope {
    // The local endpoint is the client side: src on SEND, dst on RECV.
    let local = match event.task {
        McpTask::Send => event.src.as_str(),
        McpTask::Recv => event.dst.as_str(),
    };
    let (pid, pname) = lookup(local).unwrap_or((0, "unknown".to_string()));
    let (src_role, dst_role) = match event.task {
        McpTask::Send => ("client", "server"),
        McpTask::Recv => ("server", "client"),
    };
    EventEnvelope::new(
        Producer::Mitm,
        pid,
        pname,
        EventData::Mcp(McpData {
            task: event.task,
            transport: "tcp".into(),
            src: src_role.into(),
            dst: dst_role.into(),
            message: event.message,
            mcp_tag: event.mcp_tag,
        }),
    )
}

/// PID and process name owning a local `ip:port` TCP endpoint.
fn pid_for_endpoint(endpoint: &str) -> Option<(u32, String)> {
    let port: u16 = endpoint.rsplit(':').next()?.parse().ok()?;
    let inode = ["/proc/net/tcp", "/proc/net/tcp6"]
        .iter()
        .filter_map(|table| std::fs::read_to_string(table).ok())
        .find_map(|content| socket_inode_for_port(&content, port))?;
    let pid = pid_for_socket_inode(inode)?;
    let name = std::fs::read_to_string(format!("/proc/{pid}/comm"))
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    Some((pid, name))
}

/// Scan a /proc/net/tcp-format table for a socket bound to `port`.
fn socket_inode_for_port(table: &str, port: u16) -> Option<u64> {
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }
        // local_address is hex "IP:PORT"
        let local_port = fields[1]
            .rsplit(':')
            .next()
            .and_then(|p| u16::from_str_radix(p, 16).ok());
        if local_port == Some(port) {
            return fields[9].parse().ok();
        }
    }
    None
}

/// Walk /proc/<pid>/fd looking for `socket:[inode]`.
fn pid_for_socket_inode(inode: u64) -> Option<u32> {
    let wanted = format!("socket:[{inode}]");
    let proc_entries = std::fs::read_dir("/proc").ok()?;
    for entry in proc_entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue; // not ours to inspect
        };
        for fd in fds.flatten() {
            if let Ok(target) = std::fs::read_link(fd.path()) {
                if target.to_string_lossy() == wanted {
                    return Some(pid);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn addon_event(task: &str) -> AddonEvent {
        serde_json::from_value(json!({
            "task": task,
            "src": "127.0.0.1:52344",
            "dst": "127.0.0.1:3001",
            "message": {"jsonrpc": "2.0", "id": 4, "method": "tools/list"},
            "mcpTag": "Fetch"
        }))
        .unwrap()
    }

    #[test]
    fn test_rekeys_with_looked_up_pid() {
        let env = to_envelope(addon_event("SEND"), &|endpoint| {
            assert_eq!(endpoint, "127.0.0.1:52344");
            Some((4242, "claude".to_string()))
        });
        assert_eq!(env.producer, Producer::Mitm);
        assert_eq!(env.pid, 4242);
        assert_eq!(env.pname, "claude");
        match env.data {
            EventData::Mcp(m) => {
                assert_eq!(m.transport, "tcp");
                assert_eq!(m.src, "client");
                assert_eq!(m.mcp_tag.as_deref(), Some("Fetch"));
            }
            other => panic!("expected Mcp, got {other:?}"),
        }
    }

    #[test]
    fn test_recv_looks_up_destination_endpoint() {
        let env = to_envelope(addon_event("RECV"), &|endpoint| {
            assert_eq!(endpoint, "127.0.0.1:3001");
            Some((7, "node".to_string()))
        });
        assert_eq!(env.pid, 7);
        match env.data {
            EventData::Mcp(m) => assert_eq!(m.src, "server"),
            other => panic!("expected Mcp, got {other:?}"),
        }
    }

    #[test]
    fn test_lookup_miss_degrades_to_unknown() {
        let env = to_envelope(addon_event("SEND"), &|_| None);
        assert_eq!(env.pid, 0);
        assert_eq!(env.pname, "unknown");
    }

    #[test]
    fn test_socket_inode_for_port() {
        // Trimmed /proc/net/tcp sample: port 0xCE4A = 52810, inode 123456
        let table = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:CE4A 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 123456 1 0000000000000000 100 0 0 10 0
   1: 00000000:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 654321 1 0000000000000000 100 0 0 10 0
";
        assert_eq!(socket_inode_for_port(table, 52810), Some(123456));
        assert_eq!(socket_inode_for_port(table, 8080), Some(654321));
        assert_eq!(socket_inode_for_port(table, 1), None);
    }
}
