// Producer-side transport - framed envelopes over loopback TCP
//
// Every producer sends envelopes as `<decimal length>\n<json>\n`. Emission
// is strictly best-effort: a dead Collector must never slow down or error
// a source's hot path. One silent retry per envelope, then drop until the
// reconnect backoff expires.

use crate::envelope::EventEnvelope;
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Encode one envelope payload into its wire frame.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 16);
    out.extend_from_slice(payload.len().to_string().as_bytes());
    out.push(b'\n');
    out.extend_from_slice(payload);
    out.push(b'\n');
    out
}

/// Best-effort framed client shared by all tasks of one producer.
pub struct EventSink {
    inner: Mutex<SinkInner>,
}

struct SinkInner {
    addr: SocketAddr,
    stream: Option<TcpStream>,
    /// Earliest next connect attempt after a failure.
    retry_after: Option<Instant>,
    dropped: u64,
}

impl EventSink {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            inner: Mutex::new(SinkInner {
                addr,
                stream: None,
                retry_after: None,
                dropped: 0,
            }),
        }
    }

    /// Send an envelope; failures are logged at debug level and swallowed.
    pub fn send(&self, envelope: &EventEnvelope) {
        let payload = match serde_json::to_vec(envelope) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Unencodable envelope ({}): {e}", envelope.data.kind());
                return;
            }
        };
        let bytes = frame(&payload);

        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(_) => return,
        };
        // First attempt on the existing connection, one retry on a fresh one
        for _ in 0..2 {
            if inner.stream.is_none() && !inner.try_connect() {
                inner.dropped += 1;
                return;
            }
            let ok = inner
                .stream
                .as_mut()
                .map(|s| s.write_all(&bytes).is_ok())
                .unwrap_or(false);
            if ok {
                return;
            }
            inner.stream = None;
        }
        inner.retry_after = Some(Instant::now() + RECONNECT_BACKOFF);
        inner.dropped += 1;
        tracing::debug!("Collector unreachable, dropping event");
    }

    /// Envelopes dropped because the Collector was unreachable.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().map(|g| g.dropped).unwrap_or(0)
    }
}

impl SinkInner {
    fn try_connect(&mut self) -> bool {
        if let Some(after) = self.retry_after {
            if Instant::now() < after {
                return false;
            }
        }
        match TcpStream::connect_timeout(&self.addr, CONNECT_TIMEOUT) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                self.stream = Some(stream);
                self.retry_after = None;
                true
            }
            Err(e) => {
                tracing::debug!("Collector connect to {} failed: {e}", self.addr);
                self.retry_after = Some(Instant::now() + RECONNECT_BACKOFF);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EventData, Producer, ProxyLogData};
    use std::io::Read;
    use std::net::TcpListener;

    fn test_envelope() -> EventEnvelope {
        EventEnvelope::new(
            Producer::Proxy,
            1,
            "t",
            EventData::ProxyLog(ProxyLogData {
                kind: "proxy_exit".into(),
                message: "exit code 0".into(),
            }),
        )
    }

    #[test]
    fn test_frame_layout() {
        let framed = frame(b"{\"a\":1}");
        assert_eq!(framed, b"7\n{\"a\":1}\n");
    }

    #[test]
    fn test_send_produces_decodable_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let sink = EventSink::new(addr);

        let envelope = test_envelope();
        sink.send(&envelope);

        let (mut conn, _) = listener.accept().unwrap();
        let mut buf = Vec::new();
        conn.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut chunk = [0u8; 4096];
        while let Ok(n) = conn.read(&mut chunk) {
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if buf.ends_with(b"\n") && buf.iter().filter(|&&b| b == b'\n').count() >= 2 {
                break;
            }
        }

        let newline = buf.iter().position(|&b| b == b'\n').unwrap();
        let len: usize = std::str::from_utf8(&buf[..newline]).unwrap().parse().unwrap();
        let payload = &buf[newline + 1..newline + 1 + len];
        let decoded: EventEnvelope = serde_json::from_slice(payload).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(buf[newline + 1 + len], b'\n');
        assert_eq!(sink.dropped(), 0);
    }

    #[test]
    fn test_send_to_dead_collector_drops_silently() {
        // Bind then drop to get a port with nothing listening
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let sink = EventSink::new(addr);
        let envelope = test_envelope();
        sink.send(&envelope);
        sink.send(&envelope);
        assert!(sink.dropped() >= 2);
    }
}
