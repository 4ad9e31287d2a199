// Proxy source - the stdio interposer wrapped around one MCP server
//
// The host launches `mcpspy proxy -- <real server command>` in place of
// the server itself. We spawn the real server with piped stdio and run
// three forwarding tasks: client stdin to server, server stdout to
// client, server stderr to the log. Any forwarded line that parses as a
// JSON object is mirrored to the Collector as an MCP envelope; the
// forwarded bytes themselves are never touched, and a dead Collector
// never stalls or corrupts the pass-through stream.

use crate::envelope::{EventData, EventEnvelope, McpData, McpTask, Producer, ProxyLogData};
use crate::registry::capitalize;
use crate::transport::EventSink;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// Wait this long after the client closes stdin before force-killing.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Stored stderr lines are capped; servers can be chatty.
const STDERR_CAP: usize = 2000;

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Explicit MCP tag; derived from the command when absent.
    pub name: Option<String>,
    pub collector: SocketAddr,
    /// Program followed by its arguments.
    pub command: Vec<String>,
}

/// Shared emission context for the forwarding tasks.
#[derive(Clone)]
struct EmitCtx {
    sink: Arc<EventSink>,
    pid: u32,
    pname: String,
    tag: Option<String>,
}

impl EmitCtx {
    fn emit(&self, data: EventData) {
        let envelope = EventEnvelope::new(Producer::Proxy, self.pid, self.pname.clone(), data);
        self.sink.send(&envelope);
    }
}

/// Run the interposer to completion. Returns the child's exit code so the
/// proxy is transparent to the host's process management too.
pub async fn run(opts: ProxyOptions) -> Result<i32> {
    let (program, args) = opts
        .command
        .split_first()
        .context("proxy needs a command to launch")?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawning MCP server '{program}'"))?;

    let pid = child.id().unwrap_or(0);
    let pname = program
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(program)
        .to_string();
    let tag = opts
        .name
        .clone()
        .or_else(|| Some(capitalize(pname.trim_end_matches(".exe"))));
    tracing::info!("Interposing {pname} (pid {pid}), tag {:?}", tag);

    let ctx = EmitCtx {
        sink: Arc::new(EventSink::new(opts.collector)),
        pid,
        pname,
        tag,
    };

    let child_stdin = child.stdin.take().context("child stdin not piped")?;
    let child_stdout = child.stdout.take().context("child stdout not piped")?;
    let child_stderr = child.stderr.take().context("child stderr not piped")?;

    // client -> server; finishing this task drops (closes) the child's stdin
    let stdin_ctx = ctx.clone();
    let mut stdin_task = tokio::spawn(async move {
        let reader = BufReader::new(tokio::io::stdin());
        if let Err(e) = pump(reader, child_stdin, McpTask::Send, stdin_ctx).await {
            tracing::debug!("stdin forwarding ended: {e:#}");
        }
    });

    // server -> client
    let stdout_ctx = ctx.clone();
    let stdout_task = tokio::spawn(async move {
        let reader = BufReader::new(child_stdout);
        if let Err(e) = pump(reader, tokio::io::stdout(), McpTask::Recv, stdout_ctx).await {
            tracing::debug!("stdout forwarding ended: {e:#}");
        }
    });

    // server stderr -> log
    let stderr_ctx = ctx.clone();
    let stderr_task = tokio::spawn(async move {
        drain_stderr(BufReader::new(child_stderr), stderr_ctx).await;
    });

    // Wait for the child to exit. If the client goes away first (stdin
    // task finished, which closed the child's stdin), give the server a
    // grace period before forcing the issue.
    let mut stdin_open = true;
    let status = loop {
        if stdin_open {
            tokio::select! {
                status = child.wait() => break status?,
                _ = &mut stdin_task => {
                    stdin_open = false;
                }
            }
        } else {
            match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                Ok(status) => break status?,
                Err(_) => {
                    tracing::warn!("Server ignored stdin close, killing");
                    child.start_kill().ok();
                    break child.wait().await?;
                }
            }
        }
    };

    // Child is gone; its pipes hit EOF and the readers drain naturally.
    let _ = stdout_task.await;
    let _ = stderr_task.await;
    stdin_task.abort();

    let code = status.code().unwrap_or(-1);
    ctx.emit(EventData::ProxyLog(ProxyLogData {
        kind: "proxy_exit".into(),
        message: format!("exit code {code}"),
    }));
    tracing::info!("MCP server exited with code {code}");
    Ok(code)
}

/// Forward lines byte-for-byte, mirroring JSON objects to the Collector.
async fn pump<R, W>(mut from: R, mut to: W, direction: McpTask, ctx: EmitCtx) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = from.read_until(b'\n', &mut line).await?;
        if read == 0 {
            return Ok(()); // EOF; dropping `to` closes the far end
        }
        // Pass-through first: emission must never delay or alter the bytes
        to.write_all(&line).await?;
        to.flush().await?;

        if let Some(data) = mirror_line(&line, direction, &ctx.tag) {
            ctx.emit(EventData::Mcp(data));
        }
    }
}

/// A forwarded line becomes an MCP event iff it is a JSON object.
fn mirror_line(line: &[u8], direction: McpTask, tag: &Option<String>) -> Option<McpData> {
    let text = std::str::from_utf8(line).ok()?.trim();
    if !text.starts_with('{') {
        return None;
    }
    let message: serde_json::Value = serde_json::from_str(text).ok()?;
    if !message.is_object() {
        return None;
    }
    let (src, dst) = match direction {
        McpTask::Send => ("client", "server"),
        McpTask::Recv => ("server", "client"),
    };
    Some(McpData {
        task: direction,
        transport: "stdio".into(),
        src: src.into(),
        dst: dst.into(),
        message,
        mcp_tag: tag.clone(),
    })
}

async fn drain_stderr<R>(mut from: R, ctx: EmitCtx)
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        match from.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if text.is_empty() {
                    continue;
                }
                tracing::warn!(target: "mcpspy::server", "{}", text);
                ctx.emit(EventData::ProxyLog(ProxyLogData {
                    kind: "server_stderr".into(),
                    message: cap_stderr_line(text, STDERR_CAP).to_string(),
                }));
            }
        }
    }
}

/// Cap a stderr line at a byte budget without splitting a UTF-8 character.
fn cap_stderr_line(line: &str, max_bytes: usize) -> &str {
    if line.len() <= max_bytes {
        return line;
    }
    let mut end = max_bytes;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dead_addr() -> SocketAddr {
        // Bind then drop, so nothing listens there
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    }

    fn ctx() -> EmitCtx {
        EmitCtx {
            sink: Arc::new(EventSink::new(dead_addr())),
            pid: 1,
            pname: "test".into(),
            tag: Some("Test".into()),
        }
    }

    #[test]
    fn test_mirror_line_json_object() {
        let line = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/call\"}\n";
        let data = mirror_line(line, McpTask::Send, &Some("Github".into())).unwrap();
        assert_eq!(data.task, McpTask::Send);
        assert_eq!(data.src, "client");
        assert_eq!(data.dst, "server");
        assert_eq!(data.transport, "stdio");
        assert_eq!(data.message["method"], "tools/call");
        assert_eq!(data.mcp_tag.as_deref(), Some("Github"));
    }

    #[test]
    fn test_mirror_line_recv_swaps_endpoints() {
        let line = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n";
        let data = mirror_line(line, McpTask::Recv, &None).unwrap();
        assert_eq!(data.src, "server");
        assert_eq!(data.dst, "client");
    }

    #[test]
    fn test_cap_stderr_line_respects_char_boundaries() {
        assert_eq!(cap_stderr_line("short", 100), "short");
        assert_eq!(cap_stderr_line("hello world", 5), "hello");
        // Three-byte characters: a cap mid-character backs up to the
        // previous boundary
        let capped = cap_stderr_line("日本語", 4);
        assert_eq!(capped, "日");
        assert!(capped.is_char_boundary(capped.len()));
    }

    #[test]
    fn test_mirror_line_rejects_non_objects() {
        assert!(mirror_line(b"plain log line\n", McpTask::Send, &None).is_none());
        assert!(mirror_line(b"[1,2,3]\n", McpTask::Send, &None).is_none());
        assert!(mirror_line(b"{broken json\n", McpTask::Send, &None).is_none());
        assert!(mirror_line(b"\n", McpTask::Send, &None).is_none());
        assert!(mirror_line(&[0xff, 0xfe, b'\n'], McpTask::Send, &None).is_none());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_passthrough_unchanged_with_dead_collector() {
        // cat echoes stdin; with the Collector down, bytes must still
        // arrive unmodified on the other side.
        let mut child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let child_stdin = child.stdin.take().unwrap();
        let child_stdout = child.stdout.take().unwrap();

        let input: &[u8] =
            b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/call\"}\nnot json at all\n{\"id\":2}\n";

        pump(BufReader::new(input), child_stdin, McpTask::Send, ctx())
            .await
            .unwrap();
        // pump dropped child stdin on EOF, so cat exits after echoing

        let mut out: Vec<u8> = Vec::new();
        pump(BufReader::new(child_stdout), &mut out, McpTask::Recv, ctx())
            .await
            .unwrap();
        child.wait().await.unwrap();

        assert_eq!(out, input);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_reports_child_exit_code() {
        let opts = ProxyOptions {
            name: Some("True".into()),
            collector: dead_addr(),
            command: vec!["true".into()],
        };
        // `true` exits immediately; our stdin stays open, so the child
        // wait branch fires first.
        let code = run(opts).await.unwrap();
        assert_eq!(code, 0);
    }
}
