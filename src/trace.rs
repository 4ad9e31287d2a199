// Trace plumbing - the boundary to the OS trace facility
//
// The kernel source never talks to a platform API directly; it pulls
// `TraceEvent`s from a `TraceSession`. Two sessions ship today: a /proc
// polling provider that covers process start/stop on Linux, and a replay
// session that feeds a synthetic or recorded event sequence through the
// whole pipeline (the demo mode). Kernel traces are lossy by design, so
// nothing downstream may assume completeness.

use crate::envelope::{FileTask, NetTask};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Raw event from the trace facility, before scoping/filtering/tagging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEvent {
    ProcessStart {
        pid: u32,
        parent_pid: u32,
        image: String,
        cmdline: String,
        ts: i64,
    },
    ProcessStop {
        pid: u32,
        exit_code: Option<i32>,
        ts: i64,
    },
    File {
        pid: u32,
        op: FileTask,
        path: String,
        size: Option<u64>,
        ts: i64,
    },
    /// Rename announcement carrying the pre-rename path and a correlation key.
    FileRenameStart {
        pid: u32,
        file_key: u64,
        path: String,
        ts: i64,
    },
    /// Rename completion; the old path is recovered via `file_key`.
    FileRenameEnd {
        pid: u32,
        file_key: u64,
        new_path: String,
        ts: i64,
    },
    Network {
        pid: u32,
        op: NetTask,
        src: String,
        sport: u16,
        dst: String,
        dport: u16,
        bytes: u64,
        ts: i64,
    },
}

/// Which event classes a session can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Process,
    File,
    Network,
}

/// Idempotent stop handle, shared with the Supervisor.
#[derive(Clone)]
pub struct TraceStop(Arc<AtomicBool>);

impl TraceStop {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

impl Default for TraceStop {
    fn default() -> Self {
        Self::new()
    }
}

/// An attached trace session. `next_event` is a blocking pull returning
/// `None` once the session has ended (stopped, drained, or lost).
pub trait TraceSession: Send {
    fn next_event(&mut self) -> Option<TraceEvent>;
    fn providers(&self) -> &[ProviderKind];
    fn stopper(&self) -> TraceStop;
}

// ─────────────────────────────────────────────────────────────────────────
// Replay session (demo mode / recorded traces)
// ─────────────────────────────────────────────────────────────────────────

/// Feeds a fixed event sequence, optionally paced. Backs `--demo` and
/// `--replay <file>` and every pipeline test.
pub struct ReplaySession {
    events: VecDeque<TraceEvent>,
    pace: Duration,
    stop: TraceStop,
    providers: Vec<ProviderKind>,
}

impl ReplaySession {
    pub fn new(events: Vec<TraceEvent>, pace: Duration) -> Self {
        Self {
            events: events.into(),
            pace,
            stop: TraceStop::new(),
            providers: vec![
                ProviderKind::Process,
                ProviderKind::File,
                ProviderKind::Network,
            ],
        }
    }

    /// One JSON trace event per line.
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        use anyhow::Context;
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading trace replay {}", path.display()))?;
        let mut events = Vec::new();
        for (no, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let event: TraceEvent = serde_json::from_str(line)
                .with_context(|| format!("{}:{}", path.display(), no + 1))?;
            events.push(event);
        }
        tracing::info!("Replaying {} trace events from {}", events.len(), path.display());
        Ok(Self::new(events, Duration::from_millis(2)))
    }

    /// Synthetic session showing the full event surface: the host starts,
    /// spawns two MCP servers, they log, read, rename and talk TCP, then
    /// everything shuts down. Bursts are included so the dedup window has
    /// something to collapse.
    pub fn demo(target_image: &str) -> Self {
        let ts = crate::envelope::now_ns;
        let host = format!("C:\\Program Files\\Host\\{target_image}");
        let mut events = vec![
            TraceEvent::ProcessStart {
                pid: 1000,
                parent_pid: 1,
                image: host.clone(),
                cmdline: host.clone(),
                ts: ts(),
            },
            TraceEvent::ProcessStart {
                pid: 1100,
                parent_pid: 1000,
                image: "C:\\nodejs\\node.exe".into(),
                cmdline: "node.exe C:\\npm\\@modelcontextprotocol\\server-memory\\dist\\index.js"
                    .into(),
                ts: ts(),
            },
            TraceEvent::ProcessStart {
                pid: 1200,
                parent_pid: 1000,
                image: "C:\\python\\python.exe".into(),
                cmdline: "python.exe -m mcp_server_weather".into(),
                ts: ts(),
            },
            TraceEvent::File {
                pid: 1100,
                op: FileTask::Write,
                path: "C:\\Users\\demo\\AppData\\Roaming\\Claude\\logs\\mcp-server-memory.log"
                    .into(),
                size: Some(512),
                ts: ts(),
            },
            TraceEvent::FileRenameStart {
                pid: 1200,
                file_key: 42,
                path: "C:\\Users\\demo\\Documents\\forecast.tmp".into(),
                ts: ts(),
            },
            TraceEvent::FileRenameEnd {
                pid: 1200,
                file_key: 42,
                new_path: "C:\\Users\\demo\\Documents\\forecast.csv".into(),
                ts: ts(),
            },
            TraceEvent::Network {
                pid: 1200,
                op: NetTask::Connect,
                src: "127.0.0.1".into(),
                sport: 51000,
                dst: "93.184.216.34".into(),
                dport: 443,
                bytes: 0,
                ts: ts(),
            },
            TraceEvent::Network {
                pid: 1200,
                op: NetTask::Send,
                src: "127.0.0.1".into(),
                sport: 51000,
                dst: "93.184.216.34".into(),
                dport: 443,
                bytes: 882,
                ts: ts(),
            },
        ];
        // A read burst against one file, for the dedup window
        for _ in 0..8 {
            events.push(TraceEvent::File {
                pid: 1100,
                op: FileTask::Read,
                path: "C:\\Users\\demo\\Documents\\inventory.md".into(),
                size: Some(4096),
                ts: ts(),
            });
        }
        events.push(TraceEvent::ProcessStop {
            pid: 1200,
            exit_code: Some(0),
            ts: ts(),
        });
        events.push(TraceEvent::ProcessStop {
            pid: 1100,
            exit_code: Some(0),
            ts: ts(),
        });
        Self::new(events, Duration::from_millis(150))
    }
}

impl TraceSession for ReplaySession {
    fn next_event(&mut self) -> Option<TraceEvent> {
        if self.stop.is_stopped() {
            return None;
        }
        let event = self.events.pop_front()?;
        if !self.pace.is_zero() {
            std::thread::sleep(self.pace);
        }
        Some(event)
    }

    fn providers(&self) -> &[ProviderKind] {
        &self.providers
    }

    fn stopper(&self) -> TraceStop {
        self.stop.clone()
    }
}

// ─────────────────────────────────────────────────────────────────────────
// /proc polling session (Linux)
// ─────────────────────────────────────────────────────────────────────────

/// Process provider backed by periodic /proc scans.
///
/// Detects starts and stops by diffing successive scans; file and network
/// providers are not available from /proc polling, which the Supervisor
/// reports as a degradation rather than an error.
pub struct ProcPollSession {
    rx: mpsc::Receiver<TraceEvent>,
    stop: TraceStop,
    handle: Option<JoinHandle<()>>,
    providers: Vec<ProviderKind>,
}

impl ProcPollSession {
    pub fn start(poll_interval: Duration) -> anyhow::Result<Self> {
        if !cfg!(target_os = "linux") {
            anyhow::bail!("/proc polling is only available on Linux");
        }
        let (tx, rx) = mpsc::channel();
        let stop = TraceStop::new();
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("proc-poll".into())
            .spawn(move || poll_loop(tx, thread_stop, poll_interval))?;
        Ok(Self {
            rx,
            stop,
            handle: Some(handle),
            providers: vec![ProviderKind::Process],
        })
    }
}

impl TraceSession for ProcPollSession {
    fn next_event(&mut self) -> Option<TraceEvent> {
        loop {
            if self.stop.is_stopped() {
                return None;
            }
            match self.rx.recv_timeout(Duration::from_millis(200)) {
                Ok(event) => return Some(event),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn providers(&self) -> &[ProviderKind] {
        &self.providers
    }

    fn stopper(&self) -> TraceStop {
        self.stop.clone()
    }
}

impl Drop for ProcPollSession {
    fn drop(&mut self) {
        self.stop.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Debug, Clone)]
struct ScannedProc {
    parent_pid: u32,
    image: String,
    cmdline: String,
}

fn poll_loop(tx: mpsc::Sender<TraceEvent>, stop: TraceStop, interval: Duration) {
    let mut known: HashMap<u32, ScannedProc> = HashMap::new();
    while !stop.is_stopped() {
        let current = scan_proc();

        // Starts, parents before children so graph insertion can link them
        let new_pids: Vec<u32> = current
            .keys()
            .filter(|pid| !known.contains_key(pid))
            .copied()
            .collect();
        for pid in in_spawn_order(&new_pids, &current) {
            let info = &current[&pid];
            let event = TraceEvent::ProcessStart {
                pid,
                parent_pid: info.parent_pid,
                image: info.image.clone(),
                cmdline: info.cmdline.clone(),
                ts: crate::envelope::now_ns(),
            };
            if tx.send(event).is_err() {
                return;
            }
        }

        // Stops
        let gone: Vec<u32> = known
            .keys()
            .filter(|pid| !current.contains_key(pid))
            .copied()
            .collect();
        for pid in gone {
            let event = TraceEvent::ProcessStop {
                pid,
                exit_code: None,
                ts: crate::envelope::now_ns(),
            };
            if tx.send(event).is_err() {
                return;
            }
        }

        known = current;
        std::thread::sleep(interval);
    }
}

/// Order new PIDs so that any parent also appearing in the batch is
/// announced first.
fn in_spawn_order(new_pids: &[u32], procs: &HashMap<u32, ScannedProc>) -> Vec<u32> {
    let new_set: HashSet<u32> = new_pids.iter().copied().collect();
    let mut emitted: HashSet<u32> = HashSet::new();
    let mut ordered = Vec::with_capacity(new_pids.len());
    let mut pending: Vec<u32> = {
        let mut v = new_pids.to_vec();
        v.sort_unstable();
        v
    };

    while !pending.is_empty() {
        let before = ordered.len();
        pending.retain(|&pid| {
            let parent = procs.get(&pid).map(|p| p.parent_pid).unwrap_or(0);
            if new_set.contains(&parent) && !emitted.contains(&parent) {
                true // parent not announced yet, keep waiting
            } else {
                emitted.insert(pid);
                ordered.push(pid);
                false
            }
        });
        if ordered.len() == before {
            // Parent cycle or missing entry: flush the rest as-is
            ordered.extend(pending.drain(..));
        }
    }
    ordered
}

fn scan_proc() -> HashMap<u32, ScannedProc> {
    let mut out = HashMap::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return out;
    };
    for entry in entries.flatten() {
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|n| n.parse::<u32>().ok())
        else {
            continue;
        };
        let base = entry.path();
        let Ok(stat) = std::fs::read_to_string(base.join("stat")) else {
            continue; // raced with exit
        };
        let Some(parent_pid) = parse_stat_ppid(&stat) else {
            continue;
        };
        let cmdline = std::fs::read(base.join("cmdline"))
            .map(|bytes| {
                String::from_utf8_lossy(&bytes)
                    .split('\0')
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        let image = std::fs::read_link(base.join("exe"))
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| {
                // Kernel threads and permission misses fall back to comm
                std::fs::read_to_string(base.join("comm"))
                    .map(|s| s.trim().to_string())
                    .unwrap_or_default()
            });
        out.insert(
            pid,
            ScannedProc {
                parent_pid,
                image,
                cmdline,
            },
        );
    }
    out
}

/// Field 4 of /proc/<pid>/stat, after the parenthesised comm which may
/// itself contain spaces and parentheses.
fn parse_stat_ppid(stat: &str) -> Option<u32> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.split_whitespace().nth(1)?.parse().ok()
}
