// Kernel source - turns raw trace events into tagged envelopes
//
// The only writer of the process graph. Every trace event is scoped to
// the tracked tree, noise-filtered (file I/O), tagged through the
// resolver, and normalized into an envelope. Kernel traces are lossy and
// occasionally malformed; a bad event costs a warning, never the source.

use crate::envelope::{
    EventData, EventEnvelope, FileData, FileTask, NetworkData, ParentRef, ProcessData, ProcessTask,
    Producer,
};
use crate::graph::ProcessGraph;
use crate::noise::{DedupKey, DedupOutcome, NoiseFilter};
use crate::registry::McpRegistry;
use crate::tagging::TagResolver;
use crate::trace::{TraceEvent, TraceSession};
use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Instant;

/// Placeholder when a rename completion arrives without its announcement.
const UNKNOWN_OLD_PATH: &str = "(unknown_old)";

pub struct KernelSource {
    graph: Arc<ProcessGraph>,
    registry: Arc<McpRegistry>,
    resolver: Arc<TagResolver>,
    filter: NoiseFilter,
    /// FileKey -> pre-rename path, correlated across start/completion.
    rename_keys: HashMap<u64, String>,
    /// First envelope of each open dedup burst, held until its window
    /// closes so the burst surfaces once with the suppressed count.
    pending: HashMap<DedupKey, EventEnvelope>,
}

impl KernelSource {
    pub fn new(
        graph: Arc<ProcessGraph>,
        registry: Arc<McpRegistry>,
        resolver: Arc<TagResolver>,
        filter: NoiseFilter,
    ) -> Self {
        Self {
            graph,
            registry,
            resolver,
            filter,
            rename_keys: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Pump the session until it ends or the receiver goes away. Runs on
    /// its own thread; `session.next_event()` blocks.
    pub fn run(mut self, mut session: Box<dyn TraceSession>, tx: Sender<EventEnvelope>) {
        'pump: while let Some(event) = session.next_event() {
            if let Some(envelope) = self.handle(event) {
                if tx.send(envelope).is_err() {
                    break; // supervisor shut the pipeline down
                }
            }
            // Surface bursts whose dedup window has closed
            for envelope in self.flush(Instant::now()) {
                if tx.send(envelope).is_err() {
                    break 'pump;
                }
            }
        }
        for envelope in self.drain_pending() {
            let _ = tx.send(envelope);
        }
        session.stopper().stop();
        tracing::debug!("Kernel source drained");
    }

    /// Process one trace event. `None` means out of scope or filtered.
    pub fn handle(&mut self, event: TraceEvent) -> Option<EventEnvelope> {
        match event {
            TraceEvent::ProcessStart {
                pid,
                parent_pid,
                image,
                cmdline,
                ts,
            } => self.on_process_start(pid, parent_pid, image, cmdline, ts),
            TraceEvent::ProcessStop { pid, exit_code, .. } => self.on_process_stop(pid, exit_code),
            TraceEvent::File {
                pid, op, path, size, ..
            } => self.on_file(pid, op, path, None, size),
            TraceEvent::FileRenameStart {
                pid, file_key, path, ..
            } => {
                if self.graph.is_tracked(pid) {
                    self.rename_keys.insert(file_key, path);
                }
                None
            }
            TraceEvent::FileRenameEnd {
                pid,
                file_key,
                new_path,
                ..
            } => {
                let old_path = self
                    .rename_keys
                    .remove(&file_key)
                    .unwrap_or_else(|| UNKNOWN_OLD_PATH.to_string());
                self.on_file(pid, FileTask::Rename, new_path, Some(old_path), None)
            }
            TraceEvent::Network {
                pid,
                op,
                src,
                sport,
                dst,
                dport,
                bytes,
                ..
            } => {
                if !self.graph.is_tracked(pid) {
                    return None;
                }
                let cmdline = self.graph.cmdline_of(pid);
                let tag = self.resolver.resolve(pid, cmdline.as_deref(), None);
                let pname = self.graph.name_of(pid);
                Some(EventEnvelope::new(
                    Producer::AgentCore,
                    pid,
                    pname.clone(),
                    EventData::Network(NetworkData {
                        task: op,
                        pid,
                        pname,
                        mcp_tag: tag,
                        trans_port: "tcp".to_string(),
                        src,
                        sport,
                        dst,
                        dport,
                        bytes,
                    }),
                ))
            }
        }
    }

    fn on_process_start(
        &mut self,
        pid: u32,
        parent_pid: u32,
        image: String,
        cmdline: String,
        ts: i64,
    ) -> Option<EventEnvelope> {
        // Graph update strictly before emission
        if !self.graph.on_start(pid, parent_pid, &image, &cmdline, ts) {
            return None; // neither the target nor a tracked descendant
        }
        if self.graph.root_pid() == Some(pid) {
            tracing::info!("Host target process detected (pid {pid})");
        } else {
            tracing::debug!(
                "Tracking pid {pid} at depth {}",
                self.graph.indent_depth(pid)
            );
        }
        let tag = self.resolver.resolve(pid, Some(&cmdline), Some(&image));
        let pname = self.graph.name_of(pid);
        Some(EventEnvelope::new(
            Producer::AgentCore,
            pid,
            pname.clone(),
            EventData::Process(ProcessData {
                task: ProcessTask::Start,
                pid,
                pname,
                parent: ParentRef {
                    pid: parent_pid,
                    name: self.graph.parent_name(pid),
                },
                image_filename: image,
                command_line: cmdline,
                mcp_tag: tag,
                exit_code: None,
            }),
        ))
    }

    fn on_process_stop(&mut self, pid: u32, exit_code: Option<i32>) -> Option<EventEnvelope> {
        let record = self.graph.on_stop(pid)?;
        let tag = self
            .registry
            .tag_of(pid)
            .unwrap_or_else(|| self.registry.host().name.to_string());
        // The binding dies with the process
        self.registry.remove(pid);
        Some(EventEnvelope::new(
            Producer::AgentCore,
            pid,
            record.process_name.clone(),
            EventData::Process(ProcessData {
                task: ProcessTask::Stop,
                pid,
                pname: record.process_name.clone(),
                parent: ParentRef {
                    pid: record.parent_pid,
                    name: self.graph.name_of(record.parent_pid),
                },
                image_filename: record.image_filename,
                command_line: record.command_line,
                mcp_tag: tag,
                exit_code,
            }),
        ))
    }

    /// File events are deduplicated on the trailing edge: the burst's
    /// envelope is built now but only emitted when the window closes, via
    /// `flush`/`drain_pending`, carrying the suppressed count.
    fn on_file(
        &mut self,
        pid: u32,
        op: FileTask,
        path: String,
        old_path: Option<String>,
        size: Option<u64>,
    ) -> Option<EventEnvelope> {
        if !self.graph.is_tracked(pid) {
            return None;
        }
        let outcome = self.filter.observe(op, pid, &path, Instant::now())?;
        let cmdline = self.graph.cmdline_of(pid);
        let tag = self.resolver.resolve(pid, cmdline.as_deref(), Some(&path));
        let pname = self.graph.name_of(pid);
        let is_rename = op == FileTask::Rename;
        let envelope = EventEnvelope::new(
            Producer::AgentCore,
            pid,
            pname,
            EventData::File(FileData {
                task: op,
                pid,
                file_path: path.clone(),
                mcp_tag: tag,
                repeat_count: None,
                old_path,
                new_path: is_rename.then_some(path.clone()),
                size,
            }),
        );
        let key = (op, pid, path);
        match outcome {
            DedupOutcome::Opened => {
                self.pending.insert(key, envelope);
                None
            }
            DedupOutcome::Suppressed => None,
            DedupOutcome::Rolled { repeats } => {
                // The closed burst goes out now; this event starts the next
                let previous = self.pending.insert(key, envelope);
                previous.map(|env| with_repeats(env, repeats))
            }
        }
    }

    /// Emit every burst whose dedup window has closed.
    pub fn flush(&mut self, now: Instant) -> Vec<EventEnvelope> {
        self.filter
            .flush_expired(now)
            .into_iter()
            .filter_map(|(key, repeats)| {
                self.pending
                    .remove(&key)
                    .map(|env| with_repeats(env, repeats))
            })
            .collect()
    }

    /// Emit everything still held, window or not. For session shutdown.
    pub fn drain_pending(&mut self) -> Vec<EventEnvelope> {
        self.filter
            .drain()
            .into_iter()
            .filter_map(|(key, repeats)| {
                self.pending
                    .remove(&key)
                    .map(|env| with_repeats(env, repeats))
            })
            .collect()
    }
}

fn with_repeats(mut envelope: EventEnvelope, repeats: u32) -> EventEnvelope {
    if let EventData::File(ref mut file) = envelope.data {
        file.repeat_count = (repeats > 0).then_some(repeats);
    }
    envelope
}
