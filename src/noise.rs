// Noise filter - keeps the file event stream human-sized
//
// Kernel file I/O is dominated by caches, prefetch data and runtime
// bookkeeping nobody wants to see. Two stages: a path classifier with a
// keep-list that always wins, and a per-(kind, pid, path) dedup window
// that collapses bursts into one event with a repeat count.

use crate::envelope::FileTask;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Default collapse window for identical file events.
pub const DEDUP_WINDOW: Duration = Duration::from_millis(500);

fn noisy_ext_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(\.(pf|ldb|bdic|pyc|pyo|pyd|json|lock|cfg)|ni\.dll\.aux)$").unwrap()
    })
}

/// Substrings that mark a path as runtime noise (checked lowercased).
const NOISY_SUBSTRINGS: &[&str] = &[
    "cache",
    "prefetch",
    "shadercache",
    "gpucache",
    "dawnwebgpucache",
    "code cache",
    "local storage",
    "shared dictionary",
    "temp",
    "spool\\drivers",
    "spool/drivers",
    "site-packages",
    ".venv",
    "virtualenv",
];

/// Identity of one dedup cell: `(kind, pid, path)`.
pub type DedupKey = (FileTask, u32, String);

/// What happened to one observation inside the dedup stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// A new burst opened. The caller stashes the event; it surfaces via
    /// `flush_expired`/`drain` once the window closes.
    Opened,
    /// Folded into an open burst and counted.
    Suppressed,
    /// The previous burst's window had already closed: emit it now with
    /// `repeats` attached. A new burst was opened for this event.
    Rolled { repeats: u32 },
}

pub struct NoiseFilter {
    /// Substrings that force-keep a path (host config names, log dirs…).
    keep: Vec<String>,
    dedup: DedupWindow,
}

impl NoiseFilter {
    /// `keep_names` is the host-specific keep-list (e.g. the host config
    /// file name); the structural keep entries are always included.
    pub fn new(keep_names: &[String], window: Duration) -> Self {
        let mut keep: Vec<String> = vec![
            "\\logs\\".into(),
            "/logs/".into(),
            "\\crashpad\\".into(),
            "/crashpad/".into(),
            "\\preferences".into(),
            "/preferences".into(),
            "\\hosts".into(),
            "/hosts".into(),
        ];
        keep.extend(keep_names.iter().map(|s| s.to_lowercase()));
        Self {
            keep,
            dedup: DedupWindow::new(window),
        }
    }

    /// Run both stages. `None` means the path is noise; otherwise the
    /// event entered its dedup cell and the outcome says whether the
    /// caller must stash, drop, or roll it.
    pub fn observe(
        &mut self,
        kind: FileTask,
        pid: u32,
        path: &str,
        now: Instant,
    ) -> Option<DedupOutcome> {
        if self.is_path_noise(kind, path) {
            return None;
        }
        Some(self.dedup.observe(kind, pid, path, now))
    }

    /// Bursts whose window has closed, ready to emit.
    pub fn flush_expired(&mut self, now: Instant) -> Vec<(DedupKey, u32)> {
        self.dedup.flush_expired(now)
    }

    /// Everything still pending, window or not. For session shutdown.
    pub fn drain(&mut self) -> Vec<(DedupKey, u32)> {
        self.dedup.drain()
    }

    /// Stage one: path classification only, no dedup state touched.
    pub fn is_path_noise(&self, kind: FileTask, path: &str) -> bool {
        let lower = path.to_lowercase();

        // Keep-list always wins, noise patterns notwithstanding.
        if self.keep.iter().any(|k| lower.contains(k)) {
            return false;
        }
        if noisy_ext_re().is_match(&lower) {
            return true;
        }
        if NOISY_SUBSTRINGS.iter().any(|n| lower.contains(n)) {
            return true;
        }
        // Directory-only handles on close/read/enumerate carry no signal.
        if matches!(kind, FileTask::Close | FileTask::Read | FileTask::DirEnum)
            && file_name_of(&lower).is_empty()
        {
            return true;
        }
        false
    }
}

fn file_name_of(path: &str) -> &str {
    let trimmed = path.trim_end_matches(['/', '\\']);
    trimmed.rsplit(['/', '\\']).next().unwrap_or(trimmed)
}

struct DedupCell {
    /// Burst anchor: the window is measured from the first observation.
    opened: Instant,
    /// Events folded into the burst beyond the first.
    repeats: u32,
}

/// Collapses identical `(kind, pid, path)` events inside a window.
///
/// Emission is on window close: the first observation opens a burst and
/// is held, later ones inside the window only bump the counter. When the
/// window expires the burst surfaces exactly once, carrying the number of
/// suppressed events, and the counter resets. A burst of N identical
/// events therefore yields one emission with `repeats = N - 1`.
pub struct DedupWindow {
    window: Duration,
    cells: HashMap<DedupKey, DedupCell>,
}

impl DedupWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            cells: HashMap::new(),
        }
    }

    pub fn observe(&mut self, kind: FileTask, pid: u32, path: &str, now: Instant) -> DedupOutcome {
        let key = (kind, pid, path.to_string());
        match self.cells.get_mut(&key) {
            None => {
                self.cells.insert(
                    key,
                    DedupCell {
                        opened: now,
                        repeats: 0,
                    },
                );
                DedupOutcome::Opened
            }
            Some(cell) if now.duration_since(cell.opened) < self.window => {
                cell.repeats += 1;
                DedupOutcome::Suppressed
            }
            Some(cell) => {
                // Closed but not yet flushed: hand the old burst back and
                // start a fresh one for this event.
                let repeats = cell.repeats;
                cell.opened = now;
                cell.repeats = 0;
                DedupOutcome::Rolled { repeats }
            }
        }
    }

    /// Remove and report every burst whose window has closed.
    pub fn flush_expired(&mut self, now: Instant) -> Vec<(DedupKey, u32)> {
        let window = self.window;
        let mut expired = Vec::new();
        self.cells.retain(|key, cell| {
            if now.duration_since(cell.opened) >= window {
                expired.push((key.clone(), cell.repeats));
                false
            } else {
                true
            }
        });
        expired
    }

    /// Remove and report every open burst regardless of age.
    pub fn drain(&mut self) -> Vec<(DedupKey, u32)> {
        self.cells
            .drain()
            .map(|(key, cell)| (key, cell.repeats))
            .collect()
    }

    /// Number of live cells, for diagnostics.
    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}
