// Live process graph - the set of PIDs we are observing
//
// The graph holds the host target process and every descendant observed
// alive, forming a forest rooted at the target. The kernel source is the
// only writer; every other component reads through shared references, so
// a single RwLock around the map is sufficient.

use std::collections::HashMap;
use std::sync::RwLock;

/// Everything we know about one tracked process.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub pid: u32,
    pub parent_pid: u32,
    pub image_filename: String,
    pub command_line: String,
    pub process_name: String,
    pub start_ts: i64,
}

/// Walk guard: parent chains in a live system are short, and a stale
/// parent link must never loop us forever.
const MAX_ANCESTOR_DEPTH: usize = 128;

pub struct ProcessGraph {
    inner: RwLock<GraphInner>,
}

struct GraphInner {
    procs: HashMap<u32, ProcessRecord>,
    root_pid: Option<u32>,
    /// Lowercased image suffix identifying the host target executable.
    target_image: String,
}

impl ProcessGraph {
    pub fn new(target_image: &str) -> Self {
        Self {
            inner: RwLock::new(GraphInner {
                procs: HashMap::new(),
                root_pid: None,
                target_image: target_image.to_lowercase(),
            }),
        }
    }

    /// Insert a process if it is the target or a child of a tracked PID.
    ///
    /// Idempotent: re-announcing a live PID is a no-op. Returns whether the
    /// PID is tracked after the call.
    pub fn on_start(
        &self,
        pid: u32,
        parent_pid: u32,
        image: &str,
        cmdline: &str,
        ts: i64,
    ) -> bool {
        let mut inner = match self.inner.write() {
            Ok(g) => g,
            Err(_) => return false,
        };

        if inner.procs.contains_key(&pid) {
            return true;
        }

        let is_target = image.to_lowercase().ends_with(&inner.target_image);
        if !is_target && !inner.procs.contains_key(&parent_pid) {
            return false;
        }

        // Split on both separators: trace paths keep the producer's
        // platform conventions regardless of where we run.
        let process_name = image
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(image)
            .to_string();

        inner.procs.insert(
            pid,
            ProcessRecord {
                pid,
                parent_pid,
                image_filename: image.to_string(),
                command_line: cmdline.to_string(),
                process_name,
                start_ts: ts,
            },
        );
        if is_target && inner.root_pid.is_none() {
            inner.root_pid = Some(pid);
        }
        true
    }

    /// Remove a PID, returning its record if it was tracked.
    pub fn on_stop(&self, pid: u32) -> Option<ProcessRecord> {
        self.inner.write().ok()?.procs.remove(&pid)
    }

    pub fn is_tracked(&self, pid: u32) -> bool {
        self.inner
            .read()
            .map(|g| g.procs.contains_key(&pid))
            .unwrap_or(false)
    }

    pub fn root_pid(&self) -> Option<u32> {
        self.inner.read().ok()?.root_pid
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|g| g.procs.len()).unwrap_or(0)
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of a single record, for callers that need more than a name.
    #[allow(dead_code)]
    pub fn record(&self, pid: u32) -> Option<ProcessRecord> {
        self.inner.read().ok()?.procs.get(&pid).cloned()
    }

    pub fn cmdline_of(&self, pid: u32) -> Option<String> {
        self.inner
            .read()
            .ok()?
            .procs
            .get(&pid)
            .map(|p| p.command_line.clone())
    }

    /// Process name for display; `"unknown"` if the PID is not tracked.
    pub fn name_of(&self, pid: u32) -> String {
        self.inner
            .read()
            .ok()
            .and_then(|g| g.procs.get(&pid).map(|p| p.process_name.clone()))
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Name of the parent process, `"<unknown>"` if the parent is not tracked.
    pub fn parent_name(&self, pid: u32) -> String {
        let inner = match self.inner.read() {
            Ok(g) => g,
            Err(_) => return "<unknown>".to_string(),
        };
        inner
            .procs
            .get(&pid)
            .and_then(|p| inner.procs.get(&p.parent_pid))
            .map(|p| p.process_name.clone())
            .unwrap_or_else(|| "<unknown>".to_string())
    }

    /// Tracked ancestors of `pid`, nearest first. Empty for roots and
    /// unknown PIDs.
    pub fn ancestors(&self, pid: u32) -> Vec<u32> {
        let inner = match self.inner.read() {
            Ok(g) => g,
            Err(_) => return Vec::new(),
        };
        let mut chain = Vec::new();
        let mut current = pid;
        while let Some(rec) = inner.procs.get(&current) {
            if !inner.procs.contains_key(&rec.parent_pid) {
                break;
            }
            chain.push(rec.parent_pid);
            current = rec.parent_pid;
            if chain.len() >= MAX_ANCESTOR_DEPTH {
                break;
            }
        }
        chain
    }

    /// Tree depth below the root; 0 for unknown PIDs and for the root itself.
    pub fn indent_depth(&self, pid: u32) -> usize {
        self.ancestors(pid).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> ProcessGraph {
        ProcessGraph::new("claude.exe")
    }

    #[test]
    fn test_root_insert_by_image() {
        let g = graph();
        assert!(g.on_start(100, 1, "C:\\Apps\\Claude.EXE", "claude", 1));
        assert!(g.is_tracked(100));
        assert_eq!(g.root_pid(), Some(100));
        let rec = g.record(100).unwrap();
        assert_eq!(rec.start_ts, 1);
        assert_eq!(rec.process_name, "Claude.EXE");
    }

    #[test]
    fn test_child_of_tracked_inserts() {
        let g = graph();
        g.on_start(100, 1, "C:\\Apps\\claude.exe", "claude", 1);
        assert!(g.on_start(200, 100, "C:\\bin\\node.exe", "node server.js", 2));
        assert!(g.is_tracked(200));
    }

    #[test]
    fn test_orphan_rejected() {
        let g = graph();
        assert!(!g.on_start(300, 999, "C:\\bin\\node.exe", "node", 1));
        assert!(!g.is_tracked(300));
        assert_eq!(g.len(), 0);
    }

    #[test]
    fn test_on_start_idempotent() {
        let g = graph();
        g.on_start(100, 1, "claude.exe", "claude", 1);
        g.on_start(100, 1, "claude.exe", "claude again", 2);
        assert_eq!(g.len(), 1);
        // First record wins
        assert_eq!(g.record(100).unwrap().command_line, "claude");
    }

    #[test]
    fn test_on_stop_removes_and_returns() {
        let g = graph();
        g.on_start(100, 1, "claude.exe", "claude", 1);
        g.on_start(200, 100, "node.exe", "node", 2);
        let rec = g.on_stop(200).unwrap();
        assert_eq!(rec.pid, 200);
        assert!(!g.is_tracked(200));
        assert!(g.on_stop(200).is_none());
    }

    #[test]
    fn test_ancestors_and_depth() {
        let g = graph();
        g.on_start(100, 1, "claude.exe", "claude", 1);
        g.on_start(200, 100, "node.exe", "node", 2);
        g.on_start(300, 200, "python.exe", "python", 3);
        assert_eq!(g.ancestors(300), vec![200, 100]);
        assert_eq!(g.indent_depth(300), 2);
        assert_eq!(g.indent_depth(100), 0);
        assert_eq!(g.indent_depth(9999), 0);
    }

    #[test]
    fn test_parent_name() {
        let g = graph();
        g.on_start(100, 1, "C:\\Apps\\claude.exe", "claude", 1);
        g.on_start(200, 100, "C:\\bin\\node.exe", "node", 2);
        assert_eq!(g.parent_name(200), "claude.exe");
        assert_eq!(g.parent_name(100), "<unknown>");
        assert_eq!(g.parent_name(42), "<unknown>");
    }

    #[test]
    fn test_removal_unlinks_subtree_membership() {
        let g = graph();
        g.on_start(100, 1, "claude.exe", "claude", 1);
        g.on_start(200, 100, "node.exe", "node", 2);
        g.on_stop(100);
        // Child remains until its own stop, but its ancestor chain ends
        assert!(g.is_tracked(200));
        assert_eq!(g.ancestors(200), Vec::<u32>::new());
    }
}
