// Tag resolver - classifies a process observation into an MCP tag
//
// A strict priority chain over every evidence source we have: explicit
// log paths beat cached knowledge beats command-line flags beats registry
// matches beats path heuristics beats the host fallback. The first rule
// that yields a non-empty name wins, and bindings only ever upgrade.

use crate::registry::{capitalize, McpRegistry};
use regex::Regex;
use std::sync::{Arc, OnceLock};

// Rule priorities, 1 = strongest. Kept explicit so the binding store can
// compare evidence strength across calls.
const R_LOG_PATH: u8 = 1;
const R_CACHE: u8 = 2;
const R_MCP_FLAG: u8 = 3;
const R_PROTOCOL_PKG: u8 = 4;
const R_REGISTRY: u8 = 5;
const R_VENDOR_EXT: u8 = 6;
const R_HOST_LOG: u8 = 7;
const R_RUNTIME: u8 = 8;
const R_FILENAME: u8 = 9;
const R_HOST_DEFAULT: u8 = 10;

fn mcp_log_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)[\\/]logs[\\/]mcp-server-([a-z0-9_-]+)\.log").unwrap()
    })
}

fn protocol_pkg_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@modelcontextprotocol[/\\]server-([A-Za-z0-9_-]+)").unwrap())
}

fn vendor_ext_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)[\\/][^\\/]*anthropic\.([a-z0-9_-]+)[\\/]").unwrap())
}

fn host_log_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)[\\/]logs[\\/](mcp|main|claude\.ai-web)\.log$").unwrap()
    })
}

fn filename_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"([A-Za-z0-9_-]+)\.(py|js|ts|mjs|exe|bin|wasm|sh|go|rb|jar|dll|pl)").unwrap()
    })
}

pub struct TagResolver {
    registry: Arc<McpRegistry>,
    host_name: String,
}

impl TagResolver {
    pub fn new(registry: Arc<McpRegistry>) -> Self {
        let host_name = registry.host().name.to_string();
        Self {
            registry,
            host_name,
        }
    }

    /// Resolve the MCP tag for one observation. Never returns an empty
    /// string: rule 10 attributes any tracked descendant to the host.
    pub fn resolve(&self, pid: u32, cmdline: Option<&str>, path: Option<&str>) -> String {
        let (rule, name) = self.classify(pid, cmdline, path);
        self.registry.bind(pid, rule, name)
    }

    fn classify(&self, pid: u32, cmdline: Option<&str>, path: Option<&str>) -> (u8, String) {
        let cmd = cmdline.unwrap_or("");

        // 1. Explicit MCP log path names the server outright.
        if let Some(p) = path {
            if let Some(caps) = mcp_log_re().captures(p) {
                let name = capitalize(&caps[1]);
                self.registry.cache_put(pid, &basename(p), &name);
                return (R_LOG_PATH, name);
            }
        }

        // 2. Something stronger classified this (pid, file) before.
        if let Some(p) = path {
            if let Some(name) = self.registry.cache_get(pid, &basename(p)) {
                return (R_CACHE, name);
            }
        }

        // 3. Explicit --mcp=<name> flag.
        if let Some(name) = mcp_flag_value(cmd) {
            return (R_MCP_FLAG, name);
        }

        // 4. Official protocol package name in the command line.
        if let Some(caps) = protocol_pkg_re().captures(cmd) {
            return (R_PROTOCOL_PKG, capitalize(&caps[1]));
        }

        // 5. Registry command-line match.
        if !cmd.is_empty() {
            if let Some(name) = self.registry.lookup_by_cmdline(cmd) {
                if let Some(p) = path {
                    self.registry.cache_put(pid, &basename(p), &name);
                }
                return (R_REGISTRY, name);
            }
        }

        // 6. Vendor extension bundle directory in the path (or, for process
        // starts, in the command line that launched out of it).
        for hay in [path, cmdline].into_iter().flatten() {
            if let Some(caps) = vendor_ext_re().captures(hay) {
                return (R_VENDOR_EXT, capitalize(&caps[1]));
            }
        }

        // 7. Host-internal log names belong to the host itself.
        if let Some(p) = path {
            if host_log_re().is_match(p) {
                return (R_HOST_LOG, self.host_name.clone());
            }
        }

        // 8. Runtime-only helper processes.
        if cmd.contains("--type=utility") {
            return (R_RUNTIME, "UtilityProcess".to_string());
        }
        if cmd.contains("--type=gpu") {
            return (R_RUNTIME, "GPU".to_string());
        }
        if cmd.contains("--type=renderer") {
            return (R_RUNTIME, "Renderer".to_string());
        }

        // 9. Last script/binary filename anywhere in cmdline + path.
        let hay = format!("{} {}", cmd, path.unwrap_or(""));
        if let Some(caps) = filename_re().captures_iter(&hay).last() {
            return (R_FILENAME, capitalize(&caps[1]));
        }

        // 10. Any tracked descendant is at least the host's.
        (R_HOST_DEFAULT, self.host_name.clone())
    }
}

/// Value of `--mcp=<name>`: the token up to the next whitespace or quote.
fn mcp_flag_value(cmdline: &str) -> Option<String> {
    let start = cmdline.find("--mcp=")? + "--mcp=".len();
    let rest = &cmdline[start..];
    let end = rest
        .find(|c: char| c.is_whitespace() || c == '"')
        .unwrap_or(rest.len());
    let value = &rest[..end];
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Final path component. Splits on both separators so Windows-style trace
/// paths are handled regardless of the host platform.
fn basename(path: &str) -> String {
    path.rsplit(['/', '\\']).next().unwrap_or(path).to_string()
}
