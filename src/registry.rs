// MCP registry - knows which command lines belong to which MCP server
//
// Loaded once at startup from the host's config file (the `mcpServers`
// map) and, for Claude Desktop, from per-extension manifests. Entries map
// a rendered command line to a canonical MCP name. The registry also owns
// the per-PID tag bindings and the resolver cache, because both must obey
// the same strength ordering the resolver produces.

use crate::hosts::HostTarget;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One rendered command line -> canonical name mapping.
#[derive(Debug, Clone)]
pub struct ConfigEntry {
    /// Lowercased rendered command line, the case-insensitive key.
    pub key: String,
    /// Canonical MCP name, first-letter-capitalized.
    pub name: String,
}

/// `{ "mcpServers": { "<name>": { "command": …, "args": […] } } }`
#[derive(Debug, Deserialize)]
struct HostConfigFile {
    #[serde(default, rename = "mcpServers")]
    mcp_servers: HashMap<String, ServerSpec>,
}

#[derive(Debug, Deserialize)]
struct ServerSpec {
    command: String,
    #[serde(default)]
    args: Vec<String>,
}

/// `{ "name": …, "server": { "mcp_config": { "command", "args" } } }`
#[derive(Debug, Deserialize)]
struct ManifestFile {
    name: Option<String>,
    server: Option<ManifestServer>,
}

#[derive(Debug, Deserialize)]
struct ManifestServer {
    mcp_config: Option<ServerSpec>,
}

#[derive(Default)]
struct TagState {
    /// pid -> (rule priority that set it, name). Lower priority number =
    /// stronger evidence; a weaker rule never overwrites.
    bindings: HashMap<u32, (u8, String)>,
    /// (pid, lowercased basename) -> name, written on rule 1/5 hits.
    cache: HashMap<(u32, String), String>,
}

pub struct McpRegistry {
    host: &'static HostTarget,
    /// Read-only after load. Later entries shadow earlier ones with the
    /// same key, so lookups scan in reverse.
    entries: Vec<ConfigEntry>,
    state: Mutex<TagState>,
}

impl McpRegistry {
    /// Load the registry for a host target. Missing or unreadable config
    /// files degrade to an empty entry set with a warning; they never fail
    /// startup.
    pub fn load(host: &'static HostTarget) -> Self {
        let mut entries = Vec::new();

        match host.config_path() {
            Some(path) if path.exists() => match Self::load_host_config(&path) {
                Ok(mut loaded) => {
                    tracing::info!(
                        "Loaded {} MCP server entries from {}",
                        loaded.len(),
                        path.display()
                    );
                    entries.append(&mut loaded);
                }
                Err(e) => tracing::warn!("Failed to read host config {}: {e:#}", path.display()),
            },
            Some(path) => tracing::warn!("Host config not found at {}", path.display()),
            None => tracing::warn!("No config path known for host {}", host.name),
        }

        if let Some(dir) = host.extensions_dir() {
            if dir.exists() {
                let mut loaded = Self::load_extensions(&dir);
                tracing::info!("Loaded {} extension entries from {}", loaded.len(), dir.display());
                entries.append(&mut loaded);
            }
        }

        Self {
            host,
            entries,
            state: Mutex::new(TagState::default()),
        }
    }

    /// Test constructor with explicit entries.
    #[cfg(test)]
    pub fn with_entries(host: &'static HostTarget, entries: Vec<(&str, &str)>) -> Self {
        Self {
            host,
            entries: entries
                .into_iter()
                .map(|(k, n)| ConfigEntry {
                    key: k.to_lowercase(),
                    name: capitalize(n),
                })
                .collect(),
            state: Mutex::new(TagState::default()),
        }
    }

    pub fn host(&self) -> &'static HostTarget {
        self.host
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    fn load_host_config(path: &Path) -> Result<Vec<ConfigEntry>> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let parsed: HostConfigFile =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

        let mut out: Vec<ConfigEntry> = parsed
            .mcp_servers
            .into_iter()
            .map(|(name, spec)| ConfigEntry {
                key: render_cmdline(&spec.command, &spec.args, None).to_lowercase(),
                name: capitalize(&name),
            })
            .collect();
        // HashMap iteration order is arbitrary; keep lookups stable.
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn load_extensions(dir: &Path) -> Vec<ConfigEntry> {
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("Cannot enumerate {}: {e}", dir.display());
                return out;
            }
        };
        for entry in entries.flatten() {
            let manifest_path = entry.path().join("manifest.json");
            if !manifest_path.is_file() {
                continue;
            }
            match Self::load_manifest(&manifest_path) {
                Ok(Some(cfg)) => out.push(cfg),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Skipping manifest {}: {e:#}", manifest_path.display());
                }
            }
        }
        out
    }

    fn load_manifest(path: &Path) -> Result<Option<ConfigEntry>> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let parsed: ManifestFile =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

        let Some(spec) = parsed.server.and_then(|s| s.mcp_config) else {
            return Ok(None);
        };
        let manifest_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let name = parsed.name.unwrap_or_else(|| {
            manifest_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        });

        Ok(Some(ConfigEntry {
            key: render_cmdline(&spec.command, &spec.args, Some(manifest_dir)).to_lowercase(),
            name: capitalize(&name),
        }))
    }

    /// Rule 5: a ConfigEntry key appearing inside `cmdline` (case-insensitive
    /// substring), or a significant token of the key appearing in it. Last
    /// loaded entry wins on overlap.
    pub fn lookup_by_cmdline(&self, cmdline: &str) -> Option<String> {
        let cmd = cmdline.to_lowercase();
        for entry in self.entries.iter().rev() {
            if cmd.contains(&entry.key) {
                return Some(entry.name.clone());
            }
            if entry
                .key
                .split_whitespace()
                .any(|tok| is_significant_token(tok) && cmd.contains(tok))
            {
                return Some(entry.name.clone());
            }
        }
        None
    }

    // ── Tag bindings ─────────────────────────────────────────────────────

    /// Bind `pid` to `name` at rule strength `priority` (1 = strongest).
    /// Weaker evidence never overwrites: the effective name is returned.
    pub fn bind(&self, pid: u32, priority: u8, name: String) -> String {
        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(_) => return name,
        };
        match state.bindings.get(&pid) {
            Some((held, held_name)) if *held <= priority => held_name.clone(),
            _ => {
                state.bindings.insert(pid, (priority, name.clone()));
                name
            }
        }
    }

    pub fn tag_of(&self, pid: u32) -> Option<String> {
        self.state
            .lock()
            .ok()?
            .bindings
            .get(&pid)
            .map(|(_, name)| name.clone())
    }

    /// Drop a PID's binding and cache rows. Called on Process-Stop.
    pub fn remove(&self, pid: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.bindings.remove(&pid);
            state.cache.retain(|(p, _), _| *p != pid);
        }
    }

    pub fn cache_get(&self, pid: u32, basename: &str) -> Option<String> {
        self.state
            .lock()
            .ok()?
            .cache
            .get(&(pid, basename.to_lowercase()))
            .cloned()
    }

    pub fn cache_put(&self, pid: u32, basename: &str, name: &str) {
        if let Ok(mut state) = self.state.lock() {
            state
                .cache
                .insert((pid, basename.to_lowercase()), name.to_string());
        }
    }
}

/// A token worth matching on its own: at least 5 chars, not a flag, and
/// either an executable/script name or containing the literal "server".
fn is_significant_token(tok: &str) -> bool {
    tok.len() >= 5
        && !tok.starts_with('-')
        && (tok.contains(".exe")
            || tok.contains(".py")
            || tok.contains(".js")
            || tok.contains("server"))
}

/// Render `command args…` the way the host would launch it, with
/// `${__dirname}` expanded against the manifest directory and whitespace
/// tokens quoted.
pub fn render_cmdline(command: &str, args: &[String], manifest_dir: Option<&Path>) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(resolve_executable(&expand_dirname(command, manifest_dir)));
    for arg in args {
        parts.push(quote_token(&expand_dirname(arg, manifest_dir)));
    }
    parts.join(" ")
}

fn expand_dirname(s: &str, manifest_dir: Option<&Path>) -> String {
    match manifest_dir {
        Some(dir) => s.replace("${__dirname}", &dir.to_string_lossy()),
        None => s.to_string(),
    }
}

fn quote_token(tok: &str) -> String {
    if tok.chars().any(char::is_whitespace) {
        format!("\"{tok}\"")
    } else {
        tok.to_string()
    }
}

/// Resolve a command to the executable the OS would actually run.
///
/// Absolute existing paths pass through; otherwise PATH is searched (with
/// PATHEXT extensions on Windows). A `.cmd`/`.bat` script is launched
/// through the command interpreter, so its rendered form is wrapped the
/// same way.
pub fn resolve_executable(command: &str) -> String {
    let path = Path::new(command);
    if path.is_absolute() && path.exists() {
        return wrap_script(command);
    }
    if let Some(found) = search_path(command) {
        return wrap_script(&found.to_string_lossy());
    }
    command.to_string()
}

fn search_path(command: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&paths) {
        for candidate in candidates(command) {
            let full = dir.join(&candidate);
            if full.is_file() {
                return Some(full);
            }
        }
    }
    None
}

fn candidates(command: &str) -> Vec<String> {
    if !cfg!(windows) {
        return vec![command.to_string()];
    }
    let mut out = vec![command.to_string()];
    let exts = std::env::var("PATHEXT").unwrap_or_else(|_| ".COM;.EXE;.BAT;.CMD".to_string());
    for ext in exts.split(';').filter(|e| !e.is_empty()) {
        out.push(format!("{command}{}", ext.to_lowercase()));
        out.push(format!("{command}{ext}"));
    }
    out
}

fn wrap_script(path: &str) -> String {
    let lower = path.to_lowercase();
    if cfg!(windows) && (lower.ends_with(".cmd") || lower.ends_with(".bat")) {
        format!("cmd.exe /c \"{path}\"")
    } else {
        path.to_string()
    }
}

/// Canonical names are stored with an uppercased first letter, so the
/// registry entry `weather` and the log file `mcp-server-weather.log`
/// both resolve to `Weather`.
pub fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
