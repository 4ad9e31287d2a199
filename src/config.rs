//! Configuration for the observation core
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/mcpspy/config.toml)
//! 3. Built-in defaults (lowest priority)

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default Collector port; producers and server must agree.
pub const DEFAULT_COLLECTOR_PORT: u16 = 8888;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Loopback address the Collector listens on
    pub collector_addr: SocketAddr,

    /// SQLite event store location
    pub db_path: PathBuf,

    /// Directory for rolling log files
    pub log_dir: PathBuf,

    /// Log level when RUST_LOG is unset
    pub log_level: String,

    /// Also write logs to a daily-rolling file
    pub log_to_file: bool,

    /// Generate a synthetic trace instead of attaching to the OS
    pub demo_mode: bool,

    /// Accept line-framed events from the HTTP(S) interceptor
    pub netproxy_enabled: bool,

    /// Port for the interceptor feed
    pub netproxy_port: u16,

    /// Dedup window for identical file events, in milliseconds
    pub dedup_window_ms: u64,

    /// Days of raw events to keep; 0 keeps everything
    pub retention_days: u32,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .map(|d| d.join("mcpspy"))
            .unwrap_or_else(|| PathBuf::from("./data"));
        Self {
            collector_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_COLLECTOR_PORT)),
            db_path: data_dir.join("events.db"),
            log_dir: data_dir.join("logs"),
            log_level: "info".to_string(),
            log_to_file: false,
            demo_mode: false,
            netproxy_enabled: false,
            netproxy_port: 8889,
            dedup_window_ms: 500,
            retention_days: 0,
        }
    }
}

/// On-disk shape; everything optional so partial files work.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub collector_addr: Option<SocketAddr>,
    pub db_path: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub log_to_file: Option<bool>,
    pub demo_mode: Option<bool>,
    pub netproxy_enabled: Option<bool>,
    pub netproxy_port: Option<u16>,
    pub dedup_window_ms: Option<u64>,
    pub retention_days: Option<u32>,
}

impl Config {
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("mcpspy").join("config.toml"))
    }

    /// Write the template on first run so the options are discoverable.
    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };
        if path.exists() {
            return;
        }
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        let _ = std::fs::write(&path, Config::default().to_toml());
    }

    /// Effective configuration: defaults, then file, then environment.
    pub fn from_env() -> Self {
        let mut config = Config::default();

        if let Some(path) = Self::config_path() {
            if path.exists() {
                match std::fs::read_to_string(&path) {
                    Ok(text) => match toml::from_str::<FileConfig>(&text) {
                        Ok(file) => config.apply_file(file),
                        Err(e) => eprintln!("Warning: ignoring bad config {}: {e}", path.display()),
                    },
                    Err(e) => eprintln!("Warning: cannot read {}: {e}", path.display()),
                }
            }
        }

        config.apply_env(std::env::vars());
        config
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(v) = file.collector_addr {
            self.collector_addr = v;
        }
        if let Some(v) = file.db_path {
            self.db_path = v;
        }
        if let Some(v) = file.log_dir {
            self.log_dir = v;
        }
        if let Some(v) = file.log_level {
            self.log_level = v;
        }
        if let Some(v) = file.log_to_file {
            self.log_to_file = v;
        }
        if let Some(v) = file.demo_mode {
            self.demo_mode = v;
        }
        if let Some(v) = file.netproxy_enabled {
            self.netproxy_enabled = v;
        }
        if let Some(v) = file.netproxy_port {
            self.netproxy_port = v;
        }
        if let Some(v) = file.dedup_window_ms {
            self.dedup_window_ms = v;
        }
        if let Some(v) = file.retention_days {
            self.retention_days = v;
        }
    }

    /// Overrides from `MCPSPY_*` variables; injectable for tests.
    fn apply_env<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                "MCPSPY_PORT" => {
                    if let Ok(port) = value.parse() {
                        self.collector_addr = SocketAddr::from(([127, 0, 0, 1], port));
                    }
                }
                "MCPSPY_DB" => self.db_path = PathBuf::from(value),
                "MCPSPY_LOG_LEVEL" => self.log_level = value,
                "MCPSPY_LOG_FILE" => self.log_to_file = value == "1" || value == "true",
                "MCPSPY_DEMO" => self.demo_mode = value == "1" || value == "true",
                "MCPSPY_NETPROXY" => self.netproxy_enabled = value == "1" || value == "true",
                "MCPSPY_RETENTION_DAYS" => {
                    if let Ok(days) = value.parse() {
                        self.retention_days = days;
                    }
                }
                _ => {}
            }
        }
    }

    /// Commented template; also the `config --reset` output.
    pub fn to_toml(&self) -> String {
        format!(
            r#"# mcpspy configuration
# Delete a line to fall back to the built-in default.

# Loopback address the Collector listens on
collector_addr = "{collector_addr}"

# SQLite event store (literal string: Windows paths keep their backslashes)
db_path = '{db_path}'

# Logging
log_dir = '{log_dir}'
log_level = "{log_level}"
log_to_file = {log_to_file}

# Generate a synthetic trace instead of attaching to the OS
demo_mode = {demo_mode}

# HTTP(S) interceptor feed
netproxy_enabled = {netproxy_enabled}
netproxy_port = {netproxy_port}

# Collapse window for identical file events (milliseconds)
dedup_window_ms = {dedup_window_ms}

# Days of raw events to keep (0 = forever)
retention_days = {retention_days}
"#,
            collector_addr = self.collector_addr,
            db_path = self.db_path.display(),
            log_dir = self.log_dir.display(),
            log_level = self.log_level,
            log_to_file = self.log_to_file,
            demo_mode = self.demo_mode,
            netproxy_enabled = self.netproxy_enabled,
            netproxy_port = self.netproxy_port,
            dedup_window_ms = self.dedup_window_ms,
            retention_days = self.retention_days,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Verify that the generated template can be parsed back. This
    /// catches TOML syntax errors in `to_toml` before a user hits them.
    #[test]
    fn test_config_roundtrip_default() {
        let config = Config::default();
        let toml_str = config.to_toml();
        let parsed: Result<FileConfig, _> = toml::from_str(&toml_str);
        assert!(
            parsed.is_ok(),
            "Default config should round-trip.\nTOML:\n{}\nError: {:?}",
            toml_str,
            parsed.err()
        );
        let file = parsed.unwrap();
        assert_eq!(file.collector_addr, Some(config.collector_addr));
        assert_eq!(file.netproxy_port, Some(config.netproxy_port));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut config = Config::default();
        let file: FileConfig = toml::from_str(
            r#"
            log_level = "debug"
            retention_days = 14
            "#,
        )
        .unwrap();
        config.apply_file(file);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.retention_days, 14);
        // Untouched fields keep their defaults
        assert_eq!(config.dedup_window_ms, 500);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::default();
        config.log_level = "warn".into();
        config.apply_env(vec![
            ("MCPSPY_LOG_LEVEL".to_string(), "trace".to_string()),
            ("MCPSPY_PORT".to_string(), "9001".to_string()),
            ("MCPSPY_DEMO".to_string(), "1".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ]);
        assert_eq!(config.log_level, "trace");
        assert_eq!(config.collector_addr.port(), 9001);
        assert!(config.demo_mode);
    }

    #[test]
    fn test_bad_env_values_ignored() {
        let mut config = Config::default();
        config.apply_env(vec![("MCPSPY_PORT".to_string(), "not-a-port".to_string())]);
        assert_eq!(config.collector_addr.port(), DEFAULT_COLLECTOR_PORT);
    }
}
