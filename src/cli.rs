// CLI module - command-line argument parsing and query/config handlers
//
// The default invocation runs the Supervisor against a host target. The
// `proxy` subcommand is the stdio interposer the host launches in place
// of a real MCP server. `config`, `events` and `stats` are utilities
// that never start the observation pipeline.

use crate::config::{Config, VERSION};
use crate::store::query::StoreQuery;
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

/// mcpspy - observation core for MCP server activity
#[derive(Parser)]
#[command(name = "mcpspy")]
#[command(version = VERSION)]
#[command(about = "Observe an AI-assistant host and its MCP servers", long_about = None)]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    /// Host target to observe (claude, cursor); prompts when omitted
    pub target: Option<String>,

    /// Generate a synthetic trace instead of attaching to the OS
    #[arg(long)]
    pub demo: bool,

    /// Replay a recorded JSONL trace file
    #[arg(long, value_name = "FILE")]
    pub replay: Option<PathBuf>,

    /// Collector port override
    #[arg(long)]
    pub port: Option<u16>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Interpose one MCP server: `mcpspy proxy --name X -- <command…>`
    Proxy {
        /// Canonical MCP name for mirrored events
        #[arg(long)]
        name: Option<String>,

        /// Collector address (defaults to the configured one)
        #[arg(long)]
        collector: Option<SocketAddr>,

        /// The real server command, after `--`
        #[arg(required = true, last = true)]
        command: Vec<String>,
    },

    /// Manage configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Reset config file to defaults
        #[arg(long)]
        reset: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },

    /// Show recent stored events
    Events {
        /// Maximum rows to print
        #[arg(long, default_value_t = 20)]
        limit: usize,

        /// Only events with this MCP tag
        #[arg(long)]
        tag: Option<String>,
    },

    /// Aggregate statistics from the store
    Stats,
}

pub fn handle_config(show: bool, reset: bool, path: bool) {
    if path {
        match Config::config_path() {
            Some(p) => println!("{}", p.display()),
            None => {
                eprintln!("Error: could not determine config path");
                std::process::exit(1);
            }
        }
    } else if reset {
        let Some(p) = Config::config_path() else {
            eprintln!("Error: could not determine config path");
            std::process::exit(1);
        };
        if let Some(parent) = p.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                eprintln!("Error creating directory: {e}");
                std::process::exit(1);
            }
        }
        if let Err(e) = std::fs::write(&p, Config::default().to_toml()) {
            eprintln!("Error writing config: {e}");
            std::process::exit(1);
        }
        println!("Config reset to defaults: {}", p.display());
    } else if show {
        let config = Config::from_env();
        println!("# Effective configuration (env > file > defaults)");
        println!();
        print!("{}", config.to_toml());
        println!();
        match Config::config_path() {
            Some(p) if p.exists() => println!("# Source: {}", p.display()),
            _ => println!("# Source: defaults (no config file)"),
        }
    } else {
        println!("Usage: mcpspy config [--show|--reset|--path]");
    }
}

pub fn handle_events(config: &Config, limit: usize, tag: Option<&str>) {
    let query = match StoreQuery::open(&config.db_path) {
        Ok(q) => q,
        Err(e) => {
            eprintln!("Cannot open store {}: {e:#}", config.db_path.display());
            std::process::exit(1);
        }
    };
    match query.recent(limit, tag) {
        Ok(rows) if rows.is_empty() => println!("No events stored yet."),
        Ok(rows) => {
            println!(
                "{:>8}  {:<24}  {:<10}  {:<8}  {:<7}  {:<16}  {}",
                "id", "time", "producer", "type", "pid", "tag", "pname"
            );
            for row in rows {
                println!(
                    "{:>8}  {:<24}  {:<10}  {:<8}  {:<7}  {:<16}  {}",
                    row.id,
                    format_ts(row.ts),
                    row.producer,
                    row.event_type,
                    row.pid.map(|p| p.to_string()).unwrap_or_default(),
                    row.mcp_tag.unwrap_or_default(),
                    row.pname.unwrap_or_default(),
                );
            }
        }
        Err(e) => {
            eprintln!("Query failed: {e:#}");
            std::process::exit(1);
        }
    }
}

pub fn handle_stats(config: &Config) {
    let query = match StoreQuery::open(&config.db_path) {
        Ok(q) => q,
        Err(e) => {
            eprintln!("Cannot open store {}: {e:#}", config.db_path.display());
            std::process::exit(1);
        }
    };
    let sections = [
        ("Events by MCP tag", query.counts_by_tag()),
        ("Events by type", query.counts_by_type()),
        ("JSON-RPC methods", query.rpc_methods()),
    ];
    for (title, rows) in sections {
        println!("{title}:");
        match rows {
            Ok(rows) if rows.is_empty() => println!("  (none)"),
            Ok(rows) => {
                for row in rows {
                    println!("  {:<32} {}", row.key, row.count);
                }
            }
            Err(e) => println!("  query failed: {e:#}"),
        }
        println!();
    }
}

fn format_ts(ns: i64) -> String {
    Utc.timestamp_nanos(ns)
        .format("%Y-%m-%d %H:%M:%S%.3f")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_default_run_with_target() {
        let cli = Cli::try_parse_from(["mcpspy", "claude", "--demo"]).unwrap();
        assert_eq!(cli.target.as_deref(), Some("claude"));
        assert!(cli.demo);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_cli_proxy_subcommand() {
        let cli = Cli::try_parse_from([
            "mcpspy", "proxy", "--name", "Weather", "--", "python", "-m", "mcp_server_weather",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Proxy { name, command, .. }) => {
                assert_eq!(name.as_deref(), Some("Weather"));
                assert_eq!(command, vec!["python", "-m", "mcp_server_weather"]);
            }
            _ => panic!("expected proxy subcommand"),
        }
    }

    #[test]
    fn test_cli_proxy_requires_command() {
        assert!(Cli::try_parse_from(["mcpspy", "proxy", "--name", "X"]).is_err());
    }

    #[test]
    fn test_cli_events_defaults() {
        let cli = Cli::try_parse_from(["mcpspy", "events"]).unwrap();
        match cli.command {
            Some(Commands::Events { limit, tag }) => {
                assert_eq!(limit, 20);
                assert!(tag.is_none());
            }
            _ => panic!("expected events subcommand"),
        }
    }
}
