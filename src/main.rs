// mcpspy - Observation core for MCP server activity
//
// Observes an AI-assistant host and every MCP server it spawns, and
// multiplexes everything into one normalized event stream:
// - KernelSource: process/file/network events from a trace session,
//   scoped to the host's process tree and tagged per MCP server
// - ProxySource (`mcpspy proxy`): stdio interposer mirroring JSON-RPC
// - NetProxySource: line-framed events from an HTTP(S) interceptor
// - CollectorServer: framed loopback fan-in feeding the SQLite store

mod cli;
mod collector;
mod config;
mod envelope;
mod graph;
mod hosts;
mod logging;
mod noise;
mod registry;
mod sources;
mod startup;
mod store;
mod supervisor;
mod tagging;
mod trace;
mod transport;

use clap::Parser;
use cli::{Cli, Commands};
use config::Config;
use supervisor::TraceMode;

/// Exit code for operator errors (no provider, bad target, broken store).
const EXIT_OPERATOR_ERROR: i32 = 2;

#[tokio::main]
async fn main() {
    let args = Cli::parse();

    match args.command {
        Some(Commands::Config { show, reset, path }) => {
            cli::handle_config(show, reset, path);
        }
        Some(Commands::Events { limit, tag }) => {
            let config = Config::from_env();
            cli::handle_events(&config, limit, tag.as_deref());
        }
        Some(Commands::Stats) => {
            let config = Config::from_env();
            cli::handle_stats(&config);
        }
        Some(Commands::Proxy {
            name,
            collector,
            command,
        }) => {
            let config = Config::from_env();
            // Logs go to stderr only: stdout belongs to the JSON-RPC stream
            let _guard = logging::init(&config);
            let opts = sources::proxy::ProxyOptions {
                name,
                collector: collector.unwrap_or(config.collector_addr),
                command,
            };
            match sources::proxy::run(opts).await {
                Ok(code) => std::process::exit(code),
                Err(e) => {
                    eprintln!("Error: {e:#}");
                    std::process::exit(EXIT_OPERATOR_ERROR);
                }
            }
        }
        None => {
            Config::ensure_config_exists();
            let mut config = Config::from_env();
            if let Some(port) = args.port {
                config.collector_addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
            }
            if args.demo {
                config.demo_mode = true;
            }
            let _guard = logging::init(&config);

            let target = match supervisor::select_target(args.target.as_deref()) {
                Ok(target) => target,
                Err(e) => {
                    eprintln!("Error: {e:#}");
                    std::process::exit(EXIT_OPERATOR_ERROR);
                }
            };

            startup::print_startup(&config, target);

            let mode = if let Some(path) = args.replay {
                TraceMode::Replay(path)
            } else if config.demo_mode {
                TraceMode::Demo
            } else {
                TraceMode::Platform
            };

            match supervisor::run(config, target, mode).await {
                Ok(code) => std::process::exit(code),
                Err(e) => {
                    eprintln!("Error: {e:#}");
                    std::process::exit(EXIT_OPERATOR_ERROR);
                }
            }
        }
    }
}
