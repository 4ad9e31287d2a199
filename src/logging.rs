// Logging setup - tracing subscriber with optional file output
//
// Precedence for the filter: RUST_LOG env var > config file level > "info".
// File logging uses a non-blocking daily-rolling appender; the returned
// guard must stay alive for the process lifetime or buffered lines are
// lost on exit.

use crate::config::Config;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub fn init(config: &Config) -> Option<WorkerGuard> {
    let default_filter = format!("mcpspy={}", config.log_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    if config.log_to_file {
        let appender = tracing_appender::rolling::daily(&config.log_dir, "mcpspy.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false),
            )
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false),
            )
            .init();
        None
    }
}
