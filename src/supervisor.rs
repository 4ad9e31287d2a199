// Supervisor - lifecycle of the observation pipeline
//
// Builds the shared observation context (graph, registry, resolver,
// transport), opens the store, starts the Collector and the kernel
// source, optionally the interceptor feed, and coordinates shutdown.
// Only operator errors (no trace provider, unusable store, unknown
// target) surface to the exit code; everything else degrades.

use crate::collector::CollectorServer;
use crate::config::Config;
use crate::envelope::EventEnvelope;
use crate::graph::ProcessGraph;
use crate::hosts::{HostTarget, TARGETS};
use crate::noise::NoiseFilter;
use crate::registry::McpRegistry;
use crate::sources::kernel::KernelSource;
use crate::sources::netproxy::NetProxySource;
use crate::store::{spawn_writer, EventStore};
use crate::tagging::TagResolver;
use crate::trace::{ProcPollSession, ProviderKind, ReplaySession, TraceSession};
use crate::transport::EventSink;
use anyhow::{Context, Result};
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// How the kernel source attaches to a trace facility.
pub enum TraceMode {
    /// Synthetic demo sequence
    Demo,
    /// Recorded JSONL trace
    Replay(PathBuf),
    /// Whatever the platform offers
    Platform,
}

/// Everything the sources share, built once and passed by reference.
pub struct ObservationContext {
    pub graph: Arc<ProcessGraph>,
    pub registry: Arc<McpRegistry>,
    pub resolver: Arc<TagResolver>,
    pub sink: Arc<EventSink>,
}

impl ObservationContext {
    pub fn build(config: &Config, target: &'static HostTarget) -> Self {
        let registry = Arc::new(McpRegistry::load(target));
        let graph = Arc::new(ProcessGraph::new(&target.image()));
        let resolver = Arc::new(TagResolver::new(registry.clone()));
        let sink = Arc::new(EventSink::new(config.collector_addr));
        Self {
            graph,
            registry,
            resolver,
            sink,
        }
    }
}

/// Resolve the host target from the CLI, prompting interactively when it
/// was not given. Unknown names are operator errors.
pub fn select_target(arg: Option<&str>) -> Result<&'static HostTarget> {
    if let Some(key) = arg {
        return HostTarget::find(key).with_context(|| {
            let known: Vec<&str> = TARGETS.iter().map(|t| t.key).collect();
            format!("unknown host target '{key}' (known: {})", known.join(", "))
        });
    }

    println!("Select the host target to observe:");
    for (i, target) in TARGETS.iter().enumerate() {
        println!("  {}) {} - {}", i + 1, target.key, target.description);
    }
    print!("Target [1]: ");
    std::io::stdout().flush().ok();

    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("reading target selection")?;
    let choice = line.trim();
    if choice.is_empty() {
        return Ok(&TARGETS[0]);
    }
    if let Ok(index) = choice.parse::<usize>() {
        if index >= 1 && index <= TARGETS.len() {
            return Ok(&TARGETS[index - 1]);
        }
    }
    HostTarget::find(choice).with_context(|| format!("unknown host target '{choice}'"))
}

fn attach_session(mode: TraceMode, target: &HostTarget) -> Result<Box<dyn TraceSession>> {
    match mode {
        TraceMode::Demo => Ok(Box::new(ReplaySession::demo(&target.image()))),
        TraceMode::Replay(path) => Ok(Box::new(ReplaySession::from_file(&path)?)),
        TraceMode::Platform => {
            let session = ProcPollSession::start(Duration::from_millis(250))
                .context("no trace provider could be attached")?;
            Ok(Box::new(session))
        }
    }
}

/// Run the pipeline to completion. Returns the process exit code.
pub async fn run(config: Config, target: &'static HostTarget, mode: TraceMode) -> Result<i32> {
    let context = ObservationContext::build(&config, target);
    tracing::info!(
        "Observing {} ({} registry entries)",
        target.name,
        context.registry.entry_count()
    );

    // Store first: a schema failure on a fresh store is fatal.
    let mut store = EventStore::open(&config.db_path)?;
    if config.retention_days > 0 {
        match store.apply_retention(config.retention_days) {
            Ok(0) => {}
            Ok(n) => tracing::info!("Retention removed {n} old events"),
            Err(e) => tracing::warn!("Retention sweep failed: {e:#}"),
        }
    }
    let (store_handle, writer_join) = spawn_writer(store)?;

    let (stop_tx, stop_rx) = watch::channel(false);

    let collector = CollectorServer::bind(config.collector_addr, store_handle.clone()).await?;
    let collector_task = tokio::spawn(collector.run(stop_rx.clone()));

    // Trace session; in demo/replay mode an attach failure is also fatal.
    let session = attach_session(mode, target)?;
    let attached = session.providers().to_vec();
    for provider in [ProviderKind::File, ProviderKind::Network] {
        if !attached.contains(&provider) {
            tracing::warn!("{provider:?} provider not attached, capture fidelity reduced");
        }
    }
    let stopper = session.stopper();

    // Kernel source on its own thread; envelopes flow through a channel
    // to an emitter thread that owns the framed client.
    let (envelope_tx, envelope_rx) = mpsc::channel::<EventEnvelope>();
    let kernel = KernelSource::new(
        context.graph.clone(),
        context.registry.clone(),
        context.resolver.clone(),
        NoiseFilter::new(
            &target.config_file_name().into_iter().collect::<Vec<_>>(),
            Duration::from_millis(config.dedup_window_ms),
        ),
    );
    let kernel_thread = std::thread::Builder::new()
        .name("kernel-source".into())
        .spawn(move || kernel.run(session, envelope_tx))
        .context("spawning kernel source thread")?;

    let emitter_sink = context.sink.clone();
    let emitter_thread = std::thread::Builder::new()
        .name("kernel-emitter".into())
        .spawn(move || {
            for envelope in envelope_rx {
                emitter_sink.send(&envelope);
            }
        })
        .context("spawning emitter thread")?;

    // Optional interceptor feed
    if config.netproxy_enabled {
        let feed = NetProxySource::new(
            std::net::SocketAddr::from(([127, 0, 0, 1], config.netproxy_port)),
            context.sink.clone(),
        );
        let feed_stop = stop_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = feed.run(feed_stop).await {
                tracing::warn!("Interceptor feed failed: {e:#}");
            }
        });
    }

    // Run until Ctrl-C or until the trace session drains (demo/replay).
    let mut kernel_done = tokio::task::spawn_blocking(move || {
        kernel_thread.join().ok();
        emitter_thread.join().ok();
    });
    let drained = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down...");
            false
        }
        _ = &mut kernel_done => {
            tracing::info!("Trace session ended");
            true
        }
    };

    // Stop the trace session (idempotent) and wait for the pipeline to drain.
    stopper.stop();
    if !drained {
        let _ = kernel_done.await;
    }
    if context.sink.dropped() > 0 {
        tracing::warn!(
            "{} events never reached the Collector",
            context.sink.dropped()
        );
    }
    tracing::debug!("{} processes still tracked at shutdown", context.graph.len());

    // Give in-flight frames a moment to reach the collector, then stop it.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let _ = stop_tx.send(true);
    let _ = collector_task.await;

    // Close our writer handle; the thread exits once all producers are
    // gone. External producers may still hold readers, so don't wait
    // forever.
    drop(store_handle);
    drop(context);
    let writer_wait = tokio::task::spawn_blocking(move || {
        writer_join.join().ok();
    });
    if tokio::time::timeout(Duration::from_secs(5), writer_wait)
        .await
        .is_err()
    {
        tracing::warn!("Store writer still busy at exit, leaving it to the OS");
    }

    tracing::info!("Shutdown complete");
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_target_by_key() {
        assert_eq!(select_target(Some("claude")).unwrap().name, "Claude");
        assert!(select_target(Some("nonsense")).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_demo_run_populates_store() {
        let dir = tempfile::tempdir().unwrap();
        // Ephemeral collector port so parallel tests never collide
        let collector_addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let config = Config {
            db_path: dir.path().join("events.db"),
            collector_addr,
            ..Config::default()
        };

        let target = HostTarget::find("claude").unwrap();
        let code = run(config.clone(), target, TraceMode::Demo).await.unwrap();
        assert_eq!(code, 0);

        let query = crate::store::query::StoreQuery::open(&config.db_path).unwrap();
        let types = query.counts_by_type().unwrap();
        let names: Vec<&str> = types.iter().map(|t| t.key.as_str()).collect();
        assert!(names.contains(&"Process"), "got {names:?}");
        assert!(names.contains(&"File"), "got {names:?}");
        assert!(names.contains(&"Network"), "got {names:?}");
    }
}
