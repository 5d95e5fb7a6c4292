mod config;

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use clap::Parser;
use config::{ServerArgs, ServerConfig, Transport};
use sc_net::secure::SecureFrontEnd;
use sc_net::stream::StreamFrontEnd;
use sc_queue::WorkQueue;
use sc_session::DtlsContext;
use sc_worker::{QueuedResponseSink, ResponseSink, WorkItem, WorkerPool};
use tracing::{error, info};

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let config = ServerConfig::from(ServerArgs::parse());

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server failed to start");
            ExitCode::FAILURE
        }
    }
}

fn run(config: ServerConfig) -> anyhow::Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    install_signal_handlers(Arc::clone(&shutdown))?;

    let queue = Arc::new(WorkQueue::<WorkItem>::new(config.queue_capacity).context("creating work queue")?);
    let responses = Arc::new(WorkQueue::new(config.queue_capacity).context("creating response queue")?);
    let sink: Arc<dyn ResponseSink> = Arc::new(QueuedResponseSink::new(Arc::clone(&responses)));

    let workers = WorkerPool::start(config.workers, Arc::clone(&queue), sink, Arc::clone(&shutdown));
    info!(workers = config.workers, "worker pool started");

    let mut handles = Vec::new();

    if matches!(config.transport, Transport::Stream | Transport::Both) {
        let stream_addr = config.stream_addr;
        let pool_size = config.pool_size;
        let queue = Arc::clone(&queue);
        let responses = Arc::clone(&responses);
        let shutdown = Arc::clone(&shutdown);
        handles.push(
            std::thread::Builder::new()
                .name("sc-net-stream".into())
                .spawn(move || {
                    match StreamFrontEnd::bind(stream_addr, pool_size, queue, responses) {
                        Ok(mut front) => {
                            if let Err(e) = front.run(&shutdown) {
                                error!(error = %e, "stream front end exited with error");
                            }
                        }
                        Err(e) => error!(error = %e, "failed to bind stream front end"),
                    }
                    shutdown.store(true, Ordering::Relaxed);
                })
                .context("spawning stream front end thread")?,
        );
    }

    if matches!(config.transport, Transport::Secure | Transport::Both) {
        let ctx = Arc::new(
            DtlsContext::server(&config.cert_path, &config.key_path)
                .context("initializing server DTLS context")?,
        );
        let secure_addr = config.secure_addr;
        let shutdown = Arc::clone(&shutdown);
        handles.push(
            std::thread::Builder::new()
                .name("sc-net-secure".into())
                .spawn(move || {
                    match SecureFrontEnd::bind(secure_addr, ctx) {
                        Ok(mut front) => {
                            if let Err(e) = front.run(&shutdown) {
                                error!(error = %e, "secure front end exited with error");
                            }
                        }
                        Err(e) => error!(error = %e, "failed to bind secure front end"),
                    }
                    shutdown.store(true, Ordering::Relaxed);
                })
                .context("spawning secure front end thread")?,
        );
    }

    for handle in handles {
        let _ = handle.join();
    }

    shutdown.store(true, Ordering::Relaxed);
    queue.close();
    workers.join();

    queue.drain_with_cleanup(|item| {
        info!(origin = ?item.origin, "dropping unprocessed request at shutdown");
    });
    responses.drain_with_cleanup(|(origin, _, _)| {
        info!(?origin, "dropping undelivered response at shutdown");
    });

    info!("server shut down cleanly");
    Ok(())
}

/// Installs `SIGINT`/`SIGTERM` handlers that only flip `shutdown`. The
/// handlers never allocate, log, or touch sockets — only the async-signal-safe
/// flag store.
fn install_signal_handlers(shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        let shutdown = Arc::clone(&shutdown);
        unsafe {
            signal_hook::low_level::register(sig, move || {
                shutdown.store(true, Ordering::Relaxed);
            })
            .with_context(|| format!("registering handler for signal {sig}"))?;
        }
    }
    Ok(())
}
