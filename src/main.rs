//! tcp-server: echo server on top of the listening-socket manager.
//!
//! ```text
//! config → TcpServer::new (TLS checked) → bind listeners → start(workers)
//!        → [fork] → per-worker runtime + reactor → serve until SIGINT/SIGTERM
//!        → stop() → drain
//! ```

use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;

use clap::Parser;
use tokio::io::AsyncWriteExt;

use tcp_server::config::{load_config, ListenerConfig, ServerConfig};
use tcp_server::lifecycle::{graceful_stop, shutdown::DEFAULT_DRAIN_GRACE, signals, startup};
use tcp_server::net::{ConnectionTracker, Stream, TokioReactor};
use tcp_server::observability::{logging, metrics};
use tcp_server::server::{HandlerError, StreamHandler, TcpServer};

#[derive(Debug, Parser)]
#[command(name = "tcp-server", version, about = "Echo server with optional TLS and worker processes")]
struct Args {
    /// Path to a TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen on this port only, replacing configured listeners.
    #[arg(short, long)]
    port: Option<u16>,

    /// Worker processes (0 = one per CPU core).
    #[arg(short, long)]
    workers: Option<usize>,
}

/// Writes back whatever it reads.
struct EchoHandler {
    tracker: ConnectionTracker,
}

impl StreamHandler for EchoHandler {
    fn handle_stream(&self, mut stream: Stream, peer: SocketAddr) -> Result<(), HandlerError> {
        let guard = self.tracker.track();
        tokio::task::spawn_local(async move {
            let _guard = guard;
            loop {
                match stream.read_chunk().await {
                    Ok(Some(chunk)) => {
                        if let Err(e) = stream.write_all(&chunk).await {
                            tracing::debug!(%peer, error = %e, "Echo write failed");
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(%peer, error = %e, "Echo read failed");
                        break;
                    }
                }
            }
        });
        Ok(())
    }
}

fn load(args: &Args) -> Result<ServerConfig, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ServerConfig {
            listeners: vec![ListenerConfig::default()],
            ..ServerConfig::default()
        },
    };

    if let Some(port) = args.port {
        config.listeners = vec![ListenerConfig {
            port,
            ..ListenerConfig::default()
        }];
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    Ok(config)
}

fn run(config: ServerConfig) -> Result<(), Box<dyn Error>> {
    let reactor = Rc::new(TokioReactor::new());
    let tracker = ConnectionTracker::new();

    let handler = EchoHandler {
        tracker: tracker.clone(),
    };
    let mut server = TcpServer::new(handler, config.server_options(), reactor.clone())?;
    startup::bind_listeners(&mut server, &config.listeners)?;

    // Forks here when workers != 1; everything below runs once per worker.
    server.start(config.workers)?;

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;

    reactor.block_on(&runtime, async {
        if server.task_id().unwrap_or(0) == 0 {
            if let Some(addr) = config.observability.metrics_address.as_deref() {
                metrics::init_metrics(addr.parse()?);
            }
        }

        tracing::info!(
            addresses = ?server.local_addrs(),
            task_id = ?server.task_id(),
            tls = config.tls.is_some(),
            "Serving"
        );

        signals::shutdown_signal().await?;
        graceful_stop(&mut server, &tracker, DEFAULT_DRAIN_GRACE).await;
        Ok::<_, Box<dyn Error>>(())
    })
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tcp-server: {e}");
            return ExitCode::FAILURE;
        }
    };

    logging::init_logging(&config.observability.log_filter, config.observability.log_format);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "tcp-server starting");

    match run(config) {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Fatal error");
            ExitCode::FAILURE
        }
    }
}
