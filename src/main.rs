//! Polyroute kernel server - main entry point.
//!
//! Starts both task surfaces over one shared kernel:
//! - IPC: length-prefixed JSON envelopes for adapters and TCP clients
//! - HTTP: `/`, `/health`, `/services`, `POST /task`

use clap::Parser;
use polyroute_core::ipc::IpcServer;
use polyroute_core::kernel::Kernel;
use polyroute_core::routing::RoundRobinSelector;
use polyroute_core::Config;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Polyglot task-routing kernel.
#[derive(Parser, Debug)]
#[command(name = "polyroute-kernel")]
#[command(version, about, long_about = None)]
struct Args {
    /// JSON config file; missing sections keep their defaults
    #[arg(short, long, env = "POLYROUTE_CONFIG")]
    config: Option<PathBuf>,

    /// Adapter/client TCP endpoint (overrides config and POLYROUTE_IPC_ADDR)
    #[arg(long)]
    ipc_addr: Option<String>,

    /// HTTP endpoint (overrides config and POLYROUTE_HTTP_ADDR)
    #[arg(long)]
    http_addr: Option<String>,

    /// Log filter when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,

    /// Rotate through adapters instead of picking one at random
    #[arg(long)]
    round_robin: bool,
}

fn load_config(args: &Args) -> polyroute_core::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    }
    .apply_env()?;

    if let Some(addr) = &args.ipc_addr {
        config.server.ipc_addr = addr.clone();
    }
    if let Some(addr) = &args.http_addr {
        config.server.http_addr = addr.clone();
    }
    if let Some(level) = &args.log_level {
        config.observability.log_level = level.clone();
    }
    config.observability.json_logs |= args.json_logs;

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args)?;

    polyroute_core::observability::init_tracing(&config.observability);

    let mut kernel = Kernel::new(config.clone());
    if args.round_robin {
        kernel = kernel.with_selector(Box::new(RoundRobinSelector::new()));
    }
    let kernel = Arc::new(kernel);

    let ipc_addr: SocketAddr = config.server.ipc_addr.parse()?;
    let ipc_listener = TcpListener::bind(ipc_addr).await?;
    let http_listener = TcpListener::bind(config.server.http_addr.as_str()).await?;

    let ipc = IpcServer::new(Arc::clone(&kernel), ipc_addr, config.ipc.clone());
    let cancel = ipc.cancel_token();

    tracing::info!(
        ipc_addr = %ipc_addr,
        http_addr = %config.server.http_addr,
        version = env!("CARGO_PKG_VERSION"),
        "polyroute kernel starting"
    );

    let http = tokio::spawn(polyroute_core::http::serve(
        Arc::clone(&kernel),
        http_listener,
        cancel.clone(),
    ));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
        }
        shutdown.cancel();
    });

    ipc.serve_on(ipc_listener).await?;
    http.await??;

    tracing::info!(tasks = ?kernel.task_stats(), "polyroute kernel stopped");
    Ok(())
}
