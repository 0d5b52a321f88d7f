use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use etude_core::{Config, Server, init_logging};
use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Readiness-driven HTTP/1.1 static file server.
#[derive(Parser)]
#[command(name = "etude")]
#[command(about = "Serve static files over HTTP/1.1 from an epoll reactor")]
#[command(version)]
struct Cli {
    /// Port to listen on (overrides ETUDE_PORT)
    port: Option<u16>,

    /// Address to bind (overrides ETUDE_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Document root served to clients (overrides ETUDE_DOC_ROOT)
    #[arg(long)]
    root: Option<PathBuf>,

    /// Worker pool size, 0 = one per core (overrides ETUDE_WORKERS)
    #[arg(long)]
    workers: Option<usize>,

    /// Maximum concurrent connections (overrides ETUDE_MAX_CONNECTIONS)
    #[arg(long)]
    max_connections: Option<usize>,

    /// Idle connection timeout in seconds (overrides ETUDE_IDLE_TIMEOUT_SECS)
    #[arg(long)]
    idle_timeout: Option<u64>,
}

fn main() -> ExitCode {
    init_logging();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(root) = cli.root {
        config.doc_root = root;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    if let Some(max) = cli.max_connections {
        config.max_connections = max;
    }
    if let Some(timeout) = cli.idle_timeout {
        config.idle_timeout_secs = timeout;
    }

    let server = match Server::bind(config) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed to bind");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run() {
        tracing::error!(error = %e, "server failed");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
