//! casbridge daemon
//!
//! Loads the configuration, starts the engine pool, and answers TCP
//! requests until SIGINT or SIGTERM.

use std::fs;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};

use casbridge::config::Config;
use casbridge::log::{Logger, TracingLogger};
use casbridge::logging::init_logging;
use casbridge::pool::WorkerPool;
use casbridge::{log_info, log_warn, server};

/// Bridge TCP clients to a pool of computer algebra engine processes.
#[derive(Parser, Debug)]
#[command(name = "casbridged")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file; replaces the default search path.
    #[arg(short, long, env = "CASBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter (overrides [general] log_level).
    #[arg(long)]
    log_level: Option<String>,

    /// Number of engine workers (overrides [engine] threads).
    #[arg(short = 'n', long)]
    threads: Option<usize>,

    /// Listen port (overrides [server] port).
    #[arg(short, long)]
    port: Option<u16>,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("casbridged: {:#}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load_file(path)?,
        None => Config::load()?,
    };
    if let Some(level) = cli.log_level {
        config.general.log_level = level;
    }
    if let Some(threads) = cli.threads.filter(|&n| n > 0) {
        config.engine.threads = threads;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let _guard = init_logging(&config.general.log_level, config.general.log_file.as_deref())
        .context("failed to initialize logging")?;
    let logger: Arc<dyn Logger> = Arc::new(TracingLogger);

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGTERM, shutdown.clone())?;
    signal_hook::flag::register(SIGINT, shutdown.clone())?;

    let address = config.listen_address();
    let listener =
        TcpListener::bind(&address).with_context(|| format!("failed to bind {}", address))?;

    let pool = Arc::new(WorkerPool::new(config.pool_config(), logger.clone())?);

    if let Some(pid_file) = &config.general.pid_file {
        fs::write(pid_file, format!("{}\n", process::id()))
            .with_context(|| format!("failed to write pidfile {}", pid_file.display()))?;
    }

    let served = server::serve(
        listener,
        pool.clone(),
        shutdown,
        config.server.max_request,
        logger.clone(),
    );

    log_info!(logger, "shutting down");
    pool.shutdown();

    if let Some(pid_file) = &config.general.pid_file {
        if let Err(e) = fs::remove_file(pid_file) {
            log_warn!(logger, "failed to remove pidfile {}: {}", pid_file.display(), e);
        }
    }

    served
}
