// src/main.rs
use anyhow::Context;
use clap::Parser;
use fugue_core::{Server, ServerConfig};
use mimalloc::MiMalloc;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

mod app;
mod probe;

use app::AppOptions;
use probe::ProbeHistory;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "fugue")]
#[command(about = "Serve static files, a system probe API and a WebSocket echo endpoint")]
#[command(version)]
struct Cli {
    /// Address to bind
    host: Option<String>,
    /// Port to bind
    port: Option<u16>,
    /// Directory served for GET requests
    #[arg(env = "FUGUE_WWW_ROOT", default_value = ".")]
    www_root: PathBuf,
    /// TOML file with server settings; flags take precedence
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Number of worker threads
    #[arg(long, short)]
    workers: Option<usize>,
    /// Largest unparsed request or frame accepted, in bytes
    #[arg(long)]
    max_payload_size: Option<usize>,
    /// Do not pin worker threads to CPU cores
    #[arg(long)]
    no_pin: bool,
    /// Seconds between system probe samples
    #[arg(long, default_value_t = 5)]
    probe_interval: u64,
    /// Number of probe samples kept
    #[arg(long, default_value_t = 100)]
    probe_history: usize,
}

/// File (or `FUGUE_*` environment) settings overlaid with flags.
fn load_config(cli: &Cli) -> anyhow::Result<ServerConfig> {
    let mut cfg = match &cli.config {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<ServerConfig>(&raw)
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => ServerConfig::from_env()?,
    };
    if let Some(host) = &cli.host {
        cfg.host = host.clone();
    }
    if let Some(port) = cli.port {
        cfg.port = port;
    }
    if let Some(workers) = cli.workers {
        cfg.workers = workers;
    }
    if let Some(max) = cli.max_payload_size {
        cfg.max_payload_size = max;
    }
    if cli.no_pin {
        cfg.pin_workers = false;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn main() -> anyhow::Result<()> {
    fugue_core::logging::init_logging();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("Received SIGINT. Initiating graceful shutdown...");
        flag.store(true, Ordering::SeqCst);
    })
    .context("installing Ctrl-C handler")?;

    let history = Arc::new(ProbeHistory::new(cli.probe_history));
    let sampler = probe::spawn_sampler(
        history.clone(),
        Duration::from_secs(cli.probe_interval.max(1)),
        shutdown.clone(),
    )
    .context("starting probe thread")?;

    let router = app::build_router(
        AppOptions {
            www_root: cli.www_root.clone(),
        },
        history,
    )?;
    info!("Serving {} on {}", cli.www_root.display(), config.address());
    let result = Server::new(config).shutdown_flag(shutdown.clone()).serve(router);

    shutdown.store(true, Ordering::SeqCst);
    let _ = sampler.join();
    result?;
    Ok(())
}
