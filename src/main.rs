//! `devsim` binary: parses CLI flags, loads configuration, binds the
//! listener and hands off to the supervisor loop.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::info;

use devsim::config::Config;
use devsim::registry::Registry;
use devsim::server::Server;
use devsim::{logging, supervisor};

#[derive(Parser)]
#[command(name = "devsim", about = "Concurrent device simulator core")]
struct Args {
    /// TCP port to listen on (overrides the config file and built-in default).
    #[arg(short = 'p', long)]
    port: Option<u16>,
    /// Path to a YAML configuration file.
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,
    /// Address to bind the listener to.
    #[arg(short = 'b', long)]
    bind: Option<String>,
    /// Enable debug-level logging.
    #[arg(short = 'v', long)]
    verbose: bool,
    /// Maximum number of concurrent client connections.
    #[arg(long = "max-clients")]
    max_clients: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut cfg = Config::load(args.config.as_deref())
        .with_context(|| "loading configuration")?;
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(bind) = args.bind {
        cfg.bind = bind;
    }
    if let Some(max_clients) = args.max_clients {
        cfg.max_clients = max_clients;
    }
    if args.verbose {
        cfg.verbose = true;
    }

    logging::init(cfg.verbose);
    info!("devsim starting");

    let server = Server::bind(&cfg).with_context(|| "binding listener")?;
    let mut registry = Registry::new(cfg.max_pvs, cfg.max_motors);
    registry.init();

    let tick_period = Duration::from_millis(cfg.tick_period_ms);
    supervisor::run(server, registry, tick_period)
}
