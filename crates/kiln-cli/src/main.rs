use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use kiln::{DispatchModel, LogFormat, Server, ServerConfig, logging, open_store};

#[derive(Parser)]
#[command(name = "kiln")]
#[command(about = "epoll-driven HTTP/1.1 server for static pages and credential forms")]
#[command(version)]
struct Cli {
    /// TOML config file. Without it, KILN_* variables (and .env) are read.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Log format: plain (0), json (1) or pretty
    #[arg(short = 'l', long = "log")]
    log_format: Option<LogFormat>,

    /// Append logs to this file (e.g. ./ServerLog) instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Trigger mode: 0 LT+LT, 1 LT+ET, 2 ET+LT, 3 ET+ET (listener+connections)
    #[arg(short = 'm', long = "trig", value_parser = clap::value_parser!(u8).range(0..=3))]
    trig_mode: Option<u8>,

    /// Abortive close with SO_LINGER: 0 off, 1 on
    #[arg(short = 'o', long = "linger", value_parser = clap::value_parser!(u8).range(0..=1))]
    opt_linger: Option<u8>,

    /// Credential store pool size
    #[arg(short = 's', long = "store-pool")]
    store_pool_size: Option<usize>,

    /// Worker threads
    #[arg(short = 't', long = "threads")]
    thread_num: Option<usize>,

    /// Disable logging: 0 log, 1 silent
    #[arg(short = 'c', long = "close-log", value_parser = clap::value_parser!(u8).range(0..=1))]
    close_log: Option<u8>,

    /// Dispatch model: 0 proactor, 1 reactor
    #[arg(short = 'a', long = "actor", value_parser = clap::value_parser!(u8).range(0..=1))]
    actor_model: Option<u8>,

    /// Document root
    #[arg(long)]
    root: Option<PathBuf>,

    /// Seconds between idle sweeps; connections idle for three slots are closed
    #[arg(long)]
    timeslot: Option<u64>,

    /// Users file for the persistent credential store
    #[arg(long)]
    users: Option<PathBuf>,
}

impl Cli {
    fn load(&self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ServerConfig::from_env().context("reading KILN_* environment")?,
        };

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        if let Some(mode) = self.trig_mode {
            config.set_trig_mode(mode)?;
        }
        if let Some(linger) = self.opt_linger {
            config.opt_linger = linger == 1;
        }
        if let Some(size) = self.store_pool_size {
            config.store_pool_size = size;
        }
        if let Some(threads) = self.thread_num {
            config.thread_num = threads;
        }
        if let Some(close) = self.close_log {
            config.close_log = close == 1;
        }
        if let Some(model) = self.actor_model {
            config.dispatch = DispatchModel::from_actor_model(model)?;
        }
        if let Some(root) = &self.root {
            config.doc_root = root.clone();
        }
        if let Some(secs) = self.timeslot {
            config.timeslot_secs = secs;
        }
        if let Some(path) = &self.log_file {
            config.log_file = Some(path.clone());
        }
        if let Some(users) = &self.users {
            config.users_file = Some(users.clone());
        }
        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load()?;
    logging::init_from_config(&config).context("initializing logging")?;

    let store = open_store(&config).context("opening credential store")?;
    let mut server = Server::bind(config, store).context("starting server")?;

    let handle = server.shutdown_handle();
    ctrlc::set_handler(move || {
        tracing::info!("Received SIGINT. Initiating graceful shutdown...");
        handle.shutdown();
    })
    .context("installing Ctrl-C handler")?;

    server.run()?;
    tracing::info!("server stopped");
    Ok(())
}
