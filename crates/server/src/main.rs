//! cellprobed — the spreadsheet oracle server.

mod auth;
mod config;
mod janitor;
mod server;
mod service;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use cellprobe_engine::bridge::BridgeSpawner;
use cellprobe_store::{DocumentStore, MemoCache};

use crate::auth::AuthToken;
use crate::config::ServerConfig;
use crate::janitor::{spawn_janitor, EngineRegistry};
use crate::server::Server;
use crate::service::Service;

#[derive(Parser)]
#[command(name = "cellprobed", version, about = "Spreadsheet engine oracle server")]
struct Args {
    /// TOML configuration file.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen address (overrides config).
    #[arg(long)]
    bind: Option<String>,

    /// Listen port (overrides config).
    #[arg(long)]
    port: Option<u16>,

    /// Shared auth token. Generated and logged when absent.
    #[arg(long)]
    token: Option<String>,

    /// Root directory for the document store and memo cache.
    #[arg(long, value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Engine bridge executable.
    #[arg(long, value_name = "CMD")]
    bridge_command: Option<String>,

    /// Seconds before the janitor kills an engine process.
    #[arg(long)]
    engine_timeout_secs: Option<u64>,

    /// Worker pool size. Defaults to available CPU parallelism.
    #[arg(long)]
    workers: Option<usize>,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, String> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)?,
            None => ServerConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.token.is_some() {
            config.token = self.token;
        }
        if self.cache_dir.is_some() {
            config.cache_dir = self.cache_dir;
        }
        if let Some(command) = self.bridge_command {
            config.bridge.command = command;
        }
        if let Some(secs) = self.engine_timeout_secs {
            config.engine_timeout_secs = secs;
        }
        if self.workers.is_some() {
            config.workers = self.workers;
        }
        Ok(config)
    }
}

fn main() -> ExitCode {
    env_logger::init();
    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            eprintln!("cellprobed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), String> {
    let config = args.into_config()?;
    let cache_dir = config.cache_dir();

    let store = DocumentStore::new(cache_dir.join("docs"))
        .map_err(|e| format!("document store: {e}"))?;
    let memo = MemoCache::new(cache_dir.join("memo")).map_err(|e| format!("memo cache: {e}"))?;

    let registry = EngineRegistry::new();
    spawn_janitor(registry.clone(), Duration::from_secs(config.engine_timeout_secs));

    let spawner = Arc::new(BridgeSpawner::new(config.bridge.clone()));
    let service = Arc::new(Service::new(store, memo, spawner, registry));

    let generated = config.token.is_none();
    let auth = AuthToken::from_config(config.token.clone());
    if generated {
        log::info!("generated session token: {}", auth.reveal());
    }

    let workers = config.workers();
    let server = Server::bind(&config.bind, config.port, service, auth, workers)
        .map_err(|e| format!("bind {}:{}: {e}", config.bind, config.port))?;
    log::info!(
        "listening on {}:{} with {workers} workers, cache at {}",
        config.bind,
        config.port,
        cache_dir.display()
    );
    server.serve().map_err(|e| format!("server: {e}"))
}
