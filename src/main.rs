mod cache;
mod config;
mod net;
mod server;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use cache::{CacheStorage, SqliteStorage};
use config::Config;
use net::{Fetcher, UpstreamClient};
use server::ProxyState;
use worker::{OfflineCacheWorker, WorkerHost};

#[derive(Parser, Debug)]
#[command(name = "offcache")]
#[command(about = "Offline-first caching proxy for web applications")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./offcache.yaml or $XDG_CONFIG_HOME/offcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Increase log verbosity (-v debug, -vv trace)
  #[arg(short, long, action = clap::ArgAction::Count, global = true)]
  verbose: u8,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the configured cache version and serve requests (default)
  Serve,
  /// Pre-cache the configured version, delete stale buckets, and exit
  Install,
  /// List cache buckets
  Caches,
  /// Delete stale cache buckets
  Purge {
    /// Delete the current version's bucket too
    #[arg(long)]
    all: bool,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let _log_guard = init_logging(args.verbose, &config);

  let storage = Arc::new(SqliteStorage::open_at(&config.database_path()?)?);

  match args.command.unwrap_or(Command::Serve) {
    Command::Serve => serve(config, storage).await,
    Command::Install => install(config, storage).await,
    Command::Caches => list_caches(&config, &storage),
    Command::Purge { all } => purge(&config, &storage, all),
  }
}

/// Log to stderr, or to a daily file when `log_dir` is configured.
fn init_logging(verbose: u8, config: &Config) -> Option<WorkerGuard> {
  let filter = match verbose {
    0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("offcache=info")),
    1 => EnvFilter::new("offcache=debug,tower_http=debug"),
    _ => EnvFilter::new("offcache=trace,tower_http=trace"),
  };

  match &config.log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "offcache.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Some(guard)
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
      None
    }
  }
}

fn build_host(
  config: &Config,
  storage: Arc<SqliteStorage>,
) -> Result<(Arc<WorkerHost<SqliteStorage>>, Arc<OfflineCacheWorker<SqliteStorage>>)> {
  let network: Arc<dyn Fetcher> = Arc::new(UpstreamClient::new()?);
  let worker = OfflineCacheWorker::new(config.worker_settings()?, storage, Arc::clone(&network));
  let host = WorkerHost::new(network);

  Ok((Arc::new(host), Arc::new(worker)))
}

async fn serve(config: Config, storage: Arc<SqliteStorage>) -> Result<()> {
  let (host, worker) = build_host(&config, storage)?;

  // An unreachable upstream at startup must not stop the proxy; it then
  // passes requests through until restarted with a working install
  match host.register(worker).await {
    Ok(registration) => info!(
      version = %registration.version,
      deleted = registration.deleted.len(),
      skipped_waiting = registration.skipped_waiting,
      claimed = registration.claimed_clients,
      "Cache ready"
    ),
    Err(e) => warn!(error = %e, "Install failed, serving without offline cache"),
  }

  let state = ProxyState {
    host,
    origin: config.upstream_url()?,
    max_body_bytes: config.max_body_bytes,
  };

  server::serve(state, config.listen).await
}

async fn install(config: Config, storage: Arc<SqliteStorage>) -> Result<()> {
  let (host, worker) = build_host(&config, storage.clone())?;
  let registration = host.register(worker).await?;

  println!(
    "Installed {} ({} URLs)",
    registration.version,
    storage.entry_urls(&registration.version)?.len()
  );
  for name in &registration.deleted {
    println!("Deleted stale bucket {}", name);
  }

  Ok(())
}

fn list_caches(config: &Config, storage: &SqliteStorage) -> Result<()> {
  let summaries = storage.summaries()?;
  if summaries.is_empty() {
    println!("No cache buckets");
    return Ok(());
  }

  for summary in summaries {
    let marker = if summary.name == config.cache.version {
      "*"
    } else {
      " "
    };
    println!("{} {} ({} entries)", marker, summary.name, summary.entries);
  }

  Ok(())
}

fn purge(config: &Config, storage: &SqliteStorage, all: bool) -> Result<()> {
  for name in storage.keys()? {
    if !all && name == config.cache.version {
      continue;
    }
    if storage.delete(&name)? {
      println!("Deleted {}", name);
    }
  }

  Ok(())
}
