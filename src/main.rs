mod cache;
mod config;
mod error;
mod network;
mod request;
mod server;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cache::{CacheManager, CacheStorage, FetchOutcome, MemoryStorage, SqliteStorage};
use config::{Config, StorageKind};
use network::{HttpNetwork, Network};
use request::{Destination, Request};

#[derive(Parser, Debug)]
#[command(name = "swcache")]
#[command(about = "Versioned offline asset cache for the timetable web app")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./swcache.yaml or $XDG_CONFIG_HOME/swcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Write logs to a daily-rotated file in this directory instead of stderr
  #[arg(long)]
  log_dir: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-cache the asset manifest into the current version's bucket
  Install,
  /// Install if needed, then evict stale buckets and take control
  Activate,
  /// Route one request through the cache manager
  Fetch {
    /// Absolute URL, or a path relative to the configured origin
    url: String,
    /// Treat the request as a top-level page load
    #[arg(long)]
    navigate: bool,
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Write the response body to this file
    #[arg(short = 'o', long)]
    body_out: Option<PathBuf>,
  },
  /// List cache buckets
  Buckets {
    /// Also list the request keys held in each bucket
    #[arg(long)]
    entries: bool,
  },
  /// Delete every bucket
  Clear,
  /// Serve the app locally through the cache manager
  Serve {
    /// Address to listen on (overrides server.listen)
    #[arg(short, long)]
    listen: Option<SocketAddr>,
  },
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
  // Use RUST_LOG env var to control log level (e.g., RUST_LOG=swcache=debug)
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("swcache=info"));

  match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "swcache.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(filter)
        .init();
      Some(guard)
    }
    None => {
      tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
      None
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_tracing(args.log_dir.as_deref());

  let config = Config::load(args.config.as_deref())?;
  info!(bucket = %config.bucket_name(), strategy = ?config.strategy, "Loaded configuration");

  match config.storage.kind {
    StorageKind::Sqlite => {
      let storage = SqliteStorage::open(config.storage.path.as_deref())?;
      run(args.command, &config, Arc::new(storage)).await
    }
    StorageKind::Memory => run(args.command, &config, Arc::new(MemoryStorage::new())).await,
  }
}

async fn run<S: CacheStorage + 'static>(
  command: Command,
  config: &Config,
  storage: Arc<S>,
) -> Result<()> {
  let network = Arc::new(HttpNetwork::new(&config.network)?);
  let manager = CacheManager::new(config.cache_settings()?, storage, network);

  match command {
    Command::Install => {
      let outcome = manager.install().await?;
      info!(skip_waiting = outcome.skip_waiting, "Install complete");
      println!("Installed {} ({} assets)", outcome.bucket, outcome.cached);
    }
    Command::Activate => {
      let outcome = manager.start().await?;
      match outcome.installed {
        Some(installed) => println!("Installed {} ({} assets)", installed.bucket, installed.cached),
        None => println!("{} already installed", manager.bucket()),
      }
      if outcome.activated.deleted.is_empty() {
        println!("No stale buckets");
      }
      for name in outcome.activated.deleted {
        println!("Deleted stale bucket {}", name);
      }
    }
    Command::Fetch {
      url,
      navigate,
      method,
      body_out,
    } => fetch(&manager, &url, navigate, &method, body_out.as_deref()).await?,
    Command::Buckets { entries } => list_buckets(manager.storage(), manager.bucket(), entries).await?,
    Command::Clear => {
      for name in manager.storage().bucket_names().await? {
        manager.storage().delete_bucket(&name).await?;
        println!("Deleted {}", name);
      }
    }
    Command::Serve { listen } => {
      let listen = listen.unwrap_or(config.server.listen);
      server::serve(manager, listen).await?;
    }
  }

  Ok(())
}

async fn fetch<S: CacheStorage, N: Network>(
  manager: &CacheManager<S, N>,
  url: &str,
  navigate: bool,
  method: &str,
  body_out: Option<&Path>,
) -> Result<()> {
  if let Err(e) = manager.start().await {
    warn!(error = %e, "Cache manager did not activate, continuing");
  }

  let url = manager
    .settings()
    .origin
    .join(url)
    .map_err(|e| eyre!("Invalid URL '{}': {}", url, e))?;
  let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
    .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
  let destination = if navigate {
    Destination::Document
  } else {
    Destination::Other
  };
  let request = Request::new(method, url, destination);

  let (response, source) = match manager.handle_fetch(&request).await? {
    FetchOutcome::Respond(served) => (served.response, served.source.as_str()),
    FetchOutcome::PassThrough => (manager.network().fetch(&request).await?, "pass-through"),
  };

  println!(
    "{} {} {} ({} bytes, {})",
    response.status,
    request.method,
    request.url,
    response.body.len(),
    source
  );
  if let Some(path) = body_out {
    std::fs::write(path, &response.body)
      .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?;
  }

  Ok(())
}

async fn list_buckets<S: CacheStorage>(storage: &S, current: &str, entries: bool) -> Result<()> {
  let names = storage.bucket_names().await?;
  if names.is_empty() {
    println!("No buckets");
    return Ok(());
  }

  for name in names {
    let keys = storage.keys(&name).await?;
    let marker = if name == current { "*" } else { " " };
    println!("{} {} ({} entries)", marker, name, keys.len());
    if entries {
      for key in keys {
        println!("    {}", key);
      }
    }
  }

  Ok(())
}
