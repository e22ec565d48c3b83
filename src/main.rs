use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use feedcache::backend::Filters;
use feedcache::config::Config;
use feedcache::feed::{FeedStatus, LoadOutcome};
use feedcache::DataLayer;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "feedcache")]
#[command(about = "Cached, deduplicated access to a paginated data service")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/feedcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Load a feed and print its items as JSON lines
  Feed {
    resource: String,
    /// Number of pages to load
    #[arg(long, default_value_t = 1)]
    pages: usize,
    /// Page size (default: backend.page_size)
    #[arg(long)]
    limit: Option<u32>,
    /// Filter as key=value; repeatable
    #[arg(long = "filter", value_parser = parse_filter)]
    filters: Vec<(String, String)>,
  },
  /// Print a stats value
  Stats {
    key: String,
    /// Bypass the cache
    #[arg(long)]
    refresh: bool,
  },
  /// Run a write and invalidate the resource's feed
  Create {
    resource: String,
    /// JSON payload
    #[arg(long)]
    payload: String,
    #[arg(long, default_value = "create")]
    operation: String,
  },
  /// Clear the in-memory and persisted cache
  ClearCache,
}

fn parse_filter(raw: &str) -> Result<(String, String), String> {
  raw
    .split_once('=')
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .ok_or_else(|| format!("expected key=value, got {}", raw))
}

/// Log to a daily file in the data directory. Level via FEEDCACHE_LOG.
fn init_tracing() -> Result<WorkerGuard> {
  let dir = dirs::data_dir()
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("feedcache")
    .join("logs");
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(
    &dir,
    "feedcache.log",
  ));
  let filter = EnvFilter::try_from_env("FEEDCACHE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::registry()
    .with(filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false),
    )
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;
  let _guard = init_tracing()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if let Command::Feed {
    limit: Some(limit), ..
  } = &args.command
  {
    config.backend.page_size = *limit;
  }

  let layer = DataLayer::init(config).await?;
  let result = run(&layer, args.command).await;
  layer.teardown().await;
  result
}

async fn run(layer: &DataLayer, command: Command) -> Result<()> {
  match command {
    Command::Feed {
      resource,
      pages,
      filters,
      ..
    } => {
      let filters: Filters = filters.into_iter().collect();
      let mut subscription = layer.subscribe_feed(&resource, &filters);

      let snapshot = subscription
        .snapshots()
        .wait_for(|s| !s.status.is_loading() && s.status != FeedStatus::Idle)
        .await
        .map_err(|e| eyre!("Feed closed before loading: {}", e))?
        .clone();
      if snapshot.status == FeedStatus::Error {
        let error = snapshot.last_error.map(|e| e.to_string()).unwrap_or_default();
        return Err(eyre!("Failed to load {}: {}", resource, error));
      }

      let controller = subscription.controller().clone();
      for _ in 1..pages {
        match controller.load_more().await {
          LoadOutcome::Loaded { .. } => {}
          LoadOutcome::Skipped => break,
          LoadOutcome::Failed(e) => return Err(eyre!("Failed to load more {}: {}", resource, e)),
        }
      }

      for item in controller.snapshot().items() {
        println!("{}", serde_json::to_string(item)?);
      }
      subscription.unsubscribe();
    }
    Command::Stats { key, refresh } => {
      let result = if refresh {
        layer.stats().refresh(&key).await
      } else {
        layer.stats().get_stats(&key).await
      };
      let value = result.map_err(|e| eyre!("Failed to fetch stats {}: {}", key, e))?;
      println!("{}", serde_json::to_string_pretty(&value)?);
    }
    Command::Create {
      resource,
      payload,
      operation,
    } => {
      let payload = serde_json::from_str(&payload)
        .map_err(|e| eyre!("Failed to parse payload: {}", e))?;
      let item = layer
        .write(&resource, &operation, payload)
        .await
        .map_err(|e| eyre!("Failed to {} {}: {}", operation, resource, e))?;
      println!("{}", serde_json::to_string(&item)?);
    }
    Command::ClearCache => {
      layer.clear_cache().await;
      println!("cache cleared");
    }
  }

  Ok(())
}
