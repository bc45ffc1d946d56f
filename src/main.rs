mod cache;
mod clients;
mod config;
mod http;
mod lifetime;
mod logging;
mod messages;
mod push;
mod sync;
#[cfg(test)]
mod testing;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::warn;
use url::Url;

use crate::cache::SqliteStorage;
use crate::clients::ClientRegistry;
use crate::config::{CacheConfig, Config};
use crate::http::{HttpNetwork, Network, Request};
use crate::messages::ClientMessage;
use crate::push::Notification;
use crate::sync::{SyncAction, SyncQueue};
use crate::worker::ServiceWorker;

#[derive(Parser, Debug)]
#[command(name = "health-guide-sw")]
#[command(about = "Offline caching and background sync for the Health Guide app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/health-guide/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Create the caches and precache the app shell
  Install,
  /// Remove caches from older versions and claim open windows
  Activate {
    /// URL of an already open window (repeatable)
    #[arg(long = "client")]
    clients: Vec<String>,
  },
  /// Fetch a URL through the caching policies
  Fetch {
    url: String,
    /// Treat the request as a full-page navigation
    #[arg(long)]
    navigate: bool,
    #[arg(long, default_value = "GET")]
    method: String,
  },
  /// Show the notification a push payload produces
  Push {
    /// JSON payload; omitted means an empty push
    payload: Option<String>,
  },
  /// Click a notification built from a push payload
  Click {
    /// Action id of the pressed button; omitted means the body was tapped
    action: Option<String>,
    #[arg(long)]
    payload: String,
    /// URL of an already open window (repeatable)
    #[arg(long = "client")]
    clients: Vec<String>,
  },
  /// Fire a background sync tag
  Sync { tag: String },
  /// Send a control message, e.g. '{"type":"GET_VERSION"}'
  Message { message: String },
  /// List queued sync records
  Queue {
    /// Include already delivered records
    #[arg(long)]
    all: bool,
    /// Remove delivered records
    #[arg(long)]
    purge: bool,
    /// Only records of this kind, e.g. medication_taken
    #[arg(long)]
    action: Option<String>,
  },
  /// Show cache and queue state
  Status,
}

fn print_json(value: &impl Serialize) -> Result<()> {
  let text =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to format output: {}", e))?;
  println!("{}", text);
  Ok(())
}

fn parse_url(config: &CacheConfig, raw: &str) -> Result<Url> {
  match Url::parse(raw) {
    Ok(url) => Ok(url),
    Err(url::ParseError::RelativeUrlWithoutBase) => config.resolve(raw),
    Err(e) => Err(eyre!("Invalid URL {}: {}", raw, e)),
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let data_dir = config.data_dir()?;
  let _log_guard = logging::init(&config.log, &data_dir)?;

  let cache_config = Arc::new(CacheConfig::new(&config));
  let storage = Arc::new(SqliteStorage::open(&data_dir.join("caches.sqlite"))?);
  let network: Arc<dyn Network> = Arc::new(HttpNetwork::new(Config::get_api_token())?);

  // Without the sync store the worker still runs, it just cannot queue
  let queue = match SyncQueue::open(&data_dir) {
    Ok(queue) => Some(Arc::new(queue)),
    Err(e) => {
      warn!("Sync store unavailable, continuing without it: {:#}", e);
      None
    }
  };

  let worker = ServiceWorker::new(
    Arc::clone(&cache_config),
    storage,
    Arc::clone(&network),
    queue,
    Arc::new(ClientRegistry::new()),
  )?;

  let result = run(&worker, &cache_config, network.as_ref(), args.command).await;

  // Let registered background work finish before exiting
  worker.settle().await;

  result
}

async fn run(
  worker: &ServiceWorker,
  config: &CacheConfig,
  network: &dyn Network,
  command: Command,
) -> Result<()> {
  match command {
    Command::Install => {
      let count = worker.install().await?;
      print_json(&json!({
        "version": worker.version(),
        "precached": count,
        "skip_waiting": worker.skip_waiting_requested(),
      }))
    }
    Command::Activate { clients } => {
      for url in &clients {
        worker.clients().attach(url)?;
      }
      let report = worker.activate().await?;
      print_json(&report)
    }
    Command::Fetch {
      url,
      navigate,
      method,
    } => {
      let url = parse_url(config, &url)?;
      let mut request = if navigate {
        Request::navigate(url)
      } else {
        Request::get(url)
      };
      request.method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| eyre!("Invalid method {}: {}", method, e))?;

      match worker.handle_fetch(&request).await? {
        Some(fetched) => {
          let response = &fetched.result.response;
          print_json(&json!({
            "class": format!("{:?}", fetched.class),
            "source": format!("{:?}", fetched.result.source),
            "status": response.status,
            "headers": response.headers,
            "body": response.body_text(),
          }))
        }
        None if request.is_http() => {
          let response = network.fetch(&request).await?;
          print_json(&json!({
            "source": "Passthrough",
            "status": response.status,
            "headers": response.headers,
            "body": response.body_text(),
          }))
        }
        None => Err(eyre!("Cannot fetch {} scheme", request.url.scheme())),
      }
    }
    Command::Push { payload } => {
      let notification = worker.handle_push(payload.as_deref().map(str::as_bytes));
      print_json(&notification)
    }
    Command::Click {
      action,
      payload,
      clients,
    } => {
      for url in &clients {
        worker.clients().attach(url)?;
      }
      let notification = Notification::from_push(Some(payload.as_bytes()));
      let outcome = worker.handle_notification_click(&notification, action.as_deref());
      print_json(&outcome)
    }
    Command::Sync { tag } => {
      worker.handle_sync(&tag).await?;
      print_json(&json!({ "tag": tag, "status": "ok" }))
    }
    Command::Message { message } => {
      let message: ClientMessage = serde_json::from_str(&message)
        .map_err(|e| eyre!("Invalid control message: {}", e))?;

      if message == ClientMessage::GetVersion {
        let (tx, rx) = oneshot::channel();
        worker.handle_message(message, Some(tx));
        let reply = rx
          .await
          .map_err(|e| eyre!("No version reply: {}", e))?;
        return print_json(&reply);
      }

      worker.handle_message(message, None);
      print_json(&json!({ "status": "ok" }))
    }
    Command::Queue { all, purge, action } => {
      let queue = worker
        .queue()
        .ok_or_else(|| eyre!("Sync store unavailable"))?;

      if purge {
        let removed = queue.purge_synced()?;
        return print_json(&json!({ "purged": removed }));
      }

      let action = match action.as_deref() {
        Some(raw) => Some(SyncAction::parse(raw).ok_or_else(|| eyre!("Unknown action {}", raw))?),
        None => None,
      };

      let records = match (all, action) {
        (true, Some(action)) => queue.by_action(action)?,
        (true, None) => queue.all()?,
        (false, action) => queue.pending(action)?,
      };
      print_json(&records)
    }
    Command::Status => print_json(&worker.status()?),
  }
}
