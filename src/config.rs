use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

/// App-shell URLs fetched and stored during install.
const DEFAULT_STATIC_ASSETS: &[&str] = &[
  "/",
  "/index.html",
  "/login.html",
  "/dashboard.html",
  "/prescriptions.html",
  "/vitals.html",
  "/reports.html",
  "/emergency.html",
  "/profile.html",
  "/offline.html",
  "/manifest.json",
  "/css/styles.css",
  "/js/api.js",
  "/js/auth.js",
  "/js/app.js",
  "/images/icons/icon-192x192.png",
  "/images/icons/icon-512x512.png",
];

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the app is served from, e.g. https://healthguide.example.com
  pub origin: Url,
  #[serde(default = "default_cache_version")]
  pub cache_version: String,
  /// Where the cache and sync databases live (defaults to the user data dir)
  pub data_dir: Option<PathBuf>,
  #[serde(default = "default_static_assets")]
  pub static_assets: Vec<String>,
  #[serde(default = "default_offline_page")]
  pub offline_page: String,
  /// Backend path queued sync records are delivered to
  #[serde(default = "default_sync_endpoint")]
  pub sync_endpoint: String,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogConfig {
  /// Default filter directive; RUST_LOG overrides it
  pub level: Option<String>,
  /// Log file path (defaults to <data_dir>/health-guide.log)
  pub file: Option<PathBuf>,
}

fn default_cache_version() -> String {
  "2.0.0".to_string()
}

fn default_static_assets() -> Vec<String> {
  DEFAULT_STATIC_ASSETS.iter().map(|s| s.to_string()).collect()
}

fn default_offline_page() -> String {
  "/offline.html".to_string()
}

fn default_sync_endpoint() -> String {
  "/api/v1/sync/".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./health-guide.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/health-guide/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/health-guide/config.yaml\n\
                 with at least an `origin:` entry."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("health-guide.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("health-guide").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// Resolve the data directory, falling back to the platform data dir.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("health-guide"))
  }

  /// Get the API bearer token from environment variables.
  ///
  /// Checks HEALTH_GUIDE_TOKEN first, then HEALTH_GUIDE_API_TOKEN. A missing
  /// token is not an error: unauthenticated requests still go out.
  pub fn get_api_token() -> Option<String> {
    std::env::var("HEALTH_GUIDE_TOKEN")
      .or_else(|_| std::env::var("HEALTH_GUIDE_API_TOKEN"))
      .ok()
  }
}

/// One of the four storage partitions a request can be cached in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
  Static,
  Dynamic,
  Api,
  Image,
}

impl Bucket {
  pub const ALL: [Bucket; 4] = [Bucket::Static, Bucket::Dynamic, Bucket::Api, Bucket::Image];

  fn slug(self) -> &'static str {
    match self {
      Bucket::Static => "static",
      Bucket::Dynamic => "dynamic",
      Bucket::Api => "api",
      Bucket::Image => "images",
    }
  }
}

/// Per-worker cache settings, built once at startup and shared by every handler.
#[derive(Debug, Clone)]
pub struct CacheConfig {
  pub version: String,
  pub origin: Url,
  pub static_assets: Vec<String>,
  pub offline_page: String,
  pub sync_endpoint: String,
}

impl CacheConfig {
  pub fn new(config: &Config) -> Self {
    Self {
      version: config.cache_version.clone(),
      origin: config.origin.clone(),
      static_assets: config.static_assets.clone(),
      offline_page: config.offline_page.clone(),
      sync_endpoint: config.sync_endpoint.clone(),
    }
  }

  /// Version-qualified storage name, e.g. `health-guide-static-v2.0.0`.
  pub fn bucket_name(&self, bucket: Bucket) -> String {
    format!("health-guide-{}-v{}", bucket.slug(), self.version)
  }

  pub fn bucket_names(&self) -> Vec<String> {
    Bucket::ALL.iter().map(|b| self.bucket_name(*b)).collect()
  }

  /// Freshness window for entries in a bucket. `None` means entries never
  /// expire by age. The API window is advisory only.
  pub fn max_age(&self, bucket: Bucket) -> Option<Duration> {
    match bucket {
      Bucket::Static => Some(Duration::days(7)),
      Bucket::Image => Some(Duration::days(30)),
      Bucket::Api => Some(Duration::minutes(5)),
      Bucket::Dynamic => None,
    }
  }

  /// Resolve an app path against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid path {} for origin {}: {}", path, self.origin, e))
  }

  pub fn is_static_asset(&self, path: &str) -> bool {
    self.static_assets.iter().any(|asset| asset == path)
  }
}
