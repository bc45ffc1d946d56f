//! Cache layer that orchestrates caching policies with network fetching.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::classify::{is_offline_data_path, RequestClass};
use super::storage::CacheStorage;
use super::traits::{CacheResult, CachedEntry};
use crate::config::{Bucket, CacheConfig};
use crate::http::{cache_key_for, Network, Request, Response};
use crate::lifetime::Lifetime;

/// Body returned for uncached prescription/vitals/report API calls while offline.
pub const OFFLINE_DATA_BODY: &str = r#"{"offline":true,"message":"Data not available offline"}"#;

const OFFLINE_HTML: &str = "<!DOCTYPE html><html><head><title>Offline</title></head>\
<body><h1>You are offline</h1><p>This page is not available offline.</p></body></html>";

/// Cache layer that applies the per-class caching policy to a request.
///
/// Sits between the fetch handler and the network, writing successful
/// responses into the bucket for the request's class and falling back to
/// cached or synthetic responses when the network fails.
pub struct CacheLayer<S: CacheStorage> {
  config: Arc<CacheConfig>,
  storage: Arc<S>,
  network: Arc<dyn Network>,
  lifetime: Arc<Lifetime>,
}

impl<S: CacheStorage + 'static> CacheLayer<S> {
  pub fn new(
    config: Arc<CacheConfig>,
    storage: Arc<S>,
    network: Arc<dyn Network>,
    lifetime: Arc<Lifetime>,
  ) -> Self {
    Self {
      config,
      storage,
      network,
      lifetime,
    }
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Apply the policy for `class` to `request`.
  pub async fn respond(&self, request: &Request, class: RequestClass) -> Result<CacheResult> {
    match class {
      RequestClass::Static => {
        self
          .cache_first(class.bucket(), request, "Asset not available offline")
          .await
      }
      RequestClass::Image => {
        self
          .cache_first(class.bucket(), request, "Image not available offline")
          .await
      }
      RequestClass::Api => self.network_first(request).await,
      RequestClass::Navigation => self.navigate(request).await,
      RequestClass::Dynamic => self.stale_while_revalidate(request).await,
    }
  }

  /// Cache lookup; storage failures degrade to a miss.
  fn lookup(&self, bucket: &str, key: &str) -> Option<CachedEntry> {
    match self.storage.get(bucket, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!("Cache read from {} failed: {:#}", bucket, e);
        None
      }
    }
  }

  /// Cache write; storage failures are logged and otherwise ignored.
  fn store(&self, bucket: &str, request: &Request, response: &Response) {
    if let Err(e) = self
      .storage
      .put(bucket, &request.cache_key(), request.url.as_str(), response)
    {
      warn!("Cache write of {} to {} failed: {:#}", request.url, bucket, e);
    }
  }

  /// Cache-first.
  ///
  /// 1. Fresh cache entry - return it without touching the network
  /// 2. Otherwise fetch; store successful responses
  /// 3. On network failure, return any cached entry regardless of age
  /// 4. Nothing cached - synthetic 503
  pub async fn cache_first(
    &self,
    bucket: Bucket,
    request: &Request,
    offline_message: &str,
  ) -> Result<CacheResult> {
    let name = self.config.bucket_name(bucket);
    let cached = self.lookup(&name, &request.cache_key());

    if let Some(entry) = &cached {
      if !entry.is_expired(self.config.max_age(bucket), Utc::now()) {
        return Ok(CacheResult::from_cache(entry.response.clone()));
      }
      debug!(
        "Cached {} in {} has expired (stored {})",
        entry.url, name, entry.stored_at
      );
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.ok() {
          self.store(&name, request, &response);
        }
        Ok(CacheResult::from_network(response))
      }
      Err(e) => {
        warn!("Network failed for {}: {:#}", request.url, e);
        match cached {
          Some(entry) => Ok(CacheResult::offline(entry.response)),
          None => Ok(CacheResult::synthetic(Response::text(503, offline_message))),
        }
      }
    }
  }

  /// Network-first for API calls, with cache fallback.
  ///
  /// The API freshness window is advisory: a stale entry is still served when
  /// the network is down.
  pub async fn network_first(&self, request: &Request) -> Result<CacheResult> {
    let name = self.config.bucket_name(Bucket::Api);

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.ok() {
          self.store(&name, request, &response);
        }
        Ok(CacheResult::from_network(response))
      }
      Err(e) => {
        warn!("API request {} failed, trying cache: {:#}", request.url, e);

        if let Some(entry) = self.lookup(&name, &request.cache_key()) {
          if entry.is_expired(self.config.max_age(Bucket::Api), Utc::now()) {
            debug!("Serving {} past its freshness window", request.url);
          }
          let mut response = entry.response;
          response.set_header("X-Served-From", "cache");
          return Ok(CacheResult::offline(response));
        }

        if is_offline_data_path(request.path()) {
          let response = Response::new(503, OFFLINE_DATA_BODY)
            .with_header("Content-Type", "application/json");
          return Ok(CacheResult::synthetic(response));
        }

        Err(e)
      }
    }
  }

  /// Network-first for page loads, falling back to the cached page, then the
  /// offline page, then a synthetic 503.
  pub async fn navigate(&self, request: &Request) -> Result<CacheResult> {
    let name = self.config.bucket_name(Bucket::Dynamic);

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.ok() {
          self.store(&name, request, &response);
        }
        Ok(CacheResult::from_network(response))
      }
      Err(e) => {
        warn!("Navigation to {} failed: {:#}", request.url, e);

        if let Some(entry) = self.lookup(&name, &request.cache_key()) {
          return Ok(CacheResult::offline(entry.response));
        }

        if let Some(page) = self.offline_page() {
          return Ok(CacheResult::offline(page));
        }

        Ok(CacheResult::synthetic(Response::html(503, OFFLINE_HTML)))
      }
    }
  }

  fn offline_page(&self) -> Option<Response> {
    let url = self.config.resolve(&self.config.offline_page).ok()?;
    match self.storage.match_any(&cache_key_for(&url)) {
      Ok(entry) => entry.map(|e| e.response),
      Err(e) => {
        warn!("Offline page lookup failed: {:#}", e);
        None
      }
    }
  }

  /// Stale-while-revalidate.
  ///
  /// A cached entry is returned immediately while a refresh runs in the
  /// background; without one, the caller waits for the network.
  pub async fn stale_while_revalidate(&self, request: &Request) -> Result<CacheResult> {
    let name = self.config.bucket_name(Bucket::Dynamic);
    let cached = self.lookup(&name, &request.cache_key());

    let revalidate = {
      let storage = Arc::clone(&self.storage);
      let network = Arc::clone(&self.network);
      let request = request.clone();
      async move {
        let response = network.fetch(&request).await?;
        if response.ok() {
          if let Err(e) = storage.put(&name, &request.cache_key(), request.url.as_str(), &response)
          {
            warn!("Cache write of {} failed: {:#}", request.url, e);
          }
        }
        Ok::<_, color_eyre::Report>(response)
      }
    };

    match cached {
      Some(entry) => {
        self.lifetime.wait_until(async move {
          if let Err(e) = revalidate.await {
            debug!("Background revalidation failed: {:#}", e);
          }
        });
        Ok(CacheResult::from_cache(entry.response))
      }
      None => Ok(CacheResult::from_network(revalidate.await?)),
    }
  }

  /// Create all four buckets for the current version.
  pub fn open_buckets(&self) -> Result<()> {
    for name in self.config.bucket_names() {
      self.storage.open_bucket(&name)?;
    }
    Ok(())
  }

  /// Fetch the whole static manifest and store it. Any single failure aborts
  /// without storing anything.
  pub async fn precache(&self) -> Result<usize> {
    let name = self.config.bucket_name(Bucket::Static);
    let requests = self
      .config
      .static_assets
      .iter()
      .map(|path| self.config.resolve(path).map(Request::get))
      .collect::<Result<Vec<_>>>()?;

    let entries = futures::future::try_join_all(requests.iter().map(|request| async move {
      let response = self.network.fetch(request).await?;
      if !response.ok() {
        return Err(eyre!(
          "Precache of {} failed with status {}",
          request.url,
          response.status
        ));
      }
      Ok::<_, color_eyre::Report>((request.cache_key(), request.url.to_string(), response))
    }))
    .await?;

    self.storage.put_all(&name, &entries)?;
    info!("Precached {} static assets into {}", entries.len(), name);

    Ok(entries.len())
  }

  /// Delete every bucket that does not belong to the current version.
  pub fn prune_buckets(&self) -> Result<Vec<String>> {
    let current = self.config.bucket_names();
    let mut deleted = Vec::new();

    for name in self.storage.bucket_names()? {
      if !current.contains(&name) {
        self.storage.delete_bucket(&name)?;
        info!("Deleted old cache {}", name);
        deleted.push(name);
      }
    }

    Ok(deleted)
  }

  /// Delete every bucket, current or not.
  pub fn clear_all(&self) -> Result<usize> {
    let names = self.storage.bucket_names()?;
    for name in &names {
      self.storage.delete_bucket(name)?;
    }
    Ok(names.len())
  }

  /// Re-fetch an API path and store it; errors propagate so the caller can retry.
  pub async fn refresh(&self, path: &str) -> Result<()> {
    let request = Request::get(self.config.resolve(path)?);
    let response = self.network.fetch(&request).await?;

    if !response.ok() {
      return Err(eyre!(
        "Refresh of {} failed with status {}",
        request.url,
        response.status
      ));
    }

    self.store(&self.config.bucket_name(Bucket::Api), &request, &response);
    Ok(())
  }
}
