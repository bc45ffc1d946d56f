//! The worker: lifecycle, fetch, sync, push and message handlers.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::cache::{
  classify, CacheLayer, CacheResult, CacheStorage, RequestClass, ResponseSource, SqliteStorage,
};
use crate::clients::{ClientRegistry, ClientWindow};
use crate::config::CacheConfig;
use crate::http::{Network, Request};
use crate::lifetime::Lifetime;
use crate::messages::{ClientMessage, VersionReply};
use crate::push::{plan_click, ClickAction, Navigation, Notification};
use crate::sync::{RegistrationState, SyncAction, SyncCoordinator, SyncJob, SyncQueue, SyncTag};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
  Parsed,
  Installing,
  Installed,
  Activating,
  Activated,
  /// Install failed
  Redundant,
}

/// A fetch the worker answered.
#[derive(Debug, Clone)]
pub struct FetchResponse {
  pub class: RequestClass,
  pub result: CacheResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivateReport {
  pub deleted: Vec<String>,
  pub claimed: usize,
}

/// Side effects of a notification click that actually happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NavigationOutcome {
  Focused { client: u64, url: String },
  Opened { client: u64, url: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClickOutcome {
  pub dismissed: bool,
  pub queued: Option<i64>,
  pub navigation: Option<NavigationOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketStatus {
  pub name: String,
  pub entries: usize,
  pub current: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
  pub version: String,
  pub state: LifecycleState,
  pub buckets: Vec<BucketStatus>,
  /// `None` when the sync store could not be opened
  pub pending_sync: Option<usize>,
  pub registrations: Vec<String>,
  pub clients: Vec<ClientWindow>,
}

pub struct ServiceWorker {
  config: Arc<CacheConfig>,
  cache: CacheLayer<SqliteStorage>,
  coordinator: SyncCoordinator,
  clients: Arc<ClientRegistry>,
  lifetime: Arc<Lifetime>,
  state: Mutex<LifecycleState>,
  skip_waiting: AtomicBool,
}

impl ServiceWorker {
  pub fn new(
    config: Arc<CacheConfig>,
    storage: Arc<SqliteStorage>,
    network: Arc<dyn Network>,
    queue: Option<Arc<SyncQueue>>,
    clients: Arc<ClientRegistry>,
  ) -> Result<Self> {
    let lifetime = Arc::new(Lifetime::new());
    let endpoint = config.resolve(&config.sync_endpoint)?;
    let cache = CacheLayer::new(
      Arc::clone(&config),
      storage,
      Arc::clone(&network),
      Arc::clone(&lifetime),
    );
    let coordinator = SyncCoordinator::new(queue, network, endpoint);

    Ok(Self {
      config,
      cache,
      coordinator,
      clients,
      lifetime,
      state: Mutex::new(LifecycleState::Parsed),
      skip_waiting: AtomicBool::new(false),
    })
  }

  pub fn version(&self) -> &str {
    &self.config.version
  }

  pub fn state(&self) -> LifecycleState {
    self
      .state
      .lock()
      .map(|s| *s)
      .unwrap_or(LifecycleState::Redundant)
  }

  fn set_state(&self, state: LifecycleState) {
    if let Ok(mut current) = self.state.lock() {
      debug!("Worker state {:?} -> {:?}", *current, state);
      *current = state;
    }
  }

  pub fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  pub fn skip_waiting_requested(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  /// Create the buckets and precache the static manifest.
  ///
  /// Skip-waiting is requested even when precaching fails; the error is
  /// still returned.
  pub async fn install(&self) -> Result<usize> {
    self.set_state(LifecycleState::Installing);

    let result = match self.cache.open_buckets() {
      Ok(()) => self.cache.precache().await,
      Err(e) => Err(e),
    };

    self.skip_waiting();

    match &result {
      Ok(count) => {
        info!("Installed cache version {} ({} assets)", self.version(), count);
        self.set_state(LifecycleState::Installed);
      }
      Err(e) => {
        error!("Install of cache version {} failed: {:#}", self.version(), e);
        self.set_state(LifecycleState::Redundant);
      }
    }

    result
  }

  /// Delete buckets from other versions, then take control of open clients.
  pub async fn activate(&self) -> Result<ActivateReport> {
    self.set_state(LifecycleState::Activating);

    let deleted = self.cache.prune_buckets()?;
    self.cache.open_buckets()?;
    let claimed = self.clients.claim()?;

    self.set_state(LifecycleState::Activated);
    info!(
      "Activated cache version {}; deleted {} old caches, claimed {} clients",
      self.version(),
      deleted.len(),
      claimed
    );

    Ok(ActivateReport { deleted, claimed })
  }

  /// Answer a fetch. `None` means the request is not intercepted and should
  /// go straight to the network.
  pub async fn handle_fetch(&self, request: &Request) -> Result<Option<FetchResponse>> {
    if request.method != reqwest::Method::GET || !request.is_http() {
      debug!("Passing through {} {}", request.method, request.url);
      return Ok(None);
    }

    let class = classify(request, &self.config);
    debug!("{} classified as {:?}", request.url, class);

    let result = self.cache.respond(request, class).await?;
    if result.source == ResponseSource::Offline {
      info!("Network unavailable, served {} from cache", request.url);
    }
    Ok(Some(FetchResponse { class, result }))
  }

  /// Run the job for a sync tag. Unknown tags are ignored. An error means the
  /// sync should be retried later.
  pub async fn handle_sync(&self, tag: &str) -> Result<()> {
    let Some(tag) = SyncTag::parse(tag) else {
      debug!("Ignoring unknown sync tag {}", tag);
      return Ok(());
    };

    self.coordinator.mark_fired(tag);

    let result = match tag.job() {
      SyncJob::Drain(action) => self.coordinator.drain(action).await.map(|report| {
        debug!(
          "Sync {} delivered {} records, {} remaining",
          tag.as_str(),
          report.delivered,
          report.remaining
        );
      }),
      SyncJob::Refresh(path) => self.cache.refresh(path).await,
    };

    self.coordinator.mark_finished(tag, result.is_ok());
    if let Err(e) = &result {
      warn!("Sync {} failed, will retry: {:#}", tag.as_str(), e);
    }

    result
  }

  /// Build the notification to display for a push message.
  pub fn handle_push(&self, data: Option<&[u8]>) -> Notification {
    let notification = Notification::from_push(data);
    info!("Showing notification: {}", notification.title);
    notification
  }

  /// Handle a click on a notification. Queueing failures never block the
  /// navigation.
  pub fn handle_notification_click(
    &self,
    notification: &Notification,
    action: Option<&str>,
  ) -> ClickOutcome {
    let action = ClickAction::parse(action);
    let plan = plan_click(notification, &action, Utc::now());

    let queued = plan
      .enqueue
      .and_then(|(kind, payload)| match self.enqueue(kind, &payload) {
        Ok(id) => Some(id),
        Err(e) => {
          warn!("Could not queue {} for sync: {:#}", kind.as_str(), e);
          None
        }
      });

    let navigation = plan.navigation.and_then(|nav| match self.navigate(nav) {
      Ok(outcome) => Some(outcome),
      Err(e) => {
        warn!("Navigation after notification click failed: {:#}", e);
        None
      }
    });

    ClickOutcome {
      dismissed: true,
      queued,
      navigation,
    }
  }

  fn enqueue(&self, action: SyncAction, payload: &Value) -> Result<i64> {
    let queue = self
      .coordinator
      .queue()
      .ok_or_else(|| eyre!("Sync store unavailable"))?;
    let id = queue.enqueue(action, payload)?;

    if let Err(e) = self.coordinator.register(SyncTag::for_action(action)) {
      warn!("Could not register sync for {}: {:#}", action.as_str(), e);
    }

    Ok(id)
  }

  fn navigate(&self, navigation: Navigation) -> Result<NavigationOutcome> {
    match navigation {
      Navigation::Open(url) => {
        let client = self.clients.open_window(&url)?;
        Ok(NavigationOutcome::Opened { client, url })
      }
      Navigation::FocusOrOpen(url) => match self.clients.find(&url)? {
        Some(window) => {
          self.clients.focus(window.id)?;
          Ok(NavigationOutcome::Focused {
            client: window.id,
            url: window.url,
          })
        }
        None => {
          let client = self.clients.open_window(&url)?;
          Ok(NavigationOutcome::Opened { client, url })
        }
      },
    }
  }

  /// Handle a control message; `GET_VERSION` replies through `port`.
  pub fn handle_message(&self, message: ClientMessage, port: Option<oneshot::Sender<VersionReply>>) {
    match message {
      ClientMessage::SkipWaiting => self.skip_waiting(),
      ClientMessage::GetVersion => {
        let reply = VersionReply {
          version: self.config.version.clone(),
        };
        match port {
          Some(port) => {
            if port.send(reply).is_err() {
              debug!("Version reply port closed");
            }
          }
          None => debug!("GET_VERSION without a reply port"),
        }
      }
      ClientMessage::ClearCache => match self.cache.clear_all() {
        Ok(count) => info!("Cleared {} caches", count),
        Err(e) => warn!("Clearing caches failed: {:#}", e),
      },
      ClientMessage::Unknown => debug!("Ignoring unknown client message"),
    }
  }

  /// Wait for all background work registered by handlers.
  pub async fn settle(&self) {
    let pending = self.lifetime.pending();
    if pending > 0 {
      debug!("Waiting for {} background tasks", pending);
    }
    self.lifetime.settle().await;
  }

  pub fn clients(&self) -> &ClientRegistry {
    &self.clients
  }

  pub fn queue(&self) -> Option<&SyncQueue> {
    self.coordinator.queue()
  }

  pub fn registrations(&self) -> Vec<(SyncTag, RegistrationState)> {
    self.coordinator.registrations()
  }

  pub fn status(&self) -> Result<WorkerStatus> {
    let storage = self.cache.storage();
    let current = self.config.bucket_names();

    let buckets = storage
      .bucket_names()?
      .into_iter()
      .map(|name| {
        let entries = storage.keys(&name).map(|k| k.len()).unwrap_or(0);
        let current = current.contains(&name);
        BucketStatus {
          name,
          entries,
          current,
        }
      })
      .collect();

    let pending_sync = match self.queue() {
      Some(queue) => Some(queue.count_pending()?),
      None => None,
    };

    Ok(WorkerStatus {
      version: self.config.version.clone(),
      state: self.state(),
      buckets,
      pending_sync,
      registrations: self
        .registrations()
        .into_iter()
        .map(|(tag, state)| format!("{} ({:?})", tag.as_str(), state))
        .collect(),
      clients: self.clients.list()?,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{Bucket, Config};
  use crate::http::Response;
  use crate::testing::MockNetwork;
  use url::Url;

  const ORIGIN: &str = "https://hg.example";

  fn cache_config(version: &str) -> Arc<CacheConfig> {
    let config = Config::from_yaml(&format!(
      "origin: {}\ncache_version: {}\nstatic_assets: [\"/index.html\", \"/offline.html\"]\n",
      ORIGIN, version
    ))
    .unwrap();
    Arc::new(CacheConfig::new(&config))
  }

  struct Fixture {
    worker: ServiceWorker,
    network: Arc<MockNetwork>,
    storage: Arc<SqliteStorage>,
  }

  fn fixture_with(version: &str, storage: Arc<SqliteStorage>, queue: Option<Arc<SyncQueue>>) -> Fixture {
    let network = Arc::new(MockNetwork::new());
    network.route(&url("/index.html"), Response::html(200, "index"));
    network.route(&url("/offline.html"), Response::html(200, "offline"));

    let worker = ServiceWorker::new(
      cache_config(version),
      storage.clone(),
      network.clone(),
      queue,
      Arc::new(ClientRegistry::new()),
    )
    .unwrap();

    Fixture {
      worker,
      network,
      storage,
    }
  }

  fn fixture() -> Fixture {
    fixture_with(
      "2.0.0",
      Arc::new(SqliteStorage::open_in_memory().unwrap()),
      Some(Arc::new(SyncQueue::open_in_memory().unwrap())),
    )
  }

  fn url(path: &str) -> String {
    format!("{}{}", ORIGIN, path)
  }

  fn reminder() -> Notification {
    Notification::from_push(Some(
      br#"{"type":"medication_reminder","medication_name":"Aspirin","prescription_id":5}"#.as_slice(),
    ))
  }

  #[tokio::test]
  async fn test_install_precaches_manifest() {
    let f = fixture();

    assert_eq!(f.worker.install().await.unwrap(), 2);
    assert_eq!(f.worker.state(), LifecycleState::Installed);
    assert!(f.worker.skip_waiting_requested());
    let opened = f.storage.bucket_names().unwrap();
    for name in cache_config("2.0.0").bucket_names() {
      assert!(opened.contains(&name));
    }
  }

  #[tokio::test]
  async fn test_install_failure_still_skips_waiting() {
    let f = fixture();
    f.network.set_online(false);

    assert!(f.worker.install().await.is_err());
    assert!(f.worker.skip_waiting_requested());
    assert_eq!(f.worker.state(), LifecycleState::Redundant);
  }

  #[tokio::test]
  async fn test_version_bump_prunes_old_buckets() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());

    let old = fixture_with("2.0.0", storage.clone(), None);
    old.worker.install().await.unwrap();
    old.worker.activate().await.unwrap();

    let new = fixture_with("2.0.1", storage.clone(), None);
    new.worker.clients().attach(&url("/dashboard.html")).unwrap();
    new.worker.install().await.unwrap();
    let report = new.worker.activate().await.unwrap();

    assert_eq!(report.deleted.len(), 4);
    assert!(report.deleted.iter().all(|name| name.ends_with("-v2.0.0")));
    assert_eq!(report.claimed, 1);
    let mut names = storage.bucket_names().unwrap();
    names.sort();
    let mut expected = cache_config("2.0.1").bucket_names();
    expected.sort();
    assert_eq!(names, expected);
    assert_eq!(new.worker.state(), LifecycleState::Activated);
  }

  #[tokio::test]
  async fn test_fetch_passes_through_non_get() {
    let f = fixture();
    let request = Request::post_json(Url::parse(&url("/api/v1/vitals/")).unwrap(), &serde_json::json!({})).unwrap();

    assert!(f.worker.handle_fetch(&request).await.unwrap().is_none());
    assert_eq!(f.network.call_count(), 0);
  }

  #[tokio::test]
  async fn test_fetch_passes_through_other_schemes() {
    let f = fixture();
    let request = Request::get(Url::parse("chrome-extension://abc/script.js").unwrap());
    assert!(f.worker.handle_fetch(&request).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_fetch_after_install_is_served_from_cache() {
    let f = fixture();
    f.worker.install().await.unwrap();
    let calls = f.network.call_count();

    let request = Request::navigate(Url::parse(&url("/index.html")).unwrap());
    let response = f.worker.handle_fetch(&request).await.unwrap().unwrap();

    assert_eq!(response.class, RequestClass::Static);
    assert_eq!(response.result.source, ResponseSource::Cache);
    assert_eq!(f.network.call_count(), calls);
  }

  #[tokio::test]
  async fn test_offline_medication_taken() {
    let f = fixture();
    f.network.set_online(false);

    let outcome = f.worker.handle_notification_click(&reminder(), Some("taken"));

    let queue = f.worker.queue().unwrap();
    let records = queue.all().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].action, SyncAction::MedicationTaken);
    assert!(!records[0].synced);
    assert_eq!(outcome.queued, Some(records[0].id));
    assert!(outcome.dismissed);
    assert!(matches!(
      outcome.navigation,
      Some(NavigationOutcome::Opened { ref url, .. }) if url == "/prescriptions.html"
    ));
    assert_eq!(
      f.worker.registrations(),
      vec![(SyncTag::MedicationTaken, RegistrationState::Registered)]
    );
  }

  #[tokio::test]
  async fn test_snooze_queues_without_navigation() {
    let f = fixture();
    let outcome = f.worker.handle_notification_click(&reminder(), Some("snooze"));

    assert!(outcome.queued.is_some());
    assert!(outcome.navigation.is_none());
    let records = f.worker.queue().unwrap().by_action(SyncAction::MedicationSnooze).unwrap();
    assert!(records[0].payload["snooze_until"].is_string());
  }

  #[tokio::test]
  async fn test_click_without_store_still_navigates() {
    let f = fixture_with(
      "2.0.0",
      Arc::new(SqliteStorage::open_in_memory().unwrap()),
      None,
    );
    let alert = Notification::from_push(Some(br#"{"type":"emergency_alert"}"#.as_slice()));

    let outcome = f.worker.handle_notification_click(&alert, Some("acknowledge"));

    assert!(outcome.queued.is_none());
    assert!(matches!(
      outcome.navigation,
      Some(NavigationOutcome::Opened { ref url, .. }) if url == "/emergency.html"
    ));
  }

  #[tokio::test]
  async fn test_body_tap_focuses_matching_client() {
    let f = fixture();
    let existing = f.worker.clients().attach(&url("/prescriptions.html")).unwrap();

    let outcome = f.worker.handle_notification_click(&reminder(), None);

    assert_eq!(
      outcome.navigation,
      Some(NavigationOutcome::Focused {
        client: existing,
        url: url("/prescriptions.html"),
      })
    );
  }

  #[tokio::test]
  async fn test_body_tap_opens_window_when_no_match() {
    let f = fixture();
    f.worker.clients().attach(&url("/vitals.html")).unwrap();

    let outcome = f.worker.handle_notification_click(&reminder(), None);

    assert!(matches!(outcome.navigation, Some(NavigationOutcome::Opened { .. })));
    assert_eq!(f.worker.clients().list().unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_unknown_sync_tag_is_ignored() {
    let f = fixture();
    f.worker.handle_sync("not-a-tag").await.unwrap();
    assert_eq!(f.network.call_count(), 0);
  }

  #[tokio::test]
  async fn test_sync_drains_after_reconnect() {
    let f = fixture();
    f.network.set_online(false);
    f.worker.handle_notification_click(&reminder(), Some("taken"));

    assert!(f.worker.handle_sync("medication-taken").await.is_err());
    assert_eq!(
      f.worker.registrations(),
      vec![(SyncTag::MedicationTaken, RegistrationState::Failed)]
    );

    f.network.set_online(true);
    f.network.route(&url("/api/v1/sync/"), Response::new(200, ""));
    f.worker.handle_sync("medication-taken").await.unwrap();

    assert_eq!(f.worker.queue().unwrap().count_pending().unwrap(), 0);
    assert!(f.worker.registrations().is_empty());
  }

  #[tokio::test]
  async fn test_vitals_sync_refreshes_api_bucket() {
    let f = fixture();
    f.network.route(&url("/api/v1/vitals/"), Response::json(200, &serde_json::json!([])));

    f.worker.handle_sync("vitals-sync").await.unwrap();

    let keys = f
      .storage
      .keys(&cache_config("2.0.0").bucket_name(Bucket::Api))
      .unwrap();
    assert_eq!(keys, vec![url("/api/v1/vitals/")]);
  }

  #[tokio::test]
  async fn test_get_version_replies_on_port() {
    let f = fixture();
    let (tx, rx) = oneshot::channel();

    f.worker.handle_message(ClientMessage::GetVersion, Some(tx));

    assert_eq!(rx.await.unwrap().version, "2.0.0");
  }

  #[tokio::test]
  async fn test_clear_cache_removes_every_bucket() {
    let f = fixture();
    f.worker.install().await.unwrap();

    f.worker.handle_message(ClientMessage::ClearCache, None);

    assert!(f.storage.bucket_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_skip_waiting_message() {
    let f = fixture();
    f.worker.handle_message(ClientMessage::SkipWaiting, None);
    assert!(f.worker.skip_waiting_requested());
  }

  #[tokio::test]
  async fn test_emergency_push() {
    let f = fixture();
    let n = f
      .worker
      .handle_push(Some(br#"{"type":"emergency_alert","message":"Help needed"}"#.as_slice()));

    assert!(n.require_interaction);
    assert_eq!(n.actions.len(), 2);
  }

  #[tokio::test]
  async fn test_status_reports_buckets_and_queue() {
    let f = fixture();
    f.worker.install().await.unwrap();
    f.worker.handle_notification_click(&reminder(), Some("taken"));

    let status = f.worker.status().unwrap();
    assert_eq!(status.buckets.len(), 4);
    assert!(status.buckets.iter().all(|b| b.current));
    assert_eq!(status.pending_sync, Some(1));
    assert_eq!(status.clients.len(), 1);
    assert!(status.clients[0].url.ends_with("/prescriptions.html"));
  }
}
