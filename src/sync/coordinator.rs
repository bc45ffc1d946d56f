//! Background sync coordination: tag registration and queue draining.

use color_eyre::{eyre::eyre, Result};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use super::queue::{SyncAction, SyncQueue};
use crate::http::{Network, Request};

/// Sync tags the worker reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SyncTag {
  BackgroundSync,
  PrescriptionSync,
  VitalsSync,
  MedicationTaken,
  MedicationSnooze,
  EmergencyAcknowledge,
}

/// What firing a tag does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncJob {
  /// Deliver pending queue records (all kinds when `None`)
  Drain(Option<SyncAction>),
  /// Re-fetch an API path into the cache
  Refresh(&'static str),
}

impl SyncTag {
  pub const ALL: [SyncTag; 6] = [
    SyncTag::BackgroundSync,
    SyncTag::PrescriptionSync,
    SyncTag::VitalsSync,
    SyncTag::MedicationTaken,
    SyncTag::MedicationSnooze,
    SyncTag::EmergencyAcknowledge,
  ];

  /// Unrecognized tags map to `None` and are ignored.
  pub fn parse(tag: &str) -> Option<Self> {
    Self::ALL.into_iter().find(|t| t.as_str() == tag)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      SyncTag::BackgroundSync => "background-sync",
      SyncTag::PrescriptionSync => "prescription-sync",
      SyncTag::VitalsSync => "vitals-sync",
      SyncTag::MedicationTaken => "medication-taken",
      SyncTag::MedicationSnooze => "medication-snooze",
      SyncTag::EmergencyAcknowledge => "emergency-acknowledge",
    }
  }

  pub fn job(self) -> SyncJob {
    match self {
      SyncTag::BackgroundSync => SyncJob::Drain(None),
      SyncTag::PrescriptionSync => SyncJob::Refresh("/api/v1/prescriptions/"),
      SyncTag::VitalsSync => SyncJob::Refresh("/api/v1/vitals/"),
      SyncTag::MedicationTaken => SyncJob::Drain(Some(SyncAction::MedicationTaken)),
      SyncTag::MedicationSnooze => SyncJob::Drain(Some(SyncAction::MedicationSnooze)),
      SyncTag::EmergencyAcknowledge => SyncJob::Drain(Some(SyncAction::EmergencyAcknowledge)),
    }
  }

  /// Tag registered after queueing a record of this kind.
  pub fn for_action(action: SyncAction) -> Self {
    match action {
      SyncAction::MedicationTaken => SyncTag::MedicationTaken,
      SyncAction::MedicationSnooze => SyncTag::MedicationSnooze,
      SyncAction::EmergencyAcknowledge => SyncTag::EmergencyAcknowledge,
    }
  }
}

/// Lifecycle of one registered tag. Succeeded tags are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
  Registered,
  Fired,
  /// Last run failed; the sync manager will fire it again
  Failed,
}

/// Result of one drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
  pub delivered: usize,
  pub remaining: usize,
}

/// Tracks registered tags and delivers queued records.
///
/// Retry scheduling belongs to whoever fires the tags; a failed drain only
/// reports an error.
pub struct SyncCoordinator {
  queue: Option<Arc<SyncQueue>>,
  network: Arc<dyn Network>,
  endpoint: Url,
  registrations: Mutex<BTreeMap<SyncTag, RegistrationState>>,
}

impl SyncCoordinator {
  pub fn new(queue: Option<Arc<SyncQueue>>, network: Arc<dyn Network>, endpoint: Url) -> Self {
    Self {
      queue,
      network,
      endpoint,
      registrations: Mutex::new(BTreeMap::new()),
    }
  }

  pub fn queue(&self) -> Option<&SyncQueue> {
    self.queue.as_deref()
  }

  /// Register a tag for a later sync event. Re-registering resets it.
  pub fn register(&self, tag: SyncTag) -> Result<()> {
    let mut registrations = self
      .registrations
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    registrations.insert(tag, RegistrationState::Registered);
    debug!("Registered sync tag {}", tag.as_str());
    Ok(())
  }

  pub fn registrations(&self) -> Vec<(SyncTag, RegistrationState)> {
    self
      .registrations
      .lock()
      .map(|r| r.iter().map(|(k, v)| (*k, *v)).collect())
      .unwrap_or_default()
  }

  fn set_state(&self, tag: SyncTag, state: Option<RegistrationState>) {
    if let Ok(mut registrations) = self.registrations.lock() {
      match state {
        Some(state) => {
          registrations.insert(tag, state);
        }
        None => {
          registrations.remove(&tag);
        }
      }
    }
  }

  pub fn mark_fired(&self, tag: SyncTag) {
    self.set_state(tag, Some(RegistrationState::Fired));
  }

  pub fn mark_finished(&self, tag: SyncTag, succeeded: bool) {
    if succeeded {
      self.set_state(tag, None);
    } else {
      self.set_state(tag, Some(RegistrationState::Failed));
    }
  }

  /// Deliver pending records in id order, marking each synced on a 2xx.
  ///
  /// Stops at the first failure and returns it, leaving that record and
  /// everything after it pending.
  pub async fn drain(&self, action: Option<SyncAction>) -> Result<DrainReport> {
    let Some(queue) = self.queue.as_ref() else {
      warn!("Sync store unavailable, nothing to deliver");
      return Ok(DrainReport::default());
    };

    let pending = queue.pending(action)?;
    let total = pending.len();
    let mut report = DrainReport {
      delivered: 0,
      remaining: total,
    };

    for item in pending {
      let body = json!({
        "id": item.id,
        "action": item.action,
        "payload": item.payload,
        "timestamp": item.timestamp.to_rfc3339(),
      });
      let request = Request::post_json(self.endpoint.clone(), &body)?;

      let response = self.network.fetch(&request).await.map_err(|e| {
        warn!("Delivery of sync record {} failed: {:#}", item.id, e);
        e
      })?;

      if !response.ok() {
        return Err(eyre!(
          "Delivery of sync record {} rejected with status {}",
          item.id,
          response.status
        ));
      }

      queue.mark_synced(item.id)?;
      report.delivered += 1;
      report.remaining -= 1;
    }

    if total > 0 {
      info!("Delivered {} queued sync records", report.delivered);
    }

    Ok(report)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::Response;
  use crate::testing::MockNetwork;

  const ENDPOINT: &str = "https://hg.example/api/v1/sync/";

  fn coordinator(network: Arc<MockNetwork>) -> (SyncCoordinator, Arc<SyncQueue>) {
    let queue = Arc::new(SyncQueue::open_in_memory().unwrap());
    let coordinator = SyncCoordinator::new(
      Some(queue.clone()),
      network,
      Url::parse(ENDPOINT).unwrap(),
    );
    (coordinator, queue)
  }

  #[test]
  fn test_parse_known_and_unknown_tags() {
    assert_eq!(SyncTag::parse("vitals-sync"), Some(SyncTag::VitalsSync));
    assert_eq!(SyncTag::parse("medication-taken"), Some(SyncTag::MedicationTaken));
    assert_eq!(SyncTag::parse("something-else"), None);
  }

  #[test]
  fn test_tag_jobs() {
    assert_eq!(SyncTag::BackgroundSync.job(), SyncJob::Drain(None));
    assert_eq!(
      SyncTag::MedicationSnooze.job(),
      SyncJob::Drain(Some(SyncAction::MedicationSnooze))
    );
    assert_eq!(
      SyncTag::PrescriptionSync.job(),
      SyncJob::Refresh("/api/v1/prescriptions/")
    );
  }

  #[tokio::test]
  async fn test_drain_delivers_and_marks_synced() {
    let network = Arc::new(MockNetwork::new());
    network.route(ENDPOINT, Response::new(201, ""));
    let (coordinator, queue) = coordinator(network.clone());
    queue
      .enqueue(SyncAction::MedicationTaken, &json!({"prescription_id": 4}))
      .unwrap();
    queue
      .enqueue(SyncAction::EmergencyAcknowledge, &json!({}))
      .unwrap();

    let report = coordinator.drain(None).await.unwrap();

    assert_eq!(report, DrainReport { delivered: 2, remaining: 0 });
    assert_eq!(queue.count_pending().unwrap(), 0);

    let calls = network.calls();
    assert_eq!(calls.len(), 2);
    let body: serde_json::Value = serde_json::from_slice(calls[0].body.as_ref().unwrap()).unwrap();
    assert_eq!(body["action"], "medication_taken");
    assert_eq!(body["payload"]["prescription_id"], 4);
  }

  #[tokio::test]
  async fn test_drain_only_requested_kind() {
    let network = Arc::new(MockNetwork::new());
    network.route(ENDPOINT, Response::new(200, ""));
    let (coordinator, queue) = coordinator(network);
    queue.enqueue(SyncAction::MedicationTaken, &json!({})).unwrap();
    queue.enqueue(SyncAction::MedicationSnooze, &json!({})).unwrap();

    let report = coordinator
      .drain(Some(SyncAction::MedicationSnooze))
      .await
      .unwrap();

    assert_eq!(report.delivered, 1);
    assert_eq!(queue.pending(Some(SyncAction::MedicationTaken)).unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_drain_offline_leaves_records_pending() {
    let network = Arc::new(MockNetwork::new());
    network.set_online(false);
    let (coordinator, queue) = coordinator(network);
    queue.enqueue(SyncAction::MedicationTaken, &json!({})).unwrap();

    assert!(coordinator.drain(None).await.is_err());
    assert_eq!(queue.count_pending().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_drain_stops_on_rejection() {
    let network = Arc::new(MockNetwork::new());
    network.route(ENDPOINT, Response::new(500, "boom"));
    let (coordinator, queue) = coordinator(network.clone());
    queue.enqueue(SyncAction::MedicationTaken, &json!({})).unwrap();
    queue.enqueue(SyncAction::MedicationTaken, &json!({})).unwrap();

    assert!(coordinator.drain(None).await.is_err());
    assert_eq!(network.call_count(), 1);
    assert_eq!(queue.count_pending().unwrap(), 2);
  }

  #[tokio::test]
  async fn test_drain_without_store_delivers_nothing() {
    let network = Arc::new(MockNetwork::new());
    let coordinator = SyncCoordinator::new(None, network.clone(), Url::parse(ENDPOINT).unwrap());

    let report = coordinator.drain(None).await.unwrap();

    assert_eq!(report, DrainReport::default());
    assert_eq!(network.call_count(), 0);
  }

  #[test]
  fn test_registration_lifecycle() {
    let (coordinator, _) = coordinator(Arc::new(MockNetwork::new()));
    coordinator.register(SyncTag::MedicationTaken).unwrap();
    assert_eq!(
      coordinator.registrations(),
      vec![(SyncTag::MedicationTaken, RegistrationState::Registered)]
    );

    coordinator.mark_fired(SyncTag::MedicationTaken);
    coordinator.mark_finished(SyncTag::MedicationTaken, false);
    assert_eq!(
      coordinator.registrations(),
      vec![(SyncTag::MedicationTaken, RegistrationState::Failed)]
    );

    coordinator.mark_finished(SyncTag::MedicationTaken, true);
    assert!(coordinator.registrations().is_empty());
  }
}
