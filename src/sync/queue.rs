//! Durable queue of actions waiting to be delivered to the backend.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

/// Database file name of the sync store
pub const DATABASE_NAME: &str = "HealthGuideDB";

const SCHEMA_VERSION: i64 = 2;

/// Kind of action a queued record replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
  MedicationTaken,
  MedicationSnooze,
  EmergencyAcknowledge,
}

impl SyncAction {
  pub fn as_str(self) -> &'static str {
    match self {
      SyncAction::MedicationTaken => "medication_taken",
      SyncAction::MedicationSnooze => "medication_snooze",
      SyncAction::EmergencyAcknowledge => "emergency_acknowledge",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "medication_taken" => Some(SyncAction::MedicationTaken),
      "medication_snooze" => Some(SyncAction::MedicationSnooze),
      "emergency_acknowledge" => Some(SyncAction::EmergencyAcknowledge),
      _ => None,
    }
  }
}

/// A queued record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncQueueItem {
  pub id: i64,
  pub action: SyncAction,
  pub payload: Value,
  pub timestamp: DateTime<Utc>,
  pub synced: bool,
}

/// SQLite-backed sync queue.
///
/// Records are only ever inserted, have their `synced` flag flipped, or are
/// removed by an explicit purge.
pub struct SyncQueue {
  conn: Mutex<Connection>,
}

impl SyncQueue {
  /// Open (or create) `HealthGuideDB.sqlite` inside `dir`.
  pub fn open(dir: &Path) -> Result<Self> {
    std::fs::create_dir_all(dir).map_err(|e| eyre!("Failed to create sync directory: {}", e))?;

    let path = dir.join(format!("{}.sqlite", DATABASE_NAME));
    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open sync store at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory sync store: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let queue = Self {
      conn: Mutex::new(conn),
    };
    queue.run_migrations()?;
    Ok(queue)
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Bring the schema up to version 2.
  fn run_migrations(&self) -> Result<()> {
    let version = self.schema_version()?;
    let conn = self.lock()?;

    if version < SCHEMA_VERSION {
      conn
        .execute_batch(QUEUE_SCHEMA)
        .map_err(|e| eyre!("Failed to run sync store migrations: {}", e))?;
      conn
        .pragma_update(None, "user_version", SCHEMA_VERSION)
        .map_err(|e| eyre!("Failed to set schema version: {}", e))?;
      debug!("Upgraded sync store from version {} to {}", version, SCHEMA_VERSION);
    }

    Ok(())
  }

  pub fn schema_version(&self) -> Result<i64> {
    let conn = self.lock()?;
    conn
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to read schema version: {}", e))
  }

  /// Insert an unsynced record and return its id.
  pub fn enqueue(&self, action: SyncAction, payload: &Value) -> Result<i64> {
    let conn = self.lock()?;
    let data =
      serde_json::to_string(payload).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    conn
      .execute(
        "INSERT INTO sync_queue (action_type, payload, timestamp, synced) VALUES (?, ?, ?, 0)",
        params![action.as_str(), data, Utc::now().to_rfc3339()],
      )
      .map_err(|e| eyre!("Failed to enqueue {}: {}", action.as_str(), e))?;

    let id = conn.last_insert_rowid();
    info!("Queued {} as sync record {}", action.as_str(), id);
    Ok(id)
  }

  /// Unsynced records in insertion order, optionally limited to one action kind.
  pub fn pending(&self, action: Option<SyncAction>) -> Result<Vec<SyncQueueItem>> {
    match action {
      Some(action) => self.select(
        "SELECT id, action_type, payload, timestamp, synced FROM sync_queue
         WHERE synced = 0 AND action_type = ? ORDER BY id",
        params![action.as_str()],
      ),
      None => self.select(
        "SELECT id, action_type, payload, timestamp, synced FROM sync_queue
         WHERE synced = 0 ORDER BY id",
        params![],
      ),
    }
  }

  pub fn by_action(&self, action: SyncAction) -> Result<Vec<SyncQueueItem>> {
    self.select(
      "SELECT id, action_type, payload, timestamp, synced FROM sync_queue
       WHERE action_type = ? ORDER BY id",
      params![action.as_str()],
    )
  }

  pub fn all(&self) -> Result<Vec<SyncQueueItem>> {
    self.select(
      "SELECT id, action_type, payload, timestamp, synced FROM sync_queue ORDER BY id",
      params![],
    )
  }

  pub fn count_pending(&self) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM sync_queue WHERE synced = 0",
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count pending records: {}", e))?;
    Ok(count as usize)
  }

  /// Flip a record's synced flag. Errors if the record does not exist.
  pub fn mark_synced(&self, id: i64) -> Result<()> {
    let conn = self.lock()?;
    let updated = conn
      .execute("UPDATE sync_queue SET synced = 1 WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to mark record {} synced: {}", id, e))?;

    if updated == 0 {
      return Err(eyre!("Sync record {} not found", id));
    }
    Ok(())
  }

  /// Remove delivered records. Returns how many were removed.
  pub fn purge_synced(&self) -> Result<usize> {
    let conn = self.lock()?;
    let removed = conn
      .execute("DELETE FROM sync_queue WHERE synced = 1", [])
      .map_err(|e| eyre!("Failed to purge synced records: {}", e))?;
    Ok(removed)
  }

  fn select(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<SyncQueueItem>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(sql)
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params, read_row)
      .map_err(|e| eyre!("Failed to query sync queue: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read sync record: {}", e))?;

    rows.into_iter().map(RawItem::decode).collect()
  }
}

/// Schema for the sync store.
const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    action_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_action_type ON sync_queue(action_type);
CREATE INDEX IF NOT EXISTS idx_sync_queue_synced ON sync_queue(synced);
"#;

struct RawItem {
  id: i64,
  action: String,
  payload: String,
  timestamp: String,
  synced: bool,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawItem> {
  Ok(RawItem {
    id: row.get(0)?,
    action: row.get(1)?,
    payload: row.get(2)?,
    timestamp: row.get(3)?,
    synced: row.get(4)?,
  })
}

impl RawItem {
  fn decode(self) -> Result<SyncQueueItem> {
    let action = SyncAction::parse(&self.action)
      .ok_or_else(|| eyre!("Unknown action type '{}' in record {}", self.action, self.id))?;
    let payload = serde_json::from_str(&self.payload)
      .map_err(|e| eyre!("Failed to parse payload of record {}: {}", self.id, e))?;
    let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
      .map(|dt| dt.with_timezone(&Utc))
      .map_err(|e| eyre!("Failed to parse datetime '{}': {}", self.timestamp, e))?;

    Ok(SyncQueueItem {
      id: self.id,
      action,
      payload,
      timestamp,
      synced: self.synced,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn queue() -> SyncQueue {
    SyncQueue::open_in_memory().unwrap()
  }

  #[test]
  fn test_schema_version_is_two() {
    assert_eq!(queue().schema_version().unwrap(), 2);
  }

  #[test]
  fn test_enqueue_ids_increase() {
    let queue = queue();
    let a = queue
      .enqueue(SyncAction::MedicationTaken, &json!({"prescription_id": 1}))
      .unwrap();
    let b = queue
      .enqueue(SyncAction::MedicationSnooze, &json!({"prescription_id": 1}))
      .unwrap();
    assert!(b > a);
  }

  #[test]
  fn test_ids_not_reused_after_purge() {
    let queue = queue();
    let a = queue.enqueue(SyncAction::MedicationTaken, &json!({})).unwrap();
    queue.mark_synced(a).unwrap();
    queue.purge_synced().unwrap();
    let b = queue.enqueue(SyncAction::MedicationTaken, &json!({})).unwrap();
    assert!(b > a);
  }

  #[test]
  fn test_new_record_is_unsynced() {
    let queue = queue();
    let payload = json!({"prescription_id": 7, "medication_name": "Aspirin"});
    queue.enqueue(SyncAction::MedicationTaken, &payload).unwrap();

    let pending = queue.pending(None).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].action, SyncAction::MedicationTaken);
    assert_eq!(pending[0].payload, payload);
    assert!(!pending[0].synced);
  }

  #[test]
  fn test_mark_synced_only_flips_flag() {
    let queue = queue();
    let id = queue
      .enqueue(SyncAction::EmergencyAcknowledge, &json!({"alert": 3}))
      .unwrap();
    let before = queue.all().unwrap().remove(0);

    queue.mark_synced(id).unwrap();

    let after = queue.all().unwrap().remove(0);
    assert!(after.synced);
    assert_eq!(after.payload, before.payload);
    assert_eq!(after.timestamp, before.timestamp);
    assert_eq!(queue.count_pending().unwrap(), 0);
  }

  #[test]
  fn test_mark_synced_missing_record() {
    assert!(queue().mark_synced(42).is_err());
  }

  #[test]
  fn test_pending_filters_by_action() {
    let queue = queue();
    queue.enqueue(SyncAction::MedicationTaken, &json!({})).unwrap();
    queue.enqueue(SyncAction::MedicationSnooze, &json!({})).unwrap();
    queue.enqueue(SyncAction::MedicationTaken, &json!({})).unwrap();

    assert_eq!(queue.pending(Some(SyncAction::MedicationTaken)).unwrap().len(), 2);
    assert_eq!(queue.by_action(SyncAction::MedicationSnooze).unwrap().len(), 1);
  }

  #[test]
  fn test_purge_removes_only_synced() {
    let queue = queue();
    let a = queue.enqueue(SyncAction::MedicationTaken, &json!({})).unwrap();
    queue.enqueue(SyncAction::MedicationTaken, &json!({})).unwrap();
    queue.mark_synced(a).unwrap();

    assert_eq!(queue.purge_synced().unwrap(), 1);
    assert_eq!(queue.all().unwrap().len(), 1);
  }

  #[test]
  fn test_action_serializes_snake_case() {
    assert_eq!(
      serde_json::to_value(SyncAction::MedicationTaken).unwrap(),
      json!("medication_taken")
    );
  }
}
