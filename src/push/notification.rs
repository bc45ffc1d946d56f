//! Turning push payloads into notification presentations.

use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::warn;

use super::payload::{PushKind, PushPayload};

const ICON: &str = "/images/icons/icon-192x192.png";
const BADGE: &str = "/images/icons/badge-72x72.png";

const DEFAULT_TITLE: &str = "Health Guide";
const DEFAULT_BODY: &str = "You have a new notification";

/// A button shown on a notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
  pub action: &'static str,
  pub title: &'static str,
  pub icon: &'static str,
}

const fn button(action: &'static str, title: &'static str, icon: &'static str) -> NotificationAction {
  NotificationAction { action, title, icon }
}

/// What gets displayed for one push message. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: &'static str,
  pub badge: &'static str,
  pub tag: Option<String>,
  pub vibrate: Vec<u32>,
  pub require_interaction: bool,
  pub actions: Vec<NotificationAction>,
  /// Carried through to click handling; always has a `url` entry
  pub data: Value,
}

impl Default for Notification {
  fn default() -> Self {
    Self {
      title: DEFAULT_TITLE.to_string(),
      body: DEFAULT_BODY.to_string(),
      icon: ICON,
      badge: BADGE,
      tag: None,
      vibrate: vec![200, 100, 200],
      require_interaction: false,
      actions: Vec::new(),
      data: json!({ "url": "/" }),
    }
  }
}

impl Notification {
  /// Build the presentation for a raw push message.
  ///
  /// Missing or malformed payloads produce the generic default notification.
  pub fn from_push(data: Option<&[u8]>) -> Self {
    let notification = Notification::default();

    let Some(bytes) = data else {
      return notification;
    };

    match serde_json::from_slice::<PushPayload>(bytes) {
      Ok(payload) => Self::from_payload(payload),
      Err(e) => {
        warn!("Malformed push payload, showing default notification: {}", e);
        notification
      }
    }
  }

  pub fn from_payload(payload: PushPayload) -> Self {
    let kind = PushKind::parse(payload.kind.as_deref());
    let defaults = Notification::default();

    let mut notification = match kind {
      PushKind::MedicationReminder => {
        let name = payload.medication_name.as_deref().unwrap_or("your medication");
        let body = match payload.dosage.as_deref() {
          Some(dosage) => format!("Time to take {} ({})", name, dosage),
          None => format!("Time to take {}", name),
        };
        Notification {
          title: "Medication Reminder".to_string(),
          body,
          tag: Some(match &payload.prescription_id {
            Some(id) => format!("medication-{}", id_string(id)),
            None => "medication".to_string(),
          }),
          vibrate: vec![200, 100, 200, 100, 200],
          require_interaction: true,
          actions: vec![
            button("taken", "Mark as Taken", "/images/icons/check.png"),
            button("snooze", "Snooze 15 min", "/images/icons/snooze.png"),
          ],
          data: json!({
            "url": "/prescriptions.html",
            "prescription_id": payload.prescription_id,
            "medication_name": payload.medication_name,
            "dosage": payload.dosage,
          }),
          ..defaults
        }
      }
      PushKind::EmergencyAlert => Notification {
        title: "Emergency Alert".to_string(),
        body: payload
          .message
          .clone()
          .unwrap_or_else(|| "An emergency alert needs your attention".to_string()),
        tag: Some("emergency".to_string()),
        vibrate: vec![300, 100, 300, 100, 300, 100, 300, 100, 300],
        require_interaction: true,
        actions: vec![
          button("acknowledge", "Acknowledge", "/images/icons/check.png"),
          button("call_emergency", "Call Emergency", "/images/icons/phone.png"),
        ],
        data: json!({
          "url": "/emergency.html",
          "message": payload.message,
        }),
        ..defaults
      },
      PushKind::HealthTip => {
        let url = match &payload.tip_id {
          Some(id) => format!("/dashboard.html?tip={}", id_string(id)),
          None => "/dashboard.html".to_string(),
        };
        Notification {
          title: "Health Tip".to_string(),
          body: payload
            .message
            .clone()
            .unwrap_or_else(|| "Here's a tip for a healthier day".to_string()),
          tag: Some("health-tip".to_string()),
          vibrate: vec![100],
          actions: vec![
            button("read_more", "Read More", "/images/icons/book.png"),
            button("close", "Dismiss", "/images/icons/close.png"),
          ],
          data: json!({ "url": url, "tip_id": payload.tip_id }),
          ..defaults
        }
      }
      PushKind::VitalsReminder => Notification {
        title: "Vitals Reminder".to_string(),
        body: payload
          .message
          .clone()
          .unwrap_or_else(|| "Time to log your vitals".to_string()),
        tag: Some("vitals".to_string()),
        actions: vec![
          button("log_vitals", "Log Vitals", "/images/icons/heart.png"),
          button("close", "Later", "/images/icons/close.png"),
        ],
        data: json!({ "url": "/vitals.html" }),
        ..defaults
      },
      PushKind::Other => Notification {
        title: payload.title.clone().unwrap_or(defaults.title),
        body: payload
          .body
          .clone()
          .or_else(|| payload.message.clone())
          .unwrap_or(defaults.body),
        actions: vec![
          button("view", "View", "/images/icons/view.png"),
          button("close", "Close", "/images/icons/close.png"),
        ],
        ..defaults
      },
    };

    merge_data(&mut notification.data, payload.data, kind);
    notification
  }

  /// Click target URL carried in the notification data.
  pub fn url(&self) -> &str {
    self.data.get("url").and_then(Value::as_str).unwrap_or("/")
  }

  pub fn data_field(&self, key: &str) -> Value {
    self.data.get(key).cloned().unwrap_or(Value::Null)
  }
}

/// Merge extra payload data with the built data.
///
/// Known types keep their built keys; for anything else the payload wins,
/// so a generic push can carry its own click target.
fn merge_data(data: &mut Value, extra: Option<Value>, kind: PushKind) {
  let extra = match extra {
    Some(Value::Object(map)) => map,
    _ => Map::new(),
  };
  let built = match std::mem::take(data) {
    Value::Object(map) => map,
    _ => Map::new(),
  };

  let (mut merged, over) = if kind == PushKind::Other {
    (built, extra)
  } else {
    (extra, built)
  };
  for (k, v) in over {
    merged.insert(k, v);
  }

  merged.insert("type".to_string(), Value::String(kind.as_str().to_string()));
  *data = Value::Object(merged);
}

fn id_string(id: &Value) -> String {
  match id {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}
