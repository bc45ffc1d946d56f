//! Notification click dispatch.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::{json, Value};

use super::notification::Notification;
use crate::sync::SyncAction;

/// How long a snoozed reminder waits
pub const SNOOZE_MINUTES: i64 = 15;

/// The button a user pressed, or `Open` when the notification body was tapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickAction {
  Taken,
  Snooze,
  Acknowledge,
  CallEmergency,
  LogVitals,
  ReadMore,
  View,
  Close,
  Open,
}

impl ClickAction {
  /// Unknown action ids behave like a tap on the body.
  pub fn parse(action: Option<&str>) -> Self {
    match action {
      Some("taken") => ClickAction::Taken,
      Some("snooze") => ClickAction::Snooze,
      Some("acknowledge") => ClickAction::Acknowledge,
      Some("call_emergency") => ClickAction::CallEmergency,
      Some("log_vitals") => ClickAction::LogVitals,
      Some("read_more") => ClickAction::ReadMore,
      Some("view") => ClickAction::View,
      Some("close") => ClickAction::Close,
      _ => ClickAction::Open,
    }
  }
}

/// Where a click takes the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "url", rename_all = "snake_case")]
pub enum Navigation {
  /// Open a new window at the URL
  Open(String),
  /// Focus a window already showing the URL, or open one
  FocusOrOpen(String),
}

/// What handling a click should do, before any side effects run.
#[derive(Debug, Clone, PartialEq)]
pub struct ClickPlan {
  pub enqueue: Option<(SyncAction, Value)>,
  pub navigation: Option<Navigation>,
}

impl ClickPlan {
  fn navigate(url: impl Into<String>) -> Self {
    Self {
      enqueue: None,
      navigation: Some(Navigation::Open(url.into())),
    }
  }
}

/// Decide what a click on `notification` does.
pub fn plan_click(notification: &Notification, action: &ClickAction, now: DateTime<Utc>) -> ClickPlan {
  match action {
    ClickAction::Taken => ClickPlan {
      enqueue: Some((
        SyncAction::MedicationTaken,
        json!({
          "prescription_id": notification.data_field("prescription_id"),
          "medication_name": notification.data_field("medication_name"),
          "dosage": notification.data_field("dosage"),
          "taken_at": now.to_rfc3339(),
        }),
      )),
      navigation: Some(Navigation::Open("/prescriptions.html".to_string())),
    },
    ClickAction::Snooze => ClickPlan {
      enqueue: Some((
        SyncAction::MedicationSnooze,
        json!({
          "prescription_id": notification.data_field("prescription_id"),
          "medication_name": notification.data_field("medication_name"),
          "snooze_until": (now + Duration::minutes(SNOOZE_MINUTES)).to_rfc3339(),
        }),
      )),
      navigation: None,
    },
    ClickAction::Acknowledge => ClickPlan {
      enqueue: Some((
        SyncAction::EmergencyAcknowledge,
        json!({
          "message": notification.data_field("message"),
          "acknowledged_at": now.to_rfc3339(),
        }),
      )),
      navigation: Some(Navigation::Open("/emergency.html".to_string())),
    },
    ClickAction::CallEmergency => ClickPlan::navigate("/emergency.html?action=call"),
    ClickAction::LogVitals => ClickPlan::navigate("/vitals.html"),
    ClickAction::ReadMore | ClickAction::View => ClickPlan::navigate(notification.url()),
    ClickAction::Close => ClickPlan {
      enqueue: None,
      navigation: None,
    },
    ClickAction::Open => ClickPlan {
      enqueue: None,
      navigation: Some(Navigation::FocusOrOpen(notification.url().to_string())),
    },
  }
}
