//! Serde types matching server push payloads.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Display fields accept any JSON scalar; `"dosage": 500` reads as "500".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PushPayload {
  #[serde(rename = "type", default, deserialize_with = "lenient_text")]
  pub kind: Option<String>,
  #[serde(default, deserialize_with = "lenient_text")]
  pub medication_name: Option<String>,
  #[serde(default, deserialize_with = "lenient_text")]
  pub dosage: Option<String>,
  pub prescription_id: Option<Value>,
  #[serde(default, deserialize_with = "lenient_text")]
  pub message: Option<String>,
  pub tip_id: Option<Value>,
  #[serde(default, deserialize_with = "lenient_text")]
  pub title: Option<String>,
  #[serde(default, deserialize_with = "lenient_text")]
  pub body: Option<String>,
  pub data: Option<Value>,
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
  D: Deserializer<'de>,
{
  Ok(match Option::<Value>::deserialize(deserializer)? {
    None | Some(Value::Null) => None,
    Some(Value::String(s)) => Some(s),
    Some(other) => Some(other.to_string()),
  })
}

/// Closed set of push types; anything else is `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushKind {
  MedicationReminder,
  EmergencyAlert,
  HealthTip,
  VitalsReminder,
  Other,
}

impl PushKind {
  pub fn parse(kind: Option<&str>) -> Self {
    match kind {
      Some("medication_reminder") => PushKind::MedicationReminder,
      Some("emergency_alert") => PushKind::EmergencyAlert,
      Some("health_tip") => PushKind::HealthTip,
      Some("vitals_reminder") => PushKind::VitalsReminder,
      _ => PushKind::Other,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      PushKind::MedicationReminder => "medication_reminder",
      PushKind::EmergencyAlert => "emergency_alert",
      PushKind::HealthTip => "health_tip",
      PushKind::VitalsReminder => "vitals_reminder",
      PushKind::Other => "general",
    }
  }
}
