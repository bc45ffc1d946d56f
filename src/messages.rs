//! Control messages sent from app pages to the worker.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  SkipWaiting,
  GetVersion,
  ClearCache,
  #[serde(other)]
  Unknown,
}

/// Reply sent through the message port for `GET_VERSION`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionReply {
  pub version: String,
}
