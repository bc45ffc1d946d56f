//! Core types for the caching system.

use chrono::{DateTime, Duration, Utc};

use crate::http::Response;

/// A stored response together with the URL it was fetched from.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub url: String,
  pub response: Response,
  /// When the entry was written locally; expiry uses the Date header
  pub stored_at: DateTime<Utc>,
}

impl CachedEntry {
  /// Whether the entry is older than `max_age` according to its `Date` header.
  pub fn is_expired(&self, max_age: Option<Duration>, now: DateTime<Utc>) -> bool {
    is_expired(&self.response, max_age, now)
  }
}

/// A response is expired when `now - Date > max_age` (strictly greater).
///
/// Responses without a parseable `Date` header never expire by this check.
pub fn is_expired(response: &Response, max_age: Option<Duration>, now: DateTime<Utc>) -> bool {
  let Some(max_age) = max_age else {
    return false;
  };

  match response.date() {
    Some(date) => now - date > max_age,
    None => false,
  }
}

/// Indicates where a response handed back to the page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh from the network
  Network,
  /// Served from cache without touching the network
  Cache,
  /// Served from cache after the network failed (offline mode)
  Offline,
  /// Built locally because neither network nor cache could answer
  Synthetic,
}

/// A response produced by a caching policy.
#[derive(Debug, Clone)]
pub struct CacheResult {
  pub response: Response,
  pub source: ResponseSource,
}

impl CacheResult {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
    }
  }

  pub fn from_cache(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Cache,
    }
  }

  pub fn offline(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Offline,
    }
  }

  pub fn synthetic(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Synthetic,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const DATE: &str = "Mon, 01 Jan 2024 00:00:00 GMT";

  fn dated() -> Response {
    Response::new(200, "x").with_header("Date", DATE)
  }

  fn date() -> DateTime<Utc> {
    DateTime::parse_from_rfc2822(DATE)
      .unwrap()
      .with_timezone(&Utc)
  }

  #[test]
  fn test_exactly_max_age_is_not_expired() {
    let max_age = Duration::days(7);
    assert!(!is_expired(&dated(), Some(max_age), date() + max_age));
  }

  #[test]
  fn test_one_millisecond_past_max_age_is_expired() {
    let max_age = Duration::days(7);
    let now = date() + max_age + Duration::milliseconds(1);
    assert!(is_expired(&dated(), Some(max_age), now));
  }

  #[test]
  fn test_missing_date_never_expires() {
    let response = Response::new(200, "x");
    let now = date() + Duration::days(3650);
    assert!(!is_expired(&response, Some(Duration::seconds(1)), now));
  }

  #[test]
  fn test_no_max_age_never_expires() {
    let now = date() + Duration::days(3650);
    assert!(!is_expired(&dated(), None, now));
  }
}
