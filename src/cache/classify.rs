//! Request classification: which caching policy handles a fetch.

use crate::config::{Bucket, CacheConfig};
use crate::http::{Request, RequestMode};

const STATIC_EXTENSIONS: &[&str] = &[
  "css", "js", "png", "jpg", "jpeg", "gif", "svg", "woff", "woff2", "ttf", "eot",
];

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "svg", "webp"];

/// API paths that get a synthetic offline body instead of an error
const OFFLINE_DATA_PATHS: &[&str] = &["/prescriptions", "/vitals", "/reports"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  Static,
  Api,
  Image,
  Navigation,
  Dynamic,
}

impl RequestClass {
  /// Bucket the class reads and writes.
  pub fn bucket(self) -> Bucket {
    match self {
      RequestClass::Static => Bucket::Static,
      RequestClass::Api => Bucket::Api,
      RequestClass::Image => Bucket::Image,
      RequestClass::Navigation | RequestClass::Dynamic => Bucket::Dynamic,
    }
  }
}

/// Classify a request. First match wins: static, API, image, navigation, dynamic.
pub fn classify(request: &Request, config: &CacheConfig) -> RequestClass {
  let path = request.path();
  let extension = extension(path);

  if config.is_static_asset(path) || matches_any(extension.as_deref(), STATIC_EXTENSIONS) {
    RequestClass::Static
  } else if path.starts_with("/api/") {
    RequestClass::Api
  } else if matches_any(extension.as_deref(), IMAGE_EXTENSIONS) {
    RequestClass::Image
  } else if request.mode == RequestMode::Navigate {
    RequestClass::Navigation
  } else {
    RequestClass::Dynamic
  }
}

/// Whether an API path gets the `{offline: true}` body when nothing is cached.
pub fn is_offline_data_path(path: &str) -> bool {
  OFFLINE_DATA_PATHS.iter().any(|p| path.contains(p))
}

/// Lowercased extension of the last path segment.
fn extension(path: &str) -> Option<String> {
  let segment = path.rsplit('/').next()?;
  let (stem, ext) = segment.rsplit_once('.')?;
  if stem.is_empty() && ext.is_empty() {
    return None;
  }
  Some(ext.to_ascii_lowercase())
}

fn matches_any(extension: Option<&str>, set: &[&str]) -> bool {
  extension.is_some_and(|ext| set.contains(&ext))
}
