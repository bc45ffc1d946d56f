//! Request/response types and the network seam the cache strategies fetch through.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::pin::Pin;
use url::Url;

/// A boxed, sendable future
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// How the request was initiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
  /// Full-page load
  Navigate,
  #[default]
  Cors,
}

#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub mode: RequestMode,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      mode: RequestMode::default(),
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  pub fn post_json(url: Url, body: &serde_json::Value) -> Result<Self> {
    let body = serde_json::to_vec(body).map_err(|e| eyre!("Failed to serialize body: {}", e))?;
    Ok(Self {
      method: Method::POST,
      url,
      mode: RequestMode::Cors,
      headers: vec![("Content-Type".to_string(), "application/json".to_string())],
      body: Some(body),
    })
  }

  pub fn path(&self) -> &str {
    self.url.path()
  }

  pub fn is_http(&self) -> bool {
    matches!(self.url.scheme(), "http" | "https")
  }

  /// Stable storage key for this request (SHA-256 of the URL).
  pub fn cache_key(&self) -> String {
    cache_key_for(&self.url)
  }
}

/// Fragments never reach the server, so they are left out of the key.
pub fn cache_key_for(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);

  let mut hasher = Sha256::new();
  hasher.update(url.as_str().as_bytes());
  hex::encode(hasher.finalize())
}

/// A response as seen by the worker; serializable so it can be stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn text(status: u16, body: &str) -> Self {
    Self::new(status, body).with_header("Content-Type", "text/plain")
  }

  pub fn html(status: u16, body: &str) -> Self {
    Self::new(status, body).with_header("Content-Type", "text/html")
  }

  #[cfg(test)]
  pub fn json(status: u16, body: &serde_json::Value) -> Self {
    Self::new(status, body.to_string()).with_header("Content-Type", "application/json")
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.set_header(name, value);
    self
  }

  /// Replace any existing header with the same (case-insensitive) name.
  pub fn set_header(&mut self, name: &str, value: &str) {
    self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    self.headers.push((name.to_string(), value.to_string()));
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// True for 2xx statuses
  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Parsed HTTP `Date` header, if present and well-formed.
  pub fn date(&self) -> Option<DateTime<Utc>> {
    let raw = self.header("Date")?;
    DateTime::parse_from_rfc2822(raw)
      .ok()
      .map(|dt| dt.with_timezone(&Utc))
  }

  pub fn body_text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Anything that can perform a network fetch.
pub trait Network: Send + Sync {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>>;
}

/// reqwest-backed network
pub struct HttpNetwork {
  client: reqwest::Client,
  token: Option<String>,
}

impl HttpNetwork {
  pub fn new(token: Option<String>) -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("health-guide-sw/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, token })
  }
}

impl Network for HttpNetwork {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
    Box::pin(async move {
      let mut builder = self
        .client
        .request(request.method.clone(), request.url.clone());

      for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
      }

      if let Some(token) = &self.token {
        if request.path().starts_with("/api/") {
          builder = builder.bearer_auth(token);
        }
      }

      if let Some(body) = &request.body {
        builder = builder.body(body.clone());
      }

      let response = builder
        .send()
        .await
        .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

      let status = response.status().as_u16();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?
        .to_vec();

      Ok(Response {
        status,
        headers,
        body,
      })
    })
  }
}
