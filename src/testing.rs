//! Scripted in-process network for tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::http::{BoxFuture, Network, Request, Response};

pub struct MockNetwork {
  routes: Mutex<HashMap<String, Response>>,
  online: AtomicBool,
  calls: Mutex<Vec<Request>>,
}

impl MockNetwork {
  pub fn new() -> Self {
    Self {
      routes: Mutex::new(HashMap::new()),
      online: AtomicBool::new(true),
      calls: Mutex::new(Vec::new()),
    }
  }

  /// Answer requests for `url` with `response`. Unrouted URLs get a 404.
  pub fn route(&self, url: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn calls(&self) -> Vec<Request> {
    self.calls.lock().unwrap().clone()
  }
}

impl Network for MockNetwork {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response>> {
    Box::pin(async move {
      self.calls.lock().unwrap().push(request.clone());

      if !self.online.load(Ordering::SeqCst) {
        return Err(eyre!("Failed to fetch {}: network unreachable", request.url));
      }

      let routed = self.routes.lock().unwrap().get(request.url.as_str()).cloned();
      Ok(routed.unwrap_or_else(|| Response::text(404, "Not Found")))
    })
  }
}
