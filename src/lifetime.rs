//! Event lifetime extension.
//!
//! Work that outlives the handler that started it (for example the network
//! refresh behind a stale-while-revalidate response) must be registered here,
//! otherwise it can be dropped when the worker shuts down.

use std::future::Future;
use std::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, warn};

#[derive(Default)]
pub struct Lifetime {
  tasks: Mutex<JoinSet<()>>,
}

impl Lifetime {
  pub fn new() -> Self {
    Self::default()
  }

  /// Keep the worker alive until `future` completes.
  pub fn wait_until<F>(&self, future: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    match self.tasks.lock() {
      Ok(mut tasks) => {
        tasks.spawn(future);
      }
      Err(e) => {
        // Still run it, just untracked
        warn!("Lifetime tracker poisoned, running task untracked: {}", e);
        tokio::spawn(future);
      }
    }
  }

  /// Number of registered tasks not yet collected by `settle`.
  pub fn pending(&self) -> usize {
    self.tasks.lock().map(|t| t.len()).unwrap_or(0)
  }

  /// Wait for every registered task, including ones registered while waiting.
  pub async fn settle(&self) {
    loop {
      let mut batch = match self.tasks.lock() {
        Ok(mut tasks) => std::mem::take(&mut *tasks),
        Err(_) => return,
      };

      if batch.is_empty() {
        return;
      }

      while let Some(result) = batch.join_next().await {
        if let Err(e) = result {
          debug!("Background task ended abnormally: {}", e);
        }
      }
    }
  }
}
