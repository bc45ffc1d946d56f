//! Open app windows the worker can focus, open or take control of.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::Mutex;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientWindow {
  pub id: u64,
  pub url: String,
  pub focused: bool,
  /// Whether this worker controls the window
  pub controlled: bool,
}

impl ClientWindow {
  /// A window matches a target when its path (plus query) equals it, or its
  /// full URL does.
  pub fn matches(&self, target: &str) -> bool {
    if self.url == target {
      return true;
    }

    match Url::parse(&self.url) {
      Ok(url) => {
        let path = match url.query() {
          Some(q) => format!("{}?{}", url.path(), q),
          None => url.path().to_string(),
        };
        path == target
      }
      Err(_) => false,
    }
  }
}

#[derive(Default)]
pub struct ClientRegistry {
  windows: Mutex<Vec<ClientWindow>>,
}

impl ClientRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<ClientWindow>>> {
    self
      .windows
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  pub fn list(&self) -> Result<Vec<ClientWindow>> {
    Ok(self.lock()?.clone())
  }

  /// Open a window at `url`, focus it, and return its id.
  pub fn open_window(&self, url: &str) -> Result<u64> {
    let mut windows = self.lock()?;
    let id = windows.iter().map(|w| w.id).max().unwrap_or(0) + 1;

    for window in windows.iter_mut() {
      window.focused = false;
    }
    windows.push(ClientWindow {
      id,
      url: url.to_string(),
      focused: true,
      controlled: true,
    });

    Ok(id)
  }

  pub fn focus(&self, id: u64) -> Result<()> {
    let mut windows = self.lock()?;
    if !windows.iter().any(|w| w.id == id) {
      return Err(eyre!("No client with id {}", id));
    }

    for window in windows.iter_mut() {
      window.focused = window.id == id;
    }
    Ok(())
  }

  /// First window showing `target`, if any.
  pub fn find(&self, target: &str) -> Result<Option<ClientWindow>> {
    Ok(self.lock()?.iter().find(|w| w.matches(target)).cloned())
  }

  /// Take control of every open window. Returns how many were newly claimed.
  pub fn claim(&self) -> Result<usize> {
    let mut windows = self.lock()?;
    let mut claimed = 0;
    for window in windows.iter_mut().filter(|w| !w.controlled) {
      window.controlled = true;
      claimed += 1;
    }
    Ok(claimed)
  }

  /// Register a window that was opened before this worker started.
  pub fn attach(&self, url: &str) -> Result<u64> {
    let mut windows = self.lock()?;
    let id = windows.iter().map(|w| w.id).max().unwrap_or(0) + 1;
    windows.push(ClientWindow {
      id,
      url: url.to_string(),
      focused: false,
      controlled: false,
    });
    Ok(id)
  }
}
