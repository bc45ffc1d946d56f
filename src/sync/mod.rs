//! Offline action queue and background sync.

mod coordinator;
mod queue;

pub use coordinator::{RegistrationState, SyncCoordinator, SyncJob, SyncTag};
pub use queue::{SyncAction, SyncQueue};
