//! Push messages: presentation and click handling.

mod click;
mod notification;
mod payload;

pub use click::{plan_click, ClickAction, Navigation};
pub use notification::Notification;
