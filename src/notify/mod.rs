pub mod hub;
pub mod watcher;

pub use hub::{ChangeCallback, ChangeNotification, NotificationHub, NotificationKind, NotificationToken};
pub use watcher::{ChangeWatcher, spawn_change_watcher};
