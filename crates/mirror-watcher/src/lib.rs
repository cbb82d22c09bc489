//! Debounced filesystem watching for mirror sessions.
//!
//! Provides:
//! - `FileWatcher` - notify-backed recursive watcher with async debouncing
//! - `IgnoreSet` - glob-lite path filtering
//!
//! The watcher is deliberately not restartable: on a fatal error it emits
//! one terminal [`WatchEvent::Failed`] and closes its stream. Re-creating
//! a watcher is the engine's responsibility.

pub mod ignore;
pub mod watcher;

pub use ignore::IgnoreSet;
pub use watcher::{FileWatcher, WatchError, WatchEvent};
