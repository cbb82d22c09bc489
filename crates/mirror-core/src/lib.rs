//! Core abstractions for mirror session management.
//!
//! This crate provides the fundamental building blocks:
//! - `SyncEvent` / `FileChangeRecord` - The sync pipeline's data model
//! - `EventStore` - Broadcast + bounded history for reconnection support
//! - `Session` / `ExecStatus` - Lifecycle state for sessions and executions
//! - `RetryPolicy` - Shared backoff policy for transient failures
//! - `MirrorConfig` - Engine configuration

pub mod change;
pub mod config;
pub mod event;
pub mod event_store;
pub mod retry;
pub mod session;

pub use change::{ChangeKind, FileChangeRecord};
pub use config::MirrorConfig;
pub use event::{EventStatus, SyncEvent, SyncEventType};
pub use event_store::EventStore;
pub use retry::RetryPolicy;
pub use session::{ExecStatus, Session, SessionId, SessionStatus};
