//! Sync orchestration and session lifecycle.
//!
//! Provides:
//! - `SyncManager` - Coalesces file changes into retried transfer windows
//! - `MirrorEngine` - Session lifecycle, execution wiring, observer dispatch
//! - `Transfer` / `Versioner` - The collaborators the engine moves data with

pub mod manager;
pub mod sync;

pub use manager::{EngineError, MirrorEngine};
pub use sync::{SyncError, SyncHandle, SyncManager, Transfer, TransferError, Versioner};
