//! Proxied command execution with streaming output capture.
//!
//! Provides:
//! - `CommandExecutionProxy` - Spawn and track external processes
//! - `OutputStore` - Bounded per-execution output with replay support
//! - `ClaudeCommand` - Builder for the proxied AI CLI invocation

pub mod capture;
pub mod command;
pub mod proxy;

pub use capture::{OutputChunk, OutputFormat, OutputStore, TRUNCATION_MARKER};
pub use command::ClaudeCommand;
pub use proxy::{CommandExecutionProxy, ExecError, ExecHandle, ExecRequest, ExecutionSnapshot};
