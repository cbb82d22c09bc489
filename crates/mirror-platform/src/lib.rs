//! Cross-platform command invocation resolution.
//!
//! Provides:
//! - `resolve_invocation` - Map a command name + args to a concrete invocation
//! - Shell detection utilities for Unix and Windows

pub mod adapter;
pub mod shell;

pub use adapter::{Invocation, PlatformError, default_working_dir, resolve_invocation};
pub use shell::{UnixShell, get_shell_command, resolve_executable_path};
