//! Cross-platform shell command utilities.

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

/// Returns the appropriate shell command and argument for the current platform.
///
/// Returns `(shell_program, shell_arg)` where:
/// - Windows: `("cmd", "/C")`
/// - Unix-like: the user's `$SHELL` with `-c`, falling back to `("/bin/sh", "-c")`
#[must_use]
pub fn get_shell_command() -> (String, &'static str) {
    if cfg!(windows) {
        ("cmd".into(), "/C")
    } else {
        UnixShell::current_shell().get_shell_command()
    }
}

/// Resolve an executable by name.
///
/// The search order is:
/// 1. Explicit absolute paths.
/// 2. The current process PATH via `which`.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() && path.is_file() {
        return Some(path.to_path_buf());
    }

    which_async(executable).await
}

async fn which_async(executable: &str) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(Result::ok)
}

/// Unix shell types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnixShell {
    Zsh(PathBuf),
    Bash(PathBuf),
    Sh(PathBuf),
    Other(PathBuf),
}

impl UnixShell {
    /// Get the shell path.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Zsh(p) | Self::Bash(p) | Self::Sh(p) | Self::Other(p) => p,
        }
    }

    /// Get the current shell from `$SHELL`.
    #[must_use]
    pub fn current_shell() -> Self {
        if let Ok(shell) = std::env::var("SHELL") {
            if let Some(shell) = Self::from_path(Path::new(&shell)) {
                return shell;
            }
        }
        Self::Sh(PathBuf::from("/bin/sh"))
    }

    /// Create from a path.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        if path.is_absolute() && path.is_file() {
            let path_buf = path.to_path_buf();
            if path.file_name() == Some(OsStr::new("zsh")) {
                Some(Self::Zsh(path_buf))
            } else if path.file_name() == Some(OsStr::new("bash")) {
                Some(Self::Bash(path_buf))
            } else if path.file_name() == Some(OsStr::new("sh")) {
                Some(Self::Sh(path_buf))
            } else {
                Some(Self::Other(path_buf))
            }
        } else {
            None
        }
    }

    /// Get shell command tuple.
    #[must_use]
    pub fn get_shell_command(&self) -> (String, &'static str) {
        (self.path().to_string_lossy().into_owned(), "-c")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_command_has_dash_c_on_unix() {
        if cfg!(unix) {
            let (_, arg) = get_shell_command();
            assert_eq!(arg, "-c");
        }
    }

    #[test]
    fn from_path_rejects_relative_paths() {
        assert!(UnixShell::from_path(Path::new("bash")).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn from_path_classifies_bin_sh() {
        let shell = UnixShell::from_path(Path::new("/bin/sh"));
        assert!(matches!(shell, Some(UnixShell::Sh(_))));
    }

    #[tokio::test]
    async fn resolve_rejects_empty_name() {
        assert!(resolve_executable_path("").await.is_none());
        assert!(resolve_executable_path("   ").await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_finds_sh() {
        let path = resolve_executable_path("sh").await;
        assert!(path.is_some());
    }
}
