//! Invocation resolution for proxied commands.

use std::path::PathBuf;

use thiserror::Error;

use crate::shell::resolve_executable_path;

/// Platform resolution error.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(&'static str),
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("Command cannot be parsed: {0}")]
    InvalidCommand(String),
}

/// A concrete, spawnable invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Absolute path to the executable.
    pub program: PathBuf,
    /// Argument vector, program name excluded.
    pub args: Vec<String>,
    /// Working directory to use when the caller does not supply one.
    pub default_cwd: PathBuf,
}

/// Resolve a command name plus arguments into a concrete invocation.
///
/// The command may itself carry embedded arguments (`"claude --verbose"`);
/// these are split with platform-appropriate quoting rules before `args`
/// is appended.
///
/// # Errors
/// Fails fast with a typed error if the host OS cannot be mapped, the
/// command string cannot be parsed, or the executable is not on PATH.
pub async fn resolve_invocation(
    command: &str,
    args: &[String],
) -> Result<Invocation, PlatformError> {
    if !cfg!(any(unix, windows)) {
        return Err(PlatformError::UnsupportedPlatform(std::env::consts::OS));
    }

    let mut parts = split_command_line(command)?;
    if parts.is_empty() {
        return Err(PlatformError::InvalidCommand(command.to_string()));
    }
    let program_name = parts.remove(0);
    parts.extend(args.iter().cloned());

    let program = resolve_executable_path(&program_name)
        .await
        .ok_or(PlatformError::ExecutableNotFound(program_name))?;

    tracing::debug!(program = %program.display(), args = ?parts, "Resolved invocation");

    Ok(Invocation {
        program,
        args: parts,
        default_cwd: default_working_dir(),
    })
}

/// The directory commands run in when none is given: the current
/// directory, falling back to the user's home.
#[must_use]
pub fn default_working_dir() -> PathBuf {
    std::env::current_dir()
        .ok()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn split_command_line(input: &str) -> Result<Vec<String>, PlatformError> {
    #[cfg(windows)]
    {
        let parts = winsplit::split(input);
        if parts.is_empty() {
            Err(PlatformError::InvalidCommand(input.to_string()))
        } else {
            Ok(parts)
        }
    }

    #[cfg(not(windows))]
    {
        shlex::split(input).ok_or_else(|| PlatformError::InvalidCommand(input.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn resolves_plain_command() {
        let inv = resolve_invocation("sh", &["-c".into(), "true".into()])
            .await
            .unwrap();
        assert!(inv.program.is_absolute());
        assert_eq!(inv.args, vec!["-c".to_string(), "true".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn splits_embedded_arguments() {
        let inv = resolve_invocation("sh -c 'echo hi'", &[]).await.unwrap();
        assert_eq!(inv.args, vec!["-c".to_string(), "echo hi".to_string()]);
    }

    #[tokio::test]
    async fn missing_executable_is_typed_error() {
        let err = resolve_invocation("definitely-not-a-real-binary-0xdead", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::ExecutableNotFound(_)));
    }

    #[tokio::test]
    async fn unbalanced_quotes_are_rejected() {
        let err = resolve_invocation("sh -c 'oops", &[]).await.unwrap_err();
        assert!(matches!(
            err,
            PlatformError::InvalidCommand(_) | PlatformError::ExecutableNotFound(_)
        ));
    }

    #[test]
    fn default_working_dir_exists() {
        assert!(default_working_dir().exists());
    }
}
