//! Builder for the proxied AI CLI invocation.

use std::{collections::HashMap, path::PathBuf, time::Duration};

use crate::proxy::ExecRequest;

/// Default executable name for the proxied CLI tool.
pub const DEFAULT_CLAUDE_COMMAND: &str = "claude";

/// Builder for a `claude` CLI execution request.
///
/// The CLI itself is an opaque collaborator; its exit code and
/// stdout/stderr are the only contract this crate relies on.
#[derive(Debug, Clone)]
pub struct ClaudeCommand {
    base: String,
    model: Option<String>,
    working_dir: Option<PathBuf>,
    extra_args: Vec<String>,
    env: HashMap<String, String>,
    timeout: Option<Duration>,
}

impl Default for ClaudeCommand {
    fn default() -> Self {
        Self::new()
    }
}

impl ClaudeCommand {
    /// Builder with the default executable name.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base: DEFAULT_CLAUDE_COMMAND.to_string(),
            model: None,
            working_dir: None,
            extra_args: Vec::new(),
            env: HashMap::new(),
            timeout: None,
        }
    }

    /// Override the executable (for wrappers or absolute paths).
    #[must_use]
    pub fn override_base(mut self, base: impl Into<String>) -> Self {
        self.base = base.into();
        self
    }

    /// Select a model with `--model`.
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Append pass-through arguments.
    #[must_use]
    pub fn extra_args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the invocation.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set a watchdog timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the execution request.
    #[must_use]
    pub fn build(self) -> ExecRequest {
        let mut args = Vec::new();
        if let Some(model) = self.model {
            args.push("--model".to_string());
            args.push(model);
        }
        args.extend(self.extra_args);

        let mut request = ExecRequest::new(self.base).args(args);
        request.working_dir = self.working_dir;
        request.env = self.env;
        request.timeout = self.timeout;
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_flag_precedes_extra_args() {
        let request = ClaudeCommand::new()
            .model("opus")
            .extra_args(["--print", "hi"])
            .build();
        assert_eq!(request.command, "claude");
        assert_eq!(request.args, vec!["--model", "opus", "--print", "hi"]);
    }

    #[test]
    fn base_override_and_env() {
        let request = ClaudeCommand::new()
            .override_base("/opt/bin/claude")
            .env("NO_COLOR", "1")
            .build();
        assert_eq!(request.command, "/opt/bin/claude");
        assert_eq!(request.env.get("NO_COLOR").map(String::as_str), Some("1"));
    }

    #[test]
    fn bare_builder_has_no_args() {
        let request = ClaudeCommand::new().build();
        assert!(request.args.is_empty());
        assert!(request.timeout.is_none());
    }
}
