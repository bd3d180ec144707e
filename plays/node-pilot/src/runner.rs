//! host command execution

use std::path::{Path, PathBuf};

use crate::{NodeError, Result};

/// One external command. Working directory is always explicit; the process
/// cwd is never changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn in_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    /// `program arg1 arg2`, for logs and diagnostics.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Clone, Debug, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

#[allow(async_fn_in_trait)]
pub trait CommandRunner {
    /// Run to completion. A non-zero exit is an error.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Runs commands on the local host.
#[derive(Clone, Copy, Debug, Default)]
pub struct HostRunner;

impl CommandRunner for HostRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        tracing::debug!("$ {}", spec.display());
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }
        let output = cmd.output().await.map_err(|e| NodeError::Command {
            program: spec.program.clone(),
            status: "spawn failure".into(),
            stderr: e.to_string(),
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(NodeError::Command {
                program: spec.display(),
                status: output.status.to_string(),
                stderr: last_lines(&stderr, 5),
            });
        }
        tracing::trace!("{}", stdout);
        Ok(CommandOutput { stdout, stderr })
    }
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.trim().lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_program_and_args() {
        let spec = CommandSpec::new("systemctl", ["enable", "geth"]);
        assert_eq!(spec.display(), "systemctl enable geth");
    }

    #[test]
    fn last_lines_keeps_tail() {
        assert_eq!(last_lines("a\nb\nc\n", 2), "b\nc");
        assert_eq!(last_lines("", 3), "");
    }

    #[tokio::test]
    async fn host_runner_reports_non_zero_exit() {
        let err = HostRunner
            .run(&CommandSpec::new("sh", ["-c", "echo boom >&2; exit 3"]))
            .await
            .unwrap_err();
        match err {
            NodeError::Command { stderr, .. } => assert_eq!(stderr, "boom"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn host_runner_uses_explicit_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let out = HostRunner
            .run(&CommandSpec::new("pwd", Vec::<String>::new()).in_dir(dir.path()))
            .await
            .unwrap();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(
            std::path::Path::new(out.stdout.trim()).canonicalize().unwrap(),
            expected
        );
    }
}
