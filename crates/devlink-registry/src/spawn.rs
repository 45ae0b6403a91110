//! Package manager process execution.

use anyhow::{Context, Result, bail};
use devlink_core::CLI_NAME;
use std::path::PathBuf;
use std::process::Stdio;
use tracing::{debug, info};

/// A package manager invocation, built up front so tests can assert on the
/// exact command line without spawning anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        CommandSpec {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn current_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Run a command to completion. Output is inherited when `verbose`,
/// discarded otherwise.
pub async fn run_command(spec: &CommandSpec, verbose: bool) -> Result<()> {
    debug!("Running `{}`", spec.display());

    let mut command = tokio::process::Command::new(&spec.program);
    command.args(&spec.args);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    for (key, value) in &spec.env {
        command.env(key, value);
    }
    let stdio = if verbose { Stdio::inherit } else { Stdio::null };
    command.stdin(Stdio::null()).stdout(stdio()).stderr(stdio());

    let status = command
        .status()
        .await
        .with_context(|| format!("failed to spawn `{}`", spec.display()))?;

    if !status.success() {
        if !verbose {
            info!(
                "Command `{}` failed. Rerun `{CLI_NAME}` with `--verbose` to see its output.",
                spec.display()
            );
        }
        bail!("command `{}` exited with {status}", spec.display());
    }
    Ok(())
}
