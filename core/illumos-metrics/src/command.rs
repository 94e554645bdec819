//! Execution of external commands.
//!
//! Collectors never spawn processes themselves: they go through a [`CommandRunner`], which
//! the agent provides. Tests replace it with a scripted runner.

use std::{fmt, process::Command};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// What a command printed, and how it exited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Standard output, without leading and trailing whitespace.
    pub stdout: String,
    /// Standard error, without leading and trailing whitespace.
    pub stderr: String,
    /// Exit code, `None` if the process was killed by a signal.
    pub status: Option<i32>,
}

impl CommandOutput {
    /// A successful output that printed `stdout`.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            status: Some(0),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs commands.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args` and waits for it to exit.
    ///
    /// A non-zero exit code is not an error: check [`CommandOutput::success`].
    /// An error is returned when the command cannot be started.
    fn run(&self, program: &str, args: &[&str]) -> anyhow::Result<CommandOutput>;
}

/// Runs commands with [`std::process::Command`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[&str]) -> anyhow::Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("failed to execute {}", command_line(program, args)))?;
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            status: output.status.code(),
        })
    }
}

/// Formats a command like a shell would show it.
pub fn command_line(program: &str, args: &[&str]) -> String {
    let mut line = program.to_owned();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Runs a command and returns what it printed on stdout, even if it failed.
///
/// Most illumos tools print something useful before failing on a single item (a zone that
/// disappeared, a pool being exported...), so a non-zero exit is only logged.
pub fn stdout_of(runner: &dyn CommandRunner, program: &str, args: &[&str]) -> anyhow::Result<String> {
    let output = runner.run(program, args)?;
    if !output.success() {
        log::warn!(
            "{} exited with status {:?}: {}",
            command_line(program, args),
            output.status,
            output.stderr
        );
    }
    Ok(output.stdout)
}

/// How to get the privileges that some commands need, like `fmadm` or `svcs -Z`.
///
/// In the configuration, this is either `"none"` or the path of a program that runs its
/// arguments with more privileges, like `"/bin/pfexec"` or `"/bin/sudo"`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Elevation {
    /// Run commands as is.
    #[default]
    None,
    /// Prefix commands with this program.
    With(String),
}

impl Elevation {
    pub fn is_none(&self) -> bool {
        matches!(self, Elevation::None)
    }

    /// Runs a command through the privilege program, if any.
    pub fn run(&self, runner: &dyn CommandRunner, program: &str, args: &[&str]) -> anyhow::Result<String> {
        match self {
            Elevation::None => stdout_of(runner, program, args),
            Elevation::With(prefix) => {
                let mut full_args = Vec::with_capacity(args.len() + 1);
                full_args.push(program);
                full_args.extend_from_slice(args);
                stdout_of(runner, prefix, &full_args)
            }
        }
    }
}

impl From<String> for Elevation {
    fn from(value: String) -> Self {
        let value = value.trim();
        if value.is_empty() || value == "none" {
            Elevation::None
        } else {
            Elevation::With(value.to_owned())
        }
    }
}

impl From<Elevation> for String {
    fn from(value: Elevation) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Elevation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Elevation::None => f.write_str("none"),
            Elevation::With(prefix) => f.write_str(prefix),
        }
    }
}
