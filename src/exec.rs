//! Process seam for every external tool.
//!
//! All `git`, `gh` and `tar` invocations go through a [`CommandRunner`] so
//! that ordering of side effects can be asserted in tests and so that no call
//! can block past its timeout.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::CommandError;

/// A single external command, fully described.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    pub envs: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.envs.push((key.to_string(), value.to_string()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// `program arg1 arg2 ...` for logs and error messages.
    pub fn render(&self) -> String {
        let mut rendered = self.program.clone();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(&arg.to_string_lossy());
        }
        rendered
    }

    /// Positional arguments as lossy strings, used by test doubles to match commands.
    pub fn arg_strings(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().to_string())
            .collect()
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> io::Result<Output>;
}

/// Runs commands with `tokio::process`, killing the child when the timeout fires.
#[derive(Debug, Default, Clone)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, invocation: &Invocation) -> io::Result<Output> {
        let mut command = tokio::process::Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &invocation.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &invocation.envs {
            command.env(key, value);
        }

        match invocation.timeout {
            Some(limit) => match tokio::time::timeout(limit, command.output()).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("timed out after {}s", limit.as_secs()),
                )),
            },
            None => command.output().await,
        }
    }
}

/// Run an invocation and turn spawn failures, timeouts and non-zero exits into
/// a [`CommandError`]. On success the raw output is returned.
pub async fn run_checked(
    runner: &dyn CommandRunner,
    invocation: &Invocation,
) -> Result<Output, CommandError> {
    let output = runner
        .run(invocation)
        .await
        .map_err(|error| match error.kind() {
            io::ErrorKind::NotFound => CommandError::NotFound {
                program: invocation.program.clone(),
            },
            io::ErrorKind::TimedOut => CommandError::TimedOut {
                command: invocation.render(),
                timeout: invocation.timeout.unwrap_or_default(),
            },
            _ => CommandError::Spawn {
                program: invocation.program.clone(),
                source: error,
            },
        })?;

    if output.status.success() {
        return Ok(output);
    }

    Err(CommandError::Failed {
        command: invocation.render(),
        detail: output_detail(&output),
    })
}

/// Best human-readable explanation of a failed command: stderr, else stdout, else the status.
pub fn output_detail(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if !stderr.is_empty() {
        return stderr;
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !stdout.is_empty() {
        return stdout;
    }
    format!("exit status {}", output.status)
}
