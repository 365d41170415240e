//! Thin async wrapper around the external extraction tool.
//!
//! Every call spawns exactly one child process from an argument vector (no
//! shell is involved, so user supplied URLs and names are never interpreted).
//! Output is collected separately per stream; the streaming variant hands each
//! line to a callback as soon as it is read.

use std::{path::PathBuf, process::Stdio, time::Duration};

use serde::de::DeserializeOwned;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::Command,
    sync::mpsc,
    time::Instant,
};

use crate::error::ToolError;

pub const DEFAULT_PROGRAM: &str = "yt-dlp";

/// Everything a finished, successful invocation printed.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Exit outcome of a streaming invocation. Non-zero codes are not an error at
/// this layer; the caller decides how to classify them.
#[derive(Debug, Clone)]
pub struct ToolExit {
    pub code: Option<i32>,
    pub stderr: String,
}

impl ToolExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, Clone)]
pub struct ToolRunner {
    program: PathBuf,
    leading_args: Vec<String>,
    timeout: Option<Duration>,
}

impl ToolRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            timeout: None,
        }
    }

    /// Parses a command line such as `python3 -m yt_dlp` into program and
    /// leading arguments. Blank input falls back to [`DEFAULT_PROGRAM`].
    pub fn from_command_line(command: &str) -> Self {
        let mut parts = command.split_whitespace();
        let Some(program) = parts.next() else {
            return Self::new(DEFAULT_PROGRAM);
        };
        Self::new(program).with_leading_args(parts.map(str::to_string))
    }

    pub fn with_leading_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.leading_args = args.into_iter().collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout.filter(|value| !value.is_zero());
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn program_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    fn command(&self, args: &[String]) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn spawn_error(&self, source: std::io::Error) -> ToolError {
        ToolError::Spawn {
            program: self.program_name(),
            source,
        }
    }

    fn timed_out(&self, after: Duration) -> ToolError {
        ToolError::TimedOut {
            program: self.program_name(),
            after,
        }
    }

    /// Runs to completion and returns both streams. Non-zero exit becomes
    /// [`ToolError::ExternalTool`] carrying stderr.
    pub async fn run(&self, args: &[String]) -> Result<ToolOutput, ToolError> {
        let child = self
            .command(args)
            .spawn()
            .map_err(|err| self.spawn_error(err))?;
        tracing::debug!(program = %self.program_name(), ?args, "spawned tool");

        let waiting = child.wait_with_output();
        let output = match self.timeout {
            // Dropping the future drops the child, and kill_on_drop reaps it.
            Some(limit) => tokio::time::timeout(limit, waiting)
                .await
                .map_err(|_| self.timed_out(limit))?,
            None => waiting.await,
        }
        .map_err(|source| ToolError::Io {
            program: self.program_name(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(ToolError::external(
                &self.program_name(),
                output.status.code(),
                stderr,
            ));
        }
        Ok(ToolOutput { stdout, stderr })
    }

    /// Like [`ToolRunner::run`] but requires stdout to be a JSON document.
    pub async fn run_json<T: DeserializeOwned>(&self, args: &[String]) -> Result<T, ToolError> {
        let output = self.run(args).await?;
        Ok(serde_json::from_str(output.stdout.trim())?)
    }

    /// Streams both pipes line by line into the callbacks, in the order each
    /// pipe produced them, and returns once the process has exited and both
    /// pipes are drained.
    pub async fn run_streaming<O, E>(
        &self,
        args: &[String],
        mut on_stdout: O,
        mut on_stderr: E,
    ) -> Result<ToolExit, ToolError>
    where
        O: FnMut(&str),
        E: FnMut(&str),
    {
        let mut child = self
            .command(args)
            .spawn()
            .map_err(|err| self.spawn_error(err))?;
        tracing::debug!(program = %self.program_name(), ?args, "spawned streaming tool");

        let io_error = |source: std::io::Error| ToolError::Io {
            program: self.program_name(),
            source,
        };
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io_error(std::io::Error::other("stdout not captured")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io_error(std::io::Error::other("stderr not captured")))?;

        let mut out_lines = spawn_line_reader(stdout);
        let mut err_lines = spawn_line_reader(stderr);
        let mut captured_stderr = String::new();
        let mut stdout_done = false;
        let mut stderr_done = false;
        let deadline = self.timeout.map(|limit| Instant::now() + limit);

        while !(stdout_done && stderr_done) {
            tokio::select! {
                line = out_lines.recv(), if !stdout_done => match line.transpose().map_err(io_error)? {
                    Some(line) => on_stdout(&line),
                    None => stdout_done = true,
                },
                line = err_lines.recv(), if !stderr_done => match line.transpose().map_err(io_error)? {
                    Some(line) => {
                        tracing::debug!(target: "mediadrop::tool", "{line}");
                        captured_stderr.push_str(&line);
                        captured_stderr.push('\n');
                        on_stderr(&line);
                    }
                    None => stderr_done = true,
                },
                _ = sleep_until(deadline) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(self.timed_out(self.timeout.unwrap_or_default()));
                }
            }
        }

        let status = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, child.wait())
                .await
                .map_err(|_| self.timed_out(self.timeout.unwrap_or_default()))?,
            None => child.wait().await,
        }
        .map_err(io_error)?;

        Ok(ToolExit {
            code: status.code(),
            stderr: captured_stderr,
        })
    }
}

impl Default for ToolRunner {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM)
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Reads a pipe to EOF in its own task and forwards each `\n`-terminated
/// line, decoded lossily so odd bytes in titles never abort the read loop.
fn spawn_line_reader<R>(reader: R) -> mpsc::UnboundedReceiver<std::io::Result<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let line = match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => Ok(String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string()),
                Err(err) => Err(err),
            };
            let failed = line.is_err();
            if tx.send(line).is_err() || failed {
                break;
            }
        }
    });
    rx
}
