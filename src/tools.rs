use std::{io::ErrorKind, process::Stdio};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    process::Command,
    time::{Duration, timeout},
};

const VERSION_CHECK_TIMEOUT_SECONDS: u64 = 10;

/// Binaries the worker shells out to.
#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub yt_dlp: String,
    pub ffmpeg: String,
    pub ffprobe: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            yt_dlp: "yt-dlp".to_string(),
            ffmpeg: "ffmpeg".to_string(),
            ffprobe: "ffprobe".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub success: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ToolOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0} is not installed on this system")]
    NotFound(String),
    #[error("{program} exceeded the time limit of {seconds}s")]
    TimedOut { program: String, seconds: u64 },
    #[error("could not run {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Seam between the worker and the external tools. Production code spawns
/// real processes; tests script the answers.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        limit: Duration,
    ) -> Result<ToolOutput, ToolError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        limit: Duration,
    ) -> Result<ToolOutput, ToolError> {
        let command_future = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = timeout(limit, command_future)
            .await
            .map_err(|_| ToolError::TimedOut {
                program: program.to_string(),
                seconds: limit.as_secs(),
            })?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    ToolError::NotFound(program.to_string())
                } else {
                    ToolError::Io {
                        program: program.to_string(),
                        source: error,
                    }
                }
            })?;

        Ok(ToolOutput {
            success: output.status.success(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Runs `<program> <version_flag>` and reports whether it exited cleanly.
pub async fn tool_available(runner: &dyn CommandRunner, program: &str, version_flag: &str) -> bool {
    runner
        .run(
            program,
            &[version_flag.to_string()],
            Duration::from_secs(VERSION_CHECK_TIMEOUT_SECONDS),
        )
        .await
        .map(|output| output.success)
        .unwrap_or(false)
}

/// Failure text for a tool run: stderr when it has content, stdout otherwise.
pub fn failure_text(output: &ToolOutput) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stdout = stdout.trim();
    if stdout.is_empty() {
        "the tool exited with an error and printed nothing".to_string()
    } else {
        stdout.to_string()
    }
}

/// Last non-empty line of a tool's output, which is where yt-dlp and ffmpeg
/// put the actual error.
pub fn last_line(text: &str) -> Option<&str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
}
