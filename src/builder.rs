//! Build step
//!
//! Runs the configured build command, streaming its combined output into the
//! diagnostic buffer and to the console.

use crate::command::ShellCommand;
use crate::error::GateError;
use crate::output::{pump, DiagnosticBuffer};
use std::time::Instant;
use tracing::{error, info};

pub struct Builder {
    command: Option<ShellCommand>,
    buffer: DiagnosticBuffer,
}

impl Builder {
    /// A builder without a command always succeeds with no output
    pub fn new(command: Option<ShellCommand>, buffer: DiagnosticBuffer) -> Self {
        Self { command, buffer }
    }

    /// Run the build. Returns the captured output on success; on failure the
    /// error carries it.
    pub async fn build(&self) -> Result<Vec<u8>, GateError> {
        let Some(ref command) = self.command else {
            return Ok(Vec::new());
        };

        let start = Instant::now();
        info!(command = %command.script(), "Starting build");

        let mut child = command.spawn_piped(false).map_err(|e| {
            error!(error = %e, "Failed to launch build command");
            GateError::BuildLaunch(e)
        })?;

        // Capture only this build's output, even though it also lands in the
        // shared buffer
        let local = DiagnosticBuffer::new();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let pumps = async {
            let out = async {
                if let Some(stdout) = stdout {
                    pump(stdout, local.writer(), "build").await;
                }
            };
            let err = async {
                if let Some(stderr) = stderr {
                    pump(stderr, local.writer(), "build").await;
                }
            };
            tokio::join!(out, err);
        };

        let (status, ()) = tokio::join!(child.wait(), pumps);
        let status = status.map_err(|e| {
            error!(error = %e, "Failed to wait for build command");
            GateError::BuildLaunch(e)
        })?;

        let output = local.snapshot();
        self.buffer.writer().append(&output);

        let duration_ms = start.elapsed().as_millis();
        if status.success() {
            info!(duration_ms, "Build completed successfully");
            Ok(output)
        } else {
            error!(%status, duration_ms, "Build failed");
            Err(GateError::Build {
                status: status.to_string(),
                output,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_successful_build_captures_output() {
        let buffer = DiagnosticBuffer::new();
        let builder = Builder::new(
            Some(ShellCommand::new("echo compiling; echo warning: unused >&2")),
            buffer.clone(),
        );

        let output = builder.build().await.unwrap();
        let text = String::from_utf8_lossy(&output);

        assert!(text.contains("compiling"));
        assert!(text.contains("warning: unused"));
        assert_eq!(buffer.snapshot(), output);
    }

    #[tokio::test]
    async fn test_failed_build_carries_output() {
        let buffer = DiagnosticBuffer::new();
        let builder = Builder::new(
            Some(ShellCommand::new("echo 'syntax error' >&2; exit 1")),
            buffer.clone(),
        );

        match builder.build().await {
            Err(GateError::Build { status, output }) => {
                assert!(status.contains('1'));
                assert_eq!(String::from_utf8_lossy(&output).trim(), "syntax error");
            }
            other => panic!("expected Build error, got {:?}", other),
        }
        assert!(String::from_utf8_lossy(&buffer.snapshot()).contains("syntax error"));
    }

    #[tokio::test]
    async fn test_unlaunchable_build() {
        let builder = Builder::new(
            Some(ShellCommand::new("true").with_shell("/nonexistent/shell")),
            DiagnosticBuffer::new(),
        );

        assert!(matches!(builder.build().await, Err(GateError::BuildLaunch(_))));
    }

    #[tokio::test]
    async fn test_no_build_command() {
        let builder = Builder::new(None, DiagnosticBuffer::new());
        assert!(builder.build().await.unwrap().is_empty());
    }
}
