//! Local invoker - runs the tool as a child process
//!
//! Features:
//! - stdout decoded as newline-delimited JSON through `FrameParser`
//! - progress frames forwarded to the tracker
//! - bounded stderr capture
//! - cancellation and timeout with SIGTERM -> SIGKILL escalation

use super::{InvokeOptions, Invoker};
use crate::command::CommandResult;
use crate::frame::{read_frames, FrameParser};
use crate::progress::{ProgressReporter, ProgressStep};
use async_trait::async_trait;
use conduit_foundation::{Error, ParserConfig, Result, ToolConfig};
use futures::StreamExt;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Time allowed between SIGTERM and SIGKILL
const KILL_GRACE: Duration = Duration::from_millis(500);

/// Local process invoker
pub struct LocalInvoker {
    tool: ToolConfig,
    parser: ParserConfig,
    kill_grace: Duration,
}

impl LocalInvoker {
    pub fn new(tool: ToolConfig, parser: ParserConfig) -> Self {
        Self {
            tool,
            parser,
            kill_grace: KILL_GRACE,
        }
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn tool(&self) -> &ToolConfig {
        &self.tool
    }

    fn build_command(&self, command: &str, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.tool.program);
        cmd.args(&self.tool.base_args)
            .arg(command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(ref dir) = self.tool.working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(&self.tool.env);
        cmd
    }

    /// SIGTERM, wait for the grace period, then SIGKILL
    async fn terminate(&self, child: &mut Child) {
        if send_sigterm(child)
            && tokio::time::timeout(self.kill_grace, child.wait())
                .await
                .is_ok()
        {
            return;
        }

        if let Err(e) = child.kill().await {
            warn!("Failed to kill tool process: {}", e);
        }
    }
}

/// Ask the child to exit. Returns false when no signal was sent.
#[cfg(unix)]
fn send_sigterm(child: &Child) -> bool {
    let Some(pid) = child.id() else {
        return false;
    };
    // SAFETY: pid belongs to a child we have not yet reaped
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
fn send_sigterm(_child: &Child) -> bool {
    false
}

#[async_trait]
impl Invoker for LocalInvoker {
    async fn invoke(
        &self,
        command: &str,
        args: &[String],
        options: InvokeOptions,
    ) -> Result<CommandResult> {
        if options.cancel.is_cancelled() {
            return Err(Error::cancelled(format!("{} cancelled before start", command)));
        }

        debug!(program = %self.tool.program, command, ?args, "Spawning tool process");

        let mut child = self.build_command(command, args).spawn().map_err(|e| {
            Error::execution(
                command,
                format!("failed to spawn '{}': {}", self.tool.program, e),
            )
        })?;

        let stdout_task = child.stdout.take().map(|stdout| {
            let parser = FrameParser::from_config(&self.parser);
            let chunk = self.parser.read_chunk_bytes;
            tokio::spawn(collect_messages(stdout, parser, chunk, options.progress.clone()))
        });
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(capture_limited(stderr, self.tool.stderr_limit_bytes)));

        let deadline = tokio::time::sleep(options.timeout);
        tokio::pin!(deadline);

        let status = tokio::select! {
            status = child.wait() => status,
            _ = options.cancel.cancelled() => {
                info!(command, "Cancelling tool process");
                self.terminate(&mut child).await;
                abort_all(stdout_task, stderr_task);
                return Err(Error::cancelled(format!("{} was cancelled", command)));
            }
            _ = &mut deadline => {
                let timeout_ms = options.timeout.as_millis() as u64;
                warn!(command, timeout_ms, "Tool process timed out");
                self.terminate(&mut child).await;
                abort_all(stdout_task, stderr_task);
                return Err(Error::Timeout(format!(
                    "{} exceeded {:.1}s",
                    command,
                    options.timeout.as_secs_f64()
                )));
            }
        };

        let status = status.map_err(|e| Error::execution(command, format!("wait failed: {}", e)))?;

        let messages = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => Vec::new(),
        };
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        let mut result = CommandResult {
            success: status.success(),
            exit_code: status.code(),
            messages,
            stderr,
            ..Default::default()
        };
        if !result.success {
            result.error = Some(result.failure_message());
        }

        debug!(
            command,
            exit_code = ?result.exit_code,
            messages = result.messages.len(),
            "Tool process finished"
        );
        Ok(result)
    }

    fn name(&self) -> &'static str {
        "local"
    }
}

fn abort_all(stdout: Option<JoinHandle<Vec<Value>>>, stderr: Option<JoinHandle<String>>) {
    if let Some(task) = stdout {
        task.abort();
    }
    if let Some(task) = stderr {
        task.abort();
    }
}

/// Decode stdout frames. Progress frames go to the reporter, the rest are kept.
async fn collect_messages<R>(
    reader: R,
    parser: FrameParser,
    chunk_size: usize,
    reporter: Option<ProgressReporter>,
) -> Vec<Value>
where
    R: AsyncRead + Unpin,
{
    let mut messages = Vec::new();
    let frames = read_frames(reader, parser, chunk_size);
    tokio::pin!(frames);

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(message) => {
                if let Some(step) = progress_step(&message) {
                    if let Some(ref reporter) = reporter {
                        let text = message
                            .get("message")
                            .and_then(Value::as_str)
                            .map(str::to_string);
                        reporter.report(step, text);
                    }
                    continue;
                }
                messages.push(message);
            }
            Err(e) if e.is_protocol() => {
                warn!("Dropped buffered output: {}", e);
            }
            Err(e) => {
                warn!("Stopped reading tool output: {}", e);
                break;
            }
        }
    }
    messages
}

/// `{"type":"progress","percentage":40}` or `{"progress":40}` or `{"type":"progress","step":2}`
fn progress_step(message: &Value) -> Option<ProgressStep> {
    let obj = message.as_object()?;
    let is_progress_type = obj.get("type").and_then(Value::as_str) == Some("progress");

    let percent = obj
        .get("percentage")
        .or_else(|| obj.get("progress"))
        .and_then(Value::as_f64);
    if let Some(p) = percent {
        if is_progress_type || obj.len() <= 2 {
            return Some(ProgressStep::Percent(p));
        }
    }

    if is_progress_type {
        let step = obj.get("step").and_then(Value::as_u64)?;
        return Some(ProgressStep::Step(u32::try_from(step).unwrap_or(u32::MAX)));
    }
    None
}

/// Read everything, keep at most `limit` bytes
async fn capture_limited<R>(mut reader: R, limit: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 4096];

    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = limit.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }

    let mut text = String::from_utf8_lossy(&kept).into_owned();
    if truncated {
        text.push_str("\n[stderr truncated]");
    }
    text
}
