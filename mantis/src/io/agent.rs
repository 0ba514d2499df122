//! Agent session adapter.
//!
//! The [`AgentAdapter`] trait decouples the workflow from the actual agent
//! backend (the `claude` CLI in stream-json mode). Tests use scripted adapters
//! that return canned results without spawning processes.

use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::cancel::CancellationToken;
use crate::core::events::{EventInterpreter, LineBuffer, ProgressSink};
use crate::core::retry::{Attempt, RetryPolicy};
use crate::io::artifacts::{CallPaths, write_atomic};
use crate::io::config::AgentConfig;
use crate::io::process::{
    isolate_process_group, join_output, kill_and_reap, spawn_chunk_reader, spawn_limited_reader,
};

const STDERR_TAIL_CHARS: usize = 2_000;
/// How long an agent may keep running after it emitted its result event.
const RESULT_GRACE: Duration = Duration::from_secs(5);

/// Parameters for one agent call.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Working directory for the agent process (the task output directory).
    pub workdir: PathBuf,
    pub prompt: String,
    /// Continuation id of an earlier session to resume.
    pub resume_id: Option<String>,
    pub allowed_tools: Vec<String>,
    /// Workflow phase label, used for logs.
    pub phase: String,
    /// Where to persist the prompt and raw stream, if anywhere.
    pub log: Option<CallPaths>,
}

/// How an agent call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentOutcome {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

/// Result of one agent invocation. Process-level failures land here, never as errors.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentSessionResult {
    pub success: bool,
    pub outcome: AgentOutcome,
    pub text_output: String,
    /// JSON object found in the final text, if any.
    pub structured_payload: Option<Value>,
    pub error_text: Option<String>,
    pub exit_code: Option<i32>,
    pub duration: Duration,
    pub continuation_id: Option<String>,
    pub cost_usd: Option<f64>,
}

impl AgentSessionResult {
    pub fn succeeded(text: impl Into<String>, continuation_id: Option<String>) -> Self {
        let text_output = text.into();
        Self {
            success: true,
            outcome: AgentOutcome::Succeeded,
            structured_payload: extract_json_payload(&text_output),
            text_output,
            error_text: None,
            exit_code: Some(0),
            duration: Duration::ZERO,
            continuation_id,
            cost_usd: None,
        }
    }

    pub fn failure(outcome: AgentOutcome, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: false,
            outcome,
            text_output: String::new(),
            structured_payload: None,
            error_text: Some(error.into()),
            exit_code: None,
            duration,
            continuation_id: None,
            cost_usd: None,
        }
    }

    pub fn cancelled(duration: Duration) -> Self {
        Self::failure(AgentOutcome::Cancelled, "agent call cancelled", duration)
    }

    pub fn is_cancelled(&self) -> bool {
        self.outcome == AgentOutcome::Cancelled
    }

    /// Error text for reporting, falling back to a generic message.
    pub fn error_message(&self) -> String {
        self.error_text
            .clone()
            .unwrap_or_else(|| "agent call failed".to_string())
    }
}

/// Abstraction over agent backends.
pub trait AgentAdapter {
    /// Run one agent session. Progress notices are forwarded to `sink` as they arrive.
    fn invoke(
        &self,
        request: &AgentRequest,
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
    ) -> AgentSessionResult;
}

/// Adapter that spawns the `claude` CLI with `--output-format stream-json`.
#[derive(Debug, Clone)]
pub struct ClaudeCliAdapter {
    config: AgentConfig,
}

enum Termination {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

impl ClaudeCliAdapter {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Command line for a request, without stdio wiring.
    pub fn command(&self, request: &AgentRequest) -> Command {
        let mut cmd = Command::new(&self.config.program);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--verbose");
        if !request.allowed_tools.is_empty() {
            cmd.arg("--allowedTools").arg(request.allowed_tools.join(","));
        }
        if let Some(resume) = &request.resume_id {
            cmd.arg("--resume").arg(resume);
        }
        if let Some(model) = &self.config.model {
            cmd.arg("--model").arg(model);
        }
        cmd.current_dir(&request.workdir);
        cmd
    }

    fn run_session(
        &self,
        request: &AgentRequest,
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
        started: Instant,
    ) -> Result<AgentSessionResult> {
        if let Some(log) = &request.log {
            write_atomic(&log.prompt_path, request.prompt.as_bytes())?;
        }
        let stdin = prompt_file(&request.prompt)?;

        let mut cmd = self.command(request);
        cmd.stdin(Stdio::from(stdin))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        isolate_process_group(&mut cmd);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn agent {}", self.config.program))?;
        debug!(pid = child.id(), "agent process started");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;
        let chunks = spawn_chunk_reader(stdout);
        let stderr_handle = spawn_limited_reader(stderr, self.config.output_limit_bytes);

        let mut stream_log = match &request.log {
            Some(log) => Some(open_stream_log(&log.stream_path)?),
            None => None,
        };
        let mut buffer = LineBuffer::default();
        let mut interpreter = EventInterpreter::new();
        // Returns whether the result event has been seen.
        let mut handle_line = |line: &str, stream_log: &mut Option<BufWriter<File>>| {
            if let Some(writer) = stream_log.as_mut()
                && let Err(err) = writeln!(writer, "{line}")
            {
                warn!(err = %err, "failed to write stream log");
            }
            for notice in interpreter.consume_line(line) {
                notice.deliver(sink);
            }
            interpreter.final_result().is_some()
        };

        let timeout = self.config.timeout();
        let poll = self.config.poll_interval();
        let mut deadline = started + timeout;
        let mut result_seen = false;
        let mut on_result = |seen: bool, deadline: &mut Instant| {
            if seen && !result_seen {
                result_seen = true;
                *deadline = (*deadline).min(Instant::now() + RESULT_GRACE);
            }
        };
        let mut stopped = None;
        loop {
            if cancel.is_cancelled() {
                stopped = Some(Termination::Cancelled);
                break;
            }
            if Instant::now() >= deadline {
                stopped = Some(Termination::TimedOut);
                break;
            }
            match chunks.recv_timeout(poll) {
                Ok(chunk) => {
                    for line in buffer.push(&chunk) {
                        let seen = handle_line(&line, &mut stream_log);
                        on_result(seen, &mut deadline);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        let termination = match stopped {
            Some(termination) => termination,
            None => {
                if let Some(rest) = buffer.finish() {
                    let seen = handle_line(&rest, &mut stream_log);
                    on_result(seen, &mut deadline);
                }
                self.wait_exit(&mut child, cancel, deadline)?
            }
        };
        if let Some(writer) = stream_log.as_mut() {
            writer.flush().context("flush stream log")?;
        }

        let duration = started.elapsed();
        let (exited_ok, exit_code) = match termination {
            Termination::Cancelled => {
                info!(phase = %request.phase, "agent call cancelled, killing process");
                kill_and_reap(&mut child)?;
                let mut result = AgentSessionResult::cancelled(duration);
                result.continuation_id = interpreter.session_id().map(str::to_string);
                return Ok(result);
            }
            Termination::TimedOut if interpreter.final_result().is_some() => {
                info!(
                    phase = %request.phase,
                    "agent still running after its result event, killing process"
                );
                kill_and_reap(&mut child)?;
                (true, None)
            }
            Termination::TimedOut => {
                warn!(
                    phase = %request.phase,
                    timeout_secs = timeout.as_secs(),
                    "agent call timed out, killing process"
                );
                kill_and_reap(&mut child)?;
                let mut result = AgentSessionResult::failure(
                    AgentOutcome::TimedOut,
                    format!("agent timed out after {}s", timeout.as_secs()),
                    duration,
                );
                result.continuation_id = interpreter.session_id().map(str::to_string);
                return Ok(result);
            }
            Termination::Exited(status) => (status.success(), status.code()),
        };

        let (stderr_bytes, _) = join_output(stderr_handle).context("join agent stderr")?;
        let stderr_text = String::from_utf8_lossy(&stderr_bytes).into_owned();
        if let Some(log) = &request.log
            && !stderr_text.is_empty()
        {
            write_atomic(&log.stderr_path, stderr_text.as_bytes())?;
        }
        if interpreter.malformed_lines() > 0 {
            debug!(
                malformed = interpreter.malformed_lines(),
                "agent stream had non-json lines"
            );
        }

        let session_id = interpreter.session_id().map(str::to_string);
        let Some(final_result) = interpreter.take_final_result() else {
            warn!(exit_code = ?exit_code, "agent exited without a result event");
            let mut result = AgentSessionResult::failure(
                AgentOutcome::Failed,
                format!(
                    "agent exited without a result event (exit code {}){}",
                    describe_code(exit_code),
                    stderr_suffix(&stderr_text)
                ),
                duration,
            );
            result.exit_code = exit_code;
            result.continuation_id = session_id;
            return Ok(result);
        };

        let success = exited_ok && final_result.success;
        let error_text = if success {
            None
        } else if !final_result.errors.is_empty() {
            Some(final_result.errors.join("; "))
        } else if !final_result.result_text.trim().is_empty() {
            Some(final_result.result_text.clone())
        } else {
            Some(format!(
                "agent reported {} (exit code {}){}",
                final_result.subtype,
                describe_code(exit_code),
                stderr_suffix(&stderr_text)
            ))
        };
        info!(
            phase = %request.phase,
            success,
            cost_usd = final_result.cost_usd.unwrap_or_default(),
            duration_ms = duration.as_millis() as u64,
            "agent call finished"
        );
        Ok(AgentSessionResult {
            success,
            outcome: if success {
                AgentOutcome::Succeeded
            } else {
                AgentOutcome::Failed
            },
            structured_payload: extract_json_payload(&final_result.result_text),
            text_output: final_result.result_text,
            error_text,
            exit_code,
            duration,
            continuation_id: final_result.session_id.or(session_id),
            cost_usd: final_result.cost_usd,
        })
    }

    /// Wait for exit after stdout closed, still honoring cancellation and the deadline.
    fn wait_exit(
        &self,
        child: &mut Child,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<Termination> {
        loop {
            if let Some(status) = child
                .wait_timeout(self.config.poll_interval())
                .context("wait for agent")?
            {
                return Ok(Termination::Exited(status));
            }
            if cancel.is_cancelled() {
                return Ok(Termination::Cancelled);
            }
            if Instant::now() >= deadline {
                return Ok(Termination::TimedOut);
            }
        }
    }
}

impl AgentAdapter for ClaudeCliAdapter {
    #[instrument(skip_all, fields(phase = %request.phase, resume = request.resume_id.is_some()))]
    fn invoke(
        &self,
        request: &AgentRequest,
        cancel: &CancellationToken,
        sink: &dyn ProgressSink,
    ) -> AgentSessionResult {
        let started = Instant::now();
        if cancel.is_cancelled() {
            return AgentSessionResult::cancelled(Duration::ZERO);
        }
        match self.run_session(request, cancel, sink, started) {
            Ok(result) => result,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "agent call failed before completion");
                AgentSessionResult::failure(
                    AgentOutcome::Failed,
                    format!("{err:#}"),
                    started.elapsed(),
                )
            }
        }
    }
}

/// Invoke with retries per `policy`. Success or cancellation ends the loop.
pub fn invoke_with_retry<A: AgentAdapter + ?Sized>(
    adapter: &A,
    request: &AgentRequest,
    cancel: &CancellationToken,
    sink: &dyn ProgressSink,
    policy: &RetryPolicy,
    sleep: impl Fn(Duration),
) -> AgentSessionResult {
    let max = policy.max_attempts.max(1);
    policy.run(
        |attempt| {
            if attempt > 1 {
                info!(phase = %request.phase, attempt, max, "retrying agent call");
                sink.progress(&format!("retrying agent call (attempt {attempt}/{max})"));
            }
            adapter.invoke(request, cancel, sink)
        },
        |result| {
            if result.success || result.is_cancelled() || cancel.is_cancelled() {
                Attempt::Done
            } else {
                Attempt::Retry
            }
        },
        sleep,
    )
}

/// First JSON object in agent text: the whole text, a fenced block, or the outermost braces.
pub fn extract_json_payload(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let object = |candidate: &str| {
        serde_json::from_str::<Value>(candidate.trim())
            .ok()
            .filter(Value::is_object)
    };
    if let Some(value) = object(trimmed) {
        return Some(value);
    }
    if let Some(start) = trimmed.find("```json") {
        let body = &trimmed[start + "```json".len()..];
        if let Some(end) = body.find("```")
            && let Some(value) = object(&body[..end])
        {
            return Some(value);
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    object(&trimmed[start..=end])
}

/// Prompt text in a private temp file, rewound for use as stdin.
fn prompt_file(prompt: &str) -> Result<File> {
    let mut file = tempfile::tempfile().context("create prompt temp file")?;
    file.write_all(prompt.as_bytes())
        .context("write prompt temp file")?;
    file.seek(SeekFrom::Start(0))
        .context("rewind prompt temp file")?;
    Ok(file)
}

fn open_stream_log(path: &std::path::Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("create {}", path.display()))?;
    Ok(BufWriter::new(file))
}

fn describe_code(code: Option<i32>) -> String {
    code.map_or_else(|| "none".to_string(), |c| c.to_string())
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let count = trimmed.chars().count();
    let tail: String = trimmed
        .chars()
        .skip(count.saturating_sub(STDERR_TAIL_CHARS))
        .collect();
    format!(": {tail}")
}
