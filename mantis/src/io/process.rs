//! Helpers for running child processes with timeouts, cancellation and bounded output.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::cancel::CancellationToken;

const CHUNK_SIZE: usize = 8192;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        if self.stdout_truncated > 0 {
            format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            )
        } else {
            String::new()
        }
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }

    /// Combined log text with truncation and termination notices.
    pub fn render_log(&self, label: &str) -> String {
        let mut buf = String::new();
        buf.push_str("=== stdout ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stdout));
        buf.push_str(&self.stdout_truncated_notice(label));
        buf.push_str("\n=== stderr ===\n");
        buf.push_str(&String::from_utf8_lossy(&self.stderr));
        buf.push_str(&self.stderr_truncated_notice(label));
        if self.timed_out {
            buf.push_str(&format!("\n[{label} timed out]\n"));
        }
        if self.cancelled {
            buf.push_str(&format!("\n[{label} cancelled]\n"));
        }
        buf
    }
}

/// Put the child in its own process group so terminal signals aimed at us skip it.
pub fn isolate_process_group(cmd: &mut Command) {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
}

/// Run a command until exit, timeout or cancellation, capturing stdout/stderr.
///
/// Output is read concurrently while the child runs. The child is polled every
/// `poll` so the cancellation token is observed promptly; on timeout or
/// cancellation the child is killed and reaped before returning.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_cancellable(
    mut cmd: Command,
    timeout: Duration,
    poll: Duration,
    cancel: &CancellationToken,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    isolate_process_group(&mut cmd);

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        if let Some(status) = child.wait_timeout(poll).context("wait for command")? {
            break status;
        }
        if cancel.is_cancelled() {
            info!("cancellation requested, killing command");
            cancelled = true;
            break kill_and_reap(&mut child)?;
        }
        if started.elapsed() >= timeout {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            break kill_and_reap(&mut child)?;
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
        elapsed: started.elapsed(),
    })
}

/// Kill a child and its process group (ignoring "already exited") and wait for it.
pub fn kill_and_reap(child: &mut Child) -> Result<ExitStatus> {
    kill_process_group(child.id());
    if let Err(err) = child.kill() {
        debug!(err = %err, "kill failed; child likely already exited");
    }
    child.wait().context("wait command after kill")
}

/// SIGKILL the group led by `pid`; a no-op unless the child was isolated.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(err) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        debug!(pgid = raw, err = %err, "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

/// Forward raw chunks from `reader` over a channel until EOF.
///
/// The receiver observes disconnection once the stream ends, which lets the
/// consumer poll with `recv_timeout` and interleave its own checks.
pub fn spawn_chunk_reader<R: Read + Send + 'static>(mut reader: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut chunk = [0u8; CHUNK_SIZE];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(chunk[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(err = %err, "stream read failed");
                    break;
                }
            }
        }
    });
    rx
}

/// Read a stream to EOF on a background thread, keeping at most `limit` bytes.
pub fn spawn_limited_reader<R: Read + Send + 'static>(
    reader: R,
    limit: usize,
) -> thread::JoinHandle<Result<(Vec<u8>, usize)>> {
    thread::spawn(move || read_stream_limited(reader, limit))
}

pub fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; CHUNK_SIZE];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    /// Verifies output is captured and truncated at the limit.
    #[test]
    fn captures_and_truncates_output() {
        let output = run_cancellable(
            sh("printf 'hello world'; printf 'oops' >&2"),
            Duration::from_secs(10),
            Duration::from_millis(20),
            &CancellationToken::new(),
            5,
        )
        .expect("run");
        assert!(output.status.success());
        assert_eq!(output.stdout, b"hello");
        assert_eq!(output.stdout_truncated, 6);
        assert_eq!(output.stderr, b"oops");
        assert!(!output.timed_out && !output.cancelled);
        assert!(output.render_log("harness").contains("[harness stdout truncated 6 bytes]"));
    }

    /// Verifies the timeout kills a long-running child.
    #[test]
    fn timeout_kills_child() {
        let output = run_cancellable(
            sh("exec sleep 30"),
            Duration::from_millis(200),
            Duration::from_millis(20),
            &CancellationToken::new(),
            1024,
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(!output.status.success());
        assert!(output.elapsed < Duration::from_secs(10));
    }

    /// Verifies a timeout also kills grandchildren that hold the output pipes.
    #[test]
    fn timeout_kills_process_group() {
        let output = run_cancellable(
            sh("sleep 30 & sleep 30; wait"),
            Duration::from_millis(200),
            Duration::from_millis(20),
            &CancellationToken::new(),
            1024,
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(output.elapsed < Duration::from_secs(10));
    }

    /// Verifies a pre-set cancellation token kills the child on the first poll.
    #[test]
    fn cancellation_kills_child() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let output = run_cancellable(
            sh("exec sleep 30"),
            Duration::from_secs(60),
            Duration::from_millis(20),
            &cancel,
            1024,
        )
        .expect("run");
        assert!(output.cancelled);
        assert!(!output.timed_out);
    }

    /// Verifies the chunk reader disconnects at EOF.
    #[test]
    fn chunk_reader_reaches_eof() {
        let rx = spawn_chunk_reader(std::io::Cursor::new(b"abc\ndef".to_vec()));
        let mut collected = Vec::new();
        while let Ok(chunk) = rx.recv_timeout(Duration::from_secs(5)) {
            collected.extend(chunk);
        }
        assert_eq!(collected, b"abc\ndef");
    }
}
