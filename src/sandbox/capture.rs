//! Bounded output capture with a hard wall-clock timeout.
//!
//! The child runs in its own process group so a timeout (or any other exit
//! path) can take down everything it forked, not just the direct child.

use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::guard::TRUNCATION_MARKER;

/// Exit code reported when a run is killed for exceeding its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// How long to wait for pipe readers after the process group is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8 * 1024;

/// Keeps the first `limit` bytes of a stream and counts the rest.
#[derive(Debug, Clone, Default)]
pub struct BoundedBuffer {
    data: Vec<u8>,
    total: usize,
    limit: usize,
}

impl BoundedBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            total: 0,
            limit,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.total += chunk.len();
        let room = self.limit.saturating_sub(self.data.len());
        self.data.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    #[cfg(test)]
    fn total(&self) -> usize {
        self.total
    }

    pub fn is_truncated(&self) -> bool {
        self.total > self.data.len()
    }

    /// Retained bytes as lossy UTF-8, plus whether anything was dropped.
    pub fn into_lossy(self) -> (String, bool) {
        let truncated = self.is_truncated();
        (String::from_utf8_lossy(&self.data).into_owned(), truncated)
    }

    /// Lossy UTF-8 with the truncation marker appended when bytes were dropped.
    #[cfg(test)]
    fn into_string(self) -> String {
        let (mut text, truncated) = self.into_lossy();
        if truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

#[derive(Debug)]
pub struct CapturedOutput {
    pub exit_code: i32,
    pub stdout: BoundedBuffer,
    pub stderr: BoundedBuffer,
    pub timed_out: bool,
    pub duration: Duration,
}

/// Spawn `command` and capture at most `max_output` bytes of each stream.
///
/// The command must already be configured with piped stdout/stderr. Only
/// spawn and wait failures surface as errors; a timeout is reported through
/// `timed_out` with [`TIMEOUT_EXIT_CODE`].
pub async fn run_bounded(
    mut command: Command,
    limit: Duration,
    max_output: usize,
) -> std::io::Result<CapturedOutput> {
    let started = Instant::now();
    let mut child = command.spawn()?;
    let pid = child.id();

    let stdout_task = spawn_reader(child.stdout.take(), max_output);
    let stderr_task = spawn_reader(child.stderr.take(), max_output);

    let (exit_code, timed_out) = match timeout(limit, child.wait()).await {
        Ok(status) => {
            let status = status?;
            // signal deaths have no code
            (status.code().unwrap_or(-1), false)
        }
        Err(_) => {
            tracing::warn!(pid = ?pid, timeout_secs = limit.as_secs(), "Process exceeded timeout, killing");
            kill_process_group(pid);
            let _ = child.kill().await;
            (TIMEOUT_EXIT_CODE, true)
        }
    };

    // reap stragglers left in the group on normal exit too
    kill_process_group(pid);

    let stdout = drain(stdout_task, max_output).await;
    let stderr = drain(stderr_task, max_output).await;

    Ok(CapturedOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
        duration: started.elapsed(),
    })
}

fn spawn_reader<R>(reader: Option<R>, limit: usize) -> JoinHandle<BoundedBuffer>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buffer = BoundedBuffer::new(limit);
        let Some(mut reader) = reader else {
            return buffer;
        };
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer.push(&chunk[..n]),
            }
        }
        buffer
    })
}

async fn drain(task: JoinHandle<BoundedBuffer>, limit: usize) -> BoundedBuffer {
    let abort = task.abort_handle();
    match timeout(DRAIN_GRACE, task).await {
        Ok(Ok(buffer)) => buffer,
        Ok(Err(_)) => BoundedBuffer::new(limit),
        Err(_) => {
            // a detached grandchild still holds the pipe
            abort.abort();
            BoundedBuffer::new(limit)
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    // ESRCH just means the group is already gone
    let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;

    fn shell(script: &str) -> Command {
        let mut command = Command::new("sh");
        command
            .args(["-c", script])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);
        command
    }

    #[test]
    fn test_bounded_buffer_keeps_prefix() {
        let mut buffer = BoundedBuffer::new(4);
        buffer.push(b"ab");
        buffer.push(b"cdef");
        assert_eq!(buffer.total(), 6);
        assert!(buffer.is_truncated());
        assert_eq!(buffer.into_string(), format!("abcd{}", TRUNCATION_MARKER));
    }

    #[test]
    fn test_bounded_buffer_under_limit() {
        let mut buffer = BoundedBuffer::new(16);
        buffer.push(b"hello");
        assert!(!buffer.is_truncated());
        assert_eq!(buffer.into_string(), "hello");
    }

    #[tokio::test]
    async fn test_captures_both_streams_and_exit_code() {
        let out = run_bounded(
            shell("echo out; echo err >&2; exit 3"),
            Duration::from_secs(10),
            1024,
        )
        .await
        .unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(!out.timed_out);
        assert_eq!(out.stdout.into_string(), "out\n");
        assert_eq!(out.stderr.into_string(), "err\n");
    }

    #[tokio::test]
    async fn test_output_is_bounded() {
        let out = run_bounded(
            shell("i=0; while [ $i -lt 2000 ]; do echo 0123456789; i=$((i+1)); done"),
            Duration::from_secs(10),
            100,
        )
        .await
        .unwrap();
        assert_eq!(out.exit_code, 0);
        assert_eq!(out.stdout.total(), 22_000);
        let text = out.stdout.into_string();
        assert!(text.ends_with(TRUNCATION_MARKER));
        assert_eq!(text.len(), 100 + TRUNCATION_MARKER.len());
    }

    #[tokio::test]
    async fn test_timeout_kills_process_group() {
        let started = Instant::now();
        let out = run_bounded(shell("sleep 30 & sleep 30"), Duration::from_millis(300), 1024)
            .await
            .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_error() {
        let mut command = Command::new("/nonexistent/shipwright-binary");
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        assert!(run_bounded(command, Duration::from_secs(1), 64).await.is_err());
    }
}
