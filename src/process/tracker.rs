//! Tracking of a single child process: transcript, exit status and timeouts.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt as _, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};

/// Owns one started child and records its combined stdout/stderr, line by line.
pub struct TrackedProcess {
    child: Child,
    label: String,
    lines: Vec<String>,
}

impl TrackedProcess {
    /// Spawn `cmd` with piped output and start tracking it.
    pub fn spawn(cmd: &mut Command, label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = cmd
            .spawn()
            .map_err(|e| AppError::process(format!("Failed to start {}: {}", label, e)))?;
        Ok(Self::new(child, label))
    }

    pub fn new(child: Child, label: impl Into<String>) -> Self {
        Self {
            child,
            label: label.into(),
            lines: Vec::new(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Lines recorded so far, in stream order.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Read the output streams to the end. The streams are taken on the first
    /// call, so later calls return immediately.
    pub async fn track(&mut self) -> &[String] {
        let mut stdout = LineReader::new(self.child.stdout.take());
        let mut stderr = LineReader::new(self.child.stderr.take());

        loop {
            let line = tokio::select! {
                line = stdout.next_line(&self.label), if stdout.is_open() => line,
                line = stderr.next_line(&self.label), if stderr.is_open() => line,
                else => break,
            };
            if let Some(line) = line {
                log::info!("[{}] {}", self.label, line);
                self.lines.push(line);
            }
        }

        &self.lines
    }

    /// Consume the output, then wait for exit. Both share one deadline; when
    /// it passes the exit status is left unread.
    pub async fn run_with_timeout(&mut self, timeout: Duration) -> Result<i32> {
        let pid = self.pid();
        let deadline = Instant::now() + timeout;

        if tokio::time::timeout_at(deadline, self.track()).await.is_err() {
            return Err(AppError::timeout(pid, timeout));
        }

        match tokio::time::timeout_at(deadline, self.child.wait()).await {
            Err(_) => Err(AppError::timeout(pid, timeout)),
            Ok(Ok(status)) => Ok(exit_code(status)),
            Ok(Err(e)) => Err(AppError::process(format!(
                "Failed to wait for {}: {}",
                self.label, e
            ))),
        }
    }

    /// Consume the output, then wait for exit without a deadline. Returns
    /// `None` if `cancel` fires first; the token stays cancelled so the caller
    /// sees the interruption too.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Option<i32> {
        let label = self.label.clone();
        let finished = tokio::select! {
            _ = cancel.cancelled() => None,
            status = async {
                self.track().await;
                self.child.wait().await
            } => Some(status),
        };

        match finished {
            None => {
                log::warn!("Interrupted while waiting for {}", label);
                None
            }
            Some(Ok(status)) => Some(exit_code(status)),
            Some(Err(e)) => {
                log::warn!("Failed to wait for {}: {}", label, e);
                None
            }
        }
    }

    /// Turn a non-zero exit code into a failure carrying this process's id.
    pub fn ensure_success(&self, exit_code: i32) -> Result<()> {
        if exit_code == 0 {
            Ok(())
        } else {
            Err(AppError::failure(self.pid(), exit_code))
        }
    }
}

/// Exit code, with death by signal reported shell-style as `128 + signal`.
fn exit_code(status: ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt as _;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    status.code().unwrap_or(-1)
}

/// Splits one output stream on `\n`. Partial lines survive a cancelled read,
/// so two readers can be raced in `select!`.
struct LineReader<R> {
    inner: Option<BufReader<R>>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(stream: Option<R>) -> Self {
        Self {
            inner: stream.map(BufReader::new),
            buf: Vec::new(),
        }
    }

    fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    async fn next_line(&mut self, label: &str) -> Option<String> {
        let reader = self.inner.as_mut()?;
        match reader.read_until(b'\n', &mut self.buf).await {
            Ok(0) => {
                self.inner = None;
                self.take_line()
            }
            Ok(_) => {
                if self.buf.last() == Some(&b'\n') {
                    self.buf.pop();
                    Some(self.take_buf())
                } else {
                    // Stream ended without a trailing newline.
                    self.take_line()
                }
            }
            Err(e) => {
                log::warn!("[{}] failed to read output, treating as closed: {}", label, e);
                self.inner = None;
                self.take_line()
            }
        }
    }

    fn take_line(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.take_buf())
        }
    }

    fn take_buf(&mut self) -> String {
        let bytes = std::mem::take(&mut self.buf);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn shell(script: &str) -> TrackedProcess {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        TrackedProcess::spawn(&mut cmd, "test").unwrap()
    }

    #[tokio::test]
    async fn records_lines_in_order_including_blank_and_partial() {
        let mut process = shell("printf 'First line\\n\\nSecond line'; exit 18");
        let code = process
            .run_with_timeout(Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(process.lines(), ["First line", "", "Second line"]);
        assert_eq!(code, 18);
    }

    #[tokio::test]
    async fn track_consumes_streams_once() {
        let mut process = shell("echo one; echo two");
        assert_eq!(process.track().await, ["one", "two"]);
        assert_eq!(process.track().await, ["one", "two"]);
    }

    #[tokio::test]
    async fn merges_stderr_into_transcript() {
        let mut process = shell("echo out; echo err >&2");
        process
            .run_with_timeout(Duration::from_secs(10))
            .await
            .unwrap();
        let mut lines = process.lines().to_vec();
        lines.sort();
        assert_eq!(lines, ["err", "out"]);
    }

    #[tokio::test]
    async fn times_out_when_process_outlives_budget() {
        let mut process = shell("sleep 5");
        let err = process
            .run_with_timeout(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.payload_value("timeout_ms"), Some("100"));
        assert_eq!(
            err.payload_value("pid"),
            process.pid().map(|p| p.to_string()).as_deref()
        );
    }

    #[tokio::test]
    async fn untimed_run_returns_status() {
        let mut process = shell("echo done; exit 3");
        let code = process.run(&CancellationToken::new()).await;
        assert_eq!(code, Some(3));
        assert_eq!(process.lines(), ["done"]);
    }

    #[tokio::test]
    async fn untimed_run_returns_nothing_when_interrupted() {
        let mut process = shell("sleep 5");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        assert_eq!(process.run(&cancel).await, None);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn ensure_success_reports_failure_with_exit_code() {
        let mut process = shell("exit 2");
        let code = process
            .run_with_timeout(Duration::from_secs(10))
            .await
            .unwrap();
        let err = process.ensure_success(code).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Failure);
        assert_eq!(err.payload_value("exit_code"), Some("2"));
        assert!(process.ensure_success(0).is_ok());
    }

    #[tokio::test]
    async fn killed_process_reports_signal_code() {
        let mut process = shell("kill -9 $$");
        let code = process
            .run_with_timeout(Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(code, 128 + 9);
    }
}
