//! Line-delimited JSON framing over a child's stdin/stdout.
//!
//! One [`ChildIo`] exists per spawned backend and is shared behind a
//! `tokio::sync::Mutex`; the mutex is the per-child serialisation lock, so
//! at most one round-trip is ever in flight. The reply is the first stdout
//! line that parses as a complete JSON value; other lines (interpreter
//! banners, stray logs) are skipped.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tracing::debug;

/// Errors from one stdio round-trip.
#[derive(Debug, Error)]
pub enum ChildIoError {
    #[error("Child closed its stdout")]
    Closed,

    #[error("Child stdio error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out waiting for the child's reply")]
    Timeout,
}

/// Stdin writer plus buffered stdout reader for one child.
pub struct ChildIo {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    /// Set after a timeout; the next round-trip drains stale output first.
    stale: bool,
}

impl ChildIo {
    pub fn new(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        Self {
            stdin,
            stdout: BufReader::new(stdout),
            stale: false,
        }
    }

    /// Write one newline-terminated request and read the first JSON reply.
    ///
    /// `timeout` bounds the whole round-trip. On expiry the request fails
    /// with [`ChildIoError::Timeout`] and buffered bytes are discarded
    /// before the next write.
    pub async fn round_trip(
        &mut self,
        line: &str,
        timeout: Duration,
    ) -> Result<String, ChildIoError> {
        if self.stale {
            self.drain_pending().await;
            self.stale = false;
        }

        let result = tokio::time::timeout(timeout, self.write_and_read(line)).await;
        match result {
            Ok(reply) => reply,
            Err(_) => {
                self.stale = true;
                Err(ChildIoError::Timeout)
            }
        }
    }

    async fn write_and_read(&mut self, line: &str) -> Result<String, ChildIoError> {
        self.stdin.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            self.stdin.write_all(b"\n").await?;
        }
        self.stdin.flush().await?;

        loop {
            let mut buf = String::new();
            let n = self.stdout.read_line(&mut buf).await?;
            if n == 0 {
                return Err(ChildIoError::Closed);
            }
            let trimmed = buf.trim();
            if trimmed.is_empty() {
                continue;
            }
            if serde_json::from_str::<serde_json::Value>(trimmed).is_ok() {
                return Ok(trimmed.to_string());
            }
            debug!(line = %trimmed, "Skipping non-JSON stdout line");
        }
    }

    /// Discard whatever the child wrote after a timed-out request.
    async fn drain_pending(&mut self) {
        loop {
            let mut buf = String::new();
            match tokio::time::timeout(Duration::from_millis(5), self.stdout.read_line(&mut buf))
                .await
            {
                Ok(Ok(n)) if n > 0 => {
                    debug!(discarded = %buf.trim(), "Discarding stale stdout line");
                }
                _ => break,
            }
        }
    }
}
