//! Capture pipe to the external frame producer.
//!
//! The producer (e.g. `raspiraw`) writes an unbounded run of raw blocks to
//! its stdout with no framing between them. Reads are non-blocking: an empty
//! pipe is a normal outcome, and a block that arrives in pieces is completed
//! over several calls.

use crate::raw::RawBlock;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io::{ErrorKind, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::time::Duration;
use thiserror::Error;

/// Scratch size for discarding backlog.
const DRAIN_CHUNK: usize = 64 * 1024;

/// Upper bound on one drain; a pipe never buffers more than this.
const DRAIN_LIMIT: usize = 1024 * 1024;

/// How long `stop()` waits for the producer to honour SIGTERM.
const TERM_GRACE: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum CaptureError {
    /// The producer could not be spawned. The command runs under `sh -c`,
    /// so a missing producer binary is not caught here: the shell exits and
    /// the first read reports [`ReadStatus::StreamEnded`].
    #[error("capture unavailable: {0}")]
    Unavailable(String),
    #[error("capture stream not running")]
    NotRunning,
    #[error("pipe read failed: {0}")]
    Read(#[source] std::io::Error),
}

/// Outcome of one non-blocking attempt to fill a raw block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The block holds a full frame.
    Complete,
    /// Some bytes arrived; the rest will be appended on a later call.
    Partial,
    /// Nothing was available.
    NoData,
    /// The producer closed its end of the pipe.
    StreamEnded,
}

/// Source of raw blocks.
///
/// Implemented by [`PipeCapture`] for the real producer and by in-memory
/// fakes in tests.
pub trait CaptureStream: Send {
    /// Launch the producer. Starting a running stream is a no-op.
    fn start(&mut self) -> Result<(), CaptureError>;

    /// Terminate the producer and close the pipe. Idempotent.
    fn stop(&mut self);

    fn is_running(&self) -> bool;

    /// Append available bytes to `block` until it is complete or the pipe
    /// runs dry. A block that was already complete is restarted.
    fn read_block(&mut self, block: &mut RawBlock) -> Result<ReadStatus, CaptureError>;

    /// Read and discard everything currently buffered. Returns the byte count.
    fn drain(&mut self) -> Result<usize, CaptureError>;
}

/// Capture stream backed by a `sh -c` subprocess writing to a pipe.
pub struct PipeCapture {
    command: String,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
}

impl PipeCapture {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            child: None,
            stdout: None,
        }
    }

    fn log_exit_status(&mut self) {
        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) if !status.success() => {
                    tracing::warn!(%status, "capture producer exited abnormally");
                }
                Ok(Some(status)) => tracing::info!(%status, "capture producer exited"),
                Ok(None) => tracing::debug!("capture pipe closed while producer still running"),
                Err(e) => tracing::debug!(error = %e, "failed to poll capture producer"),
            }
        }
    }
}

impl CaptureStream for PipeCapture {
    fn start(&mut self) -> Result<(), CaptureError> {
        if self.is_running() {
            return Ok(());
        }

        // Own process group so stop() reaches the producer behind the shell.
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .process_group(0)
            .spawn()
            .map_err(|e| CaptureError::Unavailable(format!("{}: {e}", self.command)))?;

        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CaptureError::Unavailable(
                "failed to capture producer stdout".into(),
            ));
        };

        if let Err(e) = set_nonblocking(stdout.as_raw_fd()) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(CaptureError::Unavailable(format!(
                "failed to make pipe non-blocking: {e}"
            )));
        }

        tracing::info!(pid = child.id(), command = %self.command, "capture pipe opened");
        self.child = Some(child);
        self.stdout = Some(stdout);
        Ok(())
    }

    fn stop(&mut self) {
        // Closing our end first unblocks a producer stuck writing.
        if self.stdout.take().is_some() {
            tracing::debug!("capture pipe closed");
        }

        let Some(mut child) = self.child.take() else {
            return;
        };

        let pgid = Pid::from_raw(child.id() as i32);
        if let Err(e) = killpg(pgid, Signal::SIGTERM) {
            tracing::debug!(error = %e, "SIGTERM to capture producer failed");
        }

        let deadline = std::time::Instant::now() + TERM_GRACE;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if std::time::Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                _ => {
                    tracing::warn!("capture producer ignored SIGTERM; killing");
                    let _ = killpg(pgid, Signal::SIGKILL);
                    let _ = child.wait();
                    break;
                }
            }
        }

        tracing::info!("capture stream stopped");
    }

    fn is_running(&self) -> bool {
        self.stdout.is_some()
    }

    fn read_block(&mut self, block: &mut RawBlock) -> Result<ReadStatus, CaptureError> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Err(CaptureError::NotRunning);
        };

        if block.is_complete() {
            block.clear();
        }

        let status = loop {
            if block.is_complete() {
                break ReadStatus::Complete;
            }
            match stdout.read(block.unfilled_mut()) {
                Ok(0) => break ReadStatus::StreamEnded,
                Ok(n) => block.advance(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    break if block.filled() > 0 {
                        ReadStatus::Partial
                    } else {
                        ReadStatus::NoData
                    };
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(CaptureError::Read(e)),
            }
        };

        if status == ReadStatus::StreamEnded {
            self.log_exit_status();
        }
        Ok(status)
    }

    fn drain(&mut self) -> Result<usize, CaptureError> {
        let Some(stdout) = self.stdout.as_mut() else {
            return Ok(0);
        };

        let mut scratch = vec![0u8; DRAIN_CHUNK];
        let mut total = 0usize;
        while total < DRAIN_LIMIT {
            match stdout.read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(CaptureError::Read(e)),
            }
        }

        if total > 0 {
            tracing::debug!(bytes = total, "drained stale capture data");
        }
        Ok(total)
    }
}

impl Drop for PipeCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Put the pipe into non-blocking mode.
fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    // SAFETY: `fd` belongs to a live ChildStdout for the duration of both calls;
    // F_GETFL/F_SETFL take no pointer arguments.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
