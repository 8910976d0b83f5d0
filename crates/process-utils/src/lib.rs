//! Subprocess helpers for the encoder adapter.
//!
//! Spawning goes through [`tokio_command`] so every child is hidden on Windows
//! and killed when its handle is dropped. [`wait_or_cancel`] and
//! [`output_or_cancel`] race a running child against a cancellation token and
//! kill the child when the token fires first.

use std::ffi::OsStr;
use std::process::{ExitStatus, Output};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` for an external tool.
///
/// The child is killed if its handle is dropped, so an aborted task never
/// leaves an orphaned encoder behind.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.kill_on_drop(true);
    cmd
}

/// How a child process ended.
#[derive(Debug)]
pub enum ProcessOutcome<T> {
    /// The child ran to completion.
    Exited(T),
    /// The token fired first; the child has been killed and reaped.
    Cancelled,
}

impl<T> ProcessOutcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Wait for `child` to exit, killing it if `token` is cancelled first.
#[cfg(feature = "tokio")]
pub async fn wait_or_cancel(
    child: &mut tokio::process::Child,
    token: &tokio_util::sync::CancellationToken,
) -> std::io::Result<ProcessOutcome<ExitStatus>> {
    tokio::select! {
        status = child.wait() => status.map(ProcessOutcome::Exited),
        _ = token.cancelled() => {
            child.kill().await?;
            Ok(ProcessOutcome::Cancelled)
        }
    }
}

/// Spawn `command` with piped stdout/stderr and collect its output, killing
/// the child if `token` is cancelled first.
#[cfg(feature = "tokio")]
pub async fn output_or_cancel(
    command: &mut tokio::process::Command,
    token: &tokio_util::sync::CancellationToken,
) -> std::io::Result<ProcessOutcome<Output>> {
    use std::process::Stdio;

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let child = command.spawn()?;

    // `wait_with_output` consumes the child; dropping the future on
    // cancellation drops the child too, and `kill_on_drop` reaps it.
    tokio::select! {
        output = child.wait_with_output() => output.map(ProcessOutcome::Exited),
        _ = token.cancelled() => Ok(ProcessOutcome::Cancelled),
    }
}
