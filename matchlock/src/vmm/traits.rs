//! Capability set the supervisor consumes from a hypervisor integration.

use async_trait::async_trait;
use matchlock_shared::MatchlockResult;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use super::config::VmConfig;

#[derive(Debug, Clone, Default)]
pub struct ExecOpts {
    pub cwd: Option<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub stdin: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
}

/// Terminal outcome of a streamed exec (`exec_pipe`/`exec_interactive`):
/// output has already been delivered incrementally over the channel, so
/// only the exit code and wall-clock duration remain to report.
#[derive(Debug, Clone, Copy)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub duration: Duration,
}

#[derive(Debug, Clone, Copy, serde::Deserialize)]
pub struct ResizeEvent {
    pub rows: u16,
    pub cols: u16,
}

/// One running (or not-yet-started) guest VM.
///
/// Every call may fail with `kind=VM`; `exec`/`exec_interactive` may also
/// fail with `kind=Cancelled` when the caller's context is cancelled.
#[async_trait]
pub trait Machine: Send + Sync {
    async fn start(&self) -> MatchlockResult<()>;

    async fn stop(&self) -> MatchlockResult<()>;

    /// Block until the guest VM process exits, returning its exit status.
    async fn wait(&self) -> MatchlockResult<i32>;

    /// Release backend-owned resources (sockets, tap devices, pidfds).
    /// Idempotent: closing an already-closed machine is not an error.
    async fn close(&self) -> MatchlockResult<()>;

    /// Run a command to completion and collect its full output.
    async fn exec(
        &self,
        command: &[String],
        opts: ExecOpts,
        cancel: CancellationToken,
    ) -> MatchlockResult<ExecResult>;

    /// Run a command with stdin piped in and stdout/stderr streamed out as
    /// they're produced, rather than collected to completion like `exec`.
    /// Used for both `exec_stream` (an already-EOF `stdin`) and `exec_pipe`
    /// (a live one) — the two differ only in what the RPC layer feeds in.
    async fn exec_pipe(
        &self,
        command: &[String],
        opts: ExecOpts,
        stdin: Box<dyn AsyncRead + Unpin + Send>,
        stdout: tokio::sync::mpsc::Sender<Vec<u8>>,
        stderr: tokio::sync::mpsc::Sender<Vec<u8>>,
        cancel: CancellationToken,
    ) -> MatchlockResult<ExecOutcome>;

    /// Run a command attached to a PTY, streaming stdin/stdout and applying
    /// resize events monotonically (a resize that arrives before an earlier
    /// one is applied is dropped).
    async fn exec_interactive(
        &self,
        command: &[String],
        opts: ExecOpts,
        rows: u16,
        cols: u16,
        stdin: Box<dyn AsyncRead + Unpin + Send>,
        stdout: Box<dyn AsyncWrite + Unpin + Send>,
        resize: tokio::sync::mpsc::Receiver<ResizeEvent>,
        cancel: CancellationToken,
    ) -> MatchlockResult<i32>;

    /// Obtain a raw bidirectional byte channel to a well-known guest vsock
    /// port (exec=5000, vfs=5001).
    async fn dial_vsock(&self, port: u32) -> MatchlockResult<tokio::net::UnixStream>;

    /// A host-side descriptor carrying layer-2 frames to/from the guest
    /// NIC, used by the interception stack or a separate packet-redirect
    /// path depending on platform. `None` when the machine has no network
    /// (`no_network=true`).
    fn network_tap(&self) -> Option<std::os::fd::RawFd>;

    fn pid(&self) -> u32;
}

/// Factory the supervisor uses to create a `Machine` from a validated
/// `VmConfig`.
#[async_trait]
pub trait VMBackend: Send + Sync {
    async fn create(&self, config: VmConfig) -> MatchlockResult<Box<dyn Machine>>;
}
