//! A subprocess-based reference `VMBackend`.
//!
//! Spawns a long-lived placeholder guest process per sandbox and tracks it
//! by PID, using the same SIGTERM-then-SIGKILL graceful shutdown and
//! liveness-check discipline as this codebase uses elsewhere. This stands
//! in for a real hypervisor integration (libkrun, Firecracker, …), which is
//! consumed only through the `VMBackend`/`Machine` contract.

use async_trait::async_trait;
use matchlock_shared::{MatchlockError, MatchlockResult};
use parking_lot::Mutex;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::util::{is_process_alive, kill_process, terminate_process};

use super::config::VmConfig;
use super::traits::{ExecOpts, ExecOutcome, ExecResult, Machine, ResizeEvent, VMBackend};

/// Pumps one child output stream to its mpsc channel until EOF or error.
/// Reader side drops its half when the RPC session ends, which makes the
/// corresponding `send` fail and ends the pump.
async fn pump_to_channel<R: AsyncRead + Unpin>(mut reader: R, tx: tokio::sync::mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    return;
                }
            }
        }
    }
}

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct ProcessBackend {
    /// Argv template for the placeholder guest process, e.g.
    /// `["sleep", "infinity"]` in tests.
    guest_command: Vec<String>,
}

impl ProcessBackend {
    pub fn new(guest_command: Vec<String>) -> Self {
        Self { guest_command }
    }
}

#[async_trait]
impl VMBackend for ProcessBackend {
    async fn create(&self, config: VmConfig) -> MatchlockResult<Box<dyn Machine>> {
        config.validate()?;

        let mut cmd = Command::new(
            self.guest_command
                .first()
                .cloned()
                .unwrap_or_else(|| "sleep".to_string()),
        );
        cmd.args(self.guest_command.iter().skip(1));
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        let child = cmd
            .spawn()
            .map_err(|e| MatchlockError::Machine(format!("spawning guest process: {e}")))?;

        Ok(Box::new(ProcessMachine {
            child: Mutex::new(Some(child)),
            pid: Mutex::new(None),
            config,
        }))
    }
}

struct ProcessMachine {
    child: Mutex<Option<Child>>,
    pid: Mutex<Option<u32>>,
    config: VmConfig,
}

#[async_trait]
impl Machine for ProcessMachine {
    async fn start(&self) -> MatchlockResult<()> {
        let pid = self
            .child
            .lock()
            .as_ref()
            .and_then(|c| c.id())
            .ok_or_else(|| MatchlockError::Machine("guest process has no pid".into()))?;
        *self.pid.lock() = Some(pid);
        Ok(())
    }

    async fn stop(&self) -> MatchlockResult<()> {
        let pid = match *self.pid.lock() {
            Some(pid) => pid,
            None => return Ok(()),
        };

        if !is_process_alive(pid) {
            return Ok(());
        }

        terminate_process(pid);
        let deadline = Instant::now() + GRACEFUL_SHUTDOWN_TIMEOUT;
        while Instant::now() < deadline {
            if !is_process_alive(pid) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if !kill_process(pid) {
            return Err(MatchlockError::Machine(format!(
                "failed to terminate guest process {pid}"
            )));
        }
        Ok(())
    }

    async fn wait(&self) -> MatchlockResult<i32> {
        let child = self.child.lock().take();
        match child {
            Some(mut child) => {
                let status = child
                    .wait()
                    .await
                    .map_err(|e| MatchlockError::Machine(format!("waiting on guest process: {e}")))?;
                Ok(status.code().unwrap_or(-1))
            }
            None => Ok(0),
        }
    }

    async fn close(&self) -> MatchlockResult<()> {
        self.stop().await
    }

    async fn exec(
        &self,
        command: &[String],
        _opts: ExecOpts,
        cancel: CancellationToken,
    ) -> MatchlockResult<ExecResult> {
        let start = Instant::now();
        let mut cmd = Command::new(command.first().cloned().unwrap_or_default());
        cmd.args(command.iter().skip(1));
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let child = cmd
            .spawn()
            .map_err(|e| MatchlockError::Machine(format!("spawning exec command: {e}")))?;

        tokio::select! {
            output = child.wait_with_output() => {
                let output = output
                    .map_err(|e| MatchlockError::Machine(format!("collecting exec output: {e}")))?;
                Ok(ExecResult {
                    exit_code: output.status.code().unwrap_or(-1),
                    stdout: output.stdout,
                    stderr: output.stderr,
                    duration: start.elapsed(),
                })
            }
            _ = cancel.cancelled() => {
                Err(MatchlockError::Cancelled("exec cancelled".into()))
            }
        }
    }

    async fn exec_pipe(
        &self,
        command: &[String],
        _opts: ExecOpts,
        mut stdin: Box<dyn AsyncRead + Unpin + Send>,
        stdout_tx: tokio::sync::mpsc::Sender<Vec<u8>>,
        stderr_tx: tokio::sync::mpsc::Sender<Vec<u8>>,
        cancel: CancellationToken,
    ) -> MatchlockResult<ExecOutcome> {
        let start = Instant::now();
        let mut cmd = Command::new(command.first().cloned().unwrap_or_default());
        cmd.args(command.iter().skip(1));
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| MatchlockError::Machine(format!("spawning piped exec command: {e}")))?;

        let mut child_stdin = child.stdin.take();
        let child_stdout = child.stdout.take().expect("piped stdout");
        let child_stderr = child.stderr.take().expect("piped stderr");

        let stdin_pump = tokio::spawn(async move {
            if let Some(mut sink) = child_stdin.take() {
                let _ = tokio::io::copy(&mut stdin, &mut sink).await;
            }
        });
        let stdout_pump = tokio::spawn(pump_to_channel(child_stdout, stdout_tx));
        let stderr_pump = tokio::spawn(pump_to_channel(child_stderr, stderr_tx));

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| MatchlockError::Machine(format!("waiting on piped exec: {e}")))?;
                stdin_pump.abort();
                let _ = stdout_pump.await;
                let _ = stderr_pump.await;
                Ok(ExecOutcome { exit_code: status.code().unwrap_or(-1), duration: start.elapsed() })
            }
            _ = cancel.cancelled() => {
                stdin_pump.abort();
                stdout_pump.abort();
                stderr_pump.abort();
                let _ = child.start_kill();
                Err(MatchlockError::Cancelled("exec_pipe cancelled".into()))
            }
        }
    }

    async fn exec_interactive(
        &self,
        command: &[String],
        _opts: ExecOpts,
        _rows: u16,
        _cols: u16,
        mut stdin: Box<dyn AsyncRead + Unpin + Send>,
        mut stdout: Box<dyn AsyncWrite + Unpin + Send>,
        mut resize: tokio::sync::mpsc::Receiver<ResizeEvent>,
        cancel: CancellationToken,
    ) -> MatchlockResult<i32> {
        // No real PTY is allocated by this reference backend (no pty crate
        // in the dependency set); stdout and stderr are merged onto the
        // single `stdout` stream the same way a real PTY would, and resize
        // events are accepted but have nothing to apply them to.
        let mut cmd = Command::new(command.first().cloned().unwrap_or_default());
        cmd.args(command.iter().skip(1));
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| MatchlockError::Machine(format!("spawning interactive exec command: {e}")))?;

        let mut child_stdin = child.stdin.take();
        let child_stdout = child.stdout.take().expect("piped stdout");
        let child_stderr = child.stderr.take().expect("piped stderr");

        let stdin_pump = tokio::spawn(async move {
            if let Some(mut sink) = child_stdin.take() {
                let _ = tokio::io::copy(&mut stdin, &mut sink).await;
            }
        });
        let resize_drain = tokio::spawn(async move { while resize.recv().await.is_some() {} });

        let copy_out = async {
            let mut out = child_stdout;
            let mut err = child_stderr;
            let (mut out_buf, mut err_buf) = ([0u8; 4096], [0u8; 4096]);
            loop {
                tokio::select! {
                    n = out.read(&mut out_buf) => {
                        match n {
                            Ok(0) | Err(_) => break,
                            Ok(n) => { if stdout.write_all(&out_buf[..n]).await.is_err() { break; } }
                        }
                    }
                    n = err.read(&mut err_buf) => {
                        match n {
                            Ok(0) | Err(_) => break,
                            Ok(n) => { if stdout.write_all(&err_buf[..n]).await.is_err() { break; } }
                        }
                    }
                }
            }
        };

        tokio::select! {
            () = copy_out => {}
            _ = cancel.cancelled() => {
                stdin_pump.abort();
                resize_drain.abort();
                let _ = child.start_kill();
                return Err(MatchlockError::Cancelled("exec_interactive cancelled".into()));
            }
        }

        stdin_pump.abort();
        resize_drain.abort();
        let status = child
            .wait()
            .await
            .map_err(|e| MatchlockError::Machine(format!("waiting on interactive exec: {e}")))?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn dial_vsock(&self, port: u32) -> MatchlockResult<tokio::net::UnixStream> {
        Err(MatchlockError::Machine(format!(
            "process backend has no vsock transport (port {port})"
        )))
    }

    fn network_tap(&self) -> Option<std::os::fd::RawFd> {
        if self.config.no_network {
            None
        } else {
            None
        }
    }

    fn pid(&self) -> u32 {
        (*self.pid.lock()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config() -> VmConfig {
        use super::super::config::{DiskLayer, FsType, RootfsLayout};
        VmConfig {
            kernel_path: PathBuf::from("/boot/vmlinux"),
            initramfs_path: None,
            rootfs: RootfsLayout {
                bootstrap: DiskLayer {
                    path: PathBuf::from("bootstrap.ext4"),
                    fs_type: FsType::Ext4,
                    readonly: true,
                },
                upper: DiskLayer {
                    path: PathBuf::from("upper.ext4"),
                    fs_type: FsType::Ext4,
                    readonly: false,
                },
                lowers: Vec::new(),
            },
            extra_disks: Vec::new(),
            cpu_count: 1,
            memory_mb: 256,
            gateway_ip: None,
            guest_ip: None,
            subnet_cidr: None,
            workspace: PathBuf::from("/workspace"),
            hostname: "sandbox".into(),
            dns_servers: Vec::new(),
            add_hosts: Vec::new(),
            mtu: 1500,
            privileged: false,
            no_network: true,
        }
    }

    #[tokio::test]
    async fn create_start_stop_roundtrip() {
        let backend = ProcessBackend::new(vec!["sleep".into(), "30".into()]);
        let machine = backend.create(config()).await.unwrap();
        machine.start().await.unwrap();
        assert!(machine.pid() > 0);
        machine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn exec_reports_exit_code_and_output() {
        let backend = ProcessBackend::new(vec!["sleep".into(), "30".into()]);
        let machine = backend.create(config()).await.unwrap();
        machine.start().await.unwrap();

        let result = machine
            .exec(
                &["echo".into(), "hello".into()],
                ExecOpts::default(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(String::from_utf8_lossy(&result.stdout).trim(), "hello");

        machine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn exec_honors_cancellation() {
        let backend = ProcessBackend::new(vec!["sleep".into(), "30".into()]);
        let machine = backend.create(config()).await.unwrap();
        machine.start().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = machine
            .exec(
                &["sleep".into(), "5".into()],
                ExecOpts::default(),
                cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), matchlock_shared::ErrorKind::Cancelled);

        machine.stop().await.unwrap();
    }

    #[tokio::test]
    async fn exec_pipe_streams_stdout_as_produced() {
        let backend = ProcessBackend::new(vec!["sleep".into(), "30".into()]);
        let machine = backend.create(config()).await.unwrap();
        machine.start().await.unwrap();

        let (stdout_tx, mut stdout_rx) = tokio::sync::mpsc::channel(16);
        let (stderr_tx, _stderr_rx) = tokio::sync::mpsc::channel(16);
        let outcome = machine
            .exec_pipe(
                &["printf".into(), "hi".into()],
                ExecOpts::default(),
                Box::new(tokio::io::empty()),
                stdout_tx,
                stderr_tx,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 0);

        let mut collected = Vec::new();
        while let Some(chunk) = stdout_rx.recv().await {
            collected.extend(chunk);
        }
        assert_eq!(String::from_utf8_lossy(&collected), "hi");

        machine.stop().await.unwrap();
    }
}
