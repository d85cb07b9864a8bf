//! Method implementations, one function per JSON-RPC method.
//! Unary calls return their result value directly; streaming calls
//! (`exec_stream`, `exec_pipe`, `exec_tty`) push notifications through
//! `ctx.writer` themselves as output arrives and only return the terminal
//! `{exit_code, duration_ms}` once the guest process exits.

use std::sync::Arc;
use std::time::Duration;

use matchlock_shared::{MatchlockError, MatchlockResult, SandboxId};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::supervisor::{Config, Sandbox};
use crate::vfs::FileType;
use crate::vmm::ExecOpts;

use super::handler::{base64_decode, base64_encode, Ctx};
use super::params::*;
use super::protocol::RpcNotification;
use super::session_io::{stdin_bridge, ChannelWriter, ResizeCoalescer, SessionInput};
use super::vfs_client;

fn invalid_params(method: &str, e: impl std::fmt::Display) -> MatchlockError {
    MatchlockError::Rpc(format!("invalid params for {method}: {e}"))
}

fn exec_opts(cwd: Option<String>, env: std::collections::BTreeMap<String, String>, timeout_ms: Option<u64>) -> ExecOpts {
    ExecOpts {
        cwd,
        env,
        timeout: timeout_ms.map(Duration::from_millis),
        stdin: None,
    }
}

/// `create`: `id` in params is rejected; a fresh `vm-…` id is
/// always minted host-side.
pub async fn create<W>(ctx: &Arc<Ctx<W>>, params: Value) -> MatchlockResult<Value>
where
    W: tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
{
    if params.get("id").is_some() {
        return Err(invalid_params("create", "`id` may not be supplied by the caller"));
    }
    let config: Config = serde_json::from_value(params).map_err(|e| invalid_params("create", e))?;
    config.validate()?;

    let id = SandboxId::generate();
    match ctx.registry.create(id.clone(), config, &ctx.deps).await {
        Ok(sandbox) => {
            ctx.metrics.record_sandbox_created();
            spawn_event_forwarder(ctx.clone(), sandbox);
            Ok(serde_json::to_value(CreateResult { id: id.to_string() }).unwrap())
        }
        Err(e) => {
            ctx.metrics.record_sandbox_failed();
            Err(e)
        }
    }
}

/// Subscribes to a freshly created sandbox's event broadcast and relays
/// every record as an `event` notification until the sandbox
/// drops its sink (on `close`) or the RPC transport disconnects.
fn spawn_event_forwarder<W>(ctx: Arc<Ctx<W>>, sandbox: Arc<Sandbox>)
where
    W: tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
{
    let mut rx = sandbox.events().subscribe();
    let sandbox_id = sandbox.id.clone();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let params = serde_json::json!({
                        "id": sandbox_id.to_string(),
                        "kind": event.kind,
                        "detail": event.detail,
                    });
                    if ctx.writer.send(RpcNotification::new("event", params)).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// `close`: `timeout_seconds` is accepted for wire compatibility;
/// `Sandbox::close` already runs its own bounded graceful-then-forced
/// shutdown internally, so there is nothing further to bound here.
pub async fn close<W>(ctx: &Arc<Ctx<W>>, params: Value) -> MatchlockResult<Value> {
    let params: CloseParams = serde_json::from_value(params).map_err(|e| invalid_params("close", e))?;
    let id = SandboxId::parse(&params.id).ok_or_else(|| MatchlockError::State(format!("malformed sandbox id {}", params.id)))?;
    ctx.port_forwards.remove(&id).await;
    ctx.registry.close(&id).await
        .map(|()| serde_json::json!({}))
}

async fn resolve_sandbox<W>(ctx: &Arc<Ctx<W>>, id: &str) -> MatchlockResult<Arc<Sandbox>> {
    let id = SandboxId::parse(id).ok_or_else(|| MatchlockError::State(format!("malformed sandbox id {id}")))?;
    ctx.registry.get(&id).await
}

/// `exec`: unary call, output returned base64-encoded in the
/// response body rather than streamed.
pub async fn exec<W>(ctx: Arc<Ctx<W>>, _id: i64, params: Value, cancel: CancellationToken) -> MatchlockResult<Value> {
    let params: ExecParams = serde_json::from_value(params).map_err(|e| invalid_params("exec", e))?;
    let sandbox = resolve_sandbox(&ctx, &params.id).await?;
    let opts = exec_opts(params.cwd, params.env, params.timeout_ms);

    let outcome = sandbox.exec(&params.command, opts, cancel).await;
    ctx.metrics.record_exec(outcome.is_err());
    let result = outcome?;

    Ok(serde_json::to_value(ExecResultParams {
        exit_code: result.exit_code,
        stdout: base64_encode(&result.stdout),
        stderr: base64_encode(&result.stderr),
        duration_ms: result.duration.as_millis(),
    })
    .unwrap())
}

/// `exec_stream`: output delivered as `exec_stream.{stdout,stderr}`
/// notifications carrying `{id, data(base64)}`, pumped from bounded
/// channels fed by `Sandbox::exec_pipe` -- stdin is never accepted on this
/// call (that's `exec_pipe`'s job), so it's wired with an already-closed
/// reader.
pub async fn exec_stream<W>(ctx: Arc<Ctx<W>>, id: i64, params: Value, cancel: CancellationToken) -> MatchlockResult<Value>
where
    W: tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
{
    let params: ExecParams = serde_json::from_value(params).map_err(|e| invalid_params("exec_stream", e))?;
    let sandbox = resolve_sandbox(&ctx, &params.id).await?;
    let opts = exec_opts(params.cwd, params.env, params.timeout_ms);

    // exec_stream never accepts stdin (that's exec_pipe's job); an
    // already-at-EOF reader is all `exec_pipe` needs underneath.
    let closed_stdin: Box<dyn tokio::io::AsyncRead + Unpin + Send> = Box::new(tokio::io::empty());

    let (stdout_tx, stdout_rx) = mpsc::channel::<Vec<u8>>(64);
    let (stderr_tx, stderr_rx) = mpsc::channel::<Vec<u8>>(64);

    let writer = ctx.writer.clone();
    let stdout_pump = tokio::spawn(pump_notifications(writer.clone(), "exec_stream.stdout", id, stdout_rx));
    let stderr_pump = tokio::spawn(pump_notifications(writer, "exec_stream.stderr", id, stderr_rx));

    let outcome = sandbox.exec_pipe(&params.command, opts, closed_stdin, stdout_tx, stderr_tx, cancel).await;
    ctx.metrics.record_exec(outcome.is_err());
    let _ = stdout_pump.await;
    let _ = stderr_pump.await;
    let outcome = outcome?;

    Ok(serde_json::to_value(StreamExecResult {
        exit_code: outcome.exit_code,
        duration_ms: outcome.duration.as_millis(),
    })
    .unwrap())
}

async fn pump_notifications<W>(writer: Arc<super::writer::OutputWriter<W>>, method: &'static str, id: i64, mut rx: mpsc::Receiver<Vec<u8>>)
where
    W: tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
{
    while let Some(chunk) = rx.recv().await {
        let notif = RpcNotification::new(method, serde_json::json!({"id": id, "data": base64_encode(&chunk)}));
        if writer.send(notif).await.is_err() {
            break;
        }
    }
}

async fn pump_notifications_unbounded<W>(
    writer: Arc<super::writer::OutputWriter<W>>,
    method: &'static str,
    id: i64,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) where
    W: tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
{
    while let Some(chunk) = rx.recv().await {
        let notif = RpcNotification::new(method, serde_json::json!({"id": id, "data": base64_encode(&chunk)}));
        if writer.send(notif).await.is_err() {
            break;
        }
    }
}

/// `exec_pipe`: client-fed stdin via `.stdin`/`.stdin_eof`
/// notifications keyed by this call's request `id`; a `.ready` notification
/// is sent before the stdin bridge starts consuming so the client never
/// races its first write.
pub async fn exec_pipe<W>(ctx: Arc<Ctx<W>>, id: i64, params: Value, cancel: CancellationToken) -> MatchlockResult<Value>
where
    W: tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
{
    let params: ExecParams = serde_json::from_value(params).map_err(|e| invalid_params("exec_pipe", e))?;
    let sandbox = resolve_sandbox(&ctx, &params.id).await?;
    let opts = exec_opts(params.cwd, params.env, params.timeout_ms);

    let (stdin_tx, stdin_reader) = stdin_bridge();
    ctx.stdin_table.lock().await.insert(id, stdin_tx);

    let (stdout_tx, stdout_rx) = mpsc::channel::<Vec<u8>>(64);
    let (stderr_tx, stderr_rx) = mpsc::channel::<Vec<u8>>(64);

    let writer = ctx.writer.clone();
    let _ = writer.send(RpcNotification::new("exec_pipe.ready", serde_json::json!({"id": id}))).await;

    let stdout_pump = tokio::spawn(pump_notifications(writer.clone(), "exec_pipe.stdout", id, stdout_rx));
    let stderr_pump = tokio::spawn(pump_notifications(writer, "exec_pipe.stderr", id, stderr_rx));

    let outcome = sandbox.exec_pipe(&params.command, opts, stdin_reader, stdout_tx, stderr_tx, cancel).await;
    ctx.metrics.record_exec(outcome.is_err());
    ctx.stdin_table.lock().await.remove(&id);
    let _ = stdout_pump.await;
    let _ = stderr_pump.await;
    let outcome = outcome?;

    Ok(serde_json::to_value(StreamExecResult {
        exit_code: outcome.exit_code,
        duration_ms: outcome.duration.as_millis(),
    })
    .unwrap())
}

/// `exec_tty`: a PTY session -- stdin, stdout, and coalesced
/// `.resize` notifications all keyed to this call's request `id`.
pub async fn exec_tty<W>(ctx: Arc<Ctx<W>>, id: i64, params: Value, cancel: CancellationToken) -> MatchlockResult<Value>
where
    W: tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
{
    let params: ExecTtyParams = serde_json::from_value(params).map_err(|e| invalid_params("exec_tty", e))?;
    let sandbox = resolve_sandbox(&ctx, &params.id).await?;
    let opts = exec_opts(params.cwd, params.env, None);

    let (stdin_tx, stdin_reader) = stdin_bridge();
    ctx.stdin_table.lock().await.insert(id, stdin_tx);

    let (coalescer, resize_rx) = ResizeCoalescer::spawn();
    ctx.resize_table.lock().await.insert(id, coalescer);

    let (stdout_writer, stdout_rx) = ChannelWriter::new();

    let writer = ctx.writer.clone();
    let _ = writer.send(RpcNotification::new("exec_tty.ready", serde_json::json!({"id": id}))).await;

    let stdout_pump = tokio::spawn(pump_notifications_unbounded(writer, "exec_tty.stdout", id, stdout_rx));

    let start = std::time::Instant::now();
    let exit_code = sandbox
        .exec_interactive(
            &params.command,
            opts,
            params.rows,
            params.cols,
            stdin_reader,
            Box::new(stdout_writer),
            resize_rx,
            cancel,
        )
        .await;
    let duration = start.elapsed();
    ctx.metrics.record_exec(exit_code.is_err());
    ctx.stdin_table.lock().await.remove(&id);
    ctx.resize_table.lock().await.remove(&id);
    let _ = stdout_pump.await;
    let exit_code = exit_code?;

    Ok(serde_json::to_value(StreamExecResult {
        exit_code,
        duration_ms: duration.as_millis(),
    })
    .unwrap())
}

pub async fn write_file<W>(ctx: Arc<Ctx<W>>, _id: i64, params: Value, _cancel: CancellationToken) -> MatchlockResult<Value> {
    let params: WriteFileParams = serde_json::from_value(params).map_err(|e| invalid_params("write_file", e))?;
    let sandbox = resolve_sandbox(&ctx, &params.id).await?;
    let data = base64_decode(&params.data).map_err(|e| invalid_params("write_file", e))?;
    vfs_client::write_file(&sandbox, &params.path, data).await?;
    Ok(serde_json::json!({}))
}

pub async fn read_file<W>(ctx: Arc<Ctx<W>>, _id: i64, params: Value, _cancel: CancellationToken) -> MatchlockResult<Value> {
    let params: ReadFileParams = serde_json::from_value(params).map_err(|e| invalid_params("read_file", e))?;
    let sandbox = resolve_sandbox(&ctx, &params.id).await?;
    let data = vfs_client::read_file(&sandbox, &params.path).await?;
    Ok(serde_json::to_value(ReadFileResult { data: base64_encode(&data) }).unwrap())
}

pub async fn list_files<W>(ctx: Arc<Ctx<W>>, _id: i64, params: Value, _cancel: CancellationToken) -> MatchlockResult<Value> {
    let params: ListFilesParams = serde_json::from_value(params).map_err(|e| invalid_params("list_files", e))?;
    let sandbox = resolve_sandbox(&ctx, &params.id).await?;
    let entries = vfs_client::list_files(&sandbox, &params.path).await?;
    Ok(serde_json::to_value(ListFilesResult {
        entries: entries
            .into_iter()
            .map(|e| DirEntryWire {
                name: e.name,
                file_type: match e.file_type {
                    FileType::File => "file",
                    FileType::Dir => "dir",
                    FileType::Symlink => "symlink",
                },
            })
            .collect(),
    })
    .unwrap())
}

pub async fn allow_list_add<W>(ctx: Arc<Ctx<W>>, _id: i64, params: Value, _cancel: CancellationToken) -> MatchlockResult<Value> {
    let params: AllowListParams = serde_json::from_value(params).map_err(|e| invalid_params("allow_list_add", e))?;
    let sandbox = resolve_sandbox(&ctx, &params.id).await?;
    let policy = sandbox.policy()?;
    let added = policy.add_allowed_hosts(&params.hosts);
    Ok(serde_json::to_value(AllowListAddResult {
        added,
        allowed_hosts: policy.allowed_hosts(),
    })
    .unwrap())
}

pub async fn allow_list_delete<W>(ctx: Arc<Ctx<W>>, _id: i64, params: Value, _cancel: CancellationToken) -> MatchlockResult<Value> {
    let params: AllowListParams = serde_json::from_value(params).map_err(|e| invalid_params("allow_list_delete", e))?;
    let sandbox = resolve_sandbox(&ctx, &params.id).await?;
    let policy = sandbox.policy()?;
    let removed = policy.remove_allowed_hosts(&params.hosts);
    Ok(serde_json::to_value(AllowListDeleteResult {
        removed,
        allowed_hosts: policy.allowed_hosts(),
    })
    .unwrap())
}

/// `port_forward`: rooted in the handler's own long-lived
/// `ctx.port_forwards` table rather than this call's own cancellation
/// token, so forwards outlive the call that installed them.
pub async fn port_forward<W>(ctx: Arc<Ctx<W>>, _id: i64, params: Value, _cancel: CancellationToken) -> MatchlockResult<Value> {
    let params: PortForwardParams = serde_json::from_value(params).map_err(|e| invalid_params("port_forward", e))?;
    let sandbox = resolve_sandbox(&ctx, &params.id).await?;
    let bindings = ctx.port_forwards.install(&sandbox, &params.bindings).await?;
    Ok(serde_json::to_value(PortForwardResult { bindings }).unwrap())
}
