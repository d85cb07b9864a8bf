//! Dispatch loop: reads line-delimited JSON-RPC requests
//! off one transport and writes responses/notifications to another through
//! the single serial [`OutputWriter`]. Holds every piece of per-process RPC
//! state: the sandbox registry, the cancellation table, the port-forward
//! table, and the stdin/resize routing tables for in-flight streaming
//! sessions.

use std::collections::HashMap;
use std::sync::Arc;

use matchlock_shared::MatchlockError;
use matchlock_shared::errors::rpc_protocol_codes::{INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::metrics::RuntimeMetrics;

use super::cancel::CancelTable;
use super::methods;
use super::params::{CancelParams, ResizeParams, StdinDataParams, StdinEofParams};
use super::port_forward::PortForwardTable;
use super::protocol::{RpcRequest, RpcResponse};
use super::registry::{RegistryDeps, SandboxRegistry};
use super::session_io::{ResizeCoalescer, SessionInput};
use super::writer::OutputWriter;

/// Maximum line length accepted off the request transport.
const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

pub struct Ctx<W> {
    pub registry: SandboxRegistry,
    pub deps: RegistryDeps,
    pub writer: Arc<OutputWriter<W>>,
    pub metrics: Arc<RuntimeMetrics>,
    pub cancel_table: CancelTable,
    pub port_forwards: PortForwardTable,
    pub stdin_table: Mutex<HashMap<i64, mpsc::Sender<SessionInput>>>,
    pub resize_table: Mutex<HashMap<i64, Arc<ResizeCoalescer>>>,
    /// `create`/`close` take the write side to drain in-flight work before
    /// running; every other spawned request holds a read guard
    /// for its whole lifetime.
    pub quiescence: RwLock<()>,
}

impl<W> Ctx<W> {
    pub fn new(deps: RegistryDeps, writer: OutputWriter<W>) -> Self {
        Self {
            registry: SandboxRegistry::new(),
            deps,
            writer: Arc::new(writer),
            metrics: Arc::new(RuntimeMetrics::new()),
            cancel_table: CancelTable::new(),
            port_forwards: PortForwardTable::new(),
            stdin_table: Mutex::new(HashMap::new()),
            resize_table: Mutex::new(HashMap::new()),
            quiescence: RwLock::new(()),
        }
    }
}

/// Drives the dispatch loop to completion (EOF on `input`, i.e.
/// disconnect). Ends every in-flight request on the way out: pipe sessions
/// and other calls have their cancellation token tripped; TTY sessions
/// instead see their stdin closed (EOF), per `handle_disconnect`.
pub async fn run<R, W>(ctx: Arc<Ctx<W>>, input: R)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + Sync + 'static,
{
    let mut lines = BufReader::new(input).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "RPC transport read error, ending session");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        if line.len() > MAX_LINE_BYTES {
            let _ = ctx.writer.send(RpcResponse::error(None, PARSE_ERROR, "request line exceeds maximum size")).await;
            continue;
        }

        let request: RpcRequest = match serde_json::from_str(&line) {
            Ok(req) => req,
            Err(e) => {
                let _ = ctx.writer.send(RpcResponse::error(None, PARSE_ERROR, format!("invalid JSON: {e}"))).await;
                continue;
            }
        };

        dispatch_line(&ctx, request).await;
    }

    handle_disconnect(&ctx).await;
}

async fn dispatch_line<W>(ctx: &Arc<Ctx<W>>, request: RpcRequest)
where
    W: AsyncWrite + Unpin + Send + Sync + 'static,
{
    match request.method.as_str() {
        // Bare notifications: no top-level id, target id lives in params.
        "exec_pipe.stdin" | "exec_tty.stdin" => {
            route_stdin_data(ctx, request.params).await;
            return;
        }
        "exec_pipe.stdin_eof" | "exec_tty.stdin_eof" => {
            route_stdin_eof(ctx, request.params).await;
            return;
        }
        "exec_tty.resize" => {
            route_resize(ctx, request.params).await;
            return;
        }
        _ => {}
    }

    if request.has_non_numeric_id() {
        let _ = ctx.writer.send(RpcResponse::error(None, INVALID_REQUEST, "id must be a JSON integer")).await;
        return;
    }
    let Some(id) = request.numeric_id() else {
        let _ = ctx.writer.send(RpcResponse::error(None, INVALID_REQUEST, "missing id")).await;
        return;
    };

    match request.method.as_str() {
        "cancel" => {
            let result = handle_cancel(ctx, request.params);
            let _ = ctx.writer.send(RpcResponse::success(id, result)).await;
        }
        "create" | "close" => {
            // Quiescence: exclusive guard drains every currently-spawned
            // read-guard-holding request before running.
            let _guard = ctx.quiescence.write().await;
            let outcome = match request.method.as_str() {
                "create" => methods::create(ctx, request.params).await,
                _ => methods::close(ctx, request.params).await,
            };
            send_outcome(ctx, id, outcome, ErrKindHint::Generic).await;
        }
        "exec" => spawn_call(ctx, id, request.params, ErrKindHint::Exec, methods::exec).await,
        "exec_stream" => spawn_call(ctx, id, request.params, ErrKindHint::Exec, methods::exec_stream).await,
        "exec_pipe" => spawn_call(ctx, id, request.params, ErrKindHint::Exec, methods::exec_pipe).await,
        "exec_tty" => spawn_call(ctx, id, request.params, ErrKindHint::Exec, methods::exec_tty).await,
        "write_file" => spawn_call(ctx, id, request.params, ErrKindHint::File, methods::write_file).await,
        "read_file" => spawn_call(ctx, id, request.params, ErrKindHint::File, methods::read_file).await,
        "list_files" => spawn_call(ctx, id, request.params, ErrKindHint::File, methods::list_files).await,
        "allow_list_add" => spawn_call(ctx, id, request.params, ErrKindHint::Generic, methods::allow_list_add).await,
        "allow_list_delete" => spawn_call(ctx, id, request.params, ErrKindHint::Generic, methods::allow_list_delete).await,
        "port_forward" => spawn_call(ctx, id, request.params, ErrKindHint::Generic, methods::port_forward).await,
        _ => {
            let _ = ctx.writer.send(RpcResponse::error(Some(id), METHOD_NOT_FOUND, format!("unknown method {}", request.method))).await;
        }
    }
}

/// Which numeric error-code table applies once a call fails: the generic
/// method table vs. the exec/file split (`MatchlockError::rpc_code` vs
/// `rpc_code_exec`).
#[derive(Clone, Copy)]
enum ErrKindHint {
    Generic,
    Exec,
    File,
}

fn error_code(hint: ErrKindHint, err: &MatchlockError) -> i64 {
    match hint {
        ErrKindHint::Exec => err.kind().rpc_code_exec(),
        ErrKindHint::Generic | ErrKindHint::File => err.rpc_code(),
    }
}

async fn send_outcome<W>(ctx: &Arc<Ctx<W>>, id: i64, outcome: matchlock_shared::MatchlockResult<serde_json::Value>, hint: ErrKindHint)
where
    W: AsyncWrite + Unpin + Send + Sync + 'static,
{
    let response = match outcome {
        Ok(value) => RpcResponse::success(id, value),
        Err(e) => RpcResponse::error(Some(id), error_code(hint, &e), e.to_string()),
    };
    let _ = ctx.writer.send(response).await;
}

/// Spawns a task for every method except `cancel`/`create`/`close`: holds a
/// read guard on quiescence for its whole lifetime, registers a fresh
/// cancellation token under `id`, runs `call`, sends the response, and
/// always removes the token.
async fn spawn_call<W, F, Fut>(ctx: &Arc<Ctx<W>>, id: i64, params: serde_json::Value, hint: ErrKindHint, call: F)
where
    W: AsyncWrite + Unpin + Send + Sync + 'static,
    F: FnOnce(Arc<Ctx<W>>, i64, serde_json::Value, tokio_util::sync::CancellationToken) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = matchlock_shared::MatchlockResult<serde_json::Value>> + Send,
{
    let ctx = ctx.clone();
    let cancel = ctx.cancel_table.register(id);
    tokio::spawn(async move {
        let _guard = ctx.quiescence.read().await;
        let outcome = call(ctx.clone(), id, params, cancel).await;
        ctx.cancel_table.remove(id);
        send_outcome(&ctx, id, outcome, hint).await;
    });
}

fn handle_cancel<W>(ctx: &Ctx<W>, params: serde_json::Value) -> serde_json::Value {
    let cancelled = match serde_json::from_value::<CancelParams>(params) {
        Ok(p) => ctx.cancel_table.cancel(p.id),
        Err(_) => false,
    };
    serde_json::to_value(super::params::CancelResult { cancelled }).unwrap()
}

async fn route_stdin_data<W>(ctx: &Ctx<W>, params: serde_json::Value) {
    let Ok(p) = serde_json::from_value::<StdinDataParams>(params) else {
        return;
    };
    let Ok(bytes) = base64_decode(&p.data) else {
        return;
    };
    if let Some(tx) = ctx.stdin_table.lock().await.get(&p.id) {
        let _ = tx.send(SessionInput::Data(bytes)).await;
    }
}

async fn route_stdin_eof<W>(ctx: &Ctx<W>, params: serde_json::Value) {
    let Ok(p) = serde_json::from_value::<StdinEofParams>(params) else {
        return;
    };
    if let Some(tx) = ctx.stdin_table.lock().await.get(&p.id) {
        let _ = tx.send(SessionInput::Eof).await;
    }
}

async fn route_resize<W>(ctx: &Ctx<W>, params: serde_json::Value) {
    let Ok(p) = serde_json::from_value::<ResizeParams>(params) else {
        return;
    };
    let coalescer = ctx.resize_table.lock().await.get(&p.id).cloned();
    if let Some(coalescer) = coalescer {
        coalescer.push(crate::vmm::ResizeEvent { rows: p.rows, cols: p.cols }).await;
    }
}

/// On transport disconnect, `exec_tty` sessions are identified by their
/// presence in `resize_table` (only `exec_tty` populates it) and are given
/// stdin EOF rather than a cancelled context, matching the asymmetry
/// between pipe and TTY disconnect handling: everything else (including
/// `exec_pipe`) has its token cancelled as usual.
async fn handle_disconnect<W>(ctx: &Arc<Ctx<W>>) {
    let tty_ids: std::collections::HashSet<i64> = ctx.resize_table.lock().await.keys().copied().collect();

    let stdin_table = ctx.stdin_table.lock().await;
    for id in &tty_ids {
        if let Some(tx) = stdin_table.get(id) {
            let _ = tx.send(SessionInput::Eof).await;
        }
    }
    drop(stdin_table);

    ctx.cancel_table.cancel_all_except(&tty_ids);
}

pub(super) fn base64_decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(s)
}

pub(super) fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[cfg(test)]
mod invalid_id_tests {
    use super::*;

    #[tokio::test]
    async fn non_numeric_id_on_a_result_bearing_method_is_rejected() {
        let (client, mut server) = tokio::io::duplex(1 << 16);
        let deps = RegistryDeps {
            backend: Arc::new(crate::vmm::ProcessBackend::new(vec!["true".into()])),
            subnet: crate::subnet::SubnetAllocator::new(),
            state_root: std::env::temp_dir(),
            kernel_path: Default::default(),
            initramfs_path: None,
            bootstrap_image: Default::default(),
            firewall: crate::supervisor::default_firewall(),
        };
        let ctx = Arc::new(Ctx::new(deps, OutputWriter::new(client)));

        let request = RpcRequest {
            jsonrpc: Some("2.0".into()),
            method: "exec".into(),
            params: serde_json::json!({}),
            id: Some(serde_json::json!("not-a-number")),
        };
        dispatch_line(&ctx, request).await;
        drop(ctx);

        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        let _ = server.read_to_end(&mut buf).await;
        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value["error"]["code"], INVALID_REQUEST);
    }
}
