//! VFS Server: accepts connections on the guest byte channel, decodes a
//! length-prefixed request, dispatches against the root provider, and
//! returns a length-prefixed response.
//!
//! Long-lived, accepts many concurrent connections (one task per
//! connection, mirroring the RPC handler's per-request task model), and
//! applies back-pressure per connection via a bounded in-flight request
//! count rather than an unbounded per-handle queue.

use matchlock_shared::{MatchlockError, MatchlockResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::sync::Semaphore;

use super::provider::Provider;
use super::types::{VfsError, VfsOp, WireRequest, WireResponse};

const MAX_INFLIGHT_PER_CONN: usize = 32;
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

pub struct VfsServer {
    root: Arc<dyn Provider>,
    stopped: Arc<AtomicBool>,
}

impl VfsServer {
    pub fn new(root: Arc<dyn Provider>) -> Self {
        Self {
            root,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the accept loop on `listener`. Returns a handle the
    /// supervisor uses to stop accepting new connections during cleanup.
    pub fn spawn_accept_loop(&self, listener: UnixListener) -> tokio::task::JoinHandle<()> {
        let root = self.root.clone();
        let stopped = self.stopped.clone();
        tokio::spawn(async move {
            loop {
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let root = root.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, root).await {
                                tracing::debug!(error = %e, "VFS connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        if stopped.load(Ordering::SeqCst) {
                            break;
                        }
                        tracing::warn!(error = %e, "VFS accept failed; retrying");
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

async fn handle_connection<S>(mut stream: S, root: Arc<dyn Provider>) -> MatchlockResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let inflight = Arc::new(Semaphore::new(MAX_INFLIGHT_PER_CONN));
    loop {
        let req = match read_frame(&mut stream).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(()),
            Err(e) => return Err(e),
        };

        let request: WireRequest = match serde_json::from_slice(&req) {
            Ok(r) => r,
            Err(e) => {
                let resp = WireResponse::err(VfsError::InvalidArgument);
                write_frame(&mut stream, &resp).await?;
                tracing::debug!(error = %e, "malformed VFS request frame");
                continue;
            }
        };

        let _permit = inflight.clone().acquire_owned().await.map_err(|e| {
            MatchlockError::Vfs(format!("in-flight semaphore closed: {e}"))
        })?;

        let response = dispatch(&root, request).await;
        write_frame(&mut stream, &response).await?;
    }
}

async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> MatchlockResult<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(MatchlockError::Vfs(format!("reading frame length: {e}"))),
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(MatchlockError::Vfs(format!(
            "frame of {len} bytes exceeds the {MAX_FRAME_BYTES}-byte limit"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| MatchlockError::Vfs(format!("reading frame body: {e}")))?;
    Ok(Some(buf))
}

async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, resp: &WireResponse) -> MatchlockResult<()> {
    let body = serde_json::to_vec(resp)?;
    stream
        .write_all(&(body.len() as u32).to_le_bytes())
        .await
        .map_err(|e| MatchlockError::Vfs(format!("writing frame length: {e}")))?;
    stream
        .write_all(&body)
        .await
        .map_err(|e| MatchlockError::Vfs(format!("writing frame body: {e}")))?;
    Ok(())
}

async fn dispatch(root: &Arc<dyn Provider>, req: WireRequest) -> WireResponse {
    match req.op {
        VfsOp::Stat => match root.stat(&req.path).await {
            Ok(stat) => WireResponse {
                stat: Some(stat),
                ..WireResponse::ok()
            },
            Err(e) => WireResponse::err(e),
        },
        VfsOp::Readdir => match root.readdir(&req.path).await {
            Ok(entries) => WireResponse {
                entries: Some(entries),
                ..WireResponse::ok()
            },
            Err(e) => WireResponse::err(e),
        },
        VfsOp::Open => match root.open(&req.path, req.flags).await {
            Ok(handle) => WireResponse {
                handle: Some(handle),
                ..WireResponse::ok()
            },
            Err(e) => WireResponse::err(e),
        },
        VfsOp::Create => match root.create(&req.path, req.mode).await {
            Ok(handle) => WireResponse {
                handle: Some(handle),
                ..WireResponse::ok()
            },
            Err(e) => WireResponse::err(e),
        },
        VfsOp::Mkdir => match root.mkdir(&req.path, req.mode).await {
            Ok(()) => WireResponse::ok(),
            Err(e) => WireResponse::err(e),
        },
        VfsOp::Chmod => match root.chmod(&req.path, req.mode).await {
            Ok(()) => WireResponse::ok(),
            Err(e) => WireResponse::err(e),
        },
        VfsOp::Remove => match root.remove(&req.path).await {
            Ok(()) => WireResponse::ok(),
            Err(e) => WireResponse::err(e),
        },
        VfsOp::RemoveAll => match root.remove_all(&req.path).await {
            Ok(()) => WireResponse::ok(),
            Err(e) => WireResponse::err(e),
        },
        VfsOp::Rename => {
            let Some(new_path) = req.new_path.as_deref() else {
                return WireResponse::err(VfsError::InvalidArgument);
            };
            match root.rename(&req.path, new_path).await {
                Ok(()) => WireResponse::ok(),
                Err(e) => WireResponse::err(e),
            }
        }
        VfsOp::Symlink => {
            let Some(new_path) = req.new_path.as_deref() else {
                return WireResponse::err(VfsError::InvalidArgument);
            };
            match root.symlink(new_path, &req.path).await {
                Ok(()) => WireResponse::ok(),
                Err(e) => WireResponse::err(e),
            }
        }
        VfsOp::Readlink => match root.readlink(&req.path).await {
            Ok(target) => WireResponse {
                data: Some(target.into_bytes()),
                ..WireResponse::ok()
            },
            Err(e) => WireResponse::err(e),
        },
        VfsOp::Read => {
            let Some(handle) = req.handle else {
                return WireResponse::err(VfsError::InvalidArgument);
            };
            match root.read(handle, req.offset, req.len).await {
                Ok(data) => WireResponse {
                    data: Some(data),
                    ..WireResponse::ok()
                },
                Err(e) => WireResponse::err(e),
            }
        }
        VfsOp::Write => {
            let Some(handle) = req.handle else {
                return WireResponse::err(VfsError::InvalidArgument);
            };
            let data = req.data.unwrap_or_default();
            match root.write(handle, req.offset, &data).await {
                Ok(n) => WireResponse {
                    data: Some(n.to_le_bytes().to_vec()),
                    ..WireResponse::ok()
                },
                Err(e) => WireResponse::err(e),
            }
        }
        VfsOp::Seek => WireResponse::ok(),
        VfsOp::Truncate => {
            let Some(handle) = req.handle else {
                return WireResponse::err(VfsError::InvalidArgument);
            };
            match root.truncate(handle, req.offset).await {
                Ok(()) => WireResponse::ok(),
                Err(e) => WireResponse::err(e),
            }
        }
        VfsOp::Sync => {
            let Some(handle) = req.handle else {
                return WireResponse::err(VfsError::InvalidArgument);
            };
            match root.sync(handle).await {
                Ok(()) => WireResponse::ok(),
                Err(e) => WireResponse::err(e),
            }
        }
        VfsOp::Close => {
            let Some(handle) = req.handle else {
                return WireResponse::err(VfsError::InvalidArgument);
            };
            match root.close(handle).await {
                Ok(()) => WireResponse::ok(),
                Err(e) => WireResponse::err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::providers::Memory;
    use crate::vfs::types::OpenFlags;
    use tokio::io::duplex;

    #[tokio::test]
    async fn create_write_read_over_wire() {
        let root: Arc<dyn Provider> = Arc::new(Memory::new(1 << 20));
        let (client, server) = duplex(64 * 1024);

        let task = tokio::spawn(handle_connection(server, root));

        let mut client = client;
        let create_req = WireRequest {
            op: VfsOp::Create,
            path: "/a.txt".into(),
            new_path: None,
            handle: None,
            flags: OpenFlags::default(),
            mode: 0o644,
            offset: 0,
            len: 0,
            data: None,
        };
        write_frame_client(&mut client, &create_req).await;
        let resp: WireResponse = read_frame_client(&mut client).await;
        assert_eq!(resp.err, None);
        let handle = resp.handle.unwrap();

        let write_req = WireRequest {
            op: VfsOp::Write,
            path: "/a.txt".into(),
            new_path: None,
            handle: Some(handle),
            flags: OpenFlags::default(),
            mode: 0,
            offset: 0,
            len: 0,
            data: Some(b"hello".to_vec()),
        };
        write_frame_client(&mut client, &write_req).await;
        let resp: WireResponse = read_frame_client(&mut client).await;
        assert_eq!(resp.err, None);

        drop(client);
        let _ = task.await;
    }

    async fn write_frame_client(stream: &mut (impl AsyncWrite + Unpin), req: &WireRequest) {
        let body = serde_json::to_vec(req).unwrap();
        stream.write_all(&(body.len() as u32).to_le_bytes()).await.unwrap();
        stream.write_all(&body).await.unwrap();
    }

    async fn read_frame_client(stream: &mut (impl AsyncRead + Unpin)) -> WireResponse {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_le_bytes(len_buf);
        let mut buf = vec![0u8; len as usize];
        stream.read_exact(&mut buf).await.unwrap();
        serde_json::from_slice(&buf).unwrap()
    }
}
