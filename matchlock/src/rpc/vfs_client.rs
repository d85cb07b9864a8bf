//! `write_file`/`read_file`/`list_files` RPC methods speak the
//! same length-prefixed wire protocol the guest uses, dialed against the
//! sandbox's own VFS socket rather than reaching into its provider tree
//! directly -- the RPC handler is just another client of `VfsServer`,
//! same as the guest kernel driver would be.

use matchlock_shared::{MatchlockError, MatchlockResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::supervisor::Sandbox;
use crate::vfs::{DirEntry, OpenFlags, VfsOp, WireRequest, WireResponse};

async fn roundtrip(sandbox: &Sandbox, req: WireRequest) -> MatchlockResult<WireResponse> {
    let mut stream = sandbox.dial_vfs().await?;
    write_frame(&mut stream, &req).await?;
    read_frame(&mut stream).await
}

async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, req: &WireRequest) -> MatchlockResult<()> {
    let body = serde_json::to_vec(req)?;
    stream
        .write_all(&(body.len() as u32).to_le_bytes())
        .await
        .map_err(|e| MatchlockError::Vfs(format!("writing VFS request frame: {e}")))?;
    stream
        .write_all(&body)
        .await
        .map_err(|e| MatchlockError::Vfs(format!("writing VFS request body: {e}")))?;
    Ok(())
}

async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> MatchlockResult<WireResponse> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| MatchlockError::Vfs(format!("reading VFS response frame: {e}")))?;
    let len = u32::from_le_bytes(len_buf);
    let mut buf = vec![0u8; len as usize];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| MatchlockError::Vfs(format!("reading VFS response body: {e}")))?;
    serde_json::from_slice(&buf).map_err(|e| MatchlockError::Vfs(format!("parsing VFS response: {e}")))
}

fn fail_if_errno(resp: &WireResponse) -> MatchlockResult<()> {
    if let Some(errno) = resp.err {
        return Err(MatchlockError::Vfs(format!("VFS op failed with errno {errno}")));
    }
    Ok(())
}

fn bare_request(op: VfsOp, path: impl Into<String>) -> WireRequest {
    WireRequest {
        op,
        path: path.into(),
        new_path: None,
        handle: None,
        flags: OpenFlags::default(),
        mode: 0,
        offset: 0,
        len: 0,
        data: None,
    }
}

/// `write_file`: create-or-truncate then write the full buffer
/// in one call, so that `write_file(p,b); read_file(p) == b`
/// holds for any path in a writable mount.
pub async fn write_file(sandbox: &Sandbox, path: &str, data: Vec<u8>) -> MatchlockResult<()> {
    let create_req = WireRequest {
        flags: OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
        mode: 0o644,
        ..bare_request(VfsOp::Create, path)
    };
    let resp = roundtrip(sandbox, create_req).await?;
    fail_if_errno(&resp)?;
    let handle = resp
        .handle
        .ok_or_else(|| MatchlockError::Vfs("VFS create returned no handle".into()))?;

    let write_req = WireRequest {
        handle: Some(handle),
        data: Some(data),
        ..bare_request(VfsOp::Write, path)
    };
    let resp = roundtrip(sandbox, write_req).await;

    let close_req = bare_request(VfsOp::Close, path);
    let close_req = WireRequest {
        handle: Some(handle),
        ..close_req
    };
    let _ = roundtrip(sandbox, close_req).await;

    fail_if_errno(&resp?)
}

/// `read_file`: stat for size, then one read covering the
/// whole file.
pub async fn read_file(sandbox: &Sandbox, path: &str) -> MatchlockResult<Vec<u8>> {
    let stat_resp = roundtrip(sandbox, bare_request(VfsOp::Stat, path)).await?;
    fail_if_errno(&stat_resp)?;
    let size = stat_resp
        .stat
        .ok_or_else(|| MatchlockError::Vfs("VFS stat returned no metadata".into()))?
        .size;

    let open_req = WireRequest {
        flags: OpenFlags::READ,
        ..bare_request(VfsOp::Open, path)
    };
    let resp = roundtrip(sandbox, open_req).await?;
    fail_if_errno(&resp)?;
    let handle = resp
        .handle
        .ok_or_else(|| MatchlockError::Vfs("VFS open returned no handle".into()))?;

    let read_req = WireRequest {
        handle: Some(handle),
        len: size.min(u32::MAX as u64) as u32,
        ..bare_request(VfsOp::Read, path)
    };
    let resp = roundtrip(sandbox, read_req).await;

    let close_req = WireRequest {
        handle: Some(handle),
        ..bare_request(VfsOp::Close, path)
    };
    let _ = roundtrip(sandbox, close_req).await;

    let resp = resp?;
    fail_if_errno(&resp)?;
    Ok(resp.data.unwrap_or_default())
}

/// `list_files`: one `readdir` call, no handle lifecycle.
pub async fn list_files(sandbox: &Sandbox, path: &str) -> MatchlockResult<Vec<DirEntry>> {
    let resp = roundtrip(sandbox, bare_request(VfsOp::Readdir, path)).await?;
    fail_if_errno(&resp)?;
    Ok(resp.entries.unwrap_or_default())
}
