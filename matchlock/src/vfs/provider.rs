//! The capability set every VFS layer (memory, hostfs, overlay, readonly,
//! router, interceptor) implements uniformly.

use async_trait::async_trait;

use super::types::{DirEntry, OpenFlags, Stat, VfsResult};

/// A stateless-from-the-caller's-view filesystem layer. Implementations
/// hold whatever locking they need internally; handles are opaque `u64`s
/// minted by the layer that owns the underlying open file.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn stat(&self, path: &str) -> VfsResult<Stat>;

    async fn readdir(&self, path: &str) -> VfsResult<Vec<DirEntry>>;

    /// Open an existing file, returning a handle for subsequent
    /// read/write/seek/truncate/sync/close calls.
    async fn open(&self, path: &str, flags: OpenFlags) -> VfsResult<u64>;

    async fn create(&self, path: &str, mode: u32) -> VfsResult<u64>;

    async fn mkdir(&self, path: &str, mode: u32) -> VfsResult<()>;

    async fn chmod(&self, path: &str, mode: u32) -> VfsResult<()>;

    async fn remove(&self, path: &str) -> VfsResult<()>;

    async fn remove_all(&self, path: &str) -> VfsResult<()>;

    /// Cross-provider renames are the router's concern (`EXDEV`); a single
    /// provider only ever sees renames within itself.
    async fn rename(&self, from: &str, to: &str) -> VfsResult<()>;

    async fn symlink(&self, target: &str, link_path: &str) -> VfsResult<()>;

    async fn readlink(&self, path: &str) -> VfsResult<String>;

    async fn read(&self, handle: u64, offset: u64, len: u32) -> VfsResult<Vec<u8>>;

    /// Returns the number of bytes accepted, which may be less than
    /// `data.len()` for the memory provider at its size budget.
    async fn write(&self, handle: u64, offset: u64, data: &[u8]) -> VfsResult<u32>;

    async fn truncate(&self, handle: u64, size: u64) -> VfsResult<()>;

    async fn sync(&self, handle: u64) -> VfsResult<()>;

    async fn close(&self, handle: u64) -> VfsResult<()>;
}
