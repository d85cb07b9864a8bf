//! Wraps any provider, rejecting mutating operations with `EROFS`.

use async_trait::async_trait;
use std::sync::Arc;

use crate::vfs::provider::Provider;
use crate::vfs::types::{DirEntry, OpenFlags, Stat, VfsError, VfsResult};

pub struct Readonly {
    inner: Arc<dyn Provider>,
}

impl Readonly {
    pub fn new(inner: Arc<dyn Provider>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl Provider for Readonly {
    async fn stat(&self, path: &str) -> VfsResult<Stat> {
        self.inner.stat(path).await
    }

    async fn readdir(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        self.inner.readdir(path).await
    }

    async fn open(&self, path: &str, flags: OpenFlags) -> VfsResult<u64> {
        if flags.intersects(OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::APPEND) {
            return Err(VfsError::ReadOnly);
        }
        self.inner.open(path, flags).await
    }

    async fn create(&self, _path: &str, _mode: u32) -> VfsResult<u64> {
        Err(VfsError::ReadOnly)
    }

    async fn mkdir(&self, _path: &str, _mode: u32) -> VfsResult<()> {
        Err(VfsError::ReadOnly)
    }

    async fn chmod(&self, _path: &str, _mode: u32) -> VfsResult<()> {
        Err(VfsError::ReadOnly)
    }

    async fn remove(&self, _path: &str) -> VfsResult<()> {
        Err(VfsError::ReadOnly)
    }

    async fn remove_all(&self, _path: &str) -> VfsResult<()> {
        Err(VfsError::ReadOnly)
    }

    async fn rename(&self, _from: &str, _to: &str) -> VfsResult<()> {
        Err(VfsError::ReadOnly)
    }

    async fn symlink(&self, _target: &str, _link_path: &str) -> VfsResult<()> {
        Err(VfsError::ReadOnly)
    }

    async fn readlink(&self, path: &str) -> VfsResult<String> {
        self.inner.readlink(path).await
    }

    async fn read(&self, handle: u64, offset: u64, len: u32) -> VfsResult<Vec<u8>> {
        self.inner.read(handle, offset, len).await
    }

    async fn write(&self, _handle: u64, _offset: u64, _data: &[u8]) -> VfsResult<u32> {
        Err(VfsError::ReadOnly)
    }

    async fn truncate(&self, _handle: u64, _size: u64) -> VfsResult<()> {
        Err(VfsError::ReadOnly)
    }

    async fn sync(&self, handle: u64) -> VfsResult<()> {
        self.inner.sync(handle).await
    }

    async fn close(&self, handle: u64) -> VfsResult<()> {
        self.inner.close(handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::providers::Memory;

    #[tokio::test]
    async fn mutating_ops_are_rejected() {
        let mem = Arc::new(Memory::new(1024));
        mem.mkdir("/d", 0o755).await.unwrap();
        let ro = Readonly::new(mem);
        let err = ro.mkdir("/d2", 0o755).await.unwrap_err();
        assert_eq!(err, VfsError::ReadOnly);
    }
}
