//! Upper/lower overlay: reads prefer upper then lower, writes to
//! non-upper files copy up before mutating, `readdir` merges names (upper
//! wins), and removes of lower-only entries are recorded as whiteouts
//! rather than mutating the lower.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::vfs::provider::Provider;
use crate::vfs::types::{DirEntry, OpenFlags, Stat, VfsError, VfsResult};

enum Side {
    Upper,
    Lower,
}

pub struct Overlay {
    upper: Arc<dyn Provider>,
    lower: Arc<dyn Provider>,
    whiteouts: Mutex<HashSet<String>>,
    handles: Mutex<BTreeMap<u64, (Side, u64)>>,
    next_handle: AtomicU64,
}

impl Overlay {
    pub fn new(upper: Arc<dyn Provider>, lower: Arc<dyn Provider>) -> Self {
        Self {
            upper,
            lower,
            whiteouts: Mutex::new(HashSet::new()),
            handles: Mutex::new(BTreeMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    fn is_whiteout(&self, path: &str) -> bool {
        self.whiteouts.lock().contains(path)
    }

    fn clear_whiteout(&self, path: &str) {
        self.whiteouts.lock().remove(path);
    }

    fn alloc(&self, side: Side, inner: u64) -> u64 {
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.handles.lock().insert(id, (side, inner));
        id
    }

    fn ensure_parent_dirs_upper(&self, path: &str) {
        // Best-effort: the upper provider is expected to already contain
        // the directory tree (it is materialized from the same host tree
        // the lower is rooted at); this is a no-op placeholder hook for
        // providers where directories must be created explicitly.
        let _ = path;
    }

    /// Copy a file from lower to upper so it can be mutated in place,
    /// preserving mode. No-op if already present upper-side.
    async fn copy_up(&self, path: &str) -> VfsResult<()> {
        if self.upper.stat(path).await.is_ok() {
            return Ok(());
        }
        let lower_stat = self.lower.stat(path).await?;
        self.ensure_parent_dirs_upper(path);

        let lower_handle = self.lower.open(path, OpenFlags::READ).await?;
        let upper_handle = self.upper.create(path, lower_stat.mode).await?;

        let mut offset = 0u64;
        const CHUNK: u32 = 1 << 20;
        loop {
            let data = self.lower.read(lower_handle, offset, CHUNK).await?;
            if data.is_empty() {
                break;
            }
            self.upper.write(upper_handle, offset, &data).await?;
            offset += data.len() as u64;
        }
        let _ = self.lower.close(lower_handle).await;
        self.upper.close(upper_handle).await?;
        self.clear_whiteout(path);
        Ok(())
    }
}

#[async_trait]
impl Provider for Overlay {
    async fn stat(&self, path: &str) -> VfsResult<Stat> {
        if self.is_whiteout(path) {
            return Err(VfsError::NotFound);
        }
        match self.upper.stat(path).await {
            Ok(st) => Ok(st),
            Err(VfsError::NotFound) => self.lower.stat(path).await,
            Err(e) => Err(e),
        }
    }

    async fn readdir(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        let mut merged: BTreeMap<String, DirEntry> = BTreeMap::new();

        if let Ok(entries) = self.lower.readdir(path).await {
            for entry in entries {
                let child_path = format!("{}/{}", path.trim_end_matches('/'), entry.name);
                if !self.is_whiteout(&child_path) {
                    merged.insert(entry.name.clone(), entry);
                }
            }
        }
        if let Ok(entries) = self.upper.readdir(path).await {
            for entry in entries {
                merged.insert(entry.name.clone(), entry);
            }
        }
        if merged.is_empty() && self.upper.stat(path).await.is_err() && self.lower.stat(path).await.is_err() {
            return Err(VfsError::NotFound);
        }
        Ok(merged.into_values().collect())
    }

    async fn open(&self, path: &str, flags: OpenFlags) -> VfsResult<u64> {
        if self.is_whiteout(path) {
            return Err(VfsError::NotFound);
        }
        if flags.contains(OpenFlags::WRITE) {
            self.copy_up(path).await.or_else(|e| {
                if e == VfsError::NotFound {
                    Ok(())
                } else {
                    Err(e)
                }
            })?;
        }
        if self.upper.stat(path).await.is_ok() {
            let h = self.upper.open(path, flags).await?;
            return Ok(self.alloc(Side::Upper, h));
        }
        let h = self.lower.open(path, flags).await?;
        Ok(self.alloc(Side::Lower, h))
    }

    async fn create(&self, path: &str, mode: u32) -> VfsResult<u64> {
        self.clear_whiteout(path);
        let h = self.upper.create(path, mode).await?;
        Ok(self.alloc(Side::Upper, h))
    }

    async fn mkdir(&self, path: &str, mode: u32) -> VfsResult<()> {
        self.clear_whiteout(path);
        self.upper.mkdir(path, mode).await
    }

    async fn chmod(&self, path: &str, mode: u32) -> VfsResult<()> {
        self.copy_up(path).await.or_else(|e| if e == VfsError::NotFound { Ok(()) } else { Err(e) })?;
        self.upper.chmod(path, mode).await
    }

    async fn remove(&self, path: &str) -> VfsResult<()> {
        let upper_exists = self.upper.stat(path).await.is_ok();
        let lower_exists = self.lower.stat(path).await.is_ok();
        if !upper_exists && !lower_exists {
            return Err(VfsError::NotFound);
        }
        if upper_exists {
            self.upper.remove(path).await?;
        }
        if lower_exists {
            self.whiteouts.lock().insert(path.to_string());
        }
        Ok(())
    }

    async fn remove_all(&self, path: &str) -> VfsResult<()> {
        let upper_exists = self.upper.stat(path).await.is_ok();
        let lower_exists = self.lower.stat(path).await.is_ok();
        if !upper_exists && !lower_exists {
            return Err(VfsError::NotFound);
        }
        if upper_exists {
            self.upper.remove_all(path).await?;
        }
        if lower_exists {
            self.whiteouts.lock().insert(path.to_string());
        }
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        self.copy_up(from).await.or_else(|e| if e == VfsError::NotFound { Ok(()) } else { Err(e) })?;
        self.upper.rename(from, to).await?;
        if self.lower.stat(from).await.is_ok() {
            self.whiteouts.lock().insert(from.to_string());
        }
        self.clear_whiteout(to);
        Ok(())
    }

    async fn symlink(&self, target: &str, link_path: &str) -> VfsResult<()> {
        self.clear_whiteout(link_path);
        self.upper.symlink(target, link_path).await
    }

    async fn readlink(&self, path: &str) -> VfsResult<String> {
        if self.is_whiteout(path) {
            return Err(VfsError::NotFound);
        }
        match self.upper.readlink(path).await {
            Ok(t) => Ok(t),
            Err(VfsError::NotFound) => self.lower.readlink(path).await,
            Err(e) => Err(e),
        }
    }

    async fn read(&self, handle: u64, offset: u64, len: u32) -> VfsResult<Vec<u8>> {
        let (side, inner) = self
            .handles
            .lock()
            .get(&handle)
            .map(|(s, i)| (matches!(s, Side::Upper), *i))
            .ok_or(VfsError::InvalidArgument)?;
        if side {
            self.upper.read(inner, offset, len).await
        } else {
            self.lower.read(inner, offset, len).await
        }
    }

    async fn write(&self, handle: u64, offset: u64, data: &[u8]) -> VfsResult<u32> {
        let (side, inner) = self
            .handles
            .lock()
            .get(&handle)
            .map(|(s, i)| (matches!(s, Side::Upper), *i))
            .ok_or(VfsError::InvalidArgument)?;
        if side {
            self.upper.write(inner, offset, data).await
        } else {
            Err(VfsError::ReadOnly)
        }
    }

    async fn truncate(&self, handle: u64, size: u64) -> VfsResult<()> {
        let (side, inner) = self
            .handles
            .lock()
            .get(&handle)
            .map(|(s, i)| (matches!(s, Side::Upper), *i))
            .ok_or(VfsError::InvalidArgument)?;
        if side {
            self.upper.truncate(inner, size).await
        } else {
            Err(VfsError::ReadOnly)
        }
    }

    async fn sync(&self, handle: u64) -> VfsResult<()> {
        let (side, inner) = self
            .handles
            .lock()
            .get(&handle)
            .map(|(s, i)| (matches!(s, Side::Upper), *i))
            .ok_or(VfsError::InvalidArgument)?;
        if side {
            self.upper.sync(inner).await
        } else {
            self.lower.sync(inner).await
        }
    }

    async fn close(&self, handle: u64) -> VfsResult<()> {
        let entry = self.handles.lock().remove(&handle);
        match entry {
            Some((Side::Upper, inner)) => self.upper.close(inner).await,
            Some((Side::Lower, inner)) => self.lower.close(inner).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::providers::Memory;

    async fn overlay_with_lower_file() -> (Overlay, &'static str) {
        let lower = Arc::new(Memory::new(1 << 20));
        let h = lower.create("/a.txt", 0o644).await.unwrap();
        lower.write(h, 0, b"lower-data").await.unwrap();
        lower.close(h).await.unwrap();
        let upper = Arc::new(Memory::new(1 << 20));
        (Overlay::new(upper, lower), "/a.txt")
    }

    #[tokio::test]
    async fn reads_fall_through_to_lower() {
        let (ov, path) = overlay_with_lower_file().await;
        let h = ov.open(path, OpenFlags::READ).await.unwrap();
        let data = ov.read(h, 0, 32).await.unwrap();
        assert_eq!(data, b"lower-data");
    }

    #[tokio::test]
    async fn write_copies_up_and_shadows_lower() {
        let (ov, path) = overlay_with_lower_file().await;
        let h = ov.open(path, OpenFlags::WRITE).await.unwrap();
        ov.write(h, 0, b"upper-data").await.unwrap();
        ov.close(h).await.unwrap();

        let h2 = ov.open(path, OpenFlags::READ).await.unwrap();
        let data = ov.read(h2, 0, 32).await.unwrap();
        assert_eq!(data, b"upper-data");
    }

    #[tokio::test]
    async fn remove_whiteouts_lower_entry() {
        let (ov, path) = overlay_with_lower_file().await;
        ov.remove(path).await.unwrap();
        let err = ov.stat(path).await.unwrap_err();
        assert_eq!(err, VfsError::NotFound);
    }
}
