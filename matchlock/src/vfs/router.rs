//! Longest-prefix-match mount router.
//!
//! Mounts are copy-on-write: every mutation builds a new sorted vector and
//! atomically swaps it in, so in-flight lookups never observe a partial
//! update.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::provider::Provider;
use super::types::{DirEntry, FileType, OpenFlags, Stat, VfsError, VfsResult};

#[derive(Clone)]
struct Binding {
    guest_path: String,
    provider: Arc<dyn Provider>,
}

/// Dispatches VFS calls to the provider whose mount point is the longest
/// matching prefix of the request path, and fabricates synthetic directory
/// entries for nested mount points so they're visible even when the base
/// provider has no directory at that path.
///
/// Handles are router-minted: two different mounted providers may both
/// hand back `1` for their own first open, so the router maps its own
/// handle ids to `(provider, provider's handle)` rather than forwarding
/// inner handles directly.
pub struct MountRouter {
    bindings: Mutex<Arc<Vec<Binding>>>,
    handles: Mutex<BTreeMap<u64, (Arc<dyn Provider>, u64)>>,
    next_handle: AtomicU64,
}

fn normalize(path: &str) -> String {
    if path.is_empty() {
        "/".to_string()
    } else if path.starts_with('/') {
        path.trim_end_matches('/').to_string()
    } else {
        format!("/{}", path.trim_end_matches('/'))
    }
    .replace("//", "/")
}

impl MountRouter {
    pub fn new() -> Self {
        Self {
            bindings: Mutex::new(Arc::new(Vec::new())),
            handles: Mutex::new(BTreeMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    fn alloc_handle(&self, provider: Arc<dyn Provider>, inner_handle: u64) -> u64 {
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.handles.lock().insert(id, (provider, inner_handle));
        id
    }

    fn handle_entry(&self, handle: u64) -> VfsResult<(Arc<dyn Provider>, u64)> {
        self.handles.lock().get(&handle).cloned().ok_or(VfsError::InvalidArgument)
    }

    /// Add (or replace) a mount binding. Call before serving traffic;
    /// runtime mount changes reuse the same copy-on-write swap.
    pub fn mount(&self, guest_path: impl Into<String>, provider: Arc<dyn Provider>) {
        let guest_path = normalize(&guest_path.into());
        let mut bindings = (*self.bindings.lock()).as_ref().clone();
        bindings.retain(|b| b.guest_path != guest_path);
        bindings.push(Binding {
            guest_path,
            provider,
        });
        bindings.sort_by(|a, b| b.guest_path.len().cmp(&a.guest_path.len()));
        *self.bindings.lock() = Arc::new(bindings);
    }

    fn snapshot(&self) -> Arc<Vec<Binding>> {
        self.bindings.lock().clone()
    }

    /// Resolve `path` to its mount's provider and the path relative to
    /// that mount (`/` if the path *is* the mount root).
    fn resolve(&self, path: &str) -> VfsResult<(Arc<dyn Provider>, String)> {
        let path = normalize(path);
        let bindings = self.snapshot();
        for binding in bindings.iter() {
            if binding.guest_path == "/" {
                continue;
            }
            if path == binding.guest_path {
                return Ok((binding.provider.clone(), "/".to_string()));
            }
            if let Some(rest) = path.strip_prefix(&binding.guest_path) {
                if rest.starts_with('/') {
                    return Ok((binding.provider.clone(), rest.to_string()));
                }
            }
        }
        for binding in bindings.iter() {
            if binding.guest_path == "/" {
                return Ok((binding.provider.clone(), path));
            }
        }
        Err(VfsError::NotFound)
    }

    /// Direct children of `path` among all mount points, used to fabricate
    /// synthetic directory entries in `readdir`.
    fn child_mounts(&self, path: &str) -> Vec<String> {
        let path = normalize(path);
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let bindings = self.snapshot();
        let mut names = Vec::new();
        for binding in bindings.iter() {
            if binding.guest_path == "/" || binding.guest_path == path {
                continue;
            }
            if let Some(rest) = binding.guest_path.strip_prefix(&prefix) {
                if let Some((first, _)) = rest.split_once('/') {
                    if !first.is_empty() {
                        names.push(first.to_string());
                    }
                } else if !rest.is_empty() {
                    names.push(rest.to_string());
                }
            }
        }
        names.sort();
        names.dedup();
        names
    }
}

impl Default for MountRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MountRouter {
    async fn stat(&self, path: &str) -> VfsResult<Stat> {
        let (provider, rel) = self.resolve(path)?;
        provider.stat(&rel).await
    }

    async fn readdir(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        let (provider, rel) = self.resolve(path)?;
        let mut entries = provider.readdir(&rel).await.unwrap_or_default();
        let existing: std::collections::HashSet<_> =
            entries.iter().map(|e| e.name.clone()).collect();
        for name in self.child_mounts(path) {
            if !existing.contains(&name) {
                entries.push(DirEntry {
                    name,
                    file_type: FileType::Dir,
                });
            }
        }
        Ok(entries)
    }

    async fn open(&self, path: &str, flags: OpenFlags) -> VfsResult<u64> {
        let (provider, rel) = self.resolve(path)?;
        let inner_handle = provider.open(&rel, flags).await?;
        Ok(self.alloc_handle(provider, inner_handle))
    }

    async fn create(&self, path: &str, mode: u32) -> VfsResult<u64> {
        let (provider, rel) = self.resolve(path)?;
        let inner_handle = provider.create(&rel, mode).await?;
        Ok(self.alloc_handle(provider, inner_handle))
    }

    async fn mkdir(&self, path: &str, mode: u32) -> VfsResult<()> {
        let (provider, rel) = self.resolve(path)?;
        provider.mkdir(&rel, mode).await
    }

    async fn chmod(&self, path: &str, mode: u32) -> VfsResult<()> {
        let (provider, rel) = self.resolve(path)?;
        provider.chmod(&rel, mode).await
    }

    async fn remove(&self, path: &str) -> VfsResult<()> {
        let (provider, rel) = self.resolve(path)?;
        provider.remove(&rel).await
    }

    async fn remove_all(&self, path: &str) -> VfsResult<()> {
        let (provider, rel) = self.resolve(path)?;
        provider.remove_all(&rel).await
    }

    async fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        let (from_provider, from_rel) = self.resolve(from)?;
        let (to_provider, to_rel) = self.resolve(to)?;
        if !Arc::ptr_eq(&from_provider, &to_provider) {
            return Err(VfsError::CrossDevice);
        }
        from_provider.rename(&from_rel, &to_rel).await
    }

    async fn symlink(&self, target: &str, link_path: &str) -> VfsResult<()> {
        let (provider, rel) = self.resolve(link_path)?;
        provider.symlink(target, &rel).await
    }

    async fn readlink(&self, path: &str) -> VfsResult<String> {
        let (provider, rel) = self.resolve(path)?;
        provider.readlink(&rel).await
    }

    async fn read(&self, handle: u64, offset: u64, len: u32) -> VfsResult<Vec<u8>> {
        let (provider, inner) = self.handle_entry(handle)?;
        provider.read(inner, offset, len).await
    }

    async fn write(&self, handle: u64, offset: u64, data: &[u8]) -> VfsResult<u32> {
        let (provider, inner) = self.handle_entry(handle)?;
        provider.write(inner, offset, data).await
    }

    async fn truncate(&self, handle: u64, size: u64) -> VfsResult<()> {
        let (provider, inner) = self.handle_entry(handle)?;
        provider.truncate(inner, size).await
    }

    async fn sync(&self, handle: u64) -> VfsResult<()> {
        let (provider, inner) = self.handle_entry(handle)?;
        provider.sync(inner).await
    }

    async fn close(&self, handle: u64) -> VfsResult<()> {
        let (provider, inner) = match self.handles.lock().remove(&handle) {
            Some(entry) => entry,
            None => return Ok(()),
        };
        provider.close(inner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::providers::Memory;

    #[tokio::test]
    async fn longest_prefix_wins() {
        let router = MountRouter::new();
        router.mount("/", Arc::new(Memory::new(1 << 20)));
        router.mount("/data", Arc::new(Memory::new(1 << 20)));

        router.create("/data/a.txt", 0o644).await.unwrap();
        let (provider, rel) = router.resolve("/data/a.txt").unwrap();
        assert_eq!(rel, "/a.txt");
        provider.stat("/a.txt").await.unwrap();
    }

    #[tokio::test]
    async fn readdir_fabricates_mount_points() {
        let router = MountRouter::new();
        router.mount("/", Arc::new(Memory::new(1 << 20)));
        router.mount("/mnt/data", Arc::new(Memory::new(1 << 20)));

        let entries = router.readdir("/mnt").await.unwrap();
        assert!(entries.iter().any(|e| e.name == "data"));
    }

    #[tokio::test]
    async fn cross_provider_rename_is_exdev() {
        let router = MountRouter::new();
        router.mount("/", Arc::new(Memory::new(1 << 20)));
        router.mount("/data", Arc::new(Memory::new(1 << 20)));
        router.create("/a.txt", 0o644).await.unwrap();

        let err = router.rename("/a.txt", "/data/a.txt").await.unwrap_err();
        assert_eq!(err, VfsError::CrossDevice);
    }
}
