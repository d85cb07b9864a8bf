//! In-process tree-backed provider with a configurable size budget.
//!
//! Thread-safe: distinct files hold independent locks (a `Mutex` per node),
//! so concurrent writers to different files never contend. Chmod persists
//! across opens; rename preserves mode.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::vfs::provider::Provider;
use crate::vfs::types::{DirEntry, FileType, OpenFlags, Stat, VfsError, VfsResult};

struct FileNode {
    data: Vec<u8>,
    mode: u32,
    mtime_unix: i64,
}

enum Node {
    File(Mutex<FileNode>),
    Dir(Mutex<BTreeMap<String, Arc<Node>>>),
    Symlink(String),
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

struct OpenHandle {
    node: Arc<Node>,
}

/// In-memory filesystem bounded by `budget_bytes` of total file data.
pub struct Memory {
    root: Arc<Node>,
    budget_bytes: u64,
    used_bytes: AtomicU64,
    handles: Mutex<BTreeMap<u64, OpenHandle>>,
    next_handle: AtomicU64,
}

impl Memory {
    pub fn new(budget_bytes: u64) -> Self {
        Self {
            root: Arc::new(Node::Dir(Mutex::new(BTreeMap::new()))),
            budget_bytes,
            used_bytes: AtomicU64::new(0),
            handles: Mutex::new(BTreeMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    fn resolve(&self, path: &str) -> VfsResult<Arc<Node>> {
        let parts = split_path(path);
        let mut cur = self.root.clone();
        for part in parts {
            match &*cur {
                Node::Dir(children) => {
                    let next = children
                        .lock()
                        .get(part)
                        .cloned()
                        .ok_or(VfsError::NotFound)?;
                    cur = next;
                }
                Node::File(_) | Node::Symlink(_) => return Err(VfsError::NotDir),
            }
        }
        Ok(cur)
    }

    fn resolve_parent<'a>(&self, path: &'a str) -> VfsResult<(Arc<Node>, &'a str)> {
        let parts = split_path(path);
        let name = parts.last().copied().ok_or(VfsError::InvalidArgument)?;
        let parent_path = &path[..path.rfind(name).unwrap_or(0)];
        let parent = self.resolve(parent_path)?;
        if !matches!(&*parent, Node::Dir(_)) {
            return Err(VfsError::NotDir);
        }
        Ok((parent, name))
    }

    fn alloc_handle(&self, node: Arc<Node>) -> u64 {
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.handles.lock().insert(id, OpenHandle { node });
        id
    }

    fn handle_node(&self, handle: u64) -> VfsResult<Arc<Node>> {
        self.handles
            .lock()
            .get(&handle)
            .map(|h| h.node.clone())
            .ok_or(VfsError::InvalidArgument)
    }
}

#[async_trait]
impl Provider for Memory {
    async fn stat(&self, path: &str) -> VfsResult<Stat> {
        let node = self.resolve(path)?;
        Ok(match &*node {
            Node::File(f) => {
                let f = f.lock();
                Stat {
                    file_type: FileType::File,
                    size: f.data.len() as u64,
                    mode: f.mode,
                    mtime_unix: f.mtime_unix,
                }
            }
            Node::Dir(_) => Stat {
                file_type: FileType::Dir,
                size: 0,
                mode: 0o755,
                mtime_unix: now(),
            },
            Node::Symlink(target) => Stat {
                file_type: FileType::Symlink,
                size: target.len() as u64,
                mode: 0o777,
                mtime_unix: now(),
            },
        })
    }

    async fn readdir(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        let node = self.resolve(path)?;
        match &*node {
            Node::Dir(children) => Ok(children
                .lock()
                .iter()
                .map(|(name, node)| DirEntry {
                    name: name.clone(),
                    file_type: match &**node {
                        Node::File(_) => FileType::File,
                        Node::Dir(_) => FileType::Dir,
                        Node::Symlink(_) => FileType::Symlink,
                    },
                })
                .collect()),
            _ => Err(VfsError::NotDir),
        }
    }

    async fn open(&self, path: &str, flags: OpenFlags) -> VfsResult<u64> {
        let node = self.resolve(path)?;
        if flags.contains(OpenFlags::TRUNCATE) {
            if let Node::File(f) = &*node {
                let mut f = f.lock();
                self.used_bytes
                    .fetch_sub(f.data.len() as u64, Ordering::SeqCst);
                f.data.clear();
            }
        }
        Ok(self.alloc_handle(node))
    }

    async fn create(&self, path: &str, mode: u32) -> VfsResult<u64> {
        let (parent, name) = self.resolve_parent(path)?;
        let Node::Dir(children) = &*parent else {
            return Err(VfsError::NotDir);
        };
        let mut children = children.lock();
        if children.contains_key(name) {
            return Err(VfsError::Exists);
        }
        let node = Arc::new(Node::File(Mutex::new(FileNode {
            data: Vec::new(),
            mode,
            mtime_unix: now(),
        })));
        children.insert(name.to_string(), node.clone());
        Ok(self.alloc_handle(node))
    }

    async fn mkdir(&self, path: &str, _mode: u32) -> VfsResult<()> {
        let (parent, name) = self.resolve_parent(path)?;
        let Node::Dir(children) = &*parent else {
            return Err(VfsError::NotDir);
        };
        let mut children = children.lock();
        if children.contains_key(name) {
            return Err(VfsError::Exists);
        }
        children.insert(name.to_string(), Arc::new(Node::Dir(Mutex::new(BTreeMap::new()))));
        Ok(())
    }

    async fn chmod(&self, path: &str, mode: u32) -> VfsResult<()> {
        let node = self.resolve(path)?;
        match &*node {
            Node::File(f) => {
                f.lock().mode = mode;
                Ok(())
            }
            Node::Dir(_) => Ok(()),
            Node::Symlink(_) => Err(VfsError::InvalidArgument),
        }
    }

    async fn remove(&self, path: &str) -> VfsResult<()> {
        let (parent, name) = self.resolve_parent(path)?;
        let Node::Dir(children) = &*parent else {
            return Err(VfsError::NotDir);
        };
        let mut children = children.lock();
        match children.get(name).map(|n| &**n) {
            None => Err(VfsError::NotFound),
            Some(Node::Dir(c)) if !c.lock().is_empty() => Err(VfsError::NotEmpty),
            Some(Node::File(f)) => {
                let size = f.lock().data.len() as u64;
                self.used_bytes.fetch_sub(size, Ordering::SeqCst);
                children.remove(name);
                Ok(())
            }
            Some(_) => {
                children.remove(name);
                Ok(())
            }
        }
    }

    async fn remove_all(&self, path: &str) -> VfsResult<()> {
        let (parent, name) = self.resolve_parent(path)?;
        let Node::Dir(children) = &*parent else {
            return Err(VfsError::NotDir);
        };
        let mut children = children.lock();
        if children.remove(name).is_none() {
            return Err(VfsError::NotFound);
        }
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        let (from_parent, from_name) = self.resolve_parent(from)?;
        let node = {
            let Node::Dir(children) = &*from_parent else {
                return Err(VfsError::NotDir);
            };
            children
                .lock()
                .remove(from_name)
                .ok_or(VfsError::NotFound)?
        };
        let (to_parent, to_name) = self.resolve_parent(to)?;
        let Node::Dir(children) = &*to_parent else {
            return Err(VfsError::NotDir);
        };
        children.lock().insert(to_name.to_string(), node);
        Ok(())
    }

    async fn symlink(&self, target: &str, link_path: &str) -> VfsResult<()> {
        let (parent, name) = self.resolve_parent(link_path)?;
        let Node::Dir(children) = &*parent else {
            return Err(VfsError::NotDir);
        };
        let mut children = children.lock();
        if children.contains_key(name) {
            return Err(VfsError::Exists);
        }
        children.insert(name.to_string(), Arc::new(Node::Symlink(target.to_string())));
        Ok(())
    }

    async fn readlink(&self, path: &str) -> VfsResult<String> {
        match &*self.resolve(path)? {
            Node::Symlink(target) => Ok(target.clone()),
            _ => Err(VfsError::InvalidArgument),
        }
    }

    async fn read(&self, handle: u64, offset: u64, len: u32) -> VfsResult<Vec<u8>> {
        let node = self.handle_node(handle)?;
        let Node::File(f) = &*node else {
            return Err(VfsError::IsDir);
        };
        let f = f.lock();
        let offset = offset as usize;
        if offset >= f.data.len() {
            return Ok(Vec::new());
        }
        let end = (offset + len as usize).min(f.data.len());
        Ok(f.data[offset..end].to_vec())
    }

    async fn write(&self, handle: u64, offset: u64, data: &[u8]) -> VfsResult<u32> {
        let node = self.handle_node(handle)?;
        let Node::File(f) = &*node else {
            return Err(VfsError::IsDir);
        };
        let mut f = f.lock();
        let offset = offset as usize;
        let needed_end = offset + data.len();
        let current_len = f.data.len();
        let grow = needed_end.saturating_sub(current_len) as u64;

        let used = self.used_bytes.load(Ordering::SeqCst);
        let allowed_growth = self.budget_bytes.saturating_sub(used);
        let (accepted_len, truncated) = if grow > allowed_growth {
            let allowed_write_len = (data.len() as u64).saturating_sub(grow - allowed_growth);
            (allowed_write_len as usize, true)
        } else {
            (data.len(), false)
        };

        if accepted_len == 0 && !data.is_empty() {
            return Err(VfsError::NoSpace);
        }

        if needed_end > current_len {
            f.data.resize(offset + accepted_len.min(data.len()), 0);
        }
        let write_slice = &data[..accepted_len];
        let end = offset + write_slice.len();
        if end > f.data.len() {
            f.data.resize(end, 0);
        }
        f.data[offset..end].copy_from_slice(write_slice);
        f.mtime_unix = now();

        let new_len = f.data.len() as u64;
        let delta = new_len as i64 - current_len as i64;
        if delta > 0 {
            self.used_bytes.fetch_add(delta as u64, Ordering::SeqCst);
        } else if delta < 0 {
            self.used_bytes.fetch_sub((-delta) as u64, Ordering::SeqCst);
        }

        if truncated && accepted_len < data.len() {
            return Err(VfsError::NoSpace);
        }
        Ok(accepted_len as u32)
    }

    async fn truncate(&self, handle: u64, size: u64) -> VfsResult<()> {
        let node = self.handle_node(handle)?;
        let Node::File(f) = &*node else {
            return Err(VfsError::IsDir);
        };
        let mut f = f.lock();
        let old = f.data.len() as u64;
        f.data.resize(size as usize, 0);
        if size > old {
            self.used_bytes.fetch_add(size - old, Ordering::SeqCst);
        } else {
            self.used_bytes.fetch_sub(old - size, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn sync(&self, _handle: u64) -> VfsResult<()> {
        Ok(())
    }

    async fn close(&self, handle: u64) -> VfsResult<()> {
        self.handles.lock().remove(&handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_write_read_roundtrip() {
        let mem = Memory::new(1024);
        let h = mem.create("/a.txt", 0o644).await.unwrap();
        let n = mem.write(h, 0, b"hello").await.unwrap();
        assert_eq!(n, 5);
        let data = mem.read(h, 0, 5).await.unwrap();
        assert_eq!(data, b"hello");
        mem.close(h).await.unwrap();
    }

    #[tokio::test]
    async fn enospc_on_overrun() {
        let mem = Memory::new(4);
        let h = mem.create("/a.txt", 0o644).await.unwrap();
        let err = mem.write(h, 0, b"hello").await.unwrap_err();
        assert_eq!(err, VfsError::NoSpace);
    }

    #[tokio::test]
    async fn chmod_persists_rename_preserves_mode() {
        let mem = Memory::new(1024);
        mem.create("/a.txt", 0o644).await.unwrap();
        mem.chmod("/a.txt", 0o600).await.unwrap();
        mem.rename("/a.txt", "/b.txt").await.unwrap();
        let st = mem.stat("/b.txt").await.unwrap();
        assert_eq!(st.mode, 0o600);
    }

    #[tokio::test]
    async fn remove_nonempty_dir_fails() {
        let mem = Memory::new(1024);
        mem.mkdir("/d", 0o755).await.unwrap();
        mem.create("/d/f", 0o644).await.unwrap();
        let err = mem.remove("/d").await.unwrap_err();
        assert_eq!(err, VfsError::NotEmpty);
    }
}
