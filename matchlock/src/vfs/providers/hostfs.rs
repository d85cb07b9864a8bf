//! Provider rooted at a host directory. Every guest path is treated as
//! sandbox-relative and resolved against `root`; paths that would escape
//! `root` (via `..` or a symlink) are rejected.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use tokio::fs::OpenOptionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::vfs::provider::Provider;
use crate::vfs::types::{DirEntry, FileType, OpenFlags, Stat, VfsError, VfsResult};

pub struct HostFs {
    root: PathBuf,
    handles: Mutex<BTreeMap<u64, PathBuf>>,
    next_handle: AtomicU64,
}

impl HostFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = std::fs::canonicalize(&root).unwrap_or(root);
        Self {
            root,
            handles: Mutex::new(BTreeMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Clean and join a guest-relative path under `root`, rejecting any
    /// component that would escape it — lexically (`..`) or through a
    /// symlink whose resolved target lands outside `root`.
    ///
    /// Every *ancestor* directory is dereferenced and checked as the path
    /// is built, so a symlinked parent can't walk the traversal outside
    /// `root`. The final component is left unresolved (callers need
    /// lstat-like semantics: `stat`/`readlink`/`remove` must see the
    /// symlink itself, not its target) but its target is still checked
    /// if it exists, since `open`/`read`/`write` dereference it via the
    /// OS and must not be allowed to follow it outside the sandbox.
    async fn resolve(&self, path: &str) -> VfsResult<PathBuf> {
        let parts: Vec<&std::ffi::OsStr> = Path::new(path.trim_start_matches('/'))
            .components()
            .map(|comp| match comp {
                Component::Normal(part) => Ok(Some(part)),
                Component::CurDir | Component::RootDir | Component::Prefix(_) => Ok(None),
                Component::ParentDir => Err(VfsError::PermissionDenied),
            })
            .collect::<VfsResult<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect();

        let mut parent = self.root.clone();
        if !parts.is_empty() {
            for part in &parts[..parts.len() - 1] {
                parent.push(part);
                parent = self.dereference_within_root(&parent).await?;
            }
        }

        let out = match parts.last() {
            Some(leaf) => parent.join(leaf),
            None => parent,
        };
        if fs::symlink_metadata(&out).await.map(|m| m.file_type().is_symlink()).unwrap_or(false) {
            self.dereference_within_root(&out).await?;
        }
        if !out.starts_with(&self.root) {
            return Err(VfsError::PermissionDenied);
        }
        Ok(out)
    }

    /// If `p` is a symlink, canonicalize it and reject a target outside
    /// `root`; otherwise return `p` unchanged.
    async fn dereference_within_root(&self, p: &Path) -> VfsResult<PathBuf> {
        match fs::symlink_metadata(p).await {
            Ok(meta) if meta.file_type().is_symlink() => {
                let real = fs::canonicalize(p).await.map_err(|e| Self::map_io_err(&e))?;
                if !real.starts_with(&self.root) {
                    return Err(VfsError::PermissionDenied);
                }
                Ok(real)
            }
            _ => Ok(p.to_path_buf()),
        }
    }

    fn map_io_err(e: &std::io::Error) -> VfsError {
        match e.kind() {
            std::io::ErrorKind::NotFound => VfsError::NotFound,
            std::io::ErrorKind::AlreadyExists => VfsError::Exists,
            std::io::ErrorKind::PermissionDenied => VfsError::PermissionDenied,
            _ => match e.raw_os_error() {
                Some(libc::ENOTDIR) => VfsError::NotDir,
                Some(libc::EISDIR) => VfsError::IsDir,
                Some(libc::ENOTEMPTY) => VfsError::NotEmpty,
                Some(libc::ENOSPC) => VfsError::NoSpace,
                _ => VfsError::Io,
            },
        }
    }

    fn alloc_handle(&self, path: PathBuf) -> u64 {
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.handles.lock().insert(id, path);
        id
    }

    fn handle_path(&self, handle: u64) -> VfsResult<PathBuf> {
        self.handles
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(VfsError::InvalidArgument)
    }
}

#[async_trait]
impl Provider for HostFs {
    async fn stat(&self, path: &str) -> VfsResult<Stat> {
        let p = self.resolve(path).await?;
        let meta = fs::symlink_metadata(&p).await.map_err(|e| Self::map_io_err(&e))?;
        let file_type = if meta.is_dir() {
            FileType::Dir
        } else if meta.file_type().is_symlink() {
            FileType::Symlink
        } else {
            FileType::File
        };
        Ok(Stat {
            file_type,
            size: meta.len(),
            mode: meta.permissions().mode() & 0o7777,
            mtime_unix: meta.mtime(),
        })
    }

    async fn readdir(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        let p = self.resolve(path).await?;
        let mut rd = fs::read_dir(&p).await.map_err(|e| Self::map_io_err(&e))?;
        let mut out = Vec::new();
        while let Some(entry) = rd.next_entry().await.map_err(|e| Self::map_io_err(&e))? {
            let ft = entry.file_type().await.map_err(|e| Self::map_io_err(&e))?;
            let file_type = if ft.is_dir() {
                FileType::Dir
            } else if ft.is_symlink() {
                FileType::Symlink
            } else {
                FileType::File
            };
            out.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                file_type,
            });
        }
        Ok(out)
    }

    async fn open(&self, path: &str, flags: OpenFlags) -> VfsResult<u64> {
        let p = self.resolve(path).await?;
        if flags.contains(OpenFlags::TRUNCATE) {
            let f = tokio::fs::OpenOptions::new()
                .write(true)
                .truncate(true)
                .open(&p)
                .await
                .map_err(|e| Self::map_io_err(&e))?;
            drop(f);
        } else {
            fs::metadata(&p).await.map_err(|e| Self::map_io_err(&e))?;
        }
        Ok(self.alloc_handle(p))
    }

    async fn create(&self, path: &str, mode: u32) -> VfsResult<u64> {
        let p = self.resolve(path).await?;
        let f = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&p)
            .await
            .map_err(|e| Self::map_io_err(&e))?;
        drop(f);
        Ok(self.alloc_handle(p))
    }

    async fn mkdir(&self, path: &str, mode: u32) -> VfsResult<()> {
        let p = self.resolve(path).await?;
        fs::create_dir(&p).await.map_err(|e| Self::map_io_err(&e))?;
        let mut perms = fs::metadata(&p).await.map_err(|e| Self::map_io_err(&e))?.permissions();
        perms.set_mode(mode);
        fs::set_permissions(&p, perms).await.map_err(|e| Self::map_io_err(&e))?;
        Ok(())
    }

    async fn chmod(&self, path: &str, mode: u32) -> VfsResult<()> {
        let p = self.resolve(path).await?;
        let mut perms = fs::metadata(&p).await.map_err(|e| Self::map_io_err(&e))?.permissions();
        perms.set_mode(mode);
        fs::set_permissions(&p, perms).await.map_err(|e| Self::map_io_err(&e))
    }

    async fn remove(&self, path: &str) -> VfsResult<()> {
        let p = self.resolve(path).await?;
        let meta = fs::symlink_metadata(&p).await.map_err(|e| Self::map_io_err(&e))?;
        if meta.is_dir() {
            fs::remove_dir(&p).await.map_err(|e| Self::map_io_err(&e))
        } else {
            fs::remove_file(&p).await.map_err(|e| Self::map_io_err(&e))
        }
    }

    async fn remove_all(&self, path: &str) -> VfsResult<()> {
        let p = self.resolve(path).await?;
        let meta = fs::symlink_metadata(&p).await.map_err(|e| Self::map_io_err(&e))?;
        if meta.is_dir() {
            fs::remove_dir_all(&p).await.map_err(|e| Self::map_io_err(&e))
        } else {
            fs::remove_file(&p).await.map_err(|e| Self::map_io_err(&e))
        }
    }

    async fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        let from_p = self.resolve(from).await?;
        let to_p = self.resolve(to).await?;
        fs::rename(&from_p, &to_p).await.map_err(|e| Self::map_io_err(&e))
    }

    async fn symlink(&self, target: &str, link_path: &str) -> VfsResult<()> {
        let link_p = self.resolve(link_path).await?;
        tokio::fs::symlink(target, &link_p)
            .await
            .map_err(|e| Self::map_io_err(&e))
    }

    async fn readlink(&self, path: &str) -> VfsResult<String> {
        let p = self.resolve(path).await?;
        let target = fs::read_link(&p).await.map_err(|e| Self::map_io_err(&e))?;
        Ok(target.to_string_lossy().into_owned())
    }

    async fn read(&self, handle: u64, offset: u64, len: u32) -> VfsResult<Vec<u8>> {
        let p = self.handle_path(handle)?;
        let mut f = fs::File::open(&p).await.map_err(|e| Self::map_io_err(&e))?;
        f.seek(std::io::SeekFrom::Start(offset)).await.map_err(|e| Self::map_io_err(&e))?;
        let mut buf = vec![0u8; len as usize];
        let n = f.read(&mut buf).await.map_err(|e| Self::map_io_err(&e))?;
        buf.truncate(n);
        Ok(buf)
    }

    async fn write(&self, handle: u64, offset: u64, data: &[u8]) -> VfsResult<u32> {
        let p = self.handle_path(handle)?;
        let mut f = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&p)
            .await
            .map_err(|e| Self::map_io_err(&e))?;
        f.seek(std::io::SeekFrom::Start(offset)).await.map_err(|e| Self::map_io_err(&e))?;
        f.write_all(data).await.map_err(|e| Self::map_io_err(&e))?;
        Ok(data.len() as u32)
    }

    async fn truncate(&self, handle: u64, size: u64) -> VfsResult<()> {
        let p = self.handle_path(handle)?;
        let f = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&p)
            .await
            .map_err(|e| Self::map_io_err(&e))?;
        f.set_len(size).await.map_err(|e| Self::map_io_err(&e))
    }

    async fn sync(&self, handle: u64) -> VfsResult<()> {
        let p = self.handle_path(handle)?;
        let f = fs::File::open(&p).await.map_err(|e| Self::map_io_err(&e))?;
        f.sync_all().await.map_err(|e| Self::map_io_err(&e))
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
    async fn rejects_escaping_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let hfs = HostFs::new(tmp.path());
        let err = hfs.stat("../../etc/passwd").await.unwrap_err();
        assert_eq!(err, VfsError::PermissionDenied);
    }

    #[tokio::test]
    async fn rejects_symlink_escaping_sandbox() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), b"nope").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), tmp.path().join("link")).unwrap();

        let hfs = HostFs::new(tmp.path());
        let err = hfs.open("/link", OpenFlags::READ).await.unwrap_err();
        assert_eq!(err, VfsError::PermissionDenied);
    }

    #[tokio::test]
    async fn stat_reports_symlink_itself() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("real"), b"hi").unwrap();
        std::os::unix::fs::symlink(tmp.path().join("real"), tmp.path().join("link")).unwrap();

        let hfs = HostFs::new(tmp.path());
        let stat = hfs.stat("/link").await.unwrap();
        assert_eq!(stat.file_type, FileType::Symlink);
    }

    #[tokio::test]
    async fn write_read_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let hfs = HostFs::new(tmp.path());
        let h = hfs.create("/a.txt", 0o644).await.unwrap();
        hfs.write(h, 0, b"hi").await.unwrap();
        hfs.close(h).await.unwrap();

        let h2 = hfs.open("/a.txt", OpenFlags::READ).await.unwrap();
        let data = hfs.read(h2, 0, 2).await.unwrap();
        assert_eq!(data, b"hi");
    }
}
