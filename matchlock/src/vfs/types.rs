//! Wire and in-process types shared by every VFS provider and the server.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// POSIX-ish errno surfaced to the guest. The host never panics on a VFS
/// operation; every failure is reported as one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VfsError {
    NotFound,
    Exists,
    NotDir,
    IsDir,
    NotEmpty,
    NoSpace,
    ReadOnly,
    CrossDevice,
    InvalidArgument,
    PermissionDenied,
    Io,
}

impl VfsError {
    pub fn errno(self) -> i32 {
        match self {
            VfsError::NotFound => libc::ENOENT,
            VfsError::Exists => libc::EEXIST,
            VfsError::NotDir => libc::ENOTDIR,
            VfsError::IsDir => libc::EISDIR,
            VfsError::NotEmpty => libc::ENOTEMPTY,
            VfsError::NoSpace => libc::ENOSPC,
            VfsError::ReadOnly => libc::EROFS,
            VfsError::CrossDevice => libc::EXDEV,
            VfsError::InvalidArgument => libc::EINVAL,
            VfsError::PermissionDenied => libc::EACCES,
            VfsError::Io => libc::EIO,
        }
    }
}

pub type VfsResult<T> = Result<T, VfsError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    File,
    Dir,
    Symlink,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stat {
    pub file_type: FileType,
    pub size: u64,
    pub mode: u32,
    pub mtime_unix: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub file_type: FileType,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 0b0001;
        const WRITE = 0b0010;
        const CREATE = 0b0100;
        const TRUNCATE = 0b1000;
        const APPEND = 0b1_0000;
    }
}

impl Default for OpenFlags {
    fn default() -> Self {
        OpenFlags::READ
    }
}

impl Serialize for OpenFlags {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for OpenFlags {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bits = u32::deserialize(d)?;
        Ok(OpenFlags::from_bits_truncate(bits))
    }
}

/// The VFS operation kind a hook rule can match against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VfsOp {
    Stat,
    Readdir,
    Open,
    Create,
    Mkdir,
    Chmod,
    Remove,
    RemoveAll,
    Rename,
    Symlink,
    Readlink,
    Read,
    Write,
    Seek,
    Truncate,
    Sync,
    Close,
}

/// Normalized description of one provider call, handed to the hook engine.
#[derive(Debug, Clone)]
pub struct HookRequest {
    pub op: VfsOp,
    pub path: String,
    pub new_path: Option<String>,
    pub flags: Option<OpenFlags>,
    pub mode: Option<u32>,
    pub offset: Option<u64>,
    pub data: Option<Vec<u8>>,
}

impl HookRequest {
    pub fn new(op: VfsOp, path: impl Into<String>) -> Self {
        Self {
            op,
            path: path.into(),
            new_path: None,
            flags: None,
            mode: None,
            offset: None,
            data: None,
        }
    }
}

/// Wire request decoded off the VFS byte channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    pub op: VfsOp,
    pub path: String,
    pub new_path: Option<String>,
    pub handle: Option<u64>,
    #[serde(default)]
    pub flags: OpenFlags,
    #[serde(default)]
    pub mode: u32,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub len: u32,
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WireResponse {
    pub err: Option<i32>,
    pub handle: Option<u64>,
    pub stat: Option<Stat>,
    pub data: Option<Vec<u8>>,
    pub entries: Option<Vec<DirEntry>>,
}

impl WireResponse {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn err(e: VfsError) -> Self {
        Self {
            err: Some(e.errno()),
            ..Default::default()
        }
    }
}

/// Bookkeeping key type for mount bindings: `guest_path -> provider index`.
pub type MountTable = BTreeMap<String, usize>;
