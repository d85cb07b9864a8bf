//! Per-sandbox state directory: `<state_root>/<vm-id>/`.

use matchlock_shared::{MatchlockError, MatchlockResult, SandboxId};
use std::path::{Path, PathBuf};

/// Owns the on-disk directory a sandbox's config, lifecycle journal, disk
/// images, overlay snapshots and sockets live under.
///
/// `register` is the single entry point that creates the directory;
/// `unregister` is the only path that removes it. Both are idempotent in
/// the direction that matters for cleanup: unregistering an already-absent
/// directory is not an error.
#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn register(state_root: &Path, vm_id: &SandboxId) -> MatchlockResult<Self> {
        let root = state_root.join(vm_id.as_str());
        if root.exists() {
            return Err(MatchlockError::State(format!(
                "state directory already exists for {vm_id}: {}",
                root.display()
            )));
        }
        std::fs::create_dir_all(&root)
            .map_err(|e| MatchlockError::State(format!("creating state dir {}: {e}", root.display())))?;
        Ok(Self { root })
    }

    pub fn unregister(&self) -> MatchlockResult<()> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MatchlockError::State(format!(
                "removing state dir {}: {e}",
                self.root.display()
            ))),
        }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn lifecycle_path(&self) -> PathBuf {
        self.root.join("lifecycle.json")
    }

    pub fn bootstrap_disk_path(&self) -> PathBuf {
        self.root.join("bootstrap.ext4")
    }

    pub fn upper_disk_path(&self) -> PathBuf {
        self.root.join("upper.ext4")
    }

    pub fn overlay_dir(&self) -> PathBuf {
        self.root.join("overlay")
    }

    pub fn overlay_mount_path(&self, index: usize) -> PathBuf {
        self.overlay_dir().join(format!("mount-{index:03}"))
    }

    pub fn control_socket_path(&self, vm_id: &SandboxId) -> PathBuf {
        self.root.join(format!("{}.sock", vm_id.as_str()))
    }

    pub fn vsock_socket_path(&self) -> PathBuf {
        self.root.join("vsock.sock")
    }

    pub fn vsock_port_socket_path(&self, port: u32) -> PathBuf {
        self.root.join(format!("vsock.sock_{port}"))
    }

    pub fn hook_socket_path(&self) -> PathBuf {
        self.root.join("hook.sock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm_id() -> SandboxId {
        SandboxId::parse("vm-0011223344556677").unwrap()
    }

    #[test]
    fn register_creates_and_unregister_removes() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = StateDir::register(tmp.path(), &vm_id()).unwrap();
        assert!(dir.path().exists());
        dir.unregister().unwrap();
        assert!(!dir.path().exists());
    }

    #[test]
    fn unregister_twice_is_not_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = StateDir::register(tmp.path(), &vm_id()).unwrap();
        dir.unregister().unwrap();
        dir.unregister().unwrap();
    }

    #[test]
    fn register_rejects_existing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let _first = StateDir::register(tmp.path(), &vm_id()).unwrap();
        let err = StateDir::register(tmp.path(), &vm_id()).unwrap_err();
        assert_eq!(err.kind(), matchlock_shared::ErrorKind::State);
    }
}
