//! `PipelineTask` implementations for the disk-preparation stage of
//! sandbox creation: preparing the bootstrap/upper disk images (with CA
//! cert injection) and materializing every overlay mount's snapshot
//! directory, all before the VM backend's `create` is called. Run as one
//! parallel `pipeline::{Stage, PipelineTask}` stage since neither step
//! depends on the other's output.

use async_trait::async_trait;
use matchlock_shared::{MatchlockError, MatchlockResult};
use std::path::PathBuf;
use std::sync::Arc;

use crate::interception::CaPool;
use crate::pipeline::PipelineTask;
use crate::subnet::StateDir;
use crate::util::copy_dir_recursive;

/// Shared, cloneable context every prep task in the stage receives.
#[derive(Clone)]
pub struct PrepCtx {
    pub state_dir: StateDir,
    pub ca: Option<Arc<CaPool>>,
}

/// Creates placeholder bootstrap/upper disk image files and, when the
/// sandbox needs interception, injects the CA root cert into the
/// writable upper rootfs at `/etc/ssl/certs/matchlock-ca.crt` before the
/// VM starts. The reference `ProcessBackend` has no real guest filesystem
/// to write into, so the injected file lives at `state_dir/upper-inject/...`
/// as the host-side stand-in a real hypervisor-backed disk writer would
/// target instead.
pub struct DiskPrepTask;

#[async_trait]
impl PipelineTask<PrepCtx> for DiskPrepTask {
    async fn run(self: Box<Self>, ctx: PrepCtx) -> MatchlockResult<()> {
        std::fs::write(ctx.state_dir.bootstrap_disk_path(), [])
            .map_err(|e| MatchlockError::Disk(format!("preparing bootstrap disk: {e}")))?;
        std::fs::write(ctx.state_dir.upper_disk_path(), [])
            .map_err(|e| MatchlockError::Disk(format!("preparing upper disk: {e}")))?;

        if let Some(ca) = &ctx.ca {
            let cert_dir = ctx.state_dir.path().join("upper-inject/etc/ssl/certs");
            std::fs::create_dir_all(&cert_dir)
                .map_err(|e| MatchlockError::Disk(format!("creating upper cert dir: {e}")))?;
            std::fs::write(cert_dir.join("matchlock-ca.crt"), ca.root_cert_pem())
                .map_err(|e| MatchlockError::Disk(format!("injecting CA cert into upper rootfs: {e}")))?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "prepare_disks"
    }
}

/// Copies one overlay mount's `host_path` into
/// `state_dir/overlay/mount-NNN` so the sandbox sees a byte-exact
/// snapshot as of `create` regardless of later host mutation.
pub struct OverlaySnapshotTask {
    pub index: usize,
    pub source: PathBuf,
}

#[async_trait]
impl PipelineTask<PrepCtx> for OverlaySnapshotTask {
    async fn run(self: Box<Self>, ctx: PrepCtx) -> MatchlockResult<()> {
        let dest = ctx.state_dir.overlay_mount_path(self.index);
        let source = self.source;
        tokio::task::spawn_blocking(move || copy_dir_recursive(&source, &dest))
            .await
            .map_err(|e| MatchlockError::Disk(format!("overlay snapshot task panicked: {e}")))?
            .map_err(|e| MatchlockError::Disk(format!("materializing overlay snapshot: {e}")))
    }

    fn name(&self) -> &str {
        "overlay_snapshot"
    }
}
