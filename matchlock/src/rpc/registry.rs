//! Multi-sandbox registry: "the RPC handler owns the sandbox". A single `matchlockd` process can supervise more
//! than one sandbox at once; this is the map from `vm-…` id to the live
//! `Sandbox`, plus the fixed, process-wide collaborators every `create`
//! call needs to build one.

use matchlock_shared::{MatchlockError, MatchlockResult, SandboxId};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::interception::FirewallController;
use crate::subnet::SubnetAllocator;
use crate::supervisor::{CreateDeps, Sandbox};
use crate::vmm::VMBackend;

/// Fixed collaborators shared by every sandbox this process creates.
/// Cloned into a fresh `CreateDeps` per `create` call.
pub struct RegistryDeps {
    pub backend: Arc<dyn VMBackend>,
    pub subnet: SubnetAllocator,
    pub state_root: PathBuf,
    pub kernel_path: PathBuf,
    pub initramfs_path: Option<PathBuf>,
    pub bootstrap_image: PathBuf,
    pub firewall: Arc<dyn FirewallController>,
}

impl RegistryDeps {
    fn create_deps(&self) -> CreateDeps {
        CreateDeps {
            backend: self.backend.clone(),
            subnet: self.subnet.clone(),
            state_root: self.state_root.clone(),
            kernel_path: self.kernel_path.clone(),
            initramfs_path: self.initramfs_path.clone(),
            bootstrap_image: self.bootstrap_image.clone(),
            firewall: self.firewall.clone(),
        }
    }
}

#[derive(Default)]
pub struct SandboxRegistry {
    sandboxes: RwLock<HashMap<SandboxId, Arc<Sandbox>>>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(
        &self,
        id: SandboxId,
        config: crate::supervisor::Config,
        deps: &RegistryDeps,
    ) -> MatchlockResult<Arc<Sandbox>> {
        let sandbox = Arc::new(Sandbox::create(id.clone(), config, deps.create_deps()).await?);
        self.sandboxes.write().await.insert(id, sandbox.clone());
        Ok(sandbox)
    }

    pub async fn get(&self, id: &SandboxId) -> MatchlockResult<Arc<Sandbox>> {
        self.sandboxes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| MatchlockError::State(format!("unknown sandbox {id}")))
    }

    /// Remove and close a sandbox. Removing from the map before `close`
    /// completes means a second `close` call for the same id sees it as
    /// already gone rather than racing the first call's teardown.
    pub async fn close(&self, id: &SandboxId) -> MatchlockResult<()> {
        let sandbox = self.sandboxes.write().await.remove(id);
        match sandbox {
            Some(sandbox) => sandbox.close().await,
            None => Ok(()),
        }
    }

    pub async fn list(&self) -> Vec<SandboxId> {
        self.sandboxes.read().await.keys().cloned().collect()
    }
}
