//! `port_forward`: unlike every other RPC method, a
//! port-forward listener's task is rooted in the handler's own long-lived
//! context rather than the calling request's -- it must keep running after
//! the `port_forward` call itself returns, and is only torn down by a
//! later `port_forward` call for the same sandbox or by `close`.

use matchlock_shared::{MatchlockError, MatchlockResult, SandboxId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::supervisor::Sandbox;
use crate::vmm::Machine;

#[derive(Debug, Clone, Deserialize)]
pub struct PortBindingRequest {
    /// `0` asks the host to pick an ephemeral port.
    #[serde(default)]
    pub host_port: u16,
    pub guest_port: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortBinding {
    pub host_port: u16,
    pub guest_port: u32,
}

struct ActiveForward {
    task: tokio::task::JoinHandle<()>,
}

impl Drop for ActiveForward {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Live listeners keyed by sandbox id. Each `port_forward` call for a given
/// sandbox replaces its entire prior set.
#[derive(Default)]
pub struct PortForwardTable {
    by_sandbox: Mutex<HashMap<SandboxId, Vec<ActiveForward>>>,
}

impl PortForwardTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds one host TCP listener per requested binding and spawns its
    /// forward loop, replacing any forwards previously registered for this
    /// sandbox. Returns the bindings with `host_port` resolved to whatever
    /// the OS actually assigned.
    pub async fn install(
        &self,
        sandbox: &Arc<Sandbox>,
        requests: &[PortBindingRequest],
    ) -> MatchlockResult<Vec<PortBinding>> {
        let mut forwards = Vec::with_capacity(requests.len());
        let mut bindings = Vec::with_capacity(requests.len());

        for req in requests {
            let addr = SocketAddr::from(([127, 0, 0, 1], req.host_port));
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| MatchlockError::Rpc(format!("binding port-forward listener on {addr}: {e}")))?;
            let bound_port = listener
                .local_addr()
                .map_err(|e| MatchlockError::Rpc(format!("reading bound port-forward address: {e}")))?
                .port();

            let guest_port = req.guest_port;
            let sandbox = sandbox.clone();
            let task = tokio::spawn(async move {
                accept_loop(listener, sandbox, guest_port).await;
            });

            forwards.push(ActiveForward { task });
            bindings.push(PortBinding {
                host_port: bound_port,
                guest_port,
            });
        }

        let mut table = self.by_sandbox.lock().await;
        table.insert(sandbox.id.clone(), forwards);
        Ok(bindings)
    }

    /// Ends every forward registered for `id`. Idempotent: a sandbox with no
    /// registered forwards is a no-op.
    pub async fn remove(&self, id: &SandboxId) {
        self.by_sandbox.lock().await.remove(id);
    }
}

async fn accept_loop(listener: TcpListener, sandbox: Arc<Sandbox>, guest_port: u32) {
    loop {
        let (mut inbound, _peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "port-forward accept failed");
                continue;
            }
        };

        let machine = match sandbox.machine().await {
            Ok(machine) => machine,
            Err(e) => {
                tracing::warn!(error = %e, "port-forward connection with no live guest machine");
                continue;
            }
        };

        tokio::spawn(async move {
            let guest = match dial_guest_port(machine.as_ref(), guest_port).await {
                Ok(guest) => guest,
                Err(e) => {
                    tracing::warn!(error = %e, guest_port, "port-forward dial to guest failed");
                    return;
                }
            };
            let mut guest = guest;
            if let Err(e) = tokio::io::copy_bidirectional(&mut inbound, &mut guest).await {
                tracing::debug!(error = %e, guest_port, "port-forward connection closed");
            }
        });
    }
}

async fn dial_guest_port(machine: &dyn Machine, guest_port: u32) -> MatchlockResult<tokio::net::UnixStream> {
    machine.dial_vsock(guest_port).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::{CreateDeps, Sandbox};
    use crate::vmm::ProcessBackend;
    use matchlock_shared::SandboxId;

    async fn sandbox(tmp: &std::path::Path) -> Arc<Sandbox> {
        let id = SandboxId::generate();
        let config = crate::supervisor::Config {
            image: "alpine:latest".into(),
            cpu_count: 1,
            memory_mb: 256,
            disk_size_mb: 512,
            no_network: true,
            network: Default::default(),
            vfs: crate::supervisor::VfsConfig {
                mounts: vec![],
                workspace_path: "/workspace".into(),
                interception_rules: vec![],
                emit_events: false,
            },
            extra_disks: vec![],
            privileged: false,
            image_config: Default::default(),
        };
        let deps = CreateDeps {
            backend: Arc::new(ProcessBackend::new(vec!["sleep".into(), "30".into()])),
            subnet: crate::subnet::SubnetAllocator::new(),
            state_root: tmp.to_path_buf(),
            kernel_path: std::path::PathBuf::new(),
            initramfs_path: None,
            bootstrap_image: std::path::PathBuf::new(),
            firewall: crate::supervisor::default_firewall(),
        };
        Arc::new(Sandbox::create(id, config, deps).await.unwrap())
    }

    #[tokio::test]
    async fn install_binds_an_ephemeral_port_when_requested() {
        let tmp = tempfile::tempdir().unwrap();
        let sb = sandbox(tmp.path()).await;
        let table = PortForwardTable::new();

        let bindings = table
            .install(&sb, &[PortBindingRequest { host_port: 0, guest_port: 9000 }])
            .await
            .unwrap();
        assert_eq!(bindings.len(), 1);
        assert_ne!(bindings[0].host_port, 0);

        table.remove(&sb.id).await;
        sb.close().await.unwrap();
    }

    #[tokio::test]
    async fn a_second_install_replaces_the_first_sets_forwards() {
        let tmp = tempfile::tempdir().unwrap();
        let sb = sandbox(tmp.path()).await;
        let table = PortForwardTable::new();

        table
            .install(&sb, &[PortBindingRequest { host_port: 0, guest_port: 9000 }])
            .await
            .unwrap();
        let second = table
            .install(&sb, &[PortBindingRequest { host_port: 0, guest_port: 9001 }])
            .await
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].guest_port, 9001);

        sb.close().await.unwrap();
    }
}
