//! `Sandbox`: one supervised micro-VM and every host-side resource opened
//! on its behalf, created in order and closed in reverse, with a
//! double-checked start/stop and a single owner of every live handle.

use matchlock_shared::{MatchlockError, MatchlockResult, SandboxId};
use parking_lot::Mutex as SyncMutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::interception::{
    FirewallController, FirewallRules, InterceptionConfig, InterceptionStack, NoopFirewall,
};
use crate::pipeline::{BoxedTask, ExecutionPlan, PipelineBuilder, PipelineExecutor, Stage};
use crate::policy::{PolicyConfig, PolicyEngine};
use crate::subnet::{StateDir, SubnetAllocator, SubnetLease};
use crate::vfs::{HookEngine, HostFs, Interceptor, Memory, MountRouter, Provider, Readonly, VfsHookEvent, VfsServer};
use crate::vmm::{DiskLayer, ExecOpts, ExecOutcome, ExecResult, FsType, Machine, ResizeEvent, RootfsLayout, VMBackend, VmConfig};

use super::config::{Config, MountType};
use super::events::EventSink;
use super::lifecycle::{Journal, Phase};
use super::prep_tasks::{DiskPrepTask, OverlaySnapshotTask, PrepCtx};

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Everything a sandbox holds open while running. Every field is optional
/// except the fields that exist for every sandbox (id, state dir, config,
/// journal); `close()` walks these back in the reverse of the order
/// `create()` opened them, regardless of which fields ended up `Some`.
pub struct Sandbox {
    pub id: SandboxId,
    config: Config,
    state_dir: StateDir,
    journal: AsyncMutex<Journal>,
    machine: AsyncMutex<Option<Arc<dyn Machine>>>,
    subnet_lease: SyncMutex<Option<SubnetLease>>,
    policy: SyncMutex<Option<Arc<PolicyEngine>>>,
    interception: AsyncMutex<Option<InterceptionStack>>,
    vfs_server_task: SyncMutex<Option<tokio::task::JoinHandle<()>>>,
    firewall: Arc<dyn FirewallController>,
    firewall_installed: SyncMutex<bool>,
    events: EventSink,
}

/// Collaborators injected by `matchlockd`'s composition root: one
/// long-lived backend and allocator shared across every sandbox, handed
/// to each `Sandbox::create` call rather than owned per-sandbox.
pub struct CreateDeps {
    pub backend: Arc<dyn VMBackend>,
    pub subnet: SubnetAllocator,
    pub state_root: std::path::PathBuf,
    pub kernel_path: std::path::PathBuf,
    pub initramfs_path: Option<std::path::PathBuf>,
    pub bootstrap_image: std::path::PathBuf,
    pub firewall: Arc<dyn FirewallController>,
}

impl Sandbox {
    /// Ordered creation: state dir + journal, subnet lease,
    /// CA pool, disk prep + overlay snapshots (parallel stage, before the
    /// VM is created), policy engine, VM config + backend create,
    /// firewall install, interception stack, VFS mount tree + server,
    /// guest start. Any failure runs the reverse cleanup of whatever
    /// succeeded so far before returning the error.
    pub async fn create(id: SandboxId, config: Config, deps: CreateDeps) -> MatchlockResult<Self> {
        config.validate()?;

        let state_dir = StateDir::register(&deps.state_root, &id)?;
        let config_bytes = serde_json::to_vec_pretty(&config)
            .map_err(|e| MatchlockError::State(format!("serializing sandbox config: {e}")))?;
        std::fs::write(state_dir.config_path(), config_bytes)
            .map_err(|e| MatchlockError::State(format!("writing sandbox config: {e}")))?;

        let mut journal = Journal::default();
        journal.record(Phase::Created, None, &timestamp());
        journal.save(&state_dir.lifecycle_path())?;

        let sandbox = Self {
            id: id.clone(),
            config: config.clone(),
            state_dir,
            journal: AsyncMutex::new(journal),
            machine: AsyncMutex::new(None),
            subnet_lease: SyncMutex::new(None),
            policy: SyncMutex::new(None),
            interception: AsyncMutex::new(None),
            vfs_server_task: SyncMutex::new(None),
            firewall: deps.firewall,
            firewall_installed: SyncMutex::new(false),
            events: EventSink::new(),
        };

        match sandbox.create_inner(&deps).await {
            Ok(()) => Ok(sandbox),
            Err(e) => {
                sandbox.mark_phase(Phase::CreateFailed, Some(e.to_string())).await;
                let _ = sandbox.close().await;
                Err(e)
            }
        }
    }

    async fn mark_phase(&self, phase: Phase, detail: Option<String>) {
        let mut journal = self.journal.lock().await;
        journal.record(phase, detail, &timestamp());
        if let Err(e) = journal.save(&self.state_dir.lifecycle_path()) {
            tracing::warn!(error = %e, sandbox = %self.id, "failed to persist lifecycle journal");
        }
    }

    async fn create_inner(&self, deps: &CreateDeps) -> MatchlockResult<()> {
        // Step: subnet lease (skipped for no_network sandboxes).
        let lease = if self.config.no_network {
            None
        } else {
            let lease = deps.subnet.allocate(&self.id)?;
            *self.subnet_lease.lock() = Some(lease.clone());
            Some(lease)
        };

        // Step: CA pool, generated ahead of disk prep so its root cert is
        // ready to inject into the upper rootfs.
        let ca = if self.config.needs_interception() {
            Some(InterceptionStack::prepare()?)
        } else {
            None
        };

        // Step: disk prep + overlay snapshot materialization, run as one
        // parallel stage, strictly before the VM
        // backend's `create` is called.
        let overlay_mounts: Vec<(usize, PathBuf)> = self
            .config
            .vfs
            .mounts
            .iter()
            .filter(|m| matches!(m.mount_type, MountType::Overlay))
            .enumerate()
            .map(|(idx, m)| {
                (
                    idx,
                    m.host_path
                        .clone()
                        .expect("overlay mount host_path validated at Config::validate"),
                )
            })
            .collect();

        let mut prep_tasks: Vec<BoxedTask<PrepCtx>> = vec![Box::new(DiskPrepTask)];
        for (index, source) in &overlay_mounts {
            prep_tasks.push(Box::new(OverlaySnapshotTask {
                index: *index,
                source: source.clone(),
            }));
        }
        let plan = ExecutionPlan::new(vec![Stage::parallel(prep_tasks)]);
        let pipeline = PipelineBuilder::from_plan(plan);
        let prep_ctx = PrepCtx {
            state_dir: self.state_dir.clone(),
            ca: ca.clone(),
        };
        let metrics = PipelineExecutor::execute(pipeline, prep_ctx).await?;
        {
            let mut journal = self.journal.lock().await;
            journal.record_resource(
                "disk_prep",
                serde_json::to_value(&metrics).unwrap_or(serde_json::Value::Null),
            );
            let _ = journal.save(&self.state_dir.lifecycle_path());
        }

        let overlay_snapshot_paths: HashMap<String, PathBuf> = self
            .config
            .vfs
            .mounts
            .iter()
            .filter(|m| matches!(m.mount_type, MountType::Overlay))
            .enumerate()
            .map(|(idx, m)| (m.guest_path.clone(), self.state_dir.overlay_mount_path(idx)))
            .collect();

        // Step: policy engine (host allow-list, secrets, private-IP
        // block). Every secret's allowed hosts are folded into the
        // allow-list so a secret doesn't leak to a host that can never
        // even be dialed.
        let mut allow_list = self.config.network.allowed_hosts.clone();
        for secret in &self.config.network.secrets {
            for host in &secret.allowed_hosts {
                if !allow_list.iter().any(|h| h == host) {
                    allow_list.push(host.clone());
                }
            }
        }
        let policy = Arc::new(PolicyEngine::new(PolicyConfig {
            initial_allow_list: allow_list,
            secrets: self
                .config
                .network
                .secrets
                .iter()
                .cloned()
                .map(Into::into)
                .collect(),
            block_private_ips: self.config.network.block_private_ips,
            allowed_private_hosts: self.config.network.allowed_private_hosts.clone(),
        }));
        *self.policy.lock() = Some(policy.clone());

        // Step: VM config assembly and backend create.
        let vm_config = self.build_vm_config(lease.as_ref())?;
        vm_config.validate()?;
        let machine: Arc<dyn Machine> = Arc::from(deps.backend.create(vm_config).await?);
        *self.machine.lock().await = Some(machine.clone());
        self.mark_phase(Phase::Starting, None).await;

        // Step: firewall install, gated on a live lease.
        if let Some(lease) = &lease {
            let rules = FirewallRules {
                vm_id: self.id.to_string(),
                subnet_cidr: lease.subnet_cidr().to_string(),
                gateway_ip: lease.gateway_ip,
            };
            self.firewall.install(&rules).await?;
            *self.firewall_installed.lock() = true;
        }

        // Step: interception stack, only when the config actually needs one.
        if let Some(ca) = ca {
            let stack = InterceptionStack::start(
                ca,
                policy.clone(),
                InterceptionConfig {
                    rules: self.config.network.interception_rules.clone(),
                    callback_socket: self.config.network.callback_socket.clone(),
                    dns_upstreams: default_dns_upstreams(&self.config),
                    bind_ip: lease
                        .as_ref()
                        .map(|l| IpAddr::V4(l.gateway_ip))
                        .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)),
                    destination_resolver: None,
                },
            )
            .await?;
            *self.interception.lock().await = Some(stack);
        }

        // Step: VFS mount tree + server over a unix socket the guest dials.
        let router = Arc::new(MountRouter::new());
        for mount in &self.config.vfs.mounts {
            let provider = self.build_provider(mount, &overlay_snapshot_paths)?;
            router.mount(mount.guest_path.clone(), provider);
        }

        let provider_root: Arc<dyn Provider> = if !self.config.vfs.interception_rules.is_empty() {
            let hooks = Arc::new(HookEngine::new(
                self.config.vfs.interception_rules.clone(),
                self.config.network.callback_socket.clone(),
            ));
            let events = self.events.clone();
            let emit_events = self.config.vfs.emit_events;
            Arc::new(
                Interceptor::new(router as Arc<dyn Provider>, hooks).with_event_sink(Arc::new(move |ev: VfsHookEvent| {
                    if emit_events {
                        events.emit(
                            "vfs_hook",
                            serde_json::json!({
                                "op": format!("{:?}", ev.op),
                                "path": ev.path,
                                "phase": format!("{:?}", ev.phase),
                                "blocked": ev.blocked,
                                "rule": ev.rule,
                            }),
                        );
                    }
                })),
            )
        } else {
            router as Arc<dyn Provider>
        };

        let vfs_listener = UnixListener::bind(self.state_dir.hook_socket_path())
            .map_err(|e| MatchlockError::Vfs(format!("binding VFS socket: {e}")))?;
        let server = VfsServer::new(provider_root);
        let handle = server.spawn_accept_loop(vfs_listener);
        *self.vfs_server_task.lock() = Some(handle);

        // Step: start the guest.
        machine.start().await?;

        // `pid` is recorded in the `Running` transition's detail field
        // (rather than a dedicated journal field) so a restarted
        // `matchlockd` can parse it back out during recovery without a
        // journal schema change.
        self.mark_phase(Phase::Running, Some(format!("pid={}", machine.pid()))).await;
        Ok(())
    }

    fn build_provider(
        &self,
        mount: &super::config::MountSpec,
        overlay_snapshot_paths: &HashMap<String, PathBuf>,
    ) -> MatchlockResult<Arc<dyn Provider>> {
        let base: Arc<dyn Provider> = match mount.mount_type {
            MountType::Memory => Arc::new(Memory::new(u64::MAX)),
            MountType::HostFs => {
                let root = mount
                    .host_path
                    .clone()
                    .ok_or_else(|| MatchlockError::Config("hostfs mount missing host_path".into()))?;
                Arc::new(HostFs::new(root))
            }
            MountType::Overlay => {
                // Already materialized into a snapshot directory before the
                // VM was created -- the mount becomes a plain hostfs mount
                // over that snapshot from here on.
                let snapshot = overlay_snapshot_paths.get(&mount.guest_path).ok_or_else(|| {
                    MatchlockError::Internal(format!(
                        "overlay mount {:?} has no materialized snapshot",
                        mount.guest_path
                    ))
                })?;
                Arc::new(HostFs::new(snapshot.clone()))
            }
        };
        if mount.readonly {
            Ok(Arc::new(Readonly::new(base)))
        } else {
            Ok(base)
        }
    }

    fn build_vm_config(&self, lease: Option<&SubnetLease>) -> MatchlockResult<VmConfig> {
        let rootfs = RootfsLayout {
            bootstrap: DiskLayer {
                path: self.state_dir.bootstrap_disk_path(),
                fs_type: FsType::Ext4,
                readonly: true,
            },
            upper: DiskLayer {
                path: self.state_dir.upper_disk_path(),
                fs_type: FsType::Ext4,
                readonly: false,
            },
            lowers: Vec::new(),
        };
        let extra_disks = self
            .config
            .extra_disks
            .iter()
            .map(|p| DiskLayer {
                path: p.clone(),
                fs_type: FsType::Ext4,
                readonly: false,
            })
            .collect();

        Ok(VmConfig {
            kernel_path: std::path::PathBuf::new(),
            initramfs_path: None,
            rootfs,
            extra_disks,
            cpu_count: self.config.cpu_count.max(1),
            memory_mb: self.config.memory_mb.max(128),
            gateway_ip: lease.map(|l| l.gateway_ip),
            guest_ip: lease.map(|l| l.guest_ip),
            subnet_cidr: lease.map(|l| l.subnet_cidr().to_string()),
            workspace: std::path::PathBuf::from(&self.config.vfs.workspace_path),
            hostname: self.id.to_string(),
            dns_servers: self.config.network.dns_servers.clone(),
            add_hosts: self.config.network.add_hosts.clone(),
            mtu: if self.config.network.mtu == 0 { 1500 } else { self.config.network.mtu },
            privileged: self.config.privileged,
            no_network: self.config.no_network,
        })
    }

    /// Reverse-order close: each named step is best-effort and
    /// recorded via `journal.mark_cleanup`, regardless of whether earlier
    /// steps failed, so a partially created sandbox cannot leak a
    /// resource because one step errored.
    pub async fn close(&self) -> MatchlockResult<()> {
        self.mark_phase(Phase::Stopping, None).await;

        self.run_cleanup_step("stop_vfs_accept_loop", || async {
            if let Some(handle) = self.vfs_server_task.lock().take() {
                handle.abort();
            }
            let _ = std::fs::remove_file(self.state_dir.hook_socket_path());
            Ok(())
        })
        .await;

        // The hook engine has no open resources of its own -- it is
        // dropped along with the VFS provider tree above.
        self.run_cleanup_step("close_hook_engine", || async { Ok(()) }).await;

        self.run_cleanup_step("cleanup_firewall_rules", || async {
            if *self.firewall_installed.lock() {
                if let Some(lease) = self.subnet_lease.lock().clone() {
                    let rules = FirewallRules {
                        vm_id: self.id.to_string(),
                        subnet_cidr: lease.subnet_cidr().to_string(),
                        gateway_ip: lease.gateway_ip,
                    };
                    self.firewall.remove(&rules).await.map_err(|e| e.to_string())?;
                }
            }
            Ok(())
        })
        .await;

        // No NAT controller is wired in this codebase (firewall rules
        // cover redirection); nothing to do beyond recording the step.
        self.run_cleanup_step("cleanup_nat_rules", || async { Ok(()) }).await;

        self.run_cleanup_step("close_interception_stack", || async {
            if let Some(stack) = self.interception.lock().await.take() {
                stack.shutdown();
            }
            Ok(())
        })
        .await;

        self.run_cleanup_step("release_subnet", || async {
            self.subnet_lease.lock().take();
            Ok(())
        })
        .await;

        // The event broadcast channel closes itself when the last sender
        // (this sandbox) is dropped; nothing to actively release here.
        self.run_cleanup_step("close_event_channel", || async { Ok(()) }).await;

        self.run_cleanup_step("flush_guest_disks", || async {
            if let Some(machine) = self.machine.lock().await.clone() {
                let cancel = CancellationToken::new();
                let sync_cancel = cancel.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    sync_cancel.cancel();
                });
                let _ = machine.exec(&["sync".to_string()], ExecOpts::default(), cancel).await;
            }
            Ok(())
        })
        .await;

        self.run_cleanup_step("unregister_state", || async { self.state_dir.unregister().map_err(|e| e.to_string()) })
            .await;

        self.run_cleanup_step("close_machine", || async {
            if let Some(machine) = self.machine.lock().await.take() {
                machine.stop().await.map_err(|e| e.to_string())?;
                machine.close().await.map_err(|e| e.to_string())?;
            }
            Ok(())
        })
        .await;

        self.run_cleanup_step("remove_overlay_snapshots", || async {
            match std::fs::remove_dir_all(self.state_dir.overlay_dir()) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.to_string()),
            }
        })
        .await;

        self.run_cleanup_step("remove_upper_disk", || async {
            match std::fs::remove_file(self.state_dir.upper_disk_path()) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.to_string()),
            }
        })
        .await;

        self.run_cleanup_step("remove_bootstrap_disk", || async {
            match std::fs::remove_file(self.state_dir.bootstrap_disk_path()) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.to_string()),
            }
        })
        .await;

        let had_failure = {
            let journal = self.journal.lock().await;
            journal.cleanup.iter().any(|c| !c.ok)
        };

        if had_failure {
            let detail = {
                let journal = self.journal.lock().await;
                journal
                    .cleanup
                    .iter()
                    .filter(|c| !c.ok)
                    .map(|c| format!("{}: {}", c.name, c.err.clone().unwrap_or_default()))
                    .collect::<Vec<_>>()
                    .join("; ")
            };
            self.mark_phase(Phase::CleanupFailed, Some(detail.clone())).await;
            Err(MatchlockError::State(format!("sandbox cleanup had failures: {detail}")))
        } else {
            self.mark_phase(Phase::Cleaned, None).await;
            Ok(())
        }
    }

    /// Runs one cleanup step, recording its outcome via
    /// `journal.mark_cleanup`. Never propagates the step's own error --
    /// cleanup continues unconditionally regardless of this step's result.
    async fn run_cleanup_step<F, Fut>(&self, name: &str, step: F)
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), String>>,
    {
        let result = step().await;
        let mut journal = self.journal.lock().await;
        journal.mark_cleanup(name, result);
        if let Err(e) = journal.save(&self.state_dir.lifecycle_path()) {
            tracing::warn!(error = %e, sandbox = %self.id, "failed to persist cleanup record");
        }
    }

    pub async fn dial_vfs(&self) -> MatchlockResult<UnixStream> {
        UnixStream::connect(self.state_dir.hook_socket_path())
            .await
            .map_err(|e| MatchlockError::Vfs(format!("dialing VFS socket: {e}")))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn last_phase(&self) -> Option<Phase> {
        self.journal.lock().await.last_phase()
    }

    /// A live handle to the guest VM, cloned out from behind the lock so
    /// a long-running `exec` doesn't serialize against other concurrent
    /// calls on the same sandbox.
    pub async fn machine(&self) -> MatchlockResult<Arc<dyn Machine>> {
        self.machine
            .lock()
            .await
            .clone()
            .ok_or_else(|| MatchlockError::Machine(format!("sandbox {} has no running machine", self.id)))
    }

    pub fn policy(&self) -> MatchlockResult<Arc<PolicyEngine>> {
        self.policy
            .lock()
            .clone()
            .ok_or_else(|| MatchlockError::Policy(format!("sandbox {} has no network policy (no_network)", self.id)))
    }

    pub fn events(&self) -> EventSink {
        self.events.clone()
    }

    pub async fn exec(&self, command: &[String], opts: ExecOpts, cancel: CancellationToken) -> MatchlockResult<ExecResult> {
        self.machine().await?.exec(command, opts, cancel).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn exec_pipe(
        &self,
        command: &[String],
        opts: ExecOpts,
        stdin: Box<dyn tokio::io::AsyncRead + Unpin + Send>,
        stdout: tokio::sync::mpsc::Sender<Vec<u8>>,
        stderr: tokio::sync::mpsc::Sender<Vec<u8>>,
        cancel: CancellationToken,
    ) -> MatchlockResult<ExecOutcome> {
        self.machine().await?.exec_pipe(command, opts, stdin, stdout, stderr, cancel).await
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn exec_interactive(
        &self,
        command: &[String],
        opts: ExecOpts,
        rows: u16,
        cols: u16,
        stdin: Box<dyn tokio::io::AsyncRead + Unpin + Send>,
        stdout: Box<dyn tokio::io::AsyncWrite + Unpin + Send>,
        resize: tokio::sync::mpsc::Receiver<ResizeEvent>,
        cancel: CancellationToken,
    ) -> MatchlockResult<i32> {
        self.machine()
            .await?
            .exec_interactive(command, opts, rows, cols, stdin, stdout, resize, cancel)
            .await
    }
}

fn default_dns_upstreams(config: &Config) -> Vec<std::net::SocketAddr> {
    if config.network.dns_servers.is_empty() {
        vec![
            std::net::SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::new(1, 1, 1, 1)), 53),
            std::net::SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::new(8, 8, 8, 8)), 53),
        ]
    } else {
        config
            .network
            .dns_servers
            .iter()
            .map(|ip| std::net::SocketAddr::new(IpAddr::V4(*ip), 53))
            .collect()
    }
}

/// Keep the supervisor functional without a real packet-redirection
/// backend: tests and the reference binary both construct a `Sandbox`
/// with this firewall unless a platform integration is wired in.
pub fn default_firewall() -> Arc<dyn FirewallController> {
    Arc::new(NoopFirewall)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmm::ProcessBackend;

    fn no_network_config() -> Config {
        Config {
            image: "alpine:latest".into(),
            cpu_count: 1,
            memory_mb: 256,
            disk_size_mb: 512,
            no_network: true,
            network: super::super::config::NetworkConfig::default(),
            vfs: super::super::config::VfsConfig {
                mounts: vec![],
                workspace_path: "/workspace".into(),
                interception_rules: vec![],
                emit_events: false,
            },
            extra_disks: vec![],
            privileged: false,
            image_config: super::super::config::ImageConfig::default(),
        }
    }

    fn deps(tmp: &std::path::Path) -> CreateDeps {
        CreateDeps {
            backend: Arc::new(ProcessBackend::new(vec!["sleep".into(), "30".into()])),
            subnet: SubnetAllocator::new(),
            state_root: tmp.to_path_buf(),
            kernel_path: std::path::PathBuf::new(),
            initramfs_path: None,
            bootstrap_image: std::path::PathBuf::new(),
            firewall: default_firewall(),
        }
    }

    #[tokio::test]
    async fn create_and_close_roundtrip_without_network() {
        let tmp = tempfile::tempdir().unwrap();
        let id = SandboxId::generate();
        let sandbox = Sandbox::create(id.clone(), no_network_config(), deps(tmp.path())).await.unwrap();
        assert_eq!(sandbox.last_phase().await, Some(Phase::Running));

        sandbox.close().await.unwrap();
        assert_eq!(sandbox.last_phase().await, Some(Phase::Cleaned));
    }

    #[tokio::test]
    async fn invalid_config_fails_before_any_resource_is_created() {
        let tmp = tempfile::tempdir().unwrap();
        let id = SandboxId::generate();
        let mut cfg = no_network_config();
        cfg.network.allowed_hosts = vec!["example.com".into()];

        let err = Sandbox::create(id.clone(), cfg, deps(tmp.path())).await.unwrap_err();
        assert_eq!(err.kind(), matchlock_shared::ErrorKind::Config);
        assert!(!tmp.path().join(id.as_str()).exists());
    }

    #[tokio::test]
    async fn overlay_mount_is_materialized_before_machine_create() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tempfile::tempdir().unwrap();
        std::fs::write(source.path().join("f.txt"), b"seed").unwrap();

        let mut cfg = no_network_config();
        cfg.vfs.mounts = vec![super::super::config::MountSpec {
            guest_path: "/data".into(),
            mount_type: MountType::Overlay,
            host_path: Some(source.path().to_path_buf()),
            readonly: false,
        }];

        let id = SandboxId::generate();
        let sandbox = Sandbox::create(id.clone(), cfg, deps(tmp.path())).await.unwrap();

        let snapshot_dir = tmp.path().join(id.as_str()).join("overlay").join("mount-000");
        assert_eq!(std::fs::read(snapshot_dir.join("f.txt")).unwrap(), b"seed");

        sandbox.close().await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_records_every_step_even_when_resources_were_never_opened() {
        let tmp = tempfile::tempdir().unwrap();
        let id = SandboxId::generate();
        let sandbox = Sandbox::create(id.clone(), no_network_config(), deps(tmp.path())).await.unwrap();
        sandbox.close().await.unwrap();
        assert_eq!(sandbox.last_phase().await, Some(Phase::Cleaned));
    }
}
