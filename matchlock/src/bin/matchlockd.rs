//! `matchlockd`: the composition root that wires a [`matchlock::rpc::Ctx`]
//! to stdin/stdout and runs the dispatch loop to completion.
//!
//! A thin binary by design. Everything it does is: parse flags,
//! initialize logging, run the startup recovery pass over
//! `state_dir/<vm-id>/lifecycle.json` left behind by a prior process,
//! build the process-wide collaborators (`RegistryDeps`), and hand off to
//! [`matchlock::rpc::run`].

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use matchlock::rpc::{Ctx, OutputWriter, RegistryDeps};
use matchlock::subnet::SubnetAllocator;
use matchlock::supervisor::{default_firewall, recover};
use matchlock::vmm::{ProcessBackend, VMBackend};

#[derive(Parser, Debug)]
#[command(name = "matchlockd", about = "Matchlock sandbox supervisor daemon")]
struct Args {
    /// Directory holding per-sandbox state (config, lifecycle journal, disks, sockets).
    #[arg(long, env = "MATCHLOCK_STATE_ROOT", default_value = "/var/lib/matchlock")]
    state_root: PathBuf,

    /// Guest kernel image path, used by a real VM backend integration.
    #[arg(long, env = "MATCHLOCK_KERNEL_PATH", default_value = "")]
    kernel_path: PathBuf,

    /// Optional initramfs override.
    #[arg(long, env = "MATCHLOCK_INITRAMFS_PATH")]
    initramfs_path: Option<PathBuf>,

    /// Bootstrap (base) rootfs image path.
    #[arg(long, env = "MATCHLOCK_BOOTSTRAP_IMAGE", default_value = "")]
    bootstrap_image: PathBuf,

    /// Directory rolling log files are written to; stderr-only if unset.
    #[arg(long, env = "MATCHLOCK_LOG_DIR")]
    log_dir: Option<PathBuf>,
}

fn init_logging(log_dir: Option<&PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "matchlockd.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(non_blocking)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(env_filter).with_ansi(true).init();
            None
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let _log_guard = init_logging(args.log_dir.as_ref());

    tracing::info!(state_root = %args.state_root.display(), "matchlockd starting");

    if let Err(e) = std::fs::create_dir_all(&args.state_root) {
        tracing::error!(error = %e, "failed to create state root, exiting");
        std::process::exit(1);
    }

    match recover(&args.state_root) {
        Ok(recovered) => {
            for sandbox in &recovered {
                tracing::info!(
                    sandbox = %sandbox.vm_id,
                    phase = ?sandbox.last_phase,
                    alive = sandbox.process_alive,
                    "recovered sandbox from prior process"
                );
            }
        }
        Err(e) => tracing::warn!(error = %e, "startup recovery pass failed, continuing with an empty registry"),
    }

    // Reference `VMBackend`: a long-lived placeholder guest process. A real
    // deployment wires a hypervisor-backed `VMBackend` here instead -- the
    // hypervisor itself is an external collaborator.
    let backend: Arc<dyn VMBackend> = Arc::new(ProcessBackend::new(vec!["sleep".to_string(), "infinity".to_string()]));

    let deps = RegistryDeps {
        backend,
        subnet: SubnetAllocator::new(),
        state_root: args.state_root.clone(),
        kernel_path: args.kernel_path,
        initramfs_path: args.initramfs_path,
        bootstrap_image: args.bootstrap_image,
        firewall: default_firewall(),
    };

    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    let ctx = Arc::new(Ctx::new(deps, OutputWriter::new(stdout)));

    matchlock::rpc::run(ctx, stdin).await;
    tracing::info!("matchlockd exiting");
}
