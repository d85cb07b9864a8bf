//! Sandbox Supervisor (C6): composes C1-C5 into one `Sandbox`, owning
//! ordered create/close and the durable lifecycle journal.

mod config;
mod events;
mod lifecycle;
mod prep_tasks;
mod recovery;
mod sandbox;

pub use config::{Config, ImageConfig, MountSpec, MountType, NetworkConfig, SecretConfig, VfsConfig};
pub use events::{EventSink, SandboxEvent};
pub use lifecycle::{CleanupRecord, Journal, JournalEvent, Phase};
pub use prep_tasks::{DiskPrepTask, OverlaySnapshotTask, PrepCtx};
pub use recovery::{recover, RecoveredSandbox};
pub use sandbox::{default_firewall, CreateDeps, Sandbox};
