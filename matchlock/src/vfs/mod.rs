//! VFS Engine (C3): layered providers, a longest-prefix-match mount router,
//! a hook interceptor, and a request/response server over the guest byte
//! channel.

mod hooks;
mod interceptor;
mod provider;
mod providers;
mod router;
mod server;
mod types;

pub use hooks::{HookAction, HookCallbackClient, HookEngine, HookOutcome, HookPhase, VfsHookRule};
pub use interceptor::{EventSink, Interceptor, VfsHookEvent};
pub use provider::Provider;
pub use providers::{HostFs, Memory, Overlay, Readonly};
pub use router::MountRouter;
pub use server::VfsServer;
pub use types::{
    DirEntry, FileType, HookRequest, OpenFlags, Stat, VfsError, VfsOp, VfsResult, WireRequest,
    WireResponse,
};
