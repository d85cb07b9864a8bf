//! RPC Handler: the duplex line-delimited JSON-RPC server that is
//! `matchlockd`'s single entrypoint. Everything else in
//! this crate is driven from here -- a request arrives, dispatches to a
//! method in [`methods`], and the method composes a [`crate::supervisor::Sandbox`]
//! out of the other components.

mod cancel;
mod handler;
mod methods;
mod params;
mod port_forward;
mod protocol;
mod registry;
mod session_io;
mod vfs_client;
mod writer;

pub use cancel::CancelTable;
pub use handler::{run, Ctx};
pub use port_forward::{PortBinding, PortBindingRequest, PortForwardTable};
pub use protocol::{OutboundMessage, RpcErrorObject, RpcNotification, RpcRequest, RpcResponse};
pub use registry::{RegistryDeps, SandboxRegistry};
pub use writer::OutputWriter;
