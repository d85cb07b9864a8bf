//! Shared, runtime-agnostic types for matchlock.
//!
//! Kept free of a tokio dependency so it can be reused by any future
//! FFI/SDK binding without pulling in an async runtime.

pub mod errors;
pub mod ids;
pub mod transport;

pub use errors::{ErrorKind, MatchlockError, MatchlockResult};
pub use ids::SandboxId;
pub use transport::Transport;
