//! Subnet & State Allocator (C2).
//!
//! Assigns each sandbox a disjoint `/24` out of a process-wide pool, and
//! owns the per-sandbox state directory the lifecycle journal and disk
//! images live under.

mod allocator;
mod state_dir;

pub use allocator::{SubnetAllocator, SubnetLease};
pub use state_dir::StateDir;
