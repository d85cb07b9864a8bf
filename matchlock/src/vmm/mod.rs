//! VM Backend Adapter (C1).
//!
//! The hypervisor itself is an external collaborator: this module defines
//! the capability set the supervisor consumes (`VMBackend`/`Machine`) and
//! ships one concrete, subprocess-based reference backend grounded on the
//! same graceful-shutdown and PID-liveness patterns used elsewhere in this
//! codebase, for use in tests and as a template for a real hypervisor
//! integration.

mod config;
mod process_backend;
mod traits;

pub use config::{DiskLayer, FsType, RootfsLayout, VmConfig};
pub use process_backend::ProcessBackend;
pub use traits::{ExecOpts, ExecOutcome, ExecResult, Machine, ResizeEvent, VMBackend};
