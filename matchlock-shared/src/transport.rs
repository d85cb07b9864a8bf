//! Byte-channel transport descriptors.
//!
//! A `Transport` names *how* to reach a guest-facing socket; it carries no
//! live connection -- just a serializable, cloneable description that both
//! the spawning side and the reconnecting side can agree on.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Transport {
    /// A Unix domain socket at a fixed path (control socket, vsock shim).
    Unix { socket_path: PathBuf },
    /// A guest vsock port, dialed through the VM backend rather than the
    /// host filesystem.
    Vsock { cid: u32, port: u32 },
}

impl Transport {
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Transport::Unix {
            socket_path: path.into(),
        }
    }

    pub fn vsock(cid: u32, port: u32) -> Self {
        Transport::Vsock { cid, port }
    }
}
