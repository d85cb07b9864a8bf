//! Typed error taxonomy shared by every matchlock component.
//!
//! A flat enum of string-carrying variants, one per failure domain, with
//! context folded into the message at each boundary crossing rather than a
//! `source()` chain. `kind()` lets the RPC layer map any error to a stable
//! numeric code without matching on the variant itself.

use std::fmt;

/// Stable failure-domain tag. Mirrors the enum's variants one-to-one; kept
/// separate so non-error code (event records, metrics) can carry a kind
/// without owning a whole error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    State,
    Subnet,
    Machine,
    Disk,
    Ca,
    Network,
    Firewall,
    Vfs,
    Policy,
    Hook,
    Rpc,
    Timeout,
    Cancelled,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Config => "config",
            ErrorKind::State => "state",
            ErrorKind::Subnet => "subnet",
            ErrorKind::Machine => "machine",
            ErrorKind::Disk => "disk",
            ErrorKind::Ca => "ca",
            ErrorKind::Network => "network",
            ErrorKind::Firewall => "firewall",
            ErrorKind::Vfs => "vfs",
            ErrorKind::Policy => "policy",
            ErrorKind::Hook => "hook",
            ErrorKind::Rpc => "rpc",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MatchlockError {
    #[error("config: {0}")]
    Config(String),
    #[error("state: {0}")]
    State(String),
    #[error("subnet: {0}")]
    Subnet(String),
    #[error("machine: {0}")]
    Machine(String),
    #[error("disk: {0}")]
    Disk(String),
    #[error("ca: {0}")]
    Ca(String),
    #[error("network: {0}")]
    Network(String),
    #[error("firewall: {0}")]
    Firewall(String),
    #[error("vfs: {0}")]
    Vfs(String),
    #[error("policy: {0}")]
    Policy(String),
    #[error("hook: {0}")]
    Hook(String),
    #[error("rpc: {0}")]
    Rpc(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type MatchlockResult<T> = Result<T, MatchlockError>;

impl MatchlockError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MatchlockError::Config(_) => ErrorKind::Config,
            MatchlockError::State(_) => ErrorKind::State,
            MatchlockError::Subnet(_) => ErrorKind::Subnet,
            MatchlockError::Machine(_) => ErrorKind::Machine,
            MatchlockError::Disk(_) => ErrorKind::Disk,
            MatchlockError::Ca(_) => ErrorKind::Ca,
            MatchlockError::Network(_) => ErrorKind::Network,
            MatchlockError::Firewall(_) => ErrorKind::Firewall,
            MatchlockError::Vfs(_) => ErrorKind::Vfs,
            MatchlockError::Policy(_) => ErrorKind::Policy,
            MatchlockError::Hook(_) => ErrorKind::Hook,
            MatchlockError::Rpc(_) => ErrorKind::Rpc,
            MatchlockError::Timeout(_) => ErrorKind::Timeout,
            MatchlockError::Cancelled(_) => ErrorKind::Cancelled,
            MatchlockError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Rewrap with additional context, keeping the original `kind`.
    ///
    /// Used at component boundaries as a reusable helper for the many
    /// call sites that just want to prefix a message onto an error
    /// without losing its kind.
    pub fn context(self, msg: impl fmt::Display) -> Self {
        let kind = self.kind();
        let text = format!("{msg}: {self}");
        kind.wrap(text)
    }

    /// Numeric JSON-RPC code for this error. Protocol-level codes
    /// (parse/invalid-request/method-not-found/invalid-params) are assigned
    /// by the RPC layer itself, not from an error kind.
    pub fn rpc_code(&self) -> i64 {
        match self.kind() {
            ErrorKind::Machine => -32000,
            ErrorKind::Cancelled => -32003,
            ErrorKind::Vfs => -32002,
            // exec failures surface as Machine/Timeout depending on origin;
            // callers that know they're reporting an exec failure specifically
            // should use ErrorKind::rpc_code_exec() instead.
            _ => -32603,
        }
    }
}

impl ErrorKind {
    fn wrap(self, text: String) -> MatchlockError {
        match self {
            ErrorKind::Config => MatchlockError::Config(text),
            ErrorKind::State => MatchlockError::State(text),
            ErrorKind::Subnet => MatchlockError::Subnet(text),
            ErrorKind::Machine => MatchlockError::Machine(text),
            ErrorKind::Disk => MatchlockError::Disk(text),
            ErrorKind::Ca => MatchlockError::Ca(text),
            ErrorKind::Network => MatchlockError::Network(text),
            ErrorKind::Firewall => MatchlockError::Firewall(text),
            ErrorKind::Vfs => MatchlockError::Vfs(text),
            ErrorKind::Policy => MatchlockError::Policy(text),
            ErrorKind::Hook => MatchlockError::Hook(text),
            ErrorKind::Rpc => MatchlockError::Rpc(text),
            ErrorKind::Timeout => MatchlockError::Timeout(text),
            ErrorKind::Cancelled => MatchlockError::Cancelled(text),
            ErrorKind::Internal => MatchlockError::Internal(text),
        }
    }

    /// The numeric JSON-RPC error code used when an error of this kind
    /// reaches the RPC boundary as the response to an `exec*` call.
    pub fn rpc_code_exec(self) -> i64 {
        match self {
            ErrorKind::Cancelled => -32003,
            ErrorKind::Machine => -32000,
            _ => -32001,
        }
    }
}

/// Stable JSON-RPC protocol codes, independent of any [`MatchlockError`].
pub mod rpc_protocol_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

impl From<std::io::Error> for MatchlockError {
    fn from(e: std::io::Error) -> Self {
        MatchlockError::Internal(format!("io error: {e}"))
    }
}

impl From<serde_json::Error> for MatchlockError {
    fn from(e: serde_json::Error) -> Self {
        MatchlockError::Rpc(format!("json error: {e}"))
    }
}
