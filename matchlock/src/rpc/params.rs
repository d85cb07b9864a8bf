//! Typed request/response param shapes for every RPC method. Kept
//! separate from `protocol.rs` (the envelope) and `handler.rs`/`methods.rs`
//! (the dispatch) so each method's wire contract is visible in one place.

use serde::{Deserialize, Serialize};

use crate::supervisor::Config;

/// `create` params: the full `Config`, plus an `id` field that exists only
/// so a caller-supplied one can be detected and rejected -- callers never
/// choose their own sandbox id.
#[derive(Debug, Deserialize)]
pub struct CreateParams {
    #[serde(flatten)]
    pub config: Config,
    /// Present only so it can be detected and rejected; never read.
    #[serde(default)]
    pub id: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct CreateResult {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct CloseParams {
    pub id: String,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ExecParams {
    pub id: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ExecResultParams {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
}

#[derive(Debug, Serialize)]
pub struct StreamExecResult {
    pub exit_code: i32,
    pub duration_ms: u128,
}

#[derive(Debug, Deserialize)]
pub struct ExecTtyParams {
    pub id: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default = "default_cols")]
    pub cols: u16,
}

fn default_rows() -> u16 {
    24
}
fn default_cols() -> u16 {
    80
}

#[derive(Debug, Deserialize)]
pub struct StdinDataParams {
    pub id: i64,
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct StdinEofParams {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct ResizeParams {
    pub id: i64,
    pub rows: u16,
    pub cols: u16,
}

#[derive(Debug, Deserialize)]
pub struct WriteFileParams {
    pub id: String,
    pub path: String,
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct ReadFileParams {
    pub id: String,
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct ReadFileResult {
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct ListFilesParams {
    pub id: String,
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct DirEntryWire {
    pub name: String,
    pub file_type: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ListFilesResult {
    pub entries: Vec<DirEntryWire>,
}

#[derive(Debug, Deserialize)]
pub struct AllowListParams {
    pub id: String,
    pub hosts: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct AllowListAddResult {
    pub added: Vec<String>,
    pub allowed_hosts: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct AllowListDeleteResult {
    pub removed: Vec<String>,
    pub allowed_hosts: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct PortForwardParams {
    pub id: String,
    pub bindings: Vec<super::port_forward::PortBindingRequest>,
}

#[derive(Debug, Serialize)]
pub struct PortForwardResult {
    pub bindings: Vec<super::port_forward::PortBinding>,
}

#[derive(Debug, Deserialize)]
pub struct CancelParams {
    pub id: i64,
}

#[derive(Debug, Serialize)]
pub struct CancelResult {
    pub cancelled: bool,
}
