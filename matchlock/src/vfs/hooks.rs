//! VFS hook rule engine: before/after observation and mutation hooks
//! layered in front of a mount's provider.

use globset::Glob;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use super::types::VfsOp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPhase {
    Before,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookAction {
    Allow,
    Block,
    MutateWrite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VfsHookRule {
    pub name: String,
    pub phase: HookPhase,
    pub ops: Vec<VfsOp>,
    pub path_glob: String,
    pub action: HookAction,
    pub data: Option<Vec<u8>>,
    pub callback_id: Option<String>,
    pub timeout_ms: u64,
}

impl VfsHookRule {
    fn matches(&self, op: VfsOp, path: &str) -> bool {
        if !self.ops.is_empty() && !self.ops.contains(&op) {
            return false;
        }
        Glob::new(&self.path_glob)
            .map(|g| g.compile_matcher().is_match(Path::new(path)))
            .unwrap_or(false)
    }
}

/// Result of running the `before`/`after` pipeline for one VFS operation.
#[derive(Debug, Clone, Default)]
pub struct HookOutcome {
    pub blocked: bool,
    /// Replacement bytes for a `mutate_write` rule, if any matched.
    pub mutated_data: Option<Vec<u8>>,
    pub matched_rule: Option<String>,
}

/// Callback transport to the SDK's hook socket. A trait so tests can inject a
/// fake responder instead of a real unix socket.
#[async_trait::async_trait]
pub trait HookCallbackClient: Send + Sync {
    async fn call(&self, socket_path: &Path, request: &CallbackRequest, timeout: Duration) -> Option<CallbackResponse>;
}

#[derive(Debug, Clone, Serialize)]
pub struct CallbackRequest {
    pub phase: HookPhase,
    pub op: VfsOp,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CallbackResponse {
    pub action: Option<HookAction>,
    pub data: Option<Vec<u8>>,
}

/// Connects to the unix-socket callback path per call. Production
/// implementation; tests use an in-memory stand-in.
pub struct UnixCallbackClient;

#[async_trait::async_trait]
impl HookCallbackClient for UnixCallbackClient {
    async fn call(&self, socket_path: &Path, request: &CallbackRequest, timeout: Duration) -> Option<CallbackResponse> {
        let fut = async {
            let mut stream = UnixStream::connect(socket_path).await.ok()?;
            let body = serde_json::to_vec(request).ok()?;
            stream.write_all(&body).await.ok()?;
            stream.write_all(b"\n").await.ok()?;
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.ok()?;
            serde_json::from_slice(&buf).ok()
        };
        if timeout.is_zero() {
            fut.await
        } else {
            tokio::time::timeout(timeout, fut).await.ok().flatten()
        }
    }
}

pub struct HookEngine {
    rules: Vec<VfsHookRule>,
    callback_socket: Option<std::path::PathBuf>,
    callback_client: Arc<dyn HookCallbackClient>,
}

impl HookEngine {
    pub fn new(rules: Vec<VfsHookRule>, callback_socket: Option<std::path::PathBuf>) -> Self {
        Self {
            rules,
            callback_socket,
            callback_client: Arc::new(UnixCallbackClient),
        }
    }

    #[cfg(test)]
    pub fn with_callback_client(mut self, client: Arc<dyn HookCallbackClient>) -> Self {
        self.callback_client = client;
        self
    }

    /// Evaluate all rules for `phase` matching `op`/`path`. A callback
    /// failure (timeout, socket error, non-conforming response) defaults
    /// to `action=allow` with no mutation.
    pub async fn evaluate(&self, phase: HookPhase, op: VfsOp, path: &str) -> HookOutcome {
        let mut outcome = HookOutcome::default();
        for rule in self.rules.iter().filter(|r| r.phase == phase) {
            if !rule.matches(op, path) {
                continue;
            }

            let (mut action, mut data) = (rule.action, rule.data.clone());

            if let Some(callback_id) = &rule.callback_id {
                if let Some(socket) = &self.callback_socket {
                    let request = CallbackRequest {
                        phase,
                        op,
                        path: path.to_string(),
                    };
                    let timeout = Duration::from_millis(rule.timeout_ms);
                    match self.callback_client.call(socket, &request, timeout).await {
                        Some(resp) => {
                            action = resp.action.unwrap_or(HookAction::Allow);
                            if resp.data.is_some() {
                                data = resp.data;
                            }
                        }
                        None => {
                            tracing::warn!(
                                rule = %rule.name,
                                callback_id,
                                "VFS hook callback failed or timed out; defaulting to allow"
                            );
                            action = HookAction::Allow;
                        }
                    }
                }
            }

            match action {
                HookAction::Block => {
                    outcome.blocked = true;
                    outcome.matched_rule = Some(rule.name.clone());
                    return outcome;
                }
                HookAction::MutateWrite => {
                    outcome.mutated_data = data;
                    outcome.matched_rule = Some(rule.name.clone());
                }
                HookAction::Allow => {
                    outcome.matched_rule = Some(rule.name.clone());
                }
            }
        }
        outcome
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(phase: HookPhase, ops: Vec<VfsOp>, glob: &str, action: HookAction) -> VfsHookRule {
        VfsHookRule {
            name: "r".into(),
            phase,
            ops,
            path_glob: glob.into(),
            action,
            data: None,
            callback_id: None,
            timeout_ms: 0,
        }
    }

    #[tokio::test]
    async fn before_block_rule_blocks_matching_path() {
        let engine = HookEngine::new(
            vec![rule(HookPhase::Before, vec![VfsOp::Write], "/secret/*", HookAction::Block)],
            None,
        );
        let outcome = engine.evaluate(HookPhase::Before, VfsOp::Write, "/secret/x").await;
        assert!(outcome.blocked);
    }

    #[tokio::test]
    async fn non_matching_path_is_not_blocked() {
        let engine = HookEngine::new(
            vec![rule(HookPhase::Before, vec![VfsOp::Write], "/secret/*", HookAction::Block)],
            None,
        );
        let outcome = engine.evaluate(HookPhase::Before, VfsOp::Write, "/public/x").await;
        assert!(!outcome.blocked);
    }

    #[tokio::test]
    async fn mutate_write_rule_replaces_data() {
        let mut r = rule(HookPhase::Before, vec![VfsOp::Write], "/x", HookAction::MutateWrite);
        r.data = Some(b"mutated".to_vec());
        let engine = HookEngine::new(vec![r], None);
        let outcome = engine.evaluate(HookPhase::Before, VfsOp::Write, "/x").await;
        assert_eq!(outcome.mutated_data, Some(b"mutated".to_vec()));
    }
}
