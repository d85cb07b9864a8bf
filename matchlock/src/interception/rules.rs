//! Network hook rule pipeline: before/after callbacks into the guest's
//! SDK over a Unix socket, evaluated around each proxied request.

use globset::Glob;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RulePhase {
    Before,
    After,
}

impl Default for RulePhase {
    fn default() -> Self {
        RulePhase::Before
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Allow,
    Block,
    Mutate,
}

impl Default for RuleAction {
    fn default() -> Self {
        RuleAction::Allow
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NetworkHookRule {
    pub name: String,
    pub phase: RulePhase,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub path_glob: Option<String>,
    pub action: RuleAction,
    #[serde(default)]
    pub set_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub delete_headers: Vec<String>,
    #[serde(default)]
    pub set_query: BTreeMap<String, String>,
    #[serde(default)]
    pub delete_query: Vec<String>,
    #[serde(default)]
    pub rewrite_path: Option<String>,
    #[serde(default)]
    pub set_response_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub delete_response_headers: Vec<String>,
    #[serde(default)]
    pub body_replacements: Vec<(String, String)>,
    #[serde(default)]
    pub callback_id: Option<String>,
    #[serde(default)]
    pub timeout_ms: u64,
}

impl NetworkHookRule {
    /// Invariant: a callback rule cannot declare `action=block`.
    pub fn validate(&self) -> Result<(), String> {
        if self.callback_id.is_some() && matches!(self.action, RuleAction::Block) {
            return Err(format!(
                "rule {:?} declares a callback with action=block, which is not allowed",
                self.name
            ));
        }
        Ok(())
    }

    fn matches(&self, host: &str, method: &str, path: &str) -> bool {
        if !self.hosts.is_empty() && !self.hosts.iter().any(|h| h.eq_ignore_ascii_case(host)) {
            return false;
        }
        if !self.methods.is_empty() && !self.methods.iter().any(|m| m.eq_ignore_ascii_case(method)) {
            return false;
        }
        if let Some(glob) = &self.path_glob {
            let matches = Glob::new(glob)
                .map(|g| g.compile_matcher().is_match(Path::new(path)))
                .unwrap_or(false);
            if !matches {
                return false;
            }
        }
        true
    }
}

/// An in-flight request's mutable parts, built by the proxy from the
/// parsed HTTP request line + headers, and folded back in after `before`
/// rules run.
#[derive(Debug, Clone, Default)]
pub struct MutableRequest {
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct MutableResponse {
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Default)]
pub struct BeforeOutcome {
    pub blocked: bool,
    pub request: MutableRequest,
}

#[async_trait::async_trait]
pub trait RuleCallbackClient: Send + Sync {
    async fn call(
        &self,
        socket_path: &Path,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Option<serde_json::Value>;
}

pub struct UnixRuleCallbackClient;

#[async_trait::async_trait]
impl RuleCallbackClient for UnixRuleCallbackClient {
    async fn call(&self, socket_path: &Path, body: &serde_json::Value, timeout: Duration) -> Option<serde_json::Value> {
        let fut = async {
            let mut stream = UnixStream::connect(socket_path).await.ok()?;
            let bytes = serde_json::to_vec(body).ok()?;
            stream.write_all(&bytes).await.ok()?;
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

/// Evaluates the ordered rule set for one connection.
pub struct RulePipeline {
    rules: Vec<NetworkHookRule>,
    callback_socket: Option<std::path::PathBuf>,
    callback_client: std::sync::Arc<dyn RuleCallbackClient>,
}

impl RulePipeline {
    pub fn new(rules: Vec<NetworkHookRule>, callback_socket: Option<std::path::PathBuf>) -> Self {
        Self {
            rules,
            callback_socket,
            callback_client: std::sync::Arc::new(UnixRuleCallbackClient),
        }
    }

    #[cfg(test)]
    pub fn with_callback_client(mut self, client: std::sync::Arc<dyn RuleCallbackClient>) -> Self {
        self.callback_client = client;
        self
    }

    /// Apply every matching `before` rule in declared order: path
    /// rewrite, query set/delete, header set/delete, and callback
    /// mutations. A matching `action=block` rule (no callback, by
    /// invariant) stops evaluation and blocks the connection.
    pub async fn run_before(&self, host: &str, method: &str, mut req: MutableRequest) -> BeforeOutcome {
        for rule in self.rules.iter().filter(|r| r.phase == RulePhase::Before) {
            if !rule.matches(host, method, &req.path) {
                continue;
            }

            if let RuleAction::Block = rule.action {
                return BeforeOutcome {
                    blocked: true,
                    request: req,
                };
            }

            if let Some(new_path) = &rule.rewrite_path {
                req.path = new_path.clone();
            }
            for key in &rule.delete_query {
                req.query.remove(key);
            }
            for (k, v) in &rule.set_query {
                req.query.insert(k.clone(), v.clone());
            }
            req.headers.retain(|(k, _)| {
                !rule.delete_headers.iter().any(|d| d.eq_ignore_ascii_case(k))
            });
            for (k, v) in &rule.set_headers {
                req.headers.push((k.clone(), v.clone()));
            }

            if let Some(callback_id) = &rule.callback_id {
                if let Some(socket) = &self.callback_socket {
                    let body = serde_json::json!({
                        "phase": "before",
                        "host": host,
                        "method": method,
                        "path": req.path,
                        "query": req.query,
                        "headers": req.headers,
                        "callback_id": callback_id,
                    });
                    let timeout = Duration::from_millis(rule.timeout_ms);
                    match self.callback_client.call(socket, &body, timeout).await {
                        Some(resp) => apply_callback_mutations(&mut req, &resp),
                        None => {
                            tracing::warn!(rule = %rule.name, callback_id, "before-hook callback failed; defaulting to allow");
                        }
                    }
                }
            }
        }
        BeforeOutcome {
            blocked: false,
            request: req,
        }
    }

    /// Apply every matching `after` rule: response header set/delete,
    /// literal body replacements, and callback mutations. Body
    /// replacements for SSE bodies are applied per `data:` line by the
    /// caller (see `sse.rs`); this returns the ordered replacement list
    /// plus mutated response headers.
    pub async fn run_after(
        &self,
        host: &str,
        method: &str,
        path: &str,
        status: u16,
        is_sse: bool,
        mut resp: MutableResponse,
    ) -> (MutableResponse, Vec<(String, String)>) {
        let mut replacements = Vec::new();
        for rule in self.rules.iter().filter(|r| r.phase == RulePhase::After) {
            if !rule.matches(host, method, path) {
                continue;
            }
            resp.headers.retain(|(k, _)| {
                !rule.delete_response_headers.iter().any(|d| d.eq_ignore_ascii_case(k))
            });
            for (k, v) in &rule.set_response_headers {
                resp.headers.push((k.clone(), v.clone()));
            }
            replacements.extend(rule.body_replacements.clone());

            if let Some(callback_id) = &rule.callback_id {
                if let Some(socket) = &self.callback_socket {
                    let body = serde_json::json!({
                        "phase": "after",
                        "host": host,
                        "method": method,
                        "path": path,
                        "status": status,
                        "is_sse": is_sse,
                        "headers": resp.headers,
                        "callback_id": callback_id,
                    });
                    let timeout = Duration::from_millis(rule.timeout_ms);
                    if self.callback_client.call(socket, &body, timeout).await.is_none() {
                        tracing::warn!(rule = %rule.name, callback_id, "after-hook callback failed; defaulting to allow");
                    }
                }
            }
        }
        (resp, replacements)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn apply_callback_mutations(req: &mut MutableRequest, resp: &serde_json::Value) {
    if let Some(path) = resp.get("path").and_then(|v| v.as_str()) {
        req.path = path.to_string();
    }
    if let Some(headers) = resp.get("set_headers").and_then(|v| v.as_object()) {
        for (k, v) in headers {
            if let Some(v) = v.as_str() {
                req.headers.push((k.clone(), v.to_string()));
            }
        }
    }
    if let Some(query) = resp.get("set_query").and_then(|v| v.as_object()) {
        for (k, v) in query {
            if let Some(v) = v.as_str() {
                req.query.insert(k.clone(), v.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn before_pipeline_rewrites_path_and_query() {
        let rule = NetworkHookRule {
            name: "r".into(),
            phase: RulePhase::Before,
            hosts: vec!["httpbin.org".into()],
            methods: vec![],
            path_glob: Some("/anything/v1".into()),
            action: RuleAction::Mutate,
            rewrite_path: Some("/anything/v2".into()),
            set_query: BTreeMap::from([("trace".to_string(), "hooked".to_string())]),
            delete_query: vec!["drop".into()],
            set_headers: BTreeMap::from([("X-Hook".to_string(), "set".to_string())]),
            delete_headers: vec!["X-Remove".into()],
            ..Default::default()
        };
        let pipeline = RulePipeline::new(vec![rule], None);

        let mut req = MutableRequest {
            path: "/anything/v1".into(),
            query: BTreeMap::from([("drop".to_string(), "1".to_string())]),
            headers: vec![("X-Remove".to_string(), "1".to_string())],
        };
        req.query.insert("drop".into(), "1".into());

        let outcome = pipeline.run_before("httpbin.org", "GET", req).await;
        assert!(!outcome.blocked);
        assert_eq!(outcome.request.path, "/anything/v2");
        assert_eq!(outcome.request.query.get("trace").unwrap(), "hooked");
        assert!(!outcome.request.query.contains_key("drop"));
        assert!(outcome.request.headers.iter().any(|(k, v)| k == "X-Hook" && v == "set"));
        assert!(!outcome.request.headers.iter().any(|(k, _)| k == "X-Remove"));
    }

    #[tokio::test]
    async fn block_rule_stops_pipeline() {
        let rule = NetworkHookRule {
            name: "block".into(),
            phase: RulePhase::Before,
            hosts: vec!["evil.com".into()],
            action: RuleAction::Block,
            ..Default::default()
        };
        let pipeline = RulePipeline::new(vec![rule], None);
        let outcome = pipeline
            .run_before("evil.com", "GET", MutableRequest::default())
            .await;
        assert!(outcome.blocked);
    }

    #[test]
    fn callback_with_block_action_is_invalid() {
        let rule = NetworkHookRule {
            name: "bad".into(),
            callback_id: Some("cb".into()),
            action: RuleAction::Block,
            ..Default::default()
        };
        assert!(rule.validate().is_err());
    }
}
