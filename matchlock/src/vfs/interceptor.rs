//! Wraps a `Provider`, running the `HookEngine` before and after each call.
//!
//! A `before` decision of `block` returns the rule's error without calling
//! the inner provider. `mutate_write` replaces the bytes passed to the
//! inner provider. `after` hooks run post-call with the observed outcome;
//! a failing `after` hook never fails the VFS operation itself -- its
//! outcome is only reported as an event.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::hooks::{HookEngine, HookPhase};
use super::provider::Provider;
use super::types::{DirEntry, OpenFlags, Stat, VfsError, VfsResult, VfsOp};

/// Observable event emitted for each hook evaluation, handed to the
/// sandbox's event sink.
#[derive(Debug, Clone)]
pub struct VfsHookEvent {
    pub op: VfsOp,
    pub path: String,
    pub phase: HookPhase,
    pub blocked: bool,
    pub rule: Option<String>,
}

pub type EventSink = Arc<dyn Fn(VfsHookEvent) + Send + Sync>;

pub struct Interceptor {
    inner: Arc<dyn Provider>,
    hooks: Arc<HookEngine>,
    handle_paths: Mutex<BTreeMap<u64, String>>,
    event_sink: Option<EventSink>,
}

impl Interceptor {
    pub fn new(inner: Arc<dyn Provider>, hooks: Arc<HookEngine>) -> Self {
        Self {
            inner,
            hooks,
            handle_paths: Mutex::new(BTreeMap::new()),
            event_sink: None,
        }
    }

    pub fn with_event_sink(mut self, sink: EventSink) -> Self {
        self.event_sink = Some(sink);
        self
    }

    fn emit(&self, op: VfsOp, path: &str, phase: HookPhase, blocked: bool, rule: Option<String>) {
        if let Some(sink) = &self.event_sink {
            sink(VfsHookEvent {
                op,
                path: path.to_string(),
                phase,
                blocked,
                rule,
            });
        }
    }

    async fn guard_before(&self, op: VfsOp, path: &str) -> VfsResult<Option<Vec<u8>>> {
        let outcome = self.hooks.evaluate(HookPhase::Before, op, path).await;
        self.emit(op, path, HookPhase::Before, outcome.blocked, outcome.matched_rule.clone());
        if outcome.blocked {
            return Err(VfsError::PermissionDenied);
        }
        Ok(outcome.mutated_data)
    }

    async fn notify_after(&self, op: VfsOp, path: &str) {
        let outcome = self.hooks.evaluate(HookPhase::After, op, path).await;
        self.emit(op, path, HookPhase::After, outcome.blocked, outcome.matched_rule);
    }
}

#[async_trait]
impl Provider for Interceptor {
    async fn stat(&self, path: &str) -> VfsResult<Stat> {
        self.guard_before(VfsOp::Stat, path).await?;
        let result = self.inner.stat(path).await;
        if result.is_ok() {
            self.notify_after(VfsOp::Stat, path).await;
        }
        result
    }

    async fn readdir(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        self.guard_before(VfsOp::Readdir, path).await?;
        let result = self.inner.readdir(path).await;
        if result.is_ok() {
            self.notify_after(VfsOp::Readdir, path).await;
        }
        result
    }

    async fn open(&self, path: &str, flags: OpenFlags) -> VfsResult<u64> {
        self.guard_before(VfsOp::Open, path).await?;
        let handle = self.inner.open(path, flags).await?;
        self.handle_paths.lock().insert(handle, path.to_string());
        self.notify_after(VfsOp::Open, path).await;
        Ok(handle)
    }

    async fn create(&self, path: &str, mode: u32) -> VfsResult<u64> {
        self.guard_before(VfsOp::Create, path).await?;
        let handle = self.inner.create(path, mode).await?;
        self.handle_paths.lock().insert(handle, path.to_string());
        self.notify_after(VfsOp::Create, path).await;
        Ok(handle)
    }

    async fn mkdir(&self, path: &str, mode: u32) -> VfsResult<()> {
        self.guard_before(VfsOp::Mkdir, path).await?;
        let result = self.inner.mkdir(path, mode).await;
        if result.is_ok() {
            self.notify_after(VfsOp::Mkdir, path).await;
        }
        result
    }

    async fn chmod(&self, path: &str, mode: u32) -> VfsResult<()> {
        self.guard_before(VfsOp::Chmod, path).await?;
        let result = self.inner.chmod(path, mode).await;
        if result.is_ok() {
            self.notify_after(VfsOp::Chmod, path).await;
        }
        result
    }

    async fn remove(&self, path: &str) -> VfsResult<()> {
        self.guard_before(VfsOp::Remove, path).await?;
        let result = self.inner.remove(path).await;
        if result.is_ok() {
            self.notify_after(VfsOp::Remove, path).await;
        }
        result
    }

    async fn remove_all(&self, path: &str) -> VfsResult<()> {
        self.guard_before(VfsOp::RemoveAll, path).await?;
        let result = self.inner.remove_all(path).await;
        if result.is_ok() {
            self.notify_after(VfsOp::RemoveAll, path).await;
        }
        result
    }

    async fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        self.guard_before(VfsOp::Rename, from).await?;
        let result = self.inner.rename(from, to).await;
        if result.is_ok() {
            self.notify_after(VfsOp::Rename, to).await;
        }
        result
    }

    async fn symlink(&self, target: &str, link_path: &str) -> VfsResult<()> {
        self.guard_before(VfsOp::Symlink, link_path).await?;
        let result = self.inner.symlink(target, link_path).await;
        if result.is_ok() {
            self.notify_after(VfsOp::Symlink, link_path).await;
        }
        result
    }

    async fn readlink(&self, path: &str) -> VfsResult<String> {
        self.guard_before(VfsOp::Readlink, path).await?;
        let result = self.inner.readlink(path).await;
        if result.is_ok() {
            self.notify_after(VfsOp::Readlink, path).await;
        }
        result
    }

    async fn read(&self, handle: u64, offset: u64, len: u32) -> VfsResult<Vec<u8>> {
        let path = self.handle_paths.lock().get(&handle).cloned().unwrap_or_default();
        self.guard_before(VfsOp::Read, &path).await?;
        let result = self.inner.read(handle, offset, len).await;
        if result.is_ok() {
            self.notify_after(VfsOp::Read, &path).await;
        }
        result
    }

    async fn write(&self, handle: u64, offset: u64, data: &[u8]) -> VfsResult<u32> {
        let path = self.handle_paths.lock().get(&handle).cloned().unwrap_or_default();
        let mutated = self.guard_before(VfsOp::Write, &path).await?;
        let original_len = data.len() as u32;
        let write_data: &[u8] = mutated.as_deref().unwrap_or(data);
        let result = self.inner.write(handle, offset, write_data).await;
        match result {
            // Report the pre-mutation length to the guest regardless of
            // what the hook changed the buffer to (spec open question).
            Ok(_) => {
                self.notify_after(VfsOp::Write, &path).await;
                Ok(original_len)
            }
            Err(e) => Err(e),
        }
    }

    async fn truncate(&self, handle: u64, size: u64) -> VfsResult<()> {
        let path = self.handle_paths.lock().get(&handle).cloned().unwrap_or_default();
        self.guard_before(VfsOp::Truncate, &path).await?;
        let result = self.inner.truncate(handle, size).await;
        if result.is_ok() {
            self.notify_after(VfsOp::Truncate, &path).await;
        }
        result
    }

    async fn sync(&self, handle: u64) -> VfsResult<()> {
        let path = self.handle_paths.lock().get(&handle).cloned().unwrap_or_default();
        let result = self.inner.sync(handle).await;
        if result.is_ok() {
            self.notify_after(VfsOp::Sync, &path).await;
        }
        result
    }

    async fn close(&self, handle: u64) -> VfsResult<()> {
        let path = self.handle_paths.lock().remove(&handle).unwrap_or_default();
        let result = self.inner.close(handle).await;
        if result.is_ok() {
            self.notify_after(VfsOp::Close, &path).await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::hooks::{HookAction, HookPhase as Phase, VfsHookRule};
    use crate::vfs::providers::Memory;

    #[tokio::test]
    async fn write_reports_pre_mutation_length() {
        let inner = Arc::new(Memory::new(1 << 20));
        let rule = VfsHookRule {
            name: "rewrite".into(),
            phase: Phase::Before,
            ops: vec![VfsOp::Write],
            path_glob: "/a.txt".into(),
            action: HookAction::MutateWrite,
            data: Some(b"x".to_vec()),
            callback_id: None,
            timeout_ms: 0,
        };
        let engine = Arc::new(HookEngine::new(vec![rule], None));
        let interceptor = Interceptor::new(inner, engine);

        let h = interceptor.create("/a.txt", 0o644).await.unwrap();
        let n = interceptor.write(h, 0, b"hello").await.unwrap();
        assert_eq!(n, 5);

        let data = interceptor.read(h, 0, 10).await.unwrap();
        assert_eq!(data, b"x");
    }

    #[tokio::test]
    async fn before_block_prevents_inner_call() {
        let inner = Arc::new(Memory::new(1 << 20));
        let rule = VfsHookRule {
            name: "block".into(),
            phase: Phase::Before,
            ops: vec![VfsOp::Mkdir],
            path_glob: "/blocked".into(),
            action: HookAction::Block,
            data: None,
            callback_id: None,
            timeout_ms: 0,
        };
        let engine = Arc::new(HookEngine::new(vec![rule], None));
        let interceptor = Interceptor::new(inner.clone(), engine);

        let err = interceptor.mkdir("/blocked", 0o755).await.unwrap_err();
        assert_eq!(err, VfsError::PermissionDenied);
        assert!(inner.stat("/blocked").await.is_err());
    }
}
