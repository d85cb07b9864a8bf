//! Startup recovery pass: inspect every `state_dir/<vm-id>/` left behind
//! by a prior `matchlockd` process and reconcile its lifecycle journal with
//! reality. Pure bookkeeping -- this never reattaches a sandbox into a live
//! `SandboxRegistry` or re-opens any of its handles; a sandbox recovered
//! here is only eligible for an explicit `close` pass by an operator or a
//! future `matchlockd` call, never a live reattach (no aspect of this
//! codebase's `Sandbox` is safely reconstructible from disk alone -- its
//! VM handle, VFS server, and interception stack are all
//! live-process-only).

use matchlock_shared::{MatchlockResult, SandboxId};
use std::path::Path;

use crate::util::{is_process_alive, is_same_process};

use super::lifecycle::{Journal, Phase};

/// One `state_dir/<vm-id>/` inspected on startup.
#[derive(Debug, Clone)]
pub struct RecoveredSandbox {
    pub vm_id: String,
    pub last_phase: Option<Phase>,
    pub pid: Option<u32>,
    pub process_alive: bool,
}

fn parse_pid(detail: &str) -> Option<u32> {
    detail.strip_prefix("pid=").and_then(|s| s.parse().ok())
}

/// Scan `state_root` for sandbox directories left in a non-terminal phase
/// and report their reconciled state, marking `CleanupFailed` (with the
/// dead-process detail) on disk for directories whose recorded PID is gone.
pub fn recover(state_root: &Path) -> MatchlockResult<Vec<RecoveredSandbox>> {
    let mut recovered = Vec::new();

    let entries = match std::fs::read_dir(state_root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(recovered),
        Err(e) => {
            return Err(matchlock_shared::MatchlockError::State(format!(
                "reading state root {}: {e}",
                state_root.display()
            )))
        }
    };

    for entry in entries {
        let entry = entry.map_err(|e| matchlock_shared::MatchlockError::State(format!("listing state root: {e}")))?;
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let vm_id = entry.file_name().to_string_lossy().into_owned();
        if SandboxId::parse(&vm_id).is_none() {
            continue;
        }

        let lifecycle_path = entry.path().join("lifecycle.json");
        let mut journal = Journal::load(&lifecycle_path)?;
        let last_phase = journal.last_phase();

        let pid = journal
            .events
            .iter()
            .rev()
            .find_map(|e| e.detail.as_deref().and_then(parse_pid));

        let process_alive = pid.map(|p| is_process_alive(p) && is_same_process(p, &vm_id)).unwrap_or(false);

        if let Some(phase) = last_phase {
            if !phase.is_terminal() && !process_alive {
                journal.record(
                    Phase::CleanupFailed,
                    Some(format!(
                        "recovered at matchlockd startup: pid {pid:?} not running, sandbox left in phase {phase:?}"
                    )),
                    &chrono::Utc::now().to_rfc3339(),
                );
                let _ = journal.save(&lifecycle_path);
                tracing::warn!(sandbox = %vm_id, ?phase, ?pid, "recovered sandbox has no live process, marked CleanupFailed");
            } else if process_alive {
                tracing::info!(sandbox = %vm_id, ?phase, ?pid, "recovered sandbox process still alive");
            }
        }

        recovered.push(RecoveredSandbox {
            vm_id,
            last_phase,
            pid,
            process_alive,
        });
    }

    Ok(recovered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchlock_shared::SandboxId;

    fn write_journal(dir: &Path, vm_id: &str, phase: Phase, detail: Option<String>) {
        std::fs::create_dir_all(dir.join(vm_id)).unwrap();
        let mut journal = Journal::default();
        journal.record(phase, detail, "2026-07-28T00:00:00Z");
        journal.save(&dir.join(vm_id).join("lifecycle.json")).unwrap();
    }

    #[test]
    fn recovers_terminal_sandboxes_without_marking_them_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let id = SandboxId::generate();
        write_journal(tmp.path(), id.as_str(), Phase::Cleaned, None);

        let recovered = recover(tmp.path()).unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].last_phase, Some(Phase::Cleaned));

        let journal = Journal::load(&tmp.path().join(id.as_str()).join("lifecycle.json")).unwrap();
        assert_eq!(journal.last_phase(), Some(Phase::Cleaned));
    }

    #[test]
    fn non_terminal_sandbox_with_dead_pid_is_marked_cleanup_failed() {
        let tmp = tempfile::tempdir().unwrap();
        let id = SandboxId::generate();
        write_journal(tmp.path(), id.as_str(), Phase::Running, Some("pid=999999999".into()));

        let recovered = recover(tmp.path()).unwrap();
        assert_eq!(recovered.len(), 1);
        assert!(!recovered[0].process_alive);

        let journal = Journal::load(&tmp.path().join(id.as_str()).join("lifecycle.json")).unwrap();
        assert_eq!(journal.last_phase(), Some(Phase::CleanupFailed));
    }

    #[test]
    fn missing_state_root_yields_no_recovered_sandboxes() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("does-not-exist");
        assert!(recover(&missing).unwrap().is_empty());
    }
}
