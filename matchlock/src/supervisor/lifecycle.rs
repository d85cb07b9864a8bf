//! Lifecycle journal: append-only phase
//! transitions persisted to `state_dir/lifecycle.json`, read back by
//! `matchlockd` on startup to recover sandboxes left mid-transition by a
//! crashed prior process.

use matchlock_shared::{MatchlockError, MatchlockResult};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Created,
    CreateFailed,
    Starting,
    Running,
    StartFailed,
    Stopping,
    Stopped,
    StopFailed,
    Cleaning,
    Cleaned,
    CleanupFailed,
}

impl Phase {
    /// A phase a crashed daemon could have left behind mid-transition,
    /// where recovery should resume cleanup rather than assume success.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Stopped | Phase::Cleaned | Phase::CreateFailed)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct JournalEvent {
    pub phase: Phase,
    pub at: String,
    pub detail: Option<String>,
}

/// One `close()` cleanup step's outcome.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CleanupRecord {
    pub name: String,
    pub ok: bool,
    pub err: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Journal {
    pub events: Vec<JournalEvent>,
    #[serde(default)]
    pub cleanup: Vec<CleanupRecord>,
    #[serde(default)]
    pub resources: serde_json::Map<String, serde_json::Value>,
}

impl Journal {
    pub fn last_phase(&self) -> Option<Phase> {
        self.events.last().map(|e| e.phase)
    }

    pub fn record(&mut self, phase: Phase, detail: Option<String>, now: &str) {
        self.events.push(JournalEvent {
            phase,
            at: now.to_string(),
            detail,
        });
    }

    /// `MarkCleanup(name, err)`: append one cleanup
    /// step's outcome. Never short-circuits the caller's remaining
    /// steps -- it just records.
    pub fn mark_cleanup(&mut self, name: impl Into<String>, result: Result<(), String>) {
        let (ok, err) = match result {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e)),
        };
        self.cleanup.push(CleanupRecord {
            name: name.into(),
            ok,
            err,
        });
    }

    pub fn record_resource(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.resources.insert(key.into(), value);
    }

    pub fn load(path: &Path) -> MatchlockResult<Self> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| MatchlockError::State(format!("parsing lifecycle journal {}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Journal::default()),
            Err(e) => Err(MatchlockError::State(format!(
                "reading lifecycle journal {}: {e}",
                path.display()
            ))),
        }
    }

    /// Persisted by writing to a sibling temp file then renaming over the
    /// target, so a crash mid-write never leaves a truncated journal.
    pub fn save(&self, path: &Path) -> MatchlockResult<()> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| MatchlockError::State(format!("serializing lifecycle journal: {e}")))?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &bytes)
            .map_err(|e| MatchlockError::State(format!("writing lifecycle journal {}: {e}", tmp_path.display())))?;
        std::fs::rename(&tmp_path, path)
            .map_err(|e| MatchlockError::State(format!("committing lifecycle journal {}: {e}", path.display())))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> String {
        "2026-07-28T00:00:00Z".to_string()
    }

    #[test]
    fn fresh_journal_has_no_last_phase() {
        let journal = Journal::default();
        assert_eq!(journal.last_phase(), None);
    }

    #[test]
    fn record_tracks_the_most_recent_phase() {
        let mut journal = Journal::default();
        journal.record(Phase::Created, None, &now());
        journal.record(Phase::Starting, None, &now());
        journal.record(Phase::Running, Some("pid=123".into()), &now());
        assert_eq!(journal.last_phase(), Some(Phase::Running));
        assert_eq!(journal.events.len(), 3);
    }

    #[test]
    fn save_and_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lifecycle.json");
        let mut journal = Journal::default();
        journal.record(Phase::Created, None, &now());
        journal.record(Phase::Running, None, &now());
        journal.save(&path).unwrap();

        let loaded = Journal::load(&path).unwrap();
        assert_eq!(loaded.last_phase(), Some(Phase::Running));
        assert_eq!(loaded.events.len(), 2);
    }

    #[test]
    fn load_missing_file_yields_empty_journal() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lifecycle.json");
        let loaded = Journal::load(&path).unwrap();
        assert_eq!(loaded.last_phase(), None);
    }

    #[test]
    fn terminal_phases_are_flagged() {
        assert!(Phase::Stopped.is_terminal());
        assert!(Phase::Cleaned.is_terminal());
        assert!(Phase::CreateFailed.is_terminal());
        assert!(!Phase::Running.is_terminal());
        assert!(!Phase::Stopping.is_terminal());
    }
}
