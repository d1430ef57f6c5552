//! Durable session storage.
//!
//! A session directory holds `state.json`, `transcript.json`, and an
//! `artifacts/` directory of immutable versioned text files. Every write
//! goes through write-temp → fsync → rename, so a reader never observes a
//! partial file; leftover temp files from a crashed run are swept when the
//! session is opened. State is saved only *after* the artifact it references
//! has been committed — the orchestrator enforces that ordering.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::errors::WorkflowError;
use crate::state::{ArtifactRef, WorkflowState};
use crate::transcript::Transcript;

const STATE_FILE: &str = "state.json";
const TRANSCRIPT_FILE: &str = "transcript.json";
const ARTIFACTS_DIR: &str = "artifacts";

/// Storage boundary for one workflow session.
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    /// Open (or create) a session directory, sweeping any partial temp files
    /// left behind by a previous crash.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, WorkflowError> {
        let root = root.into();
        let artifacts = root.join(ARTIFACTS_DIR);
        fs::create_dir_all(&artifacts)
            .map_err(|e| WorkflowError::storage("failed to create session directory", e))?;

        let store = Self { root };
        store.sweep_partials()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state_path(&self) -> PathBuf {
        self.root.join(STATE_FILE)
    }

    fn transcript_path(&self) -> PathBuf {
        self.root.join(TRANSCRIPT_FILE)
    }

    fn artifact_path(&self, artifact_ref: &str) -> PathBuf {
        self.root.join(ARTIFACTS_DIR).join(artifact_ref)
    }

    /// Remove `tempfile` droppings (`.tmp*`) from the session root and the
    /// artifact directory.
    fn sweep_partials(&self) -> Result<(), WorkflowError> {
        for dir in [self.root.clone(), self.root.join(ARTIFACTS_DIR)] {
            let entries = fs::read_dir(&dir)
                .map_err(|e| WorkflowError::storage("failed to list session directory", e))?;
            for entry in entries.flatten() {
                let name = entry.file_name();
                let is_partial = name.to_string_lossy().starts_with(".tmp");
                if is_partial {
                    warn!(file = %entry.path().display(), "removing partial file from previous run");
                    if let Err(e) = fs::remove_file(entry.path()) {
                        return Err(WorkflowError::storage("failed to remove partial file", e));
                    }
                }
            }
        }
        Ok(())
    }

    /// Write-temp → fsync → rename in the target's own directory.
    fn write_atomic(&self, path: &Path, content: &str) -> Result<(), WorkflowError> {
        let parent = path
            .parent()
            .ok_or_else(|| WorkflowError::storage_msg("target path has no parent directory"))?;

        let mut temp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| WorkflowError::storage("failed to create temp file", e))?;
        temp.write_all(content.as_bytes())
            .map_err(|e| WorkflowError::storage("failed to write temp file", e))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| WorkflowError::storage("failed to fsync temp file", e))?;
        temp.persist(path)
            .map_err(|e| WorkflowError::storage("failed to rename temp file into place", e.error))?;

        debug!(file = %path.display(), "committed");
        Ok(())
    }

    /// Commit an immutable artifact and return its reference. The reference
    /// is the file name, relative to the session's artifact directory;
    /// callers pick a fresh name per version.
    pub fn commit_artifact(
        &self,
        name: &str,
        content: &str,
    ) -> Result<ArtifactRef, WorkflowError> {
        self.write_atomic(&self.artifact_path(name), content)?;
        Ok(name.to_string())
    }

    pub fn read_artifact(&self, artifact_ref: &str) -> Result<String, WorkflowError> {
        fs::read_to_string(self.artifact_path(artifact_ref))
            .map_err(|e| WorkflowError::storage(format!("failed to read artifact {artifact_ref}"), e))
    }

    pub fn artifact_exists(&self, artifact_ref: &str) -> bool {
        self.artifact_path(artifact_ref).exists()
    }

    pub fn save_state(&self, state: &WorkflowState) -> Result<(), WorkflowError> {
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| WorkflowError::storage_msg(format!("failed to serialize state: {e}")))?;
        self.write_atomic(&self.state_path(), &json)
    }

    /// Load persisted state, or `None` for a fresh session directory.
    pub fn load_state(&self) -> Result<Option<WorkflowState>, WorkflowError> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)
            .map_err(|e| WorkflowError::storage("failed to read state file", e))?;
        let state = serde_json::from_str(&json)
            .map_err(|e| WorkflowError::storage_msg(format!("state file is corrupt: {e}")))?;
        Ok(Some(state))
    }

    pub fn save_transcript(&self, transcript: &Transcript) -> Result<(), WorkflowError> {
        let json = serde_json::to_string_pretty(transcript).map_err(|e| {
            WorkflowError::storage_msg(format!("failed to serialize transcript: {e}"))
        })?;
        self.write_atomic(&self.transcript_path(), &json)
    }

    pub fn load_transcript(&self) -> Result<Option<Transcript>, WorkflowError> {
        let path = self.transcript_path();
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)
            .map_err(|e| WorkflowError::storage("failed to read transcript file", e))?;
        let transcript = serde_json::from_str(&json)
            .map_err(|e| WorkflowError::storage_msg(format!("transcript file is corrupt: {e}")))?;
        Ok(Some(transcript))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::WorkflowPhase;
    use crate::state::RoundState;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory_layout() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("session-1");
        let store = SessionStore::open(&root).unwrap();
        assert!(root.join("artifacts").is_dir());
        assert!(store.load_state().unwrap().is_none());
        assert!(store.load_transcript().unwrap().is_none());
    }

    #[test]
    fn state_round_trips() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();

        let mut state = WorkflowState::new("a todo app");
        state.phase = WorkflowPhase::Reviewing;
        state.current_round = 1;
        state.rounds.insert(1, RoundState::for_reviewers(["a", "b"]));
        store.save_state(&state).unwrap();

        let loaded = store.load_state().unwrap().unwrap();
        assert_eq!(loaded.phase, WorkflowPhase::Reviewing);
        assert_eq!(loaded.current_round, 1);
        assert_eq!(loaded.rounds[&1].reviewers.len(), 2);
    }

    #[test]
    fn transcript_round_trips() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();

        let mut transcript = Transcript::new();
        transcript.push_user("idea");
        transcript.push_assistant("question");
        store.save_transcript(&transcript).unwrap();

        let loaded = store.load_transcript().unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
    }

    #[test]
    fn artifacts_commit_and_read_back() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();

        let reference = store.commit_artifact("draft-v1.md", "# Draft").unwrap();
        assert_eq!(reference, "draft-v1.md");
        assert!(store.artifact_exists("draft-v1.md"));
        assert_eq!(store.read_artifact(&reference).unwrap(), "# Draft");
    }

    #[test]
    fn save_replaces_atomically_without_leftovers() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();

        let state = WorkflowState::new("one");
        store.save_state(&state).unwrap();
        store.save_state(&state).unwrap();

        // No temp droppings after successful writes.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn open_sweeps_partial_files() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("session");
        fs::create_dir_all(root.join("artifacts")).unwrap();
        fs::write(root.join(".tmpAbC123"), "partial").unwrap();
        fs::write(root.join("artifacts/.tmpXyZ987"), "partial").unwrap();
        fs::write(root.join("artifacts/kept.md"), "committed").unwrap();

        let store = SessionStore::open(&root).unwrap();
        assert!(!root.join(".tmpAbC123").exists());
        assert!(!root.join("artifacts/.tmpXyZ987").exists());
        assert_eq!(store.read_artifact("kept.md").unwrap(), "committed");
    }

    #[test]
    fn corrupt_state_is_a_storage_fault() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        fs::write(dir.path().join("state.json"), "{not json").unwrap();

        let err = store.load_state().unwrap_err();
        assert!(matches!(err, WorkflowError::Storage { .. }));
    }

    #[test]
    fn missing_artifact_read_is_a_storage_fault() {
        let dir = tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        let err = store.read_artifact("nope.md").unwrap_err();
        assert!(matches!(err, WorkflowError::Storage { .. }));
    }
}
