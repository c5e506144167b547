use crate::document::Document;
use crate::error::{ChronError, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Save,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalState {
    Pending,
    GitCommitted,
    IndexCommitted,
    Completed,
    RolledBack,
}

/// One WAL entry, persisted as its own file. `content` carries the
/// post-image document for `Save`; it is absent for `Delete` (spec §4.C).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalEntry {
    pub id: String,
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub operation: Operation,
    pub document_id: String,
    pub branch: String,
    pub content: Option<serde_json::Value>,
    pub state: WalState,
}

impl WalEntry {
    pub fn content_as_document(&self) -> Result<Option<Document>> {
        match &self.content {
            Some(json) => Ok(Document::from_json(json)),
            None => Ok(None),
        }
    }
}

/// Summary returned by `recover`.
#[derive(Debug, Clone, Default)]
pub struct RecoverySummary {
    pub recovered: usize,
    pub failed: usize,
    pub entries: Vec<WalEntry>,
}

/// Health probe result (spec §4.C).
#[derive(Debug, Clone)]
pub struct WalHealth {
    pub healthy: bool,
    pub pending_count: usize,
    pub stale_count: usize,
    pub stale_entries: Vec<String>,
}

/// One-file-per-entry append-only WAL directory. Each entry's filename
/// encodes its monotonic sequence and id so recovery can replay entries in
/// order without a separate index.
pub struct Wal {
    dir: PathBuf,
    next_sequence: Mutex<u64>,
    max_pending_age: chrono::Duration,
}

impl Wal {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let mut max_seq = 0u64;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(seq) = sequence_from_filename(&entry.file_name().to_string_lossy()) {
                max_seq = max_seq.max(seq);
            }
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            next_sequence: Mutex::new(max_seq + 1),
            max_pending_age: chrono::Duration::seconds(60),
        })
    }

    pub fn with_max_pending_age(mut self, age: chrono::Duration) -> Self {
        self.max_pending_age = age;
        self
    }

    fn entry_path(&self, sequence: u64, id: &str) -> PathBuf {
        self.dir.join(format!("{:020}-{}.json", sequence, id))
    }

    fn find_path(&self, sequence: u64, id: &str) -> PathBuf {
        self.entry_path(sequence, id)
    }

    /// Append a PENDING entry for a new mutation. Returns the entry so the
    /// caller can thread its id/sequence through subsequent state
    /// transitions.
    pub fn append_pending(
        &self,
        operation: Operation,
        document_id: &str,
        branch: &str,
        content: Option<serde_json::Value>,
    ) -> Result<WalEntry> {
        let mut seq_guard = self.next_sequence.lock().unwrap();
        let sequence = *seq_guard;
        *seq_guard += 1;
        drop(seq_guard);

        let entry = WalEntry {
            id: uuid::Uuid::new_v4().to_string(),
            sequence,
            created_at: Utc::now(),
            operation,
            document_id: document_id.to_string(),
            branch: branch.to_string(),
            content,
            state: WalState::Pending,
        };
        self.write_entry(&entry)?;
        debug!("wal: appended PENDING entry {} for {}", entry.id, document_id);
        Ok(entry)
    }

    /// Advance an entry's state, rewriting its file atomically
    /// (write-to-temp + rename).
    pub fn advance(&self, entry: &mut WalEntry, new_state: WalState) -> Result<()> {
        let old_path = self.find_path(entry.sequence, &entry.id);
        entry.state = new_state;
        let tmp = old_path.with_extension("tmp");
        let data = serde_json::to_vec(entry)?;
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &old_path)?;
        debug!("wal: entry {} -> {:?}", entry.id, new_state);
        Ok(())
    }

    fn write_entry(&self, entry: &WalEntry) -> Result<()> {
        let path = self.entry_path(entry.sequence, &entry.id);
        let data = serde_json::to_vec(entry)?;
        fs::write(path, data)?;
        Ok(())
    }

    /// Remove a COMPLETED (or operator-approved ROLLED_BACK) entry's file.
    pub fn truncate_entry(&self, entry: &WalEntry) -> Result<()> {
        let path = self.find_path(entry.sequence, &entry.id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<WalEntry>> {
        let mut entries = Vec::new();
        if !self.dir.exists() {
            return Ok(entries);
        }
        for dir_entry in fs::read_dir(&self.dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".json") {
                continue;
            }
            let data = fs::read(dir_entry.path())?;
            match serde_json::from_slice::<WalEntry>(&data) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("wal: skipping corrupt entry {}: {}", name, e),
            }
        }
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    /// Replay every non-terminal entry in ascending sequence, calling
    /// `replay_save`/`replay_delete` to redo the object-store-and-index
    /// work, then `reindex` for entries already past the object store.
    /// On any single entry's failure, marks it ROLLED_BACK and continues.
    pub fn recover<FSave, FDelete, FReindex>(
        &self,
        mut replay_save: FSave,
        mut replay_delete: FDelete,
        mut reindex: FReindex,
    ) -> Result<RecoverySummary>
    where
        FSave: FnMut(&str, &str, &serde_json::Value) -> Result<()>,
        FDelete: FnMut(&str, &str) -> Result<()>,
        FReindex: FnMut(&str, &str, Option<&serde_json::Value>) -> Result<()>,
    {
        let mut summary = RecoverySummary::default();
        for mut entry in self.read_all()? {
            let outcome: Result<()> = (|| {
                match entry.state {
                    WalState::Pending => {
                        match (entry.operation, &entry.content) {
                            (Operation::Save, Some(content)) => {
                                replay_save(&entry.branch, &entry.document_id, content)?
                            }
                            (Operation::Delete, _) => {
                                replay_delete(&entry.branch, &entry.document_id)?
                            }
                            _ => {}
                        }
                        self.advance(&mut entry, WalState::GitCommitted)?;
                        reindex(&entry.branch, &entry.document_id, entry.content.as_ref())?;
                        self.advance(&mut entry, WalState::IndexCommitted)?;
                        self.advance(&mut entry, WalState::Completed)?;
                    }
                    WalState::GitCommitted => {
                        reindex(&entry.branch, &entry.document_id, entry.content.as_ref())?;
                        self.advance(&mut entry, WalState::IndexCommitted)?;
                        self.advance(&mut entry, WalState::Completed)?;
                    }
                    WalState::IndexCommitted => {
                        self.advance(&mut entry, WalState::Completed)?;
                    }
                    WalState::Completed | WalState::RolledBack => {}
                }
                Ok(())
            })();

            match outcome {
                Ok(()) => {
                    if entry.state == WalState::Completed {
                        summary.recovered += 1;
                    }
                }
                Err(e) => {
                    warn!("wal: recovery failed for entry {}: {}", entry.id, e);
                    let _ = self.advance(&mut entry, WalState::RolledBack);
                    summary.failed += 1;
                }
            }
            summary.entries.push(entry);
        }

        // Truncate everything that finished COMPLETED.
        for entry in summary.entries.iter().filter(|e| e.state == WalState::Completed) {
            self.truncate_entry(entry)?;
        }

        Ok(summary)
    }

    pub fn health(&self) -> Result<WalHealth> {
        let entries = self.read_all()?;
        let now = Utc::now();
        let pending: Vec<_> = entries
            .iter()
            .filter(|e| !matches!(e.state, WalState::Completed | WalState::RolledBack))
            .collect();
        let stale: Vec<_> = pending
            .iter()
            .filter(|e| now.signed_duration_since(e.created_at) > self.max_pending_age)
            .map(|e| e.id.clone())
            .collect();

        Ok(WalHealth {
            healthy: stale.is_empty(),
            pending_count: pending.len(),
            stale_count: stale.len(),
            stale_entries: stale,
        })
    }

    pub fn size(&self) -> u64 {
        fs::read_dir(&self.dir)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .filter_map(|e| e.metadata().ok())
                    .map(|m| m.len())
                    .sum()
            })
            .unwrap_or(0)
    }
}

fn sequence_from_filename(name: &str) -> Option<u64> {
    name.split('-').next()?.parse().ok()
}

/// Convenience map used by recovery callers keyed by document id.
pub type ContentMap = HashMap<String, serde_json::Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_advance_through_states() {
        let tmp = tempfile::tempdir().unwrap();
        let wal = Wal::open(tmp.path()).unwrap();
        let mut entry = wal
            .append_pending(Operation::Save, "user:1", "main", Some(serde_json::json!({"id":"user:1"})))
            .unwrap();
        assert_eq!(entry.state, WalState::Pending);
        wal.advance(&mut entry, WalState::GitCommitted).unwrap();
        wal.advance(&mut entry, WalState::IndexCommitted).unwrap();
        wal.advance(&mut entry, WalState::Completed).unwrap();
        assert_eq!(entry.state, WalState::Completed);
    }

    #[test]
    fn recovery_replays_pending_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let wal = Wal::open(tmp.path()).unwrap();
        wal.append_pending(Operation::Save, "user:1", "main", Some(serde_json::json!({"id":"user:1"})))
            .unwrap();

        let summary = wal
            .recover(
                |_branch, _id, _content| Ok(()),
                |_branch, _id| Ok(()),
                |_branch, _id, _content| Ok(()),
            )
            .unwrap();
        assert_eq!(summary.recovered, 1);
        assert_eq!(summary.failed, 0);
    }

    #[test]
    fn recovery_marks_failures_rolled_back() {
        let tmp = tempfile::tempdir().unwrap();
        let wal = Wal::open(tmp.path()).unwrap();
        wal.append_pending(Operation::Save, "user:1", "main", Some(serde_json::json!({"id":"user:1"})))
            .unwrap();

        let summary = wal
            .recover(
                |_b, _i, _c| Err(ChronError::StorageUnavailable),
                |_b, _i| Ok(()),
                |_b, _i, _c| Ok(()),
            )
            .unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.recovered, 0);
    }

    #[test]
    fn completed_entries_are_truncated() {
        let tmp = tempfile::tempdir().unwrap();
        let wal = Wal::open(tmp.path()).unwrap();
        wal.append_pending(Operation::Save, "x", "main", Some(serde_json::json!({"id":"x"})))
            .unwrap();
        wal.recover(|_, _, _| Ok(()), |_, _| Ok(()), |_, _, _| Ok(()))
            .unwrap();
        assert_eq!(wal.read_all().unwrap().len(), 0);
    }

    #[test]
    fn health_reports_stale_pending() {
        let tmp = tempfile::tempdir().unwrap();
        let wal = Wal::open(tmp.path())
            .unwrap()
            .with_max_pending_age(chrono::Duration::seconds(-1));
        wal.append_pending(Operation::Save, "x", "main", Some(serde_json::json!({"id":"x"})))
            .unwrap();
        let health = wal.health().unwrap();
        assert!(!health.healthy);
        assert_eq!(health.stale_count, 1);
    }

    #[test]
    fn reopen_continues_sequence() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let wal = Wal::open(tmp.path()).unwrap();
            wal.append_pending(Operation::Save, "a", "main", None).unwrap();
        }
        let wal = Wal::open(tmp.path()).unwrap();
        let entry = wal.append_pending(Operation::Save, "b", "main", None).unwrap();
        assert!(entry.sequence > 1);
    }
}
