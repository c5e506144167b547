use crate::block::ObjectHash;
use crate::error::{ChronError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_BRANCH: &str = "main";

/// Persistent `refs/heads/{branch}` pointers plus the repository's notion
/// of "current branch" for single-handle CLI-style use. Each branch maps
/// to a commit id; a branch with no commits yet simply has no entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefTable {
    pub branches: HashMap<String, ObjectHash>,
}

/// Ref storage: one file per branch under `refs/heads/`, matching the
/// conventional git layout (spec §6).
pub struct RefStore {
    dir: PathBuf,
}

impl RefStore {
    pub fn open(repo_root: &Path) -> Result<Self> {
        let dir = repo_root.join("refs").join("heads");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn branch_path(&self, branch: &str) -> PathBuf {
        self.dir.join(branch)
    }

    pub fn get(&self, branch: &str) -> Result<Option<ObjectHash>> {
        let path = self.branch_path(branch);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(path)?.trim().to_string()))
    }

    pub fn exists(&self, branch: &str) -> bool {
        self.branch_path(branch).exists()
    }

    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        if self.dir.exists() {
            for entry in fs::read_dir(&self.dir)? {
                let entry = entry?;
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Atomically advance `branch` from `expected_old` to `new`. Fails with
    /// `StaleBranch` if the observed head doesn't match — this is the CAS
    /// contract spec §4.A requires of `put_document`/`delete_document`.
    pub fn compare_and_set(
        &self,
        branch: &str,
        expected_old: Option<&ObjectHash>,
        new: &ObjectHash,
    ) -> Result<()> {
        let current = self.get(branch)?;
        if current.as_ref() != expected_old {
            return Err(ChronError::StaleBranch {
                branch: branch.to_string(),
            });
        }
        self.force_set(branch, new)
    }

    /// Unconditional set, used for branch creation/checkout bookkeeping
    /// where no prior writer could have raced us (e.g. `create_branch`).
    pub fn force_set(&self, branch: &str, new: &ObjectHash) -> Result<()> {
        let tmp = self.branch_path(branch).with_extension("tmp");
        fs::write(&tmp, new)?;
        fs::rename(&tmp, self.branch_path(branch))?;
        Ok(())
    }

    pub fn delete(&self, branch: &str) -> Result<()> {
        let path = self.branch_path(branch);
        if !path.exists() {
            return Err(ChronError::BranchNotFound(branch.to_string()));
        }
        fs::remove_file(path)?;
        Ok(())
    }
}
