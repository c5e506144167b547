use crate::block::ObjectHash;
use crate::error::Result;
use crate::store::ObjectStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Configuration for compaction / garbage collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompactionPolicy {
    /// Maximum number of versions to retain per branch (0 = unlimited).
    pub max_versions: usize,
    /// Maximum age of commits to retain (None = unlimited).
    pub max_age_days: Option<u64>,
}

/// Result of a compaction run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionResult {
    pub commits_removed: usize,
    pub trees_removed: usize,
    pub blobs_removed: usize,
    pub bytes_reclaimed: u64,
}

impl std::fmt::Display for CompactionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Commits removed: {}", self.commits_removed)?;
        writeln!(f, "Trees removed:   {}", self.trees_removed)?;
        writeln!(f, "Blobs removed:   {}", self.blobs_removed)?;
        writeln!(f, "Bytes reclaimed: {}", self.bytes_reclaimed)?;
        Ok(())
    }
}

/// Determine which commits fall outside `policy`'s retention window, given
/// a branch's commits newest-first. Returns the ids to drop.
pub fn find_removable_commits(
    commits: &[(String, DateTime<Utc>)],
    policy: &CompactionPolicy,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut to_remove = Vec::new();

    for (i, (id, ts)) in commits.iter().enumerate() {
        let mut should_remove = false;

        if policy.max_versions > 0 && i >= policy.max_versions {
            should_remove = true;
        }

        if let Some(max_days) = policy.max_age_days {
            let age = now.signed_duration_since(*ts);
            if age.num_days() > max_days as i64 {
                should_remove = true;
            }
        }

        if should_remove {
            to_remove.push(id.clone());
        }
    }

    to_remove
}

/// Computes the set of commits/trees/blobs `policy` keeps alive across
/// `branches`: each branch's first-parent chain up to its retention
/// boundary, plus the full multi-parent ancestry of any merge commit along
/// that chain — a merge's non-first parents are never pruned, since the
/// policy only bounds a branch's own depth, not the history it merged in.
pub fn reachable_under_policy(
    store: &ObjectStore,
    branches: &[String],
    policy: &CompactionPolicy,
    now: DateTime<Utc>,
) -> Result<(HashSet<ObjectHash>, HashSet<ObjectHash>, HashSet<ObjectHash>)> {
    let mut commit_ids = HashSet::new();

    for branch in branches {
        let log = store.log(branch)?;
        let timestamps: Vec<(String, DateTime<Utc>)> =
            log.iter().map(|c| (c.id.clone(), c.timestamp)).collect();
        let removable: HashSet<String> = find_removable_commits(&timestamps, policy, now)
            .into_iter()
            .collect();

        for commit in &log {
            if removable.contains(&commit.id) {
                continue;
            }
            commit_ids.insert(commit.id.clone());
            for parent in commit.parents.iter().skip(1) {
                mark_ancestry(store, parent, &mut commit_ids)?;
            }
        }
    }

    let mut tree_hashes = HashSet::new();
    let mut blob_hashes = HashSet::new();
    for id in &commit_ids {
        let commit = store.load_commit(id)?;
        if tree_hashes.insert(commit.tree_root.clone()) {
            let tree = store.load_tree_by_hash(&commit.tree_root)?;
            for (_, blob_hash) in tree.walk() {
                blob_hashes.insert(blob_hash);
            }
        }
    }

    Ok((commit_ids, tree_hashes, blob_hashes))
}

fn mark_ancestry(store: &ObjectStore, start: &ObjectHash, seen: &mut HashSet<ObjectHash>) -> Result<()> {
    let mut stack = vec![start.clone()];
    while let Some(id) = stack.pop() {
        if !seen.insert(id.clone()) {
            continue;
        }
        let commit = store.load_commit(&id)?;
        stack.extend(commit.parents.iter().cloned());
    }
    Ok(())
}

/// Deletes every on-disk commit/tree/blob absent from the reachable sets.
pub fn sweep(
    store: &ObjectStore,
    commits: &HashSet<ObjectHash>,
    trees: &HashSet<ObjectHash>,
    blobs: &HashSet<ObjectHash>,
) -> Result<CompactionResult> {
    let mut result = CompactionResult::default();

    for id in store.list_all_commits()? {
        if !commits.contains(&id) {
            result.bytes_reclaimed += store.purge_commit(&id)?;
            result.commits_removed += 1;
        }
    }
    for hash in store.list_all_trees()? {
        if !trees.contains(&hash) {
            result.bytes_reclaimed += store.purge_tree(&hash)?;
            result.trees_removed += 1;
        }
    }
    for hash in store.list_all_blobs()? {
        if !blobs.contains(&hash) {
            result.bytes_reclaimed += store.purge_blob(&hash)?;
            result.blobs_removed += 1;
        }
    }

    Ok(result)
}

/// Runs retention-bounded garbage collection across `branches` in one
/// shot: computes what `policy` keeps alive, then sweeps everything else.
pub fn compact(
    store: &ObjectStore,
    branches: &[String],
    policy: &CompactionPolicy,
    now: DateTime<Utc>,
) -> Result<CompactionResult> {
    let (commits, trees, blobs) = reachable_under_policy(store, branches, policy, now)?;
    sweep(store, &commits, &trees, &blobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use chrono::Duration;

    #[test]
    fn no_policy_removes_nothing() {
        let now = Utc::now();
        let commits = vec![
            ("a".into(), now),
            ("b".into(), now - Duration::days(1)),
            ("c".into(), now - Duration::days(2)),
        ];
        let policy = CompactionPolicy::default();
        let removable = find_removable_commits(&commits, &policy, now);
        assert!(removable.is_empty());
    }

    #[test]
    fn max_versions_removes_old() {
        let now = Utc::now();
        let commits = vec![
            ("a".into(), now),
            ("b".into(), now - Duration::days(1)),
            ("c".into(), now - Duration::days(2)),
            ("d".into(), now - Duration::days(3)),
        ];
        let policy = CompactionPolicy {
            max_versions: 2,
            max_age_days: None,
        };
        let removable = find_removable_commits(&commits, &policy, now);
        assert_eq!(removable, vec!["c", "d"]);
    }

    #[test]
    fn max_age_removes_old() {
        let now = Utc::now();
        let commits = vec![
            ("a".into(), now),
            ("b".into(), now - Duration::days(5)),
            ("c".into(), now - Duration::days(10)),
        ];
        let policy = CompactionPolicy {
            max_versions: 0,
            max_age_days: Some(7),
        };
        let removable = find_removable_commits(&commits, &policy, now);
        assert_eq!(removable, vec!["c"]);
    }

    fn test_store() -> (tempfile::TempDir, ObjectStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(tmp.path()).unwrap();
        (tmp, store)
    }

    fn doc(id: &str) -> Document {
        Document::from_json(&serde_json::json!({"id": id, "_table": "x"})).unwrap()
    }

    #[test]
    fn compact_prunes_beyond_retained_version_count() {
        let (_tmp, store) = test_store();
        for i in 0..5 {
            store
                .put_document("main", &doc(&format!("d{}", i)), "a", "a", "m", None)
                .unwrap();
        }
        let policy = CompactionPolicy {
            max_versions: 2,
            max_age_days: None,
        };
        let result = compact(&store, &["main".to_string()], &policy, Utc::now()).unwrap();
        assert_eq!(result.commits_removed, 3);
        assert_eq!(store.list_all_commits().unwrap().len(), 2);
    }

    #[test]
    fn compact_keeps_objects_still_reachable_from_another_branch() {
        let (_tmp, store) = test_store();
        store.put_document("main", &doc("shared"), "a", "a", "m", None).unwrap();
        store.create_branch("dev", "main").unwrap();
        store.put_document("dev", &doc("dev-only"), "a", "a", "m", None).unwrap();

        let policy = CompactionPolicy {
            max_versions: 1,
            max_age_days: None,
        };
        let branches = vec!["main".to_string(), "dev".to_string()];
        let result = compact(&store, &branches, &policy, Utc::now()).unwrap();
        assert_eq!(result.commits_removed, 0);
        assert!(store.get_document("dev", "shared", None).unwrap().is_some());
    }
}
