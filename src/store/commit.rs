use crate::block::{compute_hash, ObjectHash};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// An immutable commit: a snapshot of a tree plus provenance. Parents form
/// an acyclic graph; a merge commit has two or more. The `id` is the
/// content hash of every other field, so identical commits (including
/// identical parents-in-order) collide to the same id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Commit {
    pub id: ObjectHash,
    pub parents: Vec<ObjectHash>,
    pub tree_root: ObjectHash,
    pub author: String,
    pub committer: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl Commit {
    pub fn new(
        parents: Vec<ObjectHash>,
        tree_root: ObjectHash,
        author: String,
        committer: String,
        message: String,
    ) -> Self {
        Self::with_timestamp(parents, tree_root, author, committer, message, Utc::now())
    }

    pub fn with_timestamp(
        parents: Vec<ObjectHash>,
        tree_root: ObjectHash,
        author: String,
        committer: String,
        message: String,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let id = Self::compute_id(&parents, &tree_root, &author, &committer, &timestamp, &message);
        Self {
            id,
            parents,
            tree_root,
            author,
            committer,
            timestamp,
            message,
        }
    }

    /// Refuse to construct a commit that declares itself as its own parent;
    /// content addressing already rules out real cycles deeper than that
    /// (an ancestor's hash can never equal a descendant's because the
    /// descendant's hash input includes the ancestor's), but a direct
    /// self-reference is cheap to catch at construction time.
    pub fn parents_are_acyclic(parents: &[ObjectHash], self_id: &str) -> bool {
        !parents.iter().any(|p| p == self_id)
    }

    fn compute_id(
        parents: &[ObjectHash],
        tree_root: &ObjectHash,
        author: &str,
        committer: &str,
        timestamp: &DateTime<Utc>,
        message: &str,
    ) -> ObjectHash {
        let parents_joined = parents.join(",");
        let payload = format!(
            "parents:{}\ntree:{}\nauthor:{}\ncommitter:{}\ntime:{}\nmsg:{}",
            parents_joined,
            tree_root,
            author,
            committer,
            timestamp.to_rfc3339(),
            message,
        );
        compute_hash(payload.as_bytes())
    }
}

/// Out-of-band transaction metadata attached to a commit id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Note {
    pub tx_id: Option<String>,
    pub origin: Option<String>,
    pub user: Option<String>,
    pub flags: BTreeSet<String>,
    pub metadata: BTreeMap<String, String>,
}

impl Note {
    /// Merge another note onto this one: `flags` set-union, `metadata`
    /// map-merge, every scalar field last-write-wins (the `other` side
    /// wins when both have a value, per spec §3).
    pub fn merge(&self, other: &Note) -> Note {
        let mut flags = self.flags.clone();
        flags.extend(other.flags.iter().cloned());

        let mut metadata = self.metadata.clone();
        metadata.extend(other.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));

        Note {
            tx_id: other.tx_id.clone().or_else(|| self.tx_id.clone()),
            origin: other.origin.clone().or_else(|| self.origin.clone()),
            user: other.user.clone().or_else(|| self.user.clone()),
            flags,
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_has_unique_id() {
        let c1 = Commit::new(vec![], "abc".into(), "a".into(), "a".into(), "first".into());
        let c2 = Commit::new(
            vec![c1.id.clone()],
            "def".into(),
            "a".into(),
            "a".into(),
            "second".into(),
        );
        assert_ne!(c1.id, c2.id);
    }

    #[test]
    fn deterministic_with_same_inputs() {
        let ts = Utc::now();
        let c1 = Commit::with_timestamp(vec![], "root".into(), "a".into(), "a".into(), "m".into(), ts);
        let c2 = Commit::with_timestamp(vec![], "root".into(), "a".into(), "a".into(), "m".into(), ts);
        assert_eq!(c1.id, c2.id);
    }

    #[test]
    fn merge_commit_has_two_parents() {
        let p1 = Commit::new(vec![], "t1".into(), "a".into(), "a".into(), "one".into());
        let p2 = Commit::new(vec![], "t2".into(), "a".into(), "a".into(), "two".into());
        let merge = Commit::new(
            vec![p1.id.clone(), p2.id.clone()],
            "t3".into(),
            "a".into(),
            "a".into(),
            "merge".into(),
        );
        assert_eq!(merge.parents.len(), 2);
    }

    #[test]
    fn note_merge_union_and_mapmerge() {
        let mut n1 = Note::default();
        n1.flags.insert("a".into());
        n1.metadata.insert("k1".into(), "v1".into());
        n1.user = Some("alice".into());

        let mut n2 = Note::default();
        n2.flags.insert("b".into());
        n2.metadata.insert("k2".into(), "v2".into());
        n2.user = Some("bob".into());

        let merged = n1.merge(&n2);
        assert_eq!(merged.flags.len(), 2);
        assert_eq!(merged.metadata.len(), 2);
        assert_eq!(merged.user, Some("bob".into()));
    }
}
