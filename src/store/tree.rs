use crate::block::{compute_hash, ObjectHash};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An immutable, content-addressed directory: a sorted map from
/// path-segment to either a blob (a leaf document) or a nested sub-tree.
/// Every mutation (`insert`/`remove`) is copy-on-write and produces a new
/// `Tree` with a new `root_hash`; the original is untouched (spec: objects
/// are immutable once written).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tree {
    pub root_hash: ObjectHash,
    pub entries: BTreeMap<String, TreeEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TreeEntry {
    Blob(ObjectHash),
    Tree(Tree),
}

impl Tree {
    pub fn empty() -> Self {
        let entries = BTreeMap::new();
        let root_hash = Self::compute_root(&entries);
        Self { root_hash, entries }
    }

    fn compute_root(entries: &BTreeMap<String, TreeEntry>) -> ObjectHash {
        // Canonical: sorted keys (guaranteed by BTreeMap) + entry kind tag.
        let mut buf = String::new();
        for (k, v) in entries {
            match v {
                TreeEntry::Blob(h) => buf.push_str(&format!("b:{}={}\n", k, h)),
                TreeEntry::Tree(t) => buf.push_str(&format!("t:{}={}\n", k, t.root_hash)),
            }
        }
        compute_hash(buf.as_bytes())
    }

    fn rebuilt(entries: BTreeMap<String, TreeEntry>) -> Self {
        let root_hash = Self::compute_root(&entries);
        Self { root_hash, entries }
    }

    /// Insert a blob at a slash-separated path, returning a new tree with
    /// every ancestor segment along the path rehashed.
    pub fn insert(&self, path: &str, blob_hash: ObjectHash) -> Self {
        let (head, rest) = split_first_segment(path);
        let mut entries = self.entries.clone();
        match rest {
            None => {
                entries.insert(head.to_string(), TreeEntry::Blob(blob_hash));
            }
            Some(rest) => {
                let child = match entries.get(head) {
                    Some(TreeEntry::Tree(t)) => t.clone(),
                    _ => Tree::empty(),
                };
                let new_child = child.insert(rest, blob_hash);
                entries.insert(head.to_string(), TreeEntry::Tree(new_child));
            }
        }
        Self::rebuilt(entries)
    }

    /// Remove a path; intermediate directories that become empty are
    /// pruned. No-op (returns a clone) if the path is absent.
    pub fn remove(&self, path: &str) -> Self {
        let (head, rest) = split_first_segment(path);
        let mut entries = self.entries.clone();
        match rest {
            None => {
                entries.remove(head);
            }
            Some(rest) => {
                if let Some(TreeEntry::Tree(child)) = entries.get(head) {
                    let new_child = child.remove(rest);
                    if new_child.entries.is_empty() {
                        entries.remove(head);
                    } else {
                        entries.insert(head.to_string(), TreeEntry::Tree(new_child));
                    }
                }
            }
        }
        Self::rebuilt(entries)
    }

    pub fn get(&self, path: &str) -> Option<&ObjectHash> {
        let (head, rest) = split_first_segment(path);
        match (self.entries.get(head), rest) {
            (Some(TreeEntry::Blob(h)), None) => Some(h),
            (Some(TreeEntry::Tree(t)), Some(rest)) => t.get(rest),
            _ => None,
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Walk the full tree, yielding `(path, blob_hash)` pairs in
    /// lexicographic path order.
    pub fn walk(&self) -> Vec<(String, ObjectHash)> {
        let mut out = Vec::new();
        self.walk_into("", &mut out);
        out
    }

    fn walk_into(&self, prefix: &str, out: &mut Vec<(String, ObjectHash)>) {
        for (k, v) in &self.entries {
            let path = if prefix.is_empty() {
                k.clone()
            } else {
                format!("{}/{}", prefix, k)
            };
            match v {
                TreeEntry::Blob(h) => out.push((path, h.clone())),
                TreeEntry::Tree(t) => t.walk_into(&path, out),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.walk().len()
    }

    /// Shallow structural diff between two trees over their full set of
    /// leaf paths (DESIGN.md Open Question #2 — one-level nesting in
    /// practice, arbitrary depth supported for forward compatibility).
    pub fn diff(&self, other: &Tree) -> TreeDiff {
        let a: BTreeMap<_, _> = self.walk().into_iter().collect();
        let b: BTreeMap<_, _> = other.walk().into_iter().collect();

        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut modified = Vec::new();

        for (path, hash) in &b {
            match a.get(path) {
                None => added.push(path.clone()),
                Some(old) if old != hash => modified.push(path.clone()),
                _ => {}
            }
        }
        for path in a.keys() {
            if !b.contains_key(path) {
                removed.push(path.clone());
            }
        }

        TreeDiff {
            added,
            removed,
            modified,
        }
    }
}

fn split_first_segment(path: &str) -> (&str, Option<&str>) {
    match path.split_once('/') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TreeDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
}

impl TreeDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tree() {
        let t = Tree::empty();
        assert!(t.is_empty());
    }

    #[test]
    fn insert_and_get_nested_path() {
        let t = Tree::empty().insert("user/1.json", "h1".into());
        assert_eq!(t.get("user/1.json"), Some(&"h1".to_string()));
        assert!(t.get("user/2.json").is_none());
    }

    #[test]
    fn insert_is_copy_on_write() {
        let t1 = Tree::empty();
        let t2 = t1.insert("a/b.json", "h".into());
        assert!(t1.is_empty());
        assert_eq!(t2.len(), 1);
        assert_ne!(t1.root_hash, t2.root_hash);
    }

    #[test]
    fn remove_prunes_empty_directories() {
        let t = Tree::empty().insert("user/1.json", "h1".into());
        let t2 = t.remove("user/1.json");
        assert!(t2.is_empty());
        assert!(!t2.entries.contains_key("user"));
    }

    #[test]
    fn same_content_same_hash() {
        let t1 = Tree::empty()
            .insert("a.json", "1".into())
            .insert("b.json", "2".into());
        let t2 = Tree::empty()
            .insert("b.json", "2".into())
            .insert("a.json", "1".into());
        assert_eq!(t1.root_hash, t2.root_hash);
    }

    #[test]
    fn walk_lists_all_leaves() {
        let t = Tree::empty()
            .insert("user/1.json", "h1".into())
            .insert("user/2.json", "h2".into())
            .insert("order/1.json", "h3".into());
        let mut paths: Vec<_> = t.walk().into_iter().map(|(p, _)| p).collect();
        paths.sort();
        assert_eq!(paths, vec!["order/1.json", "user/1.json", "user/2.json"]);
    }

    #[test]
    fn diff_trees() {
        let t1 = Tree::empty()
            .insert("a.json", "1".into())
            .insert("b.json", "2".into());
        let t2 = t1
            .remove("a.json")
            .insert("b.json", "changed".into())
            .insert("c.json", "3".into());

        let diff = t1.diff(&t2);
        assert_eq!(diff.added, vec!["c.json"]);
        assert_eq!(diff.removed, vec!["a.json"]);
        assert_eq!(diff.modified, vec!["b.json"]);
    }
}
