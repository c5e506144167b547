pub mod commit;
pub mod refs;
pub mod tree;

use crate::block::{compute_hash, Blob, ObjectHash};
use crate::bloom::BloomFilter;
use crate::document::Document;
use crate::error::{ChronError, Result};
use commit::{Commit, Note};
use refs::{RefStore, DEFAULT_BRANCH};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tree::Tree;

const BLOBS_DIR: &str = "objects/blobs";
const TREES_DIR: &str = "objects/trees";
const COMMITS_DIR: &str = "objects/commits";
const NOTES_DIR: &str = "notes";

/// One entry of a document's commit history, as returned by `history`.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub commit_id: ObjectHash,
    pub committer: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub document: Option<Document>,
}

/// The versioned object store: content-addressed blobs/trees/commits, plus
/// per-branch refs. This is the leaf dependency every other subsystem
/// (WAL, OCC, index, schema, temporal, facade) ultimately reads and writes
/// through — spec §4.A.
pub struct ObjectStore {
    root: PathBuf,
    refs: RefStore,
    closed: Mutex<bool>,
    blooms: Mutex<HashMap<String, BloomFilter>>,
}

impl ObjectStore {
    pub fn open(path: &Path) -> Result<Self> {
        fs::create_dir_all(path)?;
        fs::create_dir_all(path.join(BLOBS_DIR))?;
        fs::create_dir_all(path.join(TREES_DIR))?;
        fs::create_dir_all(path.join(COMMITS_DIR))?;
        fs::create_dir_all(path.join(NOTES_DIR))?;
        let refs = RefStore::open(path)?;
        Ok(Self {
            root: path.to_path_buf(),
            refs,
            closed: Mutex::new(false),
            blooms: Mutex::new(HashMap::new()),
        })
    }

    pub fn close(&self) {
        *self.closed.lock().unwrap() = true;
    }

    fn check_open(&self) -> Result<()> {
        if *self.closed.lock().unwrap() {
            return Err(ChronError::StorageUnavailable);
        }
        Ok(())
    }

    // ── Blobs ──────────────────────────────────────────────────

    fn blob_path(&self, hash: &str) -> PathBuf {
        let prefix = &hash[..2.min(hash.len())];
        self.root.join(BLOBS_DIR).join(prefix).join(hash)
    }

    fn put_blob(&self, blob: &Blob) -> Result<ObjectHash> {
        let path = self.blob_path(&blob.hash);
        if !path.exists() {
            fs::create_dir_all(path.parent().unwrap())?;
            fs::write(&path, &blob.data)?;
        }
        Ok(blob.hash.clone())
    }

    fn get_blob(&self, hash: &str) -> Result<Blob> {
        let path = self.blob_path(hash);
        if !path.exists() {
            return Err(ChronError::Corruption {
                object: hash.to_string(),
            });
        }
        let data = fs::read(&path)?;
        let blob = Blob { hash: hash.to_string(), data };
        if !blob.verify() {
            return Err(ChronError::Corruption {
                object: hash.to_string(),
            });
        }
        Ok(blob)
    }

    // ── Trees ──────────────────────────────────────────────────

    fn save_tree(&self, tree: &Tree) -> Result<()> {
        let path = self.root.join(TREES_DIR).join(&tree.root_hash);
        if !path.exists() {
            let data = serde_json::to_vec(tree)?;
            fs::write(path, data)?;
        }
        Ok(())
    }

    fn load_tree(&self, hash: &str) -> Result<Tree> {
        let path = self.root.join(TREES_DIR).join(hash);
        if !path.exists() {
            return Err(ChronError::Corruption {
                object: hash.to_string(),
            });
        }
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    // ── Commits ────────────────────────────────────────────────

    fn save_commit(&self, commit: &Commit) -> Result<()> {
        let path = self.root.join(COMMITS_DIR).join(&commit.id);
        let data = serde_json::to_vec(commit)?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn load_commit(&self, id: &str) -> Result<Commit> {
        let path = self.root.join(COMMITS_DIR).join(id);
        if !path.exists() {
            return Err(ChronError::CommitNotFound(id.to_string()));
        }
        let data = fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    // ── Notes ──────────────────────────────────────────────────

    fn note_path(&self, commit_id: &str) -> PathBuf {
        self.root.join(NOTES_DIR).join(commit_id)
    }

    pub fn annotate(&self, commit_id: &str, note: &Note) -> Result<()> {
        let existing = self.load_note(commit_id)?.unwrap_or_default();
        let merged = existing.merge(note);
        let data = serde_json::to_vec(&merged)?;
        fs::write(self.note_path(commit_id), data)?;
        Ok(())
    }

    pub fn load_note(&self, commit_id: &str) -> Result<Option<Note>> {
        let path = self.note_path(commit_id);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(path)?;
        Ok(Some(serde_json::from_slice(&data)?))
    }

    // ── Branches ───────────────────────────────────────────────

    pub fn head(&self, branch: &str) -> Result<Option<ObjectHash>> {
        self.refs.get(branch)
    }

    pub fn head_commit(&self, branch: &str) -> Result<Commit> {
        let head = self
            .head(branch)?
            .ok_or(ChronError::EmptyRepository)?;
        self.load_commit(&head)
    }

    pub fn create_branch(&self, name: &str, from_ref: &str) -> Result<()> {
        if self.refs.exists(name) {
            return Err(ChronError::BranchExists(name.to_string()));
        }
        match self.head(from_ref)? {
            Some(commit_id) => self.refs.force_set(name, &commit_id)?,
            None => {
                // Source branch has no commits yet; the new branch is
                // simply also empty until the first write lands on it.
            }
        }
        let mut blooms = self.blooms.lock().unwrap();
        if let Some(bf) = blooms.get(from_ref).cloned() {
            blooms.insert(name.to_string(), bf);
        }
        Ok(())
    }

    pub fn delete_branch(&self, name: &str) -> Result<()> {
        self.refs.delete(name)
    }

    pub fn list_branches(&self) -> Result<Vec<String>> {
        self.refs.list()
    }

    pub fn default_branch() -> &'static str {
        DEFAULT_BRANCH
    }

    // ── Document operations (spec §4.A) ─────────────────────────

    fn current_tree(&self, branch: &str) -> Result<Tree> {
        match self.head(branch)? {
            Some(head) => {
                let commit = self.load_commit(&head)?;
                self.load_tree(&commit.tree_root)
            }
            None => Ok(Tree::empty()),
        }
    }

    /// Writes `doc`, returning the document as stored (canonical form).
    /// Atomically advances `branch`'s ref; fails with `StaleBranch` if the
    /// observed head moved between the read and the CAS.
    pub fn put_document(
        &self,
        branch: &str,
        doc: &Document,
        author: &str,
        committer: &str,
        message: &str,
        note: Option<&Note>,
    ) -> Result<Document> {
        self.check_open()?;
        let id = doc.id().ok_or_else(|| ChronError::NotFound {
            id: "<missing id>".to_string(),
        })?;
        let table = doc.table().unwrap_or_else(|| "default".to_string());
        let path = Document::path_for(&table, id);

        let old_head = self.head(branch)?;
        let tree = match &old_head {
            Some(h) => self.load_tree(&self.load_commit(h)?.tree_root)?,
            None => Tree::empty(),
        };

        let canonical = doc.to_canonical_json();
        let blob = Blob::new(canonical.into_bytes());
        self.put_blob(&blob)?;

        let new_tree = tree.insert(&path, blob.hash.clone());
        self.save_tree(&new_tree)?;

        let parents = old_head.clone().into_iter().collect::<Vec<_>>();
        let commit = Commit::new(
            parents,
            new_tree.root_hash.clone(),
            author.to_string(),
            committer.to_string(),
            message.to_string(),
        );
        self.save_commit(&commit)?;
        if let Some(n) = note {
            self.annotate(&commit.id, n)?;
        }

        self.refs
            .compare_and_set(branch, old_head.as_ref(), &commit.id)?;

        self.bloom_insert(branch, id);

        Document::from_canonical_bytes(&blob.data)
    }

    /// Resolves the tree of `commit` (head if `None`) and walks `id`'s
    /// path; `Ok(None)` is a legitimate absence, not an error.
    pub fn get_document(
        &self,
        branch: &str,
        id: &str,
        commit: Option<&str>,
    ) -> Result<Option<Document>> {
        self.check_open()?;
        if commit.is_none() && !self.bloom_may_contain(branch, id) {
            return Ok(None);
        }
        let tree = match commit {
            Some(cid) => self.load_tree(&self.load_commit(cid)?.tree_root)?,
            None => self.current_tree(branch)?,
        };
        self.read_document_by_id(&tree, id)
    }

    /// Consults `branch`'s bloom filter ahead of a tree walk; a `false`
    /// means `id` is definitely absent, a `true` still requires the walk
    /// (false positives are possible, false negatives are not). Branches
    /// with no filter yet (never seeded via `rebuild_bloom`/`put_document`)
    /// fall through to the walk unconditionally.
    fn bloom_may_contain(&self, branch: &str, id: &str) -> bool {
        match self.blooms.lock().unwrap().get(branch) {
            Some(bf) => bf.may_contain(id.as_bytes()),
            None => true,
        }
    }

    fn bloom_insert(&self, branch: &str, id: &str) {
        let mut blooms = self.blooms.lock().unwrap();
        blooms
            .entry(branch.to_string())
            .or_insert_with(|| BloomFilter::new(1024, 0.01))
            .insert(id.as_bytes());
    }

    /// Reseeds `branch`'s bloom filter from a known-complete document set,
    /// used after the secondary index is rebuilt from the same source
    /// (WAL recovery, bundle import) so the two caches never disagree.
    pub fn rebuild_bloom(&self, branch: &str, docs: &[Document]) {
        let mut bf = BloomFilter::new(docs.len().max(64), 0.01);
        for doc in docs {
            if let Some(id) = doc.id() {
                bf.insert(id.as_bytes());
            }
        }
        self.blooms.lock().unwrap().insert(branch.to_string(), bf);
    }

    fn read_document_by_id(&self, tree: &Tree, id: &str) -> Result<Option<Document>> {
        // The table segment isn't known a priori from `id` alone if the
        // caller relied on `_table` rather than an id prefix, so we scan
        // the (typically shallow) tree for a matching path suffix. This
        // mirrors how `get_by_prefix`/`get_by_table` already walk in full.
        let escaped = id.replace(':', "__COLON__");
        let suffix = format!("/{}.json", escaped);
        for (path, hash) in tree.walk() {
            if path.ends_with(&suffix) || path == format!("{}.json", escaped) {
                let blob = self.get_blob(&hash)?;
                return Ok(Some(Document::from_canonical_bytes(&blob.data)?));
            }
        }
        Ok(None)
    }

    /// As `put_document` but writes a tree with the path removed. Returns
    /// whether the document was present pre-delete.
    pub fn delete_document(
        &self,
        branch: &str,
        id: &str,
        author: &str,
        committer: &str,
        message: &str,
        note: Option<&Note>,
    ) -> Result<bool> {
        self.check_open()?;
        let old_head = self.head(branch)?;
        let tree = self.current_tree(branch)?;

        let existing_path = tree
            .walk()
            .into_iter()
            .find(|(p, _)| {
                let escaped = id.replace(':', "__COLON__");
                p.ends_with(&format!("/{}.json", escaped)) || *p == format!("{}.json", escaped)
            })
            .map(|(p, _)| p);

        let path = match existing_path {
            Some(p) => p,
            None => return Ok(false),
        };

        let new_tree = tree.remove(&path);
        self.save_tree(&new_tree)?;

        let parents = old_head.clone().into_iter().collect::<Vec<_>>();
        let commit = Commit::new(
            parents,
            new_tree.root_hash.clone(),
            author.to_string(),
            committer.to_string(),
            message.to_string(),
        );
        self.save_commit(&commit)?;
        if let Some(n) = note {
            self.annotate(&commit.id, n)?;
        }

        self.refs
            .compare_and_set(branch, old_head.as_ref(), &commit.id)?;
        Ok(true)
    }

    pub fn get_by_prefix(&self, branch: &str, prefix: &str) -> Result<Vec<Document>> {
        self.check_open()?;
        let tree = self.current_tree(branch)?;
        let mut out = Vec::new();
        for (path, hash) in tree.walk() {
            let id = path_to_id(&path);
            if id.starts_with(prefix) {
                let blob = self.get_blob(&hash)?;
                out.push(Document::from_canonical_bytes(&blob.data)?);
            }
        }
        out.sort_by(|a, b| a.id().unwrap_or("").cmp(b.id().unwrap_or("")));
        Ok(out)
    }

    pub fn get_by_table(&self, branch: &str, table: &str) -> Result<Vec<Document>> {
        self.check_open()?;
        let tree = self.current_tree(branch)?;
        let mut out = Vec::new();
        for (path, hash) in tree.walk() {
            if path.starts_with(&format!("{}/", table)) {
                let blob = self.get_blob(&hash)?;
                out.push(Document::from_canonical_bytes(&blob.data)?);
            }
        }
        out.sort_by(|a, b| a.id().unwrap_or("").cmp(b.id().unwrap_or("")));
        Ok(out)
    }

    /// Walks first-parent from head, emitting an entry for each commit
    /// whose tree differs at `id`'s path from its parent's tree.
    pub fn history(
        &self,
        branch: &str,
        id: &str,
        since: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<HistoryEntry>> {
        self.check_open()?;
        let head = match self.head(branch)? {
            Some(h) => h,
            None => return Ok(Vec::new()),
        };

        let mut out = Vec::new();
        let mut current_id = Some(head);
        let mut resuming = since.is_some();

        while let Some(cid) = current_id {
            let commit = self.load_commit(&cid)?;
            let parent_id = commit.parents.first().cloned();

            if resuming {
                if Some(cid.as_str()) == since {
                    resuming = false;
                }
                current_id = parent_id;
                continue;
            }

            let tree = self.load_tree(&commit.tree_root)?;
            let parent_tree = match &parent_id {
                Some(pid) => self.load_tree(&self.load_commit(pid)?.tree_root)?,
                None => Tree::empty(),
            };

            let doc = self.read_document_by_id(&tree, id)?;
            let parent_doc_hash = self.document_hash_by_id(&parent_tree, id);
            let this_doc_hash = self.document_hash_by_id(&tree, id);

            if this_doc_hash != parent_doc_hash {
                out.push(HistoryEntry {
                    commit_id: commit.id.clone(),
                    committer: commit.committer.clone(),
                    timestamp: commit.timestamp,
                    document: doc,
                });
                if let Some(l) = limit {
                    if out.len() >= l {
                        break;
                    }
                }
            }

            current_id = parent_id;
        }

        Ok(out)
    }

    fn document_hash_by_id(&self, tree: &Tree, id: &str) -> Option<ObjectHash> {
        let escaped = id.replace(':', "__COLON__");
        let suffix = format!("/{}.json", escaped);
        tree.walk()
            .into_iter()
            .find(|(p, _)| p.ends_with(&suffix) || *p == format!("{}.json", escaped))
            .map(|(_, h)| h)
    }

    /// Direct tree read at an arbitrary commit id.
    pub fn document_at(&self, id: &str, commit: &str) -> Result<Option<Document>> {
        self.check_open()?;
        let commit = self.load_commit(commit)?;
        let tree = self.load_tree(&commit.tree_root)?;
        self.read_document_by_id(&tree, id)
    }

    /// First-parent commit log for a branch, newest first.
    pub fn log(&self, branch: &str) -> Result<Vec<Commit>> {
        self.check_open()?;
        let mut commits = Vec::new();
        let head = match self.head(branch)? {
            Some(h) => h,
            None => return Ok(commits),
        };
        let mut current = Some(self.load_commit(&head)?);
        while let Some(commit) = current {
            let parent_id = commit.parents.first().cloned();
            commits.push(commit);
            current = match parent_id {
                Some(id) => Some(self.load_commit(&id)?),
                None => None,
            };
        }
        Ok(commits)
    }

    pub fn tree_at(&self, commit_id: &str) -> Result<Tree> {
        let commit = self.load_commit(commit_id)?;
        self.load_tree(&commit.tree_root)
    }

    // ── Raw object access (bundle export/import, spec §4.B) ─────

    pub fn load_blob(&self, hash: &str) -> Result<Blob> {
        self.get_blob(hash)
    }

    pub fn load_tree_by_hash(&self, hash: &str) -> Result<Tree> {
        self.load_tree(hash)
    }

    /// Writes an object of known hash without recomputing it — used when
    /// importing a bundle whose objects already carry their original hashes.
    pub fn import_blob(&self, blob: &Blob) -> Result<()> {
        self.put_blob(blob)?;
        Ok(())
    }

    pub fn import_tree(&self, tree: &Tree) -> Result<()> {
        self.save_tree(tree)
    }

    pub fn import_commit(&self, commit: &Commit) -> Result<()> {
        self.save_commit(commit)
    }

    /// Unconditional ref advance, used once a bundle's objects have all
    /// landed so the branch pointer only moves after the graph is complete.
    pub fn import_ref(&self, branch: &str, commit_id: &ObjectHash) -> Result<()> {
        self.refs.force_set(branch, commit_id)
    }

    // ── Garbage collection (spec §4.I, compaction) ──────────────

    pub fn list_all_commits(&self) -> Result<Vec<ObjectHash>> {
        list_dir_entries(&self.root.join(COMMITS_DIR))
    }

    pub fn list_all_trees(&self) -> Result<Vec<ObjectHash>> {
        list_dir_entries(&self.root.join(TREES_DIR))
    }

    /// Blobs are sharded two levels deep (`objects/blobs/<2-char
    /// prefix>/<hash>`), unlike trees/commits, so this walks one level
    /// further than `list_dir_entries`.
    pub fn list_all_blobs(&self) -> Result<Vec<ObjectHash>> {
        let root = self.root.join(BLOBS_DIR);
        let mut out = Vec::new();
        if !root.exists() {
            return Ok(out);
        }
        for shard in fs::read_dir(&root)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                if let Some(name) = entry.file_name().to_str() {
                    out.push(name.to_string());
                }
            }
        }
        Ok(out)
    }

    /// Removes a commit object, returning the bytes reclaimed (0 if it was
    /// already absent).
    pub fn purge_commit(&self, id: &str) -> Result<u64> {
        purge_file(&self.root.join(COMMITS_DIR).join(id))
    }

    pub fn purge_tree(&self, hash: &str) -> Result<u64> {
        purge_file(&self.root.join(TREES_DIR).join(hash))
    }

    pub fn purge_blob(&self, hash: &str) -> Result<u64> {
        purge_file(&self.blob_path(hash))
    }
}

fn list_dir_entries(dir: &Path) -> Result<Vec<ObjectHash>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            out.push(name.to_string());
        }
    }
    Ok(out)
}

fn purge_file(path: &Path) -> Result<u64> {
    match fs::metadata(path) {
        Ok(meta) => {
            let len = meta.len();
            fs::remove_file(path)?;
            Ok(len)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

fn path_to_id(path: &str) -> String {
    path.rsplit('/')
        .next()
        .unwrap_or(path)
        .trim_end_matches(".json")
        .replace("__COLON__", ":")
}
