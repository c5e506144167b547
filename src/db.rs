use crate::context::Context;
use crate::document::Document;
use crate::error::Result;
use crate::facade::{Facade, WriteOptions};
use crate::index::ast::{Ast, Query};
use crate::index::SearchResults;
use crate::schema::Mode as SchemaMode;
use crate::store::commit::Commit;
use crate::store::HistoryEntry;
use crate::temporal::TemporalClause;
use std::path::Path;
use std::sync::Mutex;

/// The handle callers actually hold. `Facade` sequences a single write or
/// read; `Database` owns the facade for the database's whole lifetime and
/// is where open/close and stats live, mirroring the teacher's split
/// between a thin top-level handle and the operation plumbing underneath.
pub struct Database {
    facade: Facade,
}

impl Database {
    /// Opens or creates a database at `path`, replaying any WAL entries left
    /// behind by a prior crash and rebuilding every branch's secondary index.
    pub fn open(path: &Path) -> Result<Self> {
        log::info!("opening database at {}", path.display());
        Ok(Self {
            facade: Facade::open(path)?,
        })
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.facade = self.facade.with_context(context);
        self
    }

    pub fn wal_health(&self) -> Result<crate::wal::WalHealth> {
        self.facade.wal_health()
    }

    // ── Document writes ──────────────────────────────────────────

    pub fn save(&self, branch: &str, doc: Document, opts: WriteOptions) -> Result<Document> {
        self.facade.save(branch, doc, opts)
    }

    pub fn delete(&self, branch: &str, id: &str, opts: WriteOptions) -> Result<bool> {
        self.facade.delete(branch, id, opts)
    }

    // ── Reads ────────────────────────────────────────────────────

    pub fn get(&self, branch: &str, id: &str) -> Result<Option<Document>> {
        self.facade.get(branch, id)
    }

    pub fn get_by_table(&self, branch: &str, table: &str) -> Result<Vec<Document>> {
        self.facade.get_by_table(branch, table)
    }

    pub fn history(&self, branch: &str, id: &str) -> Result<Vec<HistoryEntry>> {
        self.facade.history(branch, id)
    }

    pub fn document_at(&self, id: &str, commit: &str) -> Result<Option<Document>> {
        self.facade.document_at(id, commit)
    }

    pub fn temporal_query(&self, branch: &str, id: &str, clause: &TemporalClause) -> Result<Vec<Document>> {
        self.facade.temporal_query(branch, id, clause)
    }

    // ── Secondary index ──────────────────────────────────────────

    pub fn search(&self, branch: &str, query: &Ast) -> Vec<String> {
        self.facade.search(branch, query)
    }

    pub fn search_query(&self, query: &Query) -> SearchResults {
        self.facade.search_query(query)
    }

    // ── Schema management ────────────────────────────────────────

    pub fn register_schema(
        &self,
        branch: &str,
        namespace: &str,
        schema: serde_json::Value,
        mode: SchemaMode,
        author: &str,
    ) -> Result<()> {
        self.facade.register_schema(branch, namespace, schema, mode, author)
    }

    // ── Branching ────────────────────────────────────────────────

    pub fn create_branch(&self, name: &str, from_ref: &str) -> Result<()> {
        self.facade.create_branch(name, from_ref)
    }

    pub fn delete_branch(&self, name: &str) -> Result<()> {
        self.facade.delete_branch(name)
    }

    pub fn list_branches(&self) -> Result<Vec<String>> {
        self.facade.list_branches()
    }

    pub fn log(&self, branch: &str) -> Result<Vec<Commit>> {
        self.facade.log(branch)
    }

    pub fn default_branch() -> &'static str {
        Facade::default_branch()
    }

    // ── Bundles ──────────────────────────────────────────────────

    pub fn export_bundle(
        &self,
        branches: &[String],
        base_commit: Option<&str>,
        writer: &mut impl std::io::Write,
    ) -> Result<crate::bundle::BundleManifest> {
        self.facade.export_bundle(branches, base_commit, writer)
    }

    pub fn import_bundle(
        &self,
        reader: &mut impl std::io::Read,
        force: bool,
    ) -> Result<crate::bundle::BundleManifest> {
        self.facade.import_bundle(reader, force)
    }

    // ── Compaction ───────────────────────────────────────────────

    pub fn compact(
        &self,
        branches: &[String],
        policy: &crate::compaction::CompactionPolicy,
    ) -> Result<crate::compaction::CompactionResult> {
        self.facade.compact(branches, policy)
    }

    // ── Stats ────────────────────────────────────────────────────

    pub fn stats(&self) -> Result<DbStats> {
        let store = self.facade.store();
        Ok(DbStats {
            branch_count: store.list_branches()?.len(),
            commit_count: store.list_all_commits()?.len(),
            tree_count: store.list_all_trees()?.len(),
            blob_count: store.list_all_blobs()?.len(),
            wal_bytes: self.facade.wal_size(),
        })
    }
}

/// Guards a `Database` behind a mutex so callers needing `&mut`-style
/// exclusive access (the CLI binary, primarily) don't have to reach into
/// `Database`'s interior mutability themselves.
pub struct Handle {
    inner: Mutex<Database>,
}

impl Handle {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            inner: Mutex::new(Database::open(path)?),
        })
    }

    pub fn with<T>(&self, f: impl FnOnce(&Database) -> Result<T>) -> Result<T> {
        let db = self.inner.lock().unwrap();
        f(&db)
    }
}

/// Snapshot of a database's current size, shown by the CLI's `stats` command.
#[derive(Debug, Clone)]
pub struct DbStats {
    pub branch_count: usize,
    pub commit_count: usize,
    pub tree_count: usize,
    pub blob_count: usize,
    pub wal_bytes: u64,
}

impl std::fmt::Display for DbStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Branches: {}", self.branch_count)?;
        writeln!(f, "Commits:  {}", self.commit_count)?;
        writeln!(f, "Trees:    {}", self.tree_count)?;
        writeln!(f, "Blobs:    {}", self.blob_count)?;
        writeln!(f, "WAL size: {} bytes", self.wal_bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_usable_database() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::open(tmp.path()).unwrap();
        let doc = Document::from_json(&serde_json::json!({"id": "user:1", "name": "Alice"})).unwrap();
        db.save("main", doc, WriteOptions::new("a")).unwrap();
        assert!(db.get("main", "user:1").unwrap().is_some());
    }

    #[test]
    fn stats_reflects_written_documents() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::open(tmp.path()).unwrap();
        let doc = Document::from_json(&serde_json::json!({"id": "user:1", "name": "Alice"})).unwrap();
        db.save("main", doc, WriteOptions::new("a")).unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.branch_count, 1);
        assert_eq!(stats.commit_count, 1);
    }

    #[test]
    fn search_query_returns_envelope() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::open(tmp.path()).unwrap();
        let doc = Document::from_json(&serde_json::json!({"id": "user:1", "city": "Zurich"})).unwrap();
        db.save("main", doc, WriteOptions::new("a")).unwrap();
        let query = Query::new("main", Ast::term("city", "Zurich"));
        let results = db.search_query(&query);
        assert_eq!(results.total, 1);
        assert_eq!(results.ids, vec!["user:1".to_string()]);
    }

    #[test]
    fn handle_serializes_concurrent_access() {
        let tmp = tempfile::tempdir().unwrap();
        let handle = Handle::open(tmp.path()).unwrap();
        handle
            .with(|db| {
                let doc = Document::from_json(&serde_json::json!({"id": "a", "_table": "x"})).unwrap();
                db.save("main", doc, WriteOptions::new("a"))
            })
            .unwrap();
        let found = handle.with(|db| db.get("main", "a")).unwrap();
        assert!(found.is_some());
    }
}
