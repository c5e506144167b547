use crate::context::{Context, ContextOverrides};
use crate::document::Document;
use crate::error::{ChronError, Result};
use crate::index::ast::{Ast, Query};
use crate::index::{IndexManager, SearchResults};
use crate::occ::{with_occ_retry, BranchLocks, RetryConfig, VersionTracker};
use crate::schema::{Mode as SchemaMode, SchemaRegistry};
use crate::store::refs::DEFAULT_BRANCH;
use crate::store::ObjectStore;
use crate::temporal::{TemporalClause, TemporalResolver};
use crate::wal::{Operation, Wal, WalHealth};
use std::path::Path;

/// Options threaded through a single mutating call: a per-call identity
/// plus the optimistic-concurrency expectation and which schema namespace
/// (if any) governs the write.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub author: String,
    pub expected_version: Option<u64>,
    pub schema_namespace: Option<String>,
    pub overrides: ContextOverrides,
}

impl WriteOptions {
    pub fn new(author: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            ..Default::default()
        }
    }

    pub fn with_expected_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }

    pub fn with_schema_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.schema_namespace = Some(namespace.into());
        self
    }
}

/// Orchestrates the WAL, OCC, secondary index, schema validation, and
/// temporal resolver around the content-addressed object store to
/// implement the full per-document write sequence (spec §4.I): open
/// context → append PENDING WAL → acquire branch lock → validate →
/// object-store write with note → WAL GIT_COMMITTED → update index → WAL
/// COMPLETED → bump OCC version.
///
/// `Facade` does the sequencing; `db::Database` is the thin handle callers
/// actually hold, adding lifecycle concerns (open/stats) on top.
pub struct Facade {
    store: ObjectStore,
    wal: Wal,
    versions: VersionTracker,
    locks: BranchLocks,
    index: IndexManager,
    schemas: SchemaRegistry,
    context: Context,
    retry: RetryConfig,
}

impl Facade {
    pub fn open(path: &Path) -> Result<Self> {
        let store = ObjectStore::open(path)?;
        let wal = Wal::open(&path.join("wal"))?;
        let db = Self {
            store,
            wal,
            versions: VersionTracker::new(),
            locks: BranchLocks::new(),
            index: IndexManager::new(),
            schemas: SchemaRegistry::new(),
            context: Context::new(),
            retry: RetryConfig::default(),
        };
        db.recover()?;
        db.reindex_all_branches()?;
        Ok(db)
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    fn recover(&self) -> Result<()> {
        let store = &self.store;
        let index = &self.index;
        let summary = self.wal.recover(
            |branch, id, content| {
                let doc = Document::from_json(content).ok_or_else(|| ChronError::ValidationError {
                    namespace: "<wal>".to_string(),
                    id: id.to_string(),
                    mode: "recovery".to_string(),
                    violations: vec!["WAL content is not a JSON object".to_string()],
                })?;
                store.put_document(branch, &doc, "wal-recovery", "wal-recovery", "recover", None)?;
                Ok(())
            },
            |branch, id| {
                store.delete_document(branch, id, "wal-recovery", "wal-recovery", "recover", None)?;
                Ok(())
            },
            |branch, id, content| {
                match content {
                    Some(c) => {
                        if let Some(doc) = Document::from_json(c) {
                            index.on_put(branch, &doc);
                        }
                    }
                    None => index.on_delete(branch, id),
                }
                Ok(())
            },
        )?;
        if summary.failed > 0 {
            log::warn!("wal: {} entries failed recovery and were rolled back", summary.failed);
        }
        Ok(())
    }

    /// Rebuilds every branch's in-memory secondary index and negative-lookup
    /// bloom filter from the object store's current state — neither
    /// persists across process restarts the way the object graph does.
    fn reindex_all_branches(&self) -> Result<()> {
        for branch in self.store.list_branches()? {
            let docs = self.store.get_by_prefix(&branch, "")?;
            self.index.rebuild(&branch, &docs);
            self.store.rebuild_bloom(&branch, &docs);
        }
        Ok(())
    }

    pub fn wal_health(&self) -> Result<WalHealth> {
        self.wal.health()
    }

    // ── Document writes ──────────────────────────────────────────

    pub fn save(&self, branch: &str, doc: Document, opts: WriteOptions) -> Result<Document> {
        let id = doc
            .id()
            .ok_or_else(|| ChronError::NotFound {
                id: "<missing id>".to_string(),
            })?
            .to_string();
        let ctx = self.context.context_for_commit(&opts.overrides);
        let note = ctx.to_note();

        let entry_content = Some(doc.to_json());
        let mut entry = self
            .wal
            .append_pending(Operation::Save, &id, branch, entry_content)?;

        let result = with_occ_retry(
            &self.retry,
            |attempt, err| log::warn!("save({}) conflict on attempt {}: {}", id, attempt, err),
            |attempt, delay| log::debug!("save({}) retrying attempt {} after {:?}", id, attempt, delay),
            || {
                self.locks.with_lock(branch, || -> Result<Document> {
                    if let Some(namespace) = &opts.schema_namespace {
                        self.schemas.validate(&self.store, branch, namespace, &doc)?;
                    }
                    if let Some(expected) = opts.expected_version {
                        self.versions.verify(&id, branch, expected)?;
                    }
                    let stored = self.store.put_document(
                        branch,
                        &doc,
                        &opts.author,
                        &opts.author,
                        &format!("save {}", id),
                        Some(&note),
                    )?;
                    self.wal.advance(&mut entry, crate::wal::WalState::GitCommitted)?;
                    self.index.on_put(branch, &stored);
                    self.wal.advance(&mut entry, crate::wal::WalState::IndexCommitted)?;
                    self.wal.advance(&mut entry, crate::wal::WalState::Completed)?;
                    self.versions.increment(&id, branch);
                    Ok(stored)
                })
            },
        );

        match result {
            Ok(doc) => {
                self.wal.truncate_entry(&entry)?;
                Ok(doc)
            }
            Err(e) => {
                self.wal.advance(&mut entry, crate::wal::WalState::RolledBack)?;
                Err(e)
            }
        }
    }

    pub fn delete(&self, branch: &str, id: &str, opts: WriteOptions) -> Result<bool> {
        let ctx = self.context.context_for_commit(&opts.overrides);
        let note = ctx.to_note();

        let mut entry = self.wal.append_pending(Operation::Delete, id, branch, None)?;

        let result = with_occ_retry(
            &self.retry,
            |attempt, err| log::warn!("delete({}) conflict on attempt {}: {}", id, attempt, err),
            |attempt, delay| log::debug!("delete({}) retrying attempt {} after {:?}", id, attempt, delay),
            || {
                self.locks.with_lock(branch, || -> Result<bool> {
                    if let Some(expected) = opts.expected_version {
                        self.versions.verify(id, branch, expected)?;
                    }
                    let existed = self.store.delete_document(
                        branch,
                        id,
                        &opts.author,
                        &opts.author,
                        &format!("delete {}", id),
                        Some(&note),
                    )?;
                    self.wal.advance(&mut entry, crate::wal::WalState::GitCommitted)?;
                    if existed {
                        self.index.on_delete(branch, id);
                    }
                    self.wal.advance(&mut entry, crate::wal::WalState::IndexCommitted)?;
                    self.wal.advance(&mut entry, crate::wal::WalState::Completed)?;
                    if existed {
                        self.versions.increment(id, branch);
                    }
                    Ok(existed)
                })
            },
        );

        match result {
            Ok(existed) => {
                self.wal.truncate_entry(&entry)?;
                Ok(existed)
            }
            Err(e) => {
                self.wal.advance(&mut entry, crate::wal::WalState::RolledBack)?;
                Err(e)
            }
        }
    }

    // ── Reads ────────────────────────────────────────────────────

    pub fn get(&self, branch: &str, id: &str) -> Result<Option<Document>> {
        self.store.get_document(branch, id, None)
    }

    pub fn get_by_table(&self, branch: &str, table: &str) -> Result<Vec<Document>> {
        self.store.get_by_table(branch, table)
    }

    pub fn history(&self, branch: &str, id: &str) -> Result<Vec<crate::store::HistoryEntry>> {
        self.store.history(branch, id, None, None)
    }

    pub fn document_at(&self, id: &str, commit: &str) -> Result<Option<Document>> {
        self.store.document_at(id, commit)
    }

    pub fn temporal_query(
        &self,
        branch: &str,
        id: &str,
        clause: &TemporalClause,
    ) -> Result<Vec<Document>> {
        TemporalResolver::new(&self.store).resolve(branch, id, clause)
    }

    // ── Secondary index ──────────────────────────────────────────

    pub fn search(&self, branch: &str, query: &Ast) -> Vec<String> {
        self.index.search(branch, query)
    }

    /// The sorted, paginated, resumable query operation every adapter
    /// surface is documented to call through (spec §6), as opposed to
    /// `search`'s bare unordered id set.
    pub fn search_query(&self, query: &Query) -> SearchResults {
        self.index.search_query(query)
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
        self.schemas.register(&self.store, branch, namespace, schema, mode, author)
    }

    // ── Branching ────────────────────────────────────────────────

    pub fn create_branch(&self, name: &str, from_ref: &str) -> Result<()> {
        self.store.create_branch(name, from_ref)?;
        self.index.on_create_branch(from_ref, name);
        Ok(())
    }

    pub fn delete_branch(&self, name: &str) -> Result<()> {
        self.store.delete_branch(name)
    }

    pub fn list_branches(&self) -> Result<Vec<String>> {
        self.store.list_branches()
    }

    pub fn log(&self, branch: &str) -> Result<Vec<crate::store::commit::Commit>> {
        self.store.log(branch)
    }

    pub fn default_branch() -> &'static str {
        DEFAULT_BRANCH
    }

    // ── Bundles ──────────────────────────────────────────────────

    pub fn export_bundle(
        &self,
        branches: &[String],
        base_commit: Option<&str>,
        writer: &mut impl std::io::Write,
    ) -> Result<crate::bundle::BundleManifest> {
        crate::bundle::export_bundle(&self.store, branches, base_commit, writer)
    }

    pub fn import_bundle(
        &self,
        reader: &mut impl std::io::Read,
        force: bool,
    ) -> Result<crate::bundle::BundleManifest> {
        let manifest = crate::bundle::import_bundle(&self.store, reader, force)?;
        for (branch, _) in &manifest.refs {
            let docs = self.store.get_by_prefix(branch, "")?;
            self.index.rebuild(branch, &docs);
            self.store.rebuild_bloom(branch, &docs);
        }
        Ok(manifest)
    }

    // ── Compaction / GC ──────────────────────────────────────────

    pub fn compact(
        &self,
        branches: &[String],
        policy: &crate::compaction::CompactionPolicy,
    ) -> Result<crate::compaction::CompactionResult> {
        crate::compaction::compact(&self.store, branches, policy, chrono::Utc::now())
    }

    // ── Stats (db::Database delegates here) ──────────────────────

    pub(crate) fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub(crate) fn wal_size(&self) -> u64 {
        self.wal.size()
    }
}
