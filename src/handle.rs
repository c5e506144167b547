use crate::db::Database;
use crate::error::{ChronError, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

/// The foreign-library facade's integer handle registry (spec §6): external
/// callers hold an opaque, non-negative integer rather than a pointer into
/// Rust's heap. `open` assigns the next handle from a monotonic counter and
/// maps it to the opened `Database`; `close` drops the mapping so later ops
/// against the same integer surface `StorageUnavailable` instead of reusing
/// a freed database.
pub struct HandleRegistry {
    next: AtomicI64,
    open: RwLock<HashMap<i64, Arc<Database>>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(0),
            open: RwLock::new(HashMap::new()),
        }
    }

    /// Opens a database rooted at `data_path` and registers it, returning a
    /// non-negative handle, or `-1` if open failed. `index_path` exists for
    /// parity with the adapter contract's `open(data_path, index_path)`
    /// signature; this core keeps the secondary index beside the object
    /// store and rebuilds it from there on every open, so the path itself
    /// is only used for the log line.
    pub fn open(&self, data_path: &Path, index_path: Option<&Path>) -> i64 {
        match Database::open(data_path) {
            Ok(db) => {
                let handle = self.next.fetch_add(1, Ordering::SeqCst);
                self.open.write().unwrap().insert(handle, Arc::new(db));
                log::debug!(
                    "handle {} opened for {} (index hint: {:?})",
                    handle,
                    data_path.display(),
                    index_path
                );
                handle
            }
            Err(e) => {
                log::warn!("failed to open database at {}: {}", data_path.display(), e);
                -1
            }
        }
    }

    /// Closes `handle`, returning `0` on success or `-1` if the handle was
    /// already closed or never existed.
    pub fn close(&self, handle: i64) -> i32 {
        let removed = self.open.write().unwrap().remove(&handle);
        match removed {
            Some(_) => {
                log::debug!("handle {} closed", handle);
                0
            }
            None => -1,
        }
    }

    /// Resolves a handle to its `Database`, or `StorageUnavailable` if the
    /// handle has been closed (or never existed) — the fatal-to-that-handle
    /// error every adapter-surface op after close must surface (spec §7).
    pub fn get(&self, handle: i64) -> Result<Arc<Database>> {
        self.open
            .read()
            .unwrap()
            .get(&handle)
            .cloned()
            .ok_or(ChronError::StorageUnavailable)
    }

    /// Number of handles currently open.
    pub fn len(&self) -> usize {
        self.open.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_assigns_increasing_nonnegative_handles() {
        let registry = HandleRegistry::new();
        let tmp1 = tempfile::tempdir().unwrap();
        let tmp2 = tempfile::tempdir().unwrap();
        let h1 = registry.open(tmp1.path(), None);
        let h2 = registry.open(tmp2.path(), None);
        assert!(h1 >= 0);
        assert!(h2 > h1);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn close_removes_handle_and_returns_zero() {
        let registry = HandleRegistry::new();
        let tmp = tempfile::tempdir().unwrap();
        let handle = registry.open(tmp.path(), None);
        assert_eq!(registry.close(handle), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn closing_unknown_handle_returns_negative_one() {
        let registry = HandleRegistry::new();
        assert_eq!(registry.close(42), -1);
    }

    #[test]
    fn get_after_close_is_storage_unavailable() {
        let registry = HandleRegistry::new();
        let tmp = tempfile::tempdir().unwrap();
        let handle = registry.open(tmp.path(), None);
        registry.close(handle);
        assert!(matches!(registry.get(handle), Err(ChronError::StorageUnavailable)));
    }

    #[test]
    fn get_resolves_to_usable_database() {
        let registry = HandleRegistry::new();
        let tmp = tempfile::tempdir().unwrap();
        let handle = registry.open(tmp.path(), None);
        let db = registry.get(handle).unwrap();
        let doc = crate::document::Document::from_json(&serde_json::json!({"id": "a", "_table": "x"})).unwrap();
        db.save("main", doc, crate::facade::WriteOptions::new("a")).unwrap();
        assert!(db.get("main", "a").unwrap().is_some());
    }
}
