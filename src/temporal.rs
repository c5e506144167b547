use crate::document::Document;
use crate::error::{ChronError, Result};
use crate::store::ObjectStore;
use chrono::{DateTime, NaiveDate, Utc};

/// A point in time or range expressed by a temporal query clause (spec
/// §4.H). `commit_id` carries `VERSIONS BETWEEN` boundaries expressed as
/// commit ids rather than timestamps.
#[derive(Debug, Clone)]
pub enum TemporalClause {
    AsOf(DateTime<Utc>),
    Between(DateTime<Utc>, DateTime<Utc>),
    FromTo(DateTime<Utc>, DateTime<Utc>),
    VersionsBetween(String, String),
}

/// Accepts ISO-8601 (`2024-01-15T10:00:00Z`), a bare date (`2024-01-15`,
/// midnight UTC), or a Unix timestamp in seconds or milliseconds.
pub fn parse_timestamp(input: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        return Ok(DateTime::from_naive_utc_and_offset(
            date.and_hms_opt(0, 0, 0).unwrap(),
            Utc,
        ));
    }
    if let Ok(value) = input.parse::<i64>() {
        // <= 10^10 is seconds, > 10^10 is milliseconds (valid until year 2286).
        let dt = if value.unsigned_abs() > 10_000_000_000u64 {
            DateTime::from_timestamp_millis(value)
        } else {
            DateTime::from_timestamp(value, 0)
        };
        if let Some(dt) = dt {
            return Ok(dt);
        }
    }
    Err(ChronError::InvalidTimestamp {
        input: input.to_string(),
    })
}

/// Bi-temporal filter: does `doc`'s `_valid_from`/`_valid_to` window cover
/// `instant`? A document with no `_valid_from` is considered always valid
/// from the start of time; no `_valid_to` means still valid.
pub fn document_valid_at(doc: &Document, instant: DateTime<Utc>) -> bool {
    let after_start = match doc.valid_from().and_then(|v| v.as_str()) {
        Some(s) => parse_timestamp(s).map(|from| from <= instant).unwrap_or(true),
        None => true,
    };
    let before_end = match doc.valid_to().and_then(|v| v.as_str()) {
        Some(s) => parse_timestamp(s).map(|to| instant < to).unwrap_or(true),
        None => true,
    };
    after_start && before_end
}

/// Resolves temporal clauses against an `ObjectStore`'s commit history for
/// a given document id. This is the read-path counterpart to the
/// transaction-time (commit history) and valid-time (`_valid_from`/
/// `_valid_to`) axes described in spec §4.H.
pub struct TemporalResolver<'a> {
    store: &'a ObjectStore,
}

impl<'a> TemporalResolver<'a> {
    pub fn new(store: &'a ObjectStore) -> Self {
        Self { store }
    }

    /// `AS OF <timestamp>`: the document as it stood at the most recent
    /// commit at or before `instant`, filtered through the valid-time
    /// window so a document that had already expired by `instant` in
    /// valid-time terms is excluded even if its transaction-time entry is
    /// still the latest one before `instant`.
    pub fn as_of(&self, branch: &str, id: &str, instant: DateTime<Utc>) -> Result<Option<Document>> {
        let history = self.store.history(branch, id, None, None)?;
        for entry in history {
            if entry.timestamp <= instant {
                return Ok(entry
                    .document
                    .filter(|d| document_valid_at(d, instant)));
            }
        }
        Ok(None)
    }

    /// `BETWEEN <from> AND <to>`: every transaction-time revision whose
    /// commit timestamp falls in `[from, to]`, newest first (matching
    /// `ObjectStore::history`'s order).
    pub fn between(
        &self,
        branch: &str,
        id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Document>> {
        let history = self.store.history(branch, id, None, None)?;
        Ok(history
            .into_iter()
            .filter(|e| e.timestamp >= from && e.timestamp <= to)
            .filter_map(|e| e.document)
            .collect())
    }

    /// `FROM <from> TO <to>`: like `BETWEEN` but half-open — `to` itself is
    /// excluded. The conventional distinction between the two range forms
    /// in bi-temporal SQL (SQL:2011 `PERIOD` semantics).
    pub fn from_to(
        &self,
        branch: &str,
        id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Document>> {
        let history = self.store.history(branch, id, None, None)?;
        Ok(history
            .into_iter()
            .filter(|e| e.timestamp >= from && e.timestamp < to)
            .filter_map(|e| e.document)
            .collect())
    }

    /// `VERSIONS BETWEEN <commit_a> AND <commit_b>`: every revision whose
    /// commit lies on the branch's history between the two given commits
    /// (inclusive), identified by commit id rather than wall-clock time.
    pub fn versions_between(
        &self,
        branch: &str,
        id: &str,
        commit_a: &str,
        commit_b: &str,
    ) -> Result<Vec<Document>> {
        let log = self.store.log(branch)?;
        let pos_a = log.iter().position(|c| c.id == commit_a);
        let pos_b = log.iter().position(|c| c.id == commit_b);
        let (lo, hi) = match (pos_a, pos_b) {
            (Some(a), Some(b)) => (a.min(b), a.max(b)),
            _ => {
                return Err(ChronError::CommitNotFound(format!(
                    "{} or {}",
                    commit_a, commit_b
                )))
            }
        };
        let window = &log[lo..=hi];
        let mut out = Vec::new();
        for commit in window {
            if let Some(doc) = self.store.document_at(id, &commit.id)? {
                out.push(doc);
            }
        }
        Ok(out)
    }

    pub fn resolve(&self, branch: &str, id: &str, clause: &TemporalClause) -> Result<Vec<Document>> {
        match clause {
            TemporalClause::AsOf(instant) => Ok(self.as_of(branch, id, *instant)?.into_iter().collect()),
            TemporalClause::Between(from, to) => self.between(branch, id, *from, *to),
            TemporalClause::FromTo(from, to) => self.from_to(branch, id, *from, *to),
            TemporalClause::VersionsBetween(a, b) => self.versions_between(branch, id, a, b),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_rfc3339() {
        let ts = parse_timestamp("2024-01-15T10:00:00Z").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-01-15T10:00:00+00:00");
    }

    #[test]
    fn parses_bare_date_as_midnight() {
        let ts = parse_timestamp("2024-01-15").unwrap();
        assert_eq!(ts.format("%H:%M:%S").to_string(), "00:00:00");
    }

    #[test]
    fn parses_unix_seconds() {
        let ts = parse_timestamp("1700000000").unwrap();
        assert_eq!(ts.timestamp(), 1700000000);
    }

    #[test]
    fn parses_unix_millis() {
        let ts = parse_timestamp("1700000000000").unwrap();
        assert_eq!(ts.timestamp(), 1700000000);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_timestamp("not-a-time").is_err());
    }

    #[test]
    fn boundary_value_is_seconds_not_millis() {
        // 10^10 is the spec's literal "<=" boundary: parsed as seconds,
        // not milliseconds, even though it's an 11-digit string.
        let ts = parse_timestamp("10000000000").unwrap();
        assert_eq!(ts.timestamp(), 10_000_000_000);
    }

    #[test]
    fn just_above_boundary_is_millis() {
        let ts = parse_timestamp("10000000001").unwrap();
        assert_eq!(ts.timestamp(), 10_000_000);
    }

    fn doc_with_validity(from: Option<&str>, to: Option<&str>) -> Document {
        let mut json = serde_json::json!({"id": "x:1"});
        if let Some(f) = from {
            json["_valid_from"] = serde_json::json!(f);
        }
        if let Some(t) = to {
            json["_valid_to"] = serde_json::json!(t);
        }
        Document::from_json(&json).unwrap()
    }

    #[test]
    fn valid_time_window_excludes_before_start() {
        let doc = doc_with_validity(Some("2024-06-01"), None);
        let instant = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert!(!document_valid_at(&doc, instant));
    }

    #[test]
    fn valid_time_window_excludes_after_end() {
        let doc = doc_with_validity(None, Some("2024-06-01"));
        let instant = Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap();
        assert!(!document_valid_at(&doc, instant));
    }

    #[test]
    fn valid_time_window_includes_inside_range() {
        let doc = doc_with_validity(Some("2024-01-01"), Some("2024-12-01"));
        let instant = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert!(document_valid_at(&doc, instant));
    }

    #[test]
    fn no_bounds_always_valid() {
        let doc = doc_with_validity(None, None);
        let instant = Utc.with_ymd_and_hms(1999, 1, 1, 0, 0, 0).unwrap();
        assert!(document_valid_at(&doc, instant));
    }

    fn test_store() -> (tempfile::TempDir, ObjectStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = ObjectStore::open(tmp.path()).unwrap();
        (tmp, store)
    }

    #[test]
    fn as_of_returns_latest_revision_not_after_instant() {
        let (_tmp, store) = test_store();
        let d1 = Document::from_json(&serde_json::json!({"id": "cfg:app", "v": 1})).unwrap();
        store.put_document("main", &d1, "a", "a", "v1", None).unwrap();
        let mid = Utc::now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let d2 = Document::from_json(&serde_json::json!({"id": "cfg:app", "v": 2})).unwrap();
        store.put_document("main", &d2, "a", "a", "v2", None).unwrap();

        let resolver = TemporalResolver::new(&store);
        let at_mid = resolver.as_of("main", "cfg:app", mid).unwrap().unwrap();
        assert_eq!(at_mid.fields.get("v").unwrap().as_i64(), Some(1));
    }

    #[test]
    fn versions_between_returns_commits_in_range() {
        let (_tmp, store) = test_store();
        let d1 = Document::from_json(&serde_json::json!({"id": "cfg:app", "v": 1})).unwrap();
        store.put_document("main", &d1, "a", "a", "v1", None).unwrap();
        let c1 = store.head("main").unwrap().unwrap();
        let d2 = Document::from_json(&serde_json::json!({"id": "cfg:app", "v": 2})).unwrap();
        store.put_document("main", &d2, "a", "a", "v2", None).unwrap();
        let c2 = store.head("main").unwrap().unwrap();

        let resolver = TemporalResolver::new(&store);
        let versions = resolver.versions_between("main", "cfg:app", &c1, &c2).unwrap();
        assert_eq!(versions.len(), 2);
    }
}
