pub mod ast;

use crate::document::Document;
use crate::value::Value;
use ast::{Ast, Query, SortDirection, ValueType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

/// Inverted + numeric-range index over one dotted field path, scoped to a
/// single branch. Generalizes the teacher's single-value `SecondaryIndex`
/// to cover every leaf of every document rather than one named field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FieldIndex {
    /// Exact stringified value → document ids (term/wildcard/exists).
    terms: BTreeMap<String, BTreeSet<String>>,
    /// Lowercased whitespace tokens → document ids (fts).
    tokens: BTreeMap<String, BTreeSet<String>>,
    /// `(numeric value, document id)`, kept sorted by value for range scans.
    numeric: Vec<(f64, String)>,
    /// Every document id that has a value at this path at all.
    present: BTreeSet<String>,
    /// Document id → its (last-indexed) value at this path, for sort keys.
    /// A multi-valued field keeps whichever occurrence was indexed last.
    values: BTreeMap<String, Value>,
}

impl FieldIndex {
    fn index(&mut self, id: &str, value: &Value) {
        let stringified = value.stringify();
        self.terms
            .entry(stringified.clone())
            .or_default()
            .insert(id.to_string());
        self.present.insert(id.to_string());
        for token in tokenize(&stringified) {
            self.tokens.entry(token).or_default().insert(id.to_string());
        }
        if let Some(n) = value.as_f64() {
            let pos = self
                .numeric
                .partition_point(|(v, _)| *v < n);
            self.numeric.insert(pos, (n, id.to_string()));
        }
        self.values.insert(id.to_string(), value.clone());
    }

    /// Linear removal, same cost profile as the teacher's `remove_key`: we
    /// don't keep a reverse id→value map, so a delete walks every bucket.
    fn remove(&mut self, id: &str) {
        let mut empty = Vec::new();
        for (val, ids) in self.terms.iter_mut() {
            ids.remove(id);
            if ids.is_empty() {
                empty.push(val.clone());
            }
        }
        for val in empty {
            self.terms.remove(&val);
        }
        let mut empty = Vec::new();
        for (tok, ids) in self.tokens.iter_mut() {
            ids.remove(id);
            if ids.is_empty() {
                empty.push(tok.clone());
            }
        }
        for tok in empty {
            self.tokens.remove(&tok);
        }
        self.numeric.retain(|(_, doc_id)| doc_id != id);
        self.present.remove(id);
        self.values.remove(id);
    }

    fn term_lookup(&self, value: &str) -> BTreeSet<String> {
        self.terms.get(value).cloned().unwrap_or_default()
    }

    fn wildcard_lookup(&self, pattern: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for (val, ids) in &self.terms {
            if glob_match(pattern, val) {
                out.extend(ids.iter().cloned());
            }
        }
        out
    }

    fn fts_lookup(&self, text: &str) -> BTreeSet<String> {
        let query_tokens = tokenize(text);
        if query_tokens.is_empty() {
            return BTreeSet::new();
        }
        let mut result: Option<BTreeSet<String>> = None;
        for tok in &query_tokens {
            let ids = self.tokens.get(tok).cloned().unwrap_or_default();
            result = Some(match result {
                None => ids,
                Some(r) => r.intersection(&ids).cloned().collect(),
            });
        }
        result.unwrap_or_default()
    }

    fn range_lookup(
        &self,
        lo: Option<&str>,
        hi: Option<&str>,
        include_lo: bool,
        include_hi: bool,
        value_type: ValueType,
    ) -> BTreeSet<String> {
        match value_type {
            ValueType::String => {
                self.terms
                    .iter()
                    .filter(|(val, _)| {
                        let above_lo = match lo {
                            Some(l) if include_lo => val.as_str() >= l,
                            Some(l) => val.as_str() > l,
                            None => true,
                        };
                        let below_hi = match hi {
                            Some(h) if include_hi => val.as_str() <= h,
                            Some(h) => val.as_str() < h,
                            None => true,
                        };
                        above_lo && below_hi
                    })
                    .flat_map(|(_, ids)| ids.iter().cloned())
                    .collect()
            }
            ValueType::Long | ValueType::Double => {
                let lo_n = lo.and_then(|s| s.parse::<f64>().ok());
                let hi_n = hi.and_then(|s| s.parse::<f64>().ok());
                self.numeric
                    .iter()
                    .filter(|(v, _)| {
                        let above_lo = match lo_n {
                            Some(l) if include_lo => *v >= l,
                            Some(l) => *v > l,
                            None => true,
                        };
                        let below_hi = match hi_n {
                            Some(h) if include_hi => *v <= h,
                            Some(h) => *v < h,
                            None => true,
                        };
                        above_lo && below_hi
                    })
                    .map(|(_, id)| id.clone())
                    .collect()
            }
        }
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Simple `*`-glob matcher: splits the pattern on `*` and checks that each
/// literal segment occurs in order, anchoring the first/last segment to
/// the start/end unless the pattern itself starts/ends with `*`.
fn glob_match(pattern: &str, candidate: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == candidate;
    }
    let segments: Vec<&str> = pattern.split('*').collect();
    let mut cursor = 0usize;
    for (i, seg) in segments.iter().enumerate() {
        if seg.is_empty() {
            continue;
        }
        match candidate[cursor..].find(seg) {
            Some(pos) => {
                let abs = cursor + pos;
                if i == 0 && !pattern.starts_with('*') && abs != 0 {
                    return false;
                }
                cursor = abs + seg.len();
            }
            None => return false,
        }
    }
    let last_anchored = !pattern.ends_with('*');
    if last_anchored && segments.last().map(|s| !s.is_empty()).unwrap_or(false) {
        return cursor == candidate.len();
    }
    true
}

/// Flattens a document's fields into `(dotted.path, leaf value)` pairs.
/// List elements are indexed under the same path as their container, so a
/// term query matches any element of a multi-valued field.
fn flatten(value: &Value, prefix: &str, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Map(m) => {
            for (k, v) in m {
                let path = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{}.{}", prefix, k)
                };
                flatten(v, &path, out);
            }
        }
        Value::List(items) => {
            for item in items {
                flatten(item, prefix, out);
            }
        }
        leaf => out.push((prefix.to_string(), leaf.clone())),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BranchIndex {
    fields: BTreeMap<String, FieldIndex>,
    all_ids: BTreeSet<String>,
}

impl BranchIndex {
    fn field(&self, path: &str) -> Option<&FieldIndex> {
        self.fields.get(path)
    }

    fn on_put(&mut self, doc: &Document) {
        let id = match doc.id() {
            Some(id) => id.to_string(),
            None => return,
        };
        self.on_delete(&id);
        self.all_ids.insert(id.clone());

        let mut leaves = Vec::new();
        flatten(&Value::Map(doc.fields.clone()), "", &mut leaves);
        for (path, value) in leaves {
            self.fields.entry(path).or_default().index(&id, &value);
        }
    }

    fn on_delete(&mut self, id: &str) {
        self.all_ids.remove(id);
        for field in self.fields.values_mut() {
            field.remove(id);
        }
    }

    fn evaluate(&self, ast: &Ast) -> BTreeSet<String> {
        match ast {
            Ast::MatchAll => self.all_ids.clone(),
            Ast::Term { field, value } => self
                .field(field)
                .map(|f| f.term_lookup(value))
                .unwrap_or_default(),
            Ast::Wildcard { field, pattern } => self
                .field(field)
                .map(|f| f.wildcard_lookup(pattern))
                .unwrap_or_default(),
            Ast::Fts { field, text } => self
                .field(field)
                .map(|f| f.fts_lookup(text))
                .unwrap_or_default(),
            Ast::Exists { field } => self
                .field(field)
                .map(|f| f.present.clone())
                .unwrap_or_default(),
            Ast::Missing { field } => {
                let present = self
                    .field(field)
                    .map(|f| f.present.clone())
                    .unwrap_or_default();
                self.all_ids.difference(&present).cloned().collect()
            }
            Ast::Range { field, lo, hi, include_lo, include_hi, value_type } => self
                .field(field)
                .map(|f| {
                    f.range_lookup(lo.as_deref(), hi.as_deref(), *include_lo, *include_hi, *value_type)
                })
                .unwrap_or_default(),
            Ast::Boolean { must, should, must_not, filter } => {
                let mut result: Option<BTreeSet<String>> = None;
                for clause in must.iter().chain(filter.iter()) {
                    let set = self.evaluate(clause);
                    result = Some(match result {
                        None => set,
                        Some(r) => r.intersection(&set).cloned().collect(),
                    });
                }
                let mut result = result.unwrap_or_else(|| self.all_ids.clone());
                if ast.should_requires_match() {
                    let mut union = BTreeSet::new();
                    for clause in should {
                        union.extend(self.evaluate(clause));
                    }
                    result = union;
                }
                for clause in must_not {
                    let excl = self.evaluate(clause);
                    result = result.difference(&excl).cloned().collect();
                }
                result
            }
        }
    }

    /// Resolves `query`'s clause, applies its `sort`, then slices out one
    /// page per its `after` cursor / `offset` / `limit` (spec §4.F).
    /// `after` resumes just past the given id in the sorted order; a stale
    /// or unknown cursor (the id is no longer a match) falls back to
    /// starting from the top rather than erroring, since the sorted order
    /// is still well-defined without it.
    fn search_query(&self, query: &Query) -> SearchResults {
        let matched = self.evaluate(&query.clause);
        let total = matched.len();
        let mut ids: Vec<String> = matched.into_iter().collect();

        if !query.sort.is_empty() {
            ids.sort_by(|a, b| {
                for (field, dir, value_type) in &query.sort {
                    let key_a = self.sort_key(a, field, *value_type);
                    let key_b = self.sort_key(b, field, *value_type);
                    let ord = key_a.cmp(&key_b);
                    let ord = match dir {
                        SortDirection::Asc => ord,
                        SortDirection::Desc => ord.reverse(),
                    };
                    if ord != std::cmp::Ordering::Equal {
                        return ord;
                    }
                }
                a.cmp(b)
            });
        }

        let resume_at = match &query.after {
            Some(cursor) => ids
                .iter()
                .position(|id| id == cursor)
                .map(|p| p + 1)
                .unwrap_or(0),
            None => 0,
        };
        let start = resume_at + query.offset;
        let page: Vec<String> = match query.limit {
            Some(limit) => ids.into_iter().skip(start).take(limit).collect(),
            None => ids.into_iter().skip(start).collect(),
        };
        let after = page.last().cloned();

        SearchResults {
            ids: page,
            total,
            limit: query.limit,
            offset: query.offset,
            after,
        }
    }

    fn sort_key(&self, id: &str, field: &str, value_type: ValueType) -> SortKey {
        let value = self.field(field).and_then(|f| f.values.get(id));
        SortKey::resolve(value, value_type)
    }
}

/// A single sort-field's comparison key, resolved from a `FieldIndex`'s
/// reverse id→value map. Numbers always sort before strings when a field
/// holds mixed types across documents, which can't happen for well-typed
/// data but must still resolve to *some* total order.
#[derive(Debug, Clone)]
enum SortKey {
    Missing,
    Number(f64),
    Text(String),
}

impl SortKey {
    fn resolve(value: Option<&Value>, value_type: ValueType) -> SortKey {
        match value {
            None => SortKey::Missing,
            Some(v) => match value_type {
                ValueType::Long | ValueType::Double => {
                    v.as_f64().map(SortKey::Number).unwrap_or(SortKey::Missing)
                }
                ValueType::String => SortKey::Text(v.stringify()),
            },
        }
    }

    fn cmp(&self, other: &SortKey) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (self, other) {
            (SortKey::Missing, SortKey::Missing) => Ordering::Equal,
            (SortKey::Missing, _) => Ordering::Less,
            (_, SortKey::Missing) => Ordering::Greater,
            (SortKey::Number(a), SortKey::Number(b)) => a.total_cmp(b),
            (SortKey::Text(a), SortKey::Text(b)) => a.cmp(b),
            (SortKey::Number(_), SortKey::Text(_)) => Ordering::Less,
            (SortKey::Text(_), SortKey::Number(_)) => Ordering::Greater,
        }
    }
}

/// The envelope every `search_query` call returns (spec §4.F / §6): the
/// page of matching ids plus enough bookkeeping for a caller to page
/// through the rest. `after` in the response is the cursor to pass as the
/// next call's `after` — the id of the last result on this page, or
/// `None` once there's nothing left.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResults {
    pub ids: Vec<String>,
    pub total: usize,
    pub limit: Option<usize>,
    pub offset: usize,
    pub after: Option<String>,
}

/// Per-branch secondary index manager: the facade calls `on_put`/`on_delete`
/// on every mutating write and `search` to resolve a query clause to the
/// set of matching document ids (spec §4.F).
#[derive(Default)]
pub struct IndexManager {
    branches: RwLock<BTreeMap<String, BranchIndex>>,
}

impl IndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_put(&self, branch: &str, doc: &Document) {
        let mut branches = self.branches.write().unwrap();
        branches.entry(branch.to_string()).or_default().on_put(doc);
    }

    pub fn on_delete(&self, branch: &str, id: &str) {
        let mut branches = self.branches.write().unwrap();
        branches.entry(branch.to_string()).or_default().on_delete(id);
    }

    /// Create `to` as an independent copy of `from`'s current index state,
    /// mirroring `ObjectStore::create_branch`'s ref-copy semantics.
    pub fn on_create_branch(&self, from: &str, to: &str) {
        let mut branches = self.branches.write().unwrap();
        let source = branches.get(from).cloned().unwrap_or_default();
        branches.insert(to.to_string(), source);
    }

    pub fn search(&self, branch: &str, ast: &Ast) -> Vec<String> {
        let branches = self.branches.read().unwrap();
        match branches.get(branch) {
            Some(idx) => idx.evaluate(ast).into_iter().collect(),
            None => Vec::new(),
        }
    }

    /// The full query operation (spec §4.F / §6): sorted, paginated,
    /// resumable search with a total count, consumed by every adapter
    /// surface (`search` above only ever did exact single-clause lookup).
    pub fn search_query(&self, query: &Query) -> SearchResults {
        let branches = self.branches.read().unwrap();
        match branches.get(&query.branch) {
            Some(idx) => idx.search_query(query),
            None => SearchResults {
                ids: Vec::new(),
                total: 0,
                limit: query.limit,
                offset: query.offset,
                after: None,
            },
        }
    }

    /// Drops and rebuilds a branch's index from a full document set — used
    /// by WAL recovery's reindex step.
    pub fn rebuild(&self, branch: &str, docs: &[Document]) {
        let mut branches = self.branches.write().unwrap();
        let mut fresh = BranchIndex::default();
        for doc in docs {
            fresh.on_put(doc);
        }
        branches.insert(branch.to_string(), fresh);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ast::Query;

    fn doc(id: &str, json: serde_json::Value) -> Document {
        let mut obj = json;
        obj.as_object_mut()
            .unwrap()
            .insert("id".to_string(), serde_json::json!(id));
        Document::from_json(&obj).unwrap()
    }

    #[test]
    fn term_lookup_finds_exact_match() {
        let mgr = IndexManager::new();
        mgr.on_put("main", &doc("u:1", serde_json::json!({"city": "Zurich"})));
        mgr.on_put("main", &doc("u:2", serde_json::json!({"city": "Bern"})));
        let ids = mgr.search("main", &Ast::term("city", "Zurich"));
        assert_eq!(ids, vec!["u:1".to_string()]);
    }

    #[test]
    fn delete_removes_from_all_structures() {
        let mgr = IndexManager::new();
        mgr.on_put("main", &doc("u:1", serde_json::json!({"city": "Zurich"})));
        mgr.on_delete("main", "u:1");
        assert!(mgr.search("main", &Ast::term("city", "Zurich")).is_empty());
        assert!(mgr.search("main", &Ast::MatchAll).is_empty());
    }

    #[test]
    fn nested_path_indexed_with_dots() {
        let mgr = IndexManager::new();
        mgr.on_put(
            "main",
            &doc("u:1", serde_json::json!({"address": {"city": "Zurich"}})),
        );
        assert_eq!(
            mgr.search("main", &Ast::term("address.city", "Zurich")),
            vec!["u:1".to_string()]
        );
    }

    #[test]
    fn wildcard_prefix_and_infix() {
        let mgr = IndexManager::new();
        mgr.on_put("main", &doc("u:1", serde_json::json!({"name": "Alice"})));
        mgr.on_put("main", &doc("u:2", serde_json::json!({"name": "Albert"})));
        mgr.on_put("main", &doc("u:3", serde_json::json!({"name": "Bob"})));
        let mut ids = mgr.search("main", &Ast::prefix("name", "Al"));
        ids.sort();
        assert_eq!(ids, vec!["u:1".to_string(), "u:2".to_string()]);
    }

    #[test]
    fn fts_requires_all_tokens() {
        let mgr = IndexManager::new();
        mgr.on_put(
            "main",
            &doc("p:1", serde_json::json!({"body": "the quick brown fox"})),
        );
        mgr.on_put("main", &doc("p:2", serde_json::json!({"body": "the slow turtle"})));
        let ids = mgr.search("main", &Ast::fts("body", "quick fox"));
        assert_eq!(ids, vec!["p:1".to_string()]);
        assert!(mgr.search("main", &Ast::fts("body", "quick turtle")).is_empty());
    }

    #[test]
    fn exists_and_missing() {
        let mgr = IndexManager::new();
        mgr.on_put("main", &doc("u:1", serde_json::json!({"email": "a@b.com"})));
        mgr.on_put("main", &doc("u:2", serde_json::json!({})));
        assert_eq!(
            mgr.search("main", &Ast::exists("email")),
            vec!["u:1".to_string()]
        );
        assert_eq!(
            mgr.search("main", &Ast::missing("email")),
            vec!["u:2".to_string()]
        );
    }

    #[test]
    fn numeric_range_query() {
        let mgr = IndexManager::new();
        mgr.on_put("main", &doc("u:1", serde_json::json!({"age": 18})));
        mgr.on_put("main", &doc("u:2", serde_json::json!({"age": 42})));
        mgr.on_put("main", &doc("u:3", serde_json::json!({"age": 65})));
        let ids = mgr.search(
            "main",
            &Ast::range("age", Some("20".into()), Some("60".into()), true, true, ast::ValueType::Long),
        );
        assert_eq!(ids, vec!["u:2".to_string()]);
    }

    #[test]
    fn boolean_must_intersects() {
        let mgr = IndexManager::new();
        mgr.on_put("main", &doc("u:1", serde_json::json!({"city": "Zurich", "active": true})));
        mgr.on_put("main", &doc("u:2", serde_json::json!({"city": "Zurich", "active": false})));
        let ids = mgr.search(
            "main",
            &Ast::and(vec![Ast::term("city", "Zurich"), Ast::term("active", "true")]),
        );
        assert_eq!(ids, vec!["u:1".to_string()]);
    }

    #[test]
    fn boolean_must_not_excludes() {
        let mgr = IndexManager::new();
        mgr.on_put("main", &doc("u:1", serde_json::json!({"city": "Zurich"})));
        mgr.on_put("main", &doc("u:2", serde_json::json!({"city": "Bern"})));
        let ids = mgr.search("main", &Ast::not(Some(Ast::term("city", "Zurich"))));
        assert_eq!(ids, vec!["u:2".to_string()]);
    }

    #[test]
    fn branches_are_isolated() {
        let mgr = IndexManager::new();
        mgr.on_put("main", &doc("u:1", serde_json::json!({"city": "Zurich"})));
        assert!(mgr.search("feature", &Ast::MatchAll).is_empty());
        mgr.on_create_branch("main", "feature");
        assert_eq!(mgr.search("feature", &Ast::MatchAll), vec!["u:1".to_string()]);
    }

    #[test]
    fn rebuild_replaces_branch_state() {
        let mgr = IndexManager::new();
        mgr.on_put("main", &doc("stale", serde_json::json!({})));
        let fresh = vec![doc("u:1", serde_json::json!({"city": "Zurich"}))];
        mgr.rebuild("main", &fresh);
        let mut ids = mgr.search("main", &Ast::MatchAll);
        ids.sort();
        assert_eq!(ids, vec!["u:1".to_string()]);
    }

    #[test]
    fn query_envelope_normalizes_clause() {
        let q = Query::new("main", Ast::and(vec![Ast::term("a", "1")]));
        assert_eq!(q.clause, Ast::term("a", "1"));
    }

    #[test]
    fn search_query_sorts_paginates_and_reports_total() {
        let mgr = IndexManager::new();
        mgr.on_put("main", &doc("u:1", serde_json::json!({"age": 42, "city": "Zurich"})));
        mgr.on_put("main", &doc("u:2", serde_json::json!({"age": 18, "city": "Zurich"})));
        mgr.on_put("main", &doc("u:3", serde_json::json!({"age": 65, "city": "Zurich"})));

        let mut q = Query::new("main", Ast::term("city", "Zurich"));
        q.sort = vec![("age".to_string(), ast::SortDirection::Asc, ast::ValueType::Long)];
        q.limit = Some(2);

        let page1 = mgr.search_query(&q);
        assert_eq!(page1.total, 3);
        assert_eq!(page1.ids, vec!["u:2".to_string(), "u:1".to_string()]);
        assert_eq!(page1.after, Some("u:1".to_string()));

        q.after = page1.after.clone();
        let page2 = mgr.search_query(&q);
        assert_eq!(page2.ids, vec!["u:3".to_string()]);
        assert_eq!(page2.total, 3);
    }

    #[test]
    fn search_query_on_unknown_branch_is_empty() {
        let mgr = IndexManager::new();
        let q = Query::new("ghost", Ast::MatchAll);
        let results = mgr.search_query(&q);
        assert_eq!(results.total, 0);
        assert!(results.ids.is_empty());
    }
}
