use crate::document::Document;
use crate::error::{ChronError, Result};
use crate::store::ObjectStore;
use jsonschema::JSONSchema;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const SCHEMA_TABLE: &str = "_schema";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Violations reject the write.
    Strict,
    /// Violations are logged but the write proceeds.
    Warning,
    /// No schema is consulted at all.
    Disabled,
}

impl Mode {
    fn parse(s: &str) -> Mode {
        match s {
            "strict" => Mode::Strict,
            "disabled" => Mode::Disabled,
            _ => Mode::Warning,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Mode::Strict => "strict",
            Mode::Warning => "warning",
            Mode::Disabled => "disabled",
        }
    }
}

/// The schema document stored per namespace: `{id, schema, version, mode}`.
struct StoredSchema {
    schema: serde_json::Value,
    version: u64,
    mode: Mode,
}

fn schema_id(namespace: &str) -> String {
    format!("validation/{}", namespace)
}

/// Compiled-validator cache keyed by `(namespace, branch, schema_version)`
/// so a schema bump on one branch doesn't invalidate another branch still
/// pinned to the old version (spec §4.G).
#[derive(Default)]
pub struct SchemaRegistry {
    cache: Mutex<HashMap<(String, String, u64), Arc<JSONSchema>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes (or replaces) the JSON Schema governing `namespace` on
    /// `branch`, bumping its version by one.
    pub fn register(
        &self,
        store: &ObjectStore,
        branch: &str,
        namespace: &str,
        schema: serde_json::Value,
        mode: Mode,
        author: &str,
    ) -> Result<()> {
        // Compile eagerly so a malformed schema is rejected at registration
        // time rather than surfacing as a confusing validation failure later.
        JSONSchema::compile(&schema).map_err(|e| ChronError::ValidationError {
            namespace: namespace.to_string(),
            id: "<schema>".to_string(),
            mode: mode.as_str().to_string(),
            violations: vec![e.to_string()],
        })?;

        let previous = self.load(store, branch, namespace)?;
        let version = previous.map(|s| s.version + 1).unwrap_or(1);

        let doc_json = serde_json::json!({
            "id": schema_id(namespace),
            "_table": SCHEMA_TABLE,
            "schema": schema,
            "version": version,
            "mode": mode.as_str(),
        });
        let doc = Document::from_json(&doc_json).ok_or_else(|| ChronError::ValidationError {
            namespace: namespace.to_string(),
            id: "<schema>".to_string(),
            mode: mode.as_str().to_string(),
            violations: vec!["schema document is not a JSON object".to_string()],
        })?;

        store.put_document(
            branch,
            &doc,
            author,
            author,
            &format!("register schema for {}", namespace),
            None,
        )?;
        Ok(())
    }

    fn load(&self, store: &ObjectStore, branch: &str, namespace: &str) -> Result<Option<StoredSchema>> {
        let doc = store.get_document(branch, &schema_id(namespace), None)?;
        let doc = match doc {
            Some(d) => d,
            None => return Ok(None),
        };
        let schema = doc
            .fields
            .get("schema")
            .map(|v| v.to_json())
            .unwrap_or(serde_json::Value::Null);
        let version = doc
            .fields
            .get("version")
            .and_then(|v| v.as_i64())
            .unwrap_or(1) as u64;
        let mode = doc
            .fields
            .get("mode")
            .and_then(|v| v.as_str())
            .map(Mode::parse)
            .unwrap_or(Mode::Warning);
        Ok(Some(StoredSchema { schema, version, mode }))
    }

    fn compiled(
        &self,
        branch: &str,
        namespace: &str,
        version: u64,
        schema: &serde_json::Value,
    ) -> Result<Arc<JSONSchema>> {
        let key = (namespace.to_string(), branch.to_string(), version);
        if let Some(existing) = self.cache.lock().unwrap().get(&key) {
            return Ok(existing.clone());
        }
        let compiled = Arc::new(JSONSchema::compile(schema).map_err(|e| {
            ChronError::ValidationError {
                namespace: namespace.to_string(),
                id: "<schema>".to_string(),
                mode: "strict".to_string(),
                violations: vec![e.to_string()],
            }
        })?);
        self.cache.lock().unwrap().insert(key, compiled.clone());
        Ok(compiled)
    }

    /// Validates `doc` against `namespace`'s registered schema on `branch`.
    /// Returns `Ok(violations)` in warning mode (empty if clean) and raises
    /// `ValidationError` in strict mode; disabled mode and an unregistered
    /// namespace both short-circuit to `Ok(vec![])`.
    pub fn validate(
        &self,
        store: &ObjectStore,
        branch: &str,
        namespace: &str,
        doc: &Document,
    ) -> Result<Vec<String>> {
        let stored = match self.load(store, branch, namespace)? {
            Some(s) => s,
            None => return Ok(Vec::new()),
        };
        if stored.mode == Mode::Disabled {
            return Ok(Vec::new());
        }

        let validator = self.compiled(branch, namespace, stored.version, &stored.schema)?;
        let instance = doc.to_json();
        let violations: Vec<String> = match validator.validate(&instance) {
            Ok(()) => Vec::new(),
            Err(errors) => errors.map(|e| e.to_string()).collect(),
        };

        if violations.is_empty() {
            return Ok(violations);
        }

        match stored.mode {
            Mode::Strict => Err(ChronError::ValidationError {
                namespace: namespace.to_string(),
                id: doc.id().unwrap_or("<unknown>").to_string(),
                mode: "strict".to_string(),
                violations,
            }),
            Mode::Warning => {
                for v in &violations {
                    log::warn!(
                        "schema violation: namespace={} id={:?} detail={}",
                        namespace,
                        doc.id(),
                        v
                    );
                }
                Ok(violations)
            }
            Mode::Disabled => unreachable!(),
        }
    }
}
