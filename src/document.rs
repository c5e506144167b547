use crate::value::Value;
use std::collections::BTreeMap;

/// The token colons in an id are replaced with when building a tree path,
/// so ids like `user:1` don't get mistaken for path separators.
const COLON_ESCAPE: &str = "__COLON__";

/// A document: an open map of attributes. `id` must be present on write;
/// `_table` and the bi-temporal `_valid_from`/`_valid_to` attributes carry
/// reserved semantics but are otherwise ordinary map keys (spec §9).
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub fields: BTreeMap<String, Value>,
}

impl Document {
    pub fn from_json(v: &serde_json::Value) -> Option<Self> {
        let value = Value::from_json(v);
        match value {
            Value::Map(fields) => Some(Self { fields }),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        Value::Map(self.fields.clone()).to_json()
    }

    pub fn to_canonical_json(&self) -> String {
        Value::Map(self.fields.clone()).to_canonical_json()
    }

    pub fn from_canonical_bytes(bytes: &[u8]) -> crate::error::Result<Self> {
        let json: serde_json::Value = serde_json::from_slice(bytes)?;
        Ok(Self::from_json(&json).unwrap_or(Self {
            fields: BTreeMap::new(),
        }))
    }

    /// Stable string identity. Required on write (spec §3); callers must
    /// validate its presence before calling tree-path derivation.
    pub fn id(&self) -> Option<&str> {
        self.fields.get("id").and_then(Value::as_str)
    }

    /// `_table`, or the id prefix before the first `:` if absent.
    pub fn table(&self) -> Option<String> {
        if let Some(Value::String(t)) = self.fields.get("_table") {
            return Some(t.clone());
        }
        self.id().and_then(|id| id.split(':').next().map(String::from))
    }

    pub fn valid_from(&self) -> Option<&Value> {
        self.fields.get("_valid_from")
    }

    pub fn valid_to(&self) -> Option<&Value> {
        self.fields.get("_valid_to")
    }

    /// Deterministic tree path: `{table}/{id-with-colons-escaped}.json`.
    pub fn path_for(table: &str, id: &str) -> String {
        let escaped_id = id.replace(':', COLON_ESCAPE);
        format!("{}/{}.json", table, escaped_id)
    }

    pub fn path(&self) -> Option<String> {
        let id = self.id()?;
        let table = self.table().unwrap_or_else(|| "default".to_string());
        Some(Self::path_for(&table, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_from_tag() {
        let d = Document::from_json(&serde_json::json!({"id": "user:1", "_table": "user"}))
            .unwrap();
        assert_eq!(d.table(), Some("user".to_string()));
    }

    #[test]
    fn table_from_id_prefix() {
        let d = Document::from_json(&serde_json::json!({"id": "user:1"})).unwrap();
        assert_eq!(d.table(), Some("user".to_string()));
    }

    #[test]
    fn path_escapes_colons() {
        let d = Document::from_json(&serde_json::json!({"id": "user:1", "_table": "user"}))
            .unwrap();
        assert_eq!(d.path().unwrap(), format!("user/user{}1.json", COLON_ESCAPE));
    }
}
