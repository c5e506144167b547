use crate::store::commit::Note;
use std::collections::BTreeMap;

/// Ambient per-operation metadata, threaded explicitly through the
/// facade's call chain rather than via thread-local/global state (spec
/// §9's design note). Each mutating facade call opens one of these and
/// folds it into the commit's `Note` at the annotation step.
#[derive(Debug, Clone, Default)]
pub struct Context {
    pub tx_id: String,
    pub origin: Option<String>,
    pub user: Option<String>,
    pub flags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

impl Context {
    pub fn new() -> Self {
        Self {
            tx_id: uuid::Uuid::new_v4().to_string(),
            ..Default::default()
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.push(flag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Fold `overrides` onto this ambient context, producing the value
    /// used to build the commit annotation. Overrides win on every
    /// scalar field they set; flags/metadata accumulate.
    pub fn context_for_commit(&self, overrides: &ContextOverrides) -> Context {
        let mut ctx = self.clone();
        if let Some(origin) = &overrides.origin {
            ctx.origin = Some(origin.clone());
        }
        if let Some(user) = &overrides.user {
            ctx.user = Some(user.clone());
        }
        ctx.flags.extend(overrides.flags.iter().cloned());
        ctx.metadata
            .extend(overrides.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        ctx
    }

    pub fn to_note(&self) -> Note {
        Note {
            tx_id: Some(self.tx_id.clone()),
            origin: self.origin.clone(),
            user: self.user.clone(),
            flags: self.flags.iter().cloned().collect(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Overrides applied on top of an ambient `Context` for a single call.
#[derive(Debug, Clone, Default)]
pub struct ContextOverrides {
    pub origin: Option<String>,
    pub user: Option<String>,
    pub flags: Vec<String>,
    pub metadata: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_context_has_unique_tx_id() {
        let c1 = Context::new();
        let c2 = Context::new();
        assert_ne!(c1.tx_id, c2.tx_id);
    }

    #[test]
    fn overrides_win_on_scalars_and_accumulate_on_collections() {
        let base = Context::new().with_user("alice").with_flag("base-flag");
        let overrides = ContextOverrides {
            user: Some("bob".into()),
            flags: vec!["override-flag".into()],
            ..Default::default()
        };
        let folded = base.context_for_commit(&overrides);
        assert_eq!(folded.user, Some("bob".to_string()));
        assert_eq!(folded.flags, vec!["base-flag", "override-flag"]);
    }

    #[test]
    fn to_note_carries_fields() {
        let ctx = Context::new().with_user("alice").with_metadata("k", "v");
        let note = ctx.to_note();
        assert_eq!(note.user, Some("alice".to_string()));
        assert_eq!(note.metadata.get("k"), Some(&"v".to_string()));
    }
}
