use crate::model::FieldChange;
use serde::Serialize;
use serde_json::Value;

/// Collects `{field, old, new}` rows for the fields an update really changes.
///
/// Text is compared after trimming, so whitespace-only edits are not changes.
/// An empty set means the update is a no-op.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ChangeSet {
    changes: Vec<FieldChange>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a text field. Returns whether it changed.
    pub fn text(&mut self, field: &str, old: &str, new: &str) -> bool {
        if old.trim() == new.trim() {
            return false;
        }
        self.changes.push(FieldChange {
            field: field.to_string(),
            old: Value::String(old.to_string()),
            new: Value::String(new.trim().to_string()),
        });
        true
    }

    /// Records any other field. Returns whether it changed.
    pub fn value<T>(&mut self, field: &str, old: &T, new: &T) -> bool
    where
        T: PartialEq + Serialize,
    {
        if old == new {
            return false;
        }
        self.changes.push(FieldChange {
            field: field.to_string(),
            old: to_json(old),
            new: to_json(new),
        });
        true
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().map(|change| change.field.as_str())
    }

    pub fn into_changes(self) -> Vec<FieldChange> {
        self.changes
    }
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_default()
}
