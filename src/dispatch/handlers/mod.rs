//! Built-in request handlers, one per [`RequestKind`](super::RequestKind).

pub mod comments;
pub mod dependencies;
pub mod queries;
pub mod sprints;
pub mod timers;
pub mod work_items;

use super::registry::HandlerRegistry;
use super::{HandlerOutput, Payload};
use crate::core::{MutationError, ProjectId, Result};
use serde::{Deserialize, Deserializer};
use std::sync::Arc;

/// Result of an update transaction. `Unchanged` means nothing differed: no
/// version bump, no activity row, nothing to broadcast.
pub(crate) enum UpdateOutcome<T> {
    Applied(T),
    Unchanged(T),
}

impl<T> UpdateOutcome<T> {
    pub(crate) fn into_output(self, project_id: ProjectId, wrap: impl FnOnce(T) -> Payload) -> HandlerOutput {
        match self {
            Self::Applied(entity) => HandlerOutput::committed(project_id, wrap(entity)),
            Self::Unchanged(entity) => HandlerOutput::unchanged(wrap(entity)),
        }
    }
}

pub(crate) fn register_defaults(registry: &mut HandlerRegistry) {
    registry.register(Arc::new(work_items::CreateWorkItem));
    registry.register(Arc::new(work_items::UpdateWorkItem));
    registry.register(Arc::new(work_items::DeleteWorkItem));
    registry.register(Arc::new(sprints::CreateSprint));
    registry.register(Arc::new(sprints::UpdateSprint));
    registry.register(Arc::new(comments::AddComment));
    registry.register(Arc::new(comments::EditComment));
    registry.register(Arc::new(comments::DeleteComment));
    registry.register(Arc::new(timers::StartTimer));
    registry.register(Arc::new(timers::StopTimer));
    registry.register(Arc::new(timers::LogManualTime));
    registry.register(Arc::new(dependencies::AddDependency));
    registry.register(Arc::new(dependencies::RemoveDependency));
    registry.register(Arc::new(queries::GetWorkItem));
    registry.register(Arc::new(queries::ListWorkItems));
    registry.register(Arc::new(queries::GetSprint));
    registry.register(Arc::new(queries::ListComments));
    registry.register(Arc::new(queries::CurrentTimer));
    registry.register(Arc::new(queries::ListDependencies));
    registry.register(Arc::new(queries::ListActivity));
}

/// Distinguishes an absent field (`None`) from an explicit `null`
/// (`Some(None)`), so updates can clear optional fields.
pub(crate) fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Trimmed, non-empty, at most `max` characters.
pub(crate) fn required_text(field: &str, value: &str, max: usize) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(MutationError::validation(field, format!("{field} must not be empty")));
    }
    bounded_text(field, trimmed, max)
}

/// Trimmed, at most `max` characters.
pub(crate) fn bounded_text(field: &str, value: &str, max: usize) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.chars().count() > max {
        return Err(MutationError::validation(
            field,
            format!("{field} must be at most {max} characters"),
        ));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Patch {
        #[serde(default, deserialize_with = "nullable")]
        assignee: Option<Option<u32>>,
    }

    #[test]
    fn nullable_distinguishes_absent_from_null() {
        let absent: Patch = serde_json::from_value(json!({})).unwrap();
        let cleared: Patch = serde_json::from_value(json!({"assignee": null})).unwrap();
        let set: Patch = serde_json::from_value(json!({"assignee": 4})).unwrap();
        assert_eq!(absent.assignee, None);
        assert_eq!(cleared.assignee, Some(None));
        assert_eq!(set.assignee, Some(Some(4)));
    }

    #[test]
    fn text_rules() {
        assert_eq!(required_text("title", "  Ship  ", 10).unwrap(), "Ship");
        assert!(required_text("title", "   ", 10).is_err());
        assert!(required_text("title", "abcdefghijk", 10).is_err());
        assert_eq!(bounded_text("goal", "", 10).unwrap(), "");
    }
}
