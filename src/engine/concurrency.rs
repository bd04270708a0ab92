//! Optimistic versioning and status state machines.

use crate::core::{EntityId, MutationError, Result};
use chrono::{DateTime, Utc};

/// A mutable entity guarded by a version counter.
///
/// Create sets `version = 1`; every committed update bumps it exactly once.
pub trait Versioned {
    const ENTITY: &'static str;

    fn id(&self) -> EntityId;
    fn version(&self) -> u64;
    fn bump_version(&mut self, now: DateTime<Utc>);
}

/// A finite status set with an explicit transition relation.
pub trait StatusMachine: Copy + PartialEq {
    fn can_transition_to(&self, next: &Self) -> bool;
    fn is_terminal(&self) -> bool;
    fn label(&self) -> &'static str;
}

/// Conflict carrying the current version unless `expected` matches it.
pub fn check_version<T: Versioned>(entity: &T, expected: u64) -> Result<()> {
    let current = entity.version();
    if current == expected {
        return Ok(());
    }
    Err(MutationError::version_conflict(
        format!(
            "{} '{}' is at version {current}, not {expected}",
            T::ENTITY,
            entity.id()
        ),
        current,
    ))
}

/// Entities in a terminal status accept no further updates.
pub fn ensure_not_terminal<T, S>(entity: &T, status: S) -> Result<()>
where
    T: Versioned,
    S: StatusMachine,
{
    if !status.is_terminal() {
        return Ok(());
    }
    Err(MutationError::version_conflict(
        format!("{} '{}' is {} and can no longer change", T::ENTITY, entity.id(), status.label()),
        entity.version(),
    ))
}

/// Staying in the same status is always allowed.
pub fn ensure_transition<T, S>(entity: &T, from: S, to: S) -> Result<()>
where
    T: Versioned,
    S: StatusMachine,
{
    if from == to || from.can_transition_to(&to) {
        return Ok(());
    }
    Err(MutationError::version_conflict(
        format!(
            "{} '{}' cannot move from {} to {}",
            T::ENTITY,
            entity.id(),
            from.label(),
            to.label()
        ),
        entity.version(),
    ))
}
