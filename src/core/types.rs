use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type UserId = Uuid;
pub type ProjectId = Uuid;
pub type EntityId = Uuid;

/// Entity families a request can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Project,
    WorkItem,
    Sprint,
    Comment,
    TimeEntry,
    Dependency,
    Activity,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::WorkItem => "work_item",
            Self::Sprint => "sprint",
            Self::Comment => "comment",
            Self::TimeEntry => "time_entry",
            Self::Dependency => "dependency",
            Self::Activity => "activity",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Project membership level. Ordered: `View < Edit < Admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    View,
    Edit,
    Admin,
}

impl PermissionLevel {
    #[inline]
    pub fn satisfies(self, required: PermissionLevel) -> bool {
        self >= required
    }
}

impl std::str::FromStr for PermissionLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "view" => Ok(Self::View),
            "edit" => Ok(Self::Edit),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown permission level '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_levels_are_ordered() {
        assert!(PermissionLevel::Admin.satisfies(PermissionLevel::Edit));
        assert!(PermissionLevel::Edit.satisfies(PermissionLevel::Edit));
        assert!(!PermissionLevel::View.satisfies(PermissionLevel::Edit));
        assert_eq!("ADMIN".parse::<PermissionLevel>(), Ok(PermissionLevel::Admin));
        assert!("owner".parse::<PermissionLevel>().is_err());
    }
}
