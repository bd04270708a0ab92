//! Cycle rejection for blocking dependencies and the work-item hierarchy.
//!
//! Both checks walk the existing graph breadth-first from the proposed target,
//! keeping a parent pointer per visited node so the offending path can be
//! returned to the caller.

use crate::config::DependencyPolicy;
use crate::core::{ConflictContext, EntityId, MutationError, ProjectId, Result};
use crate::model::{DependencyEdge, DependencyKind};
use crate::storage::StoreState;
use std::collections::{HashMap, HashSet, VecDeque};

/// The path a rejected edge would have closed, starting at its target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError {
    pub path: Vec<EntityId>,
}

impl From<CycleError> for MutationError {
    fn from(err: CycleError) -> Self {
        MutationError::Conflict {
            message: "dependency would create a cycle".to_string(),
            context: ConflictContext::CyclePath(err.path),
        }
    }
}

/// Adjacency over blocking edges only.
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    adjacency: HashMap<EntityId, Vec<EntityId>>,
}

impl DependencyGraph {
    pub fn from_edges<'a>(edges: impl IntoIterator<Item = &'a DependencyEdge>) -> Self {
        let mut graph = Self::default();
        for edge in edges {
            if edge.kind == DependencyKind::Blocking {
                graph.add_edge(edge.from_id, edge.to_id);
            }
        }
        graph
    }

    pub fn for_project(state: &StoreState, project_id: ProjectId) -> Self {
        Self::from_edges(
            state
                .dependencies
                .values()
                .filter(|edge| edge.project_id == project_id),
        )
    }

    pub fn add_edge(&mut self, from: EntityId, to: EntityId) {
        self.adjacency.entry(from).or_default().push(to);
    }

    /// Whether adding `new_from -> new_to` would close a cycle.
    pub fn would_cycle(&self, new_from: EntityId, new_to: EntityId) -> std::result::Result<(), CycleError> {
        let mut parents: HashMap<EntityId, EntityId> = HashMap::new();
        let mut visited: HashSet<EntityId> = HashSet::from([new_to]);
        let mut queue = VecDeque::from([new_to]);

        while let Some(node) = queue.pop_front() {
            if node == new_from {
                return Err(CycleError {
                    path: walk_back(&parents, new_to, new_from),
                });
            }
            for &next in self.adjacency.get(&node).map(Vec::as_slice).unwrap_or_default() {
                if visited.insert(next) {
                    parents.insert(next, node);
                    queue.push_back(next);
                }
            }
        }
        Ok(())
    }
}

fn walk_back(parents: &HashMap<EntityId, EntityId>, start: EntityId, end: EntityId) -> Vec<EntityId> {
    let mut path = vec![end];
    let mut cursor = end;
    while cursor != start {
        match parents.get(&cursor) {
            Some(&parent) => {
                path.push(parent);
                cursor = parent;
            }
            None => break,
        }
    }
    path.reverse();
    path
}

/// Every precondition for inserting `from -> to`, cycle check last.
pub fn validate_new_edge(
    state: &StoreState,
    policy: &DependencyPolicy,
    from_id: EntityId,
    to_id: EntityId,
    kind: DependencyKind,
) -> Result<ProjectId> {
    if from_id == to_id {
        return Err(MutationError::validation(
            "to_id",
            "a work item cannot depend on itself",
        ));
    }

    let project_id = state.live_work_item(from_id)?.project_id;
    if state.live_work_item(to_id)?.project_id != project_id {
        return Err(MutationError::validation(
            "to_id",
            "both work items must belong to the same project",
        ));
    }

    if let Some(existing) = state
        .dependencies
        .values()
        .find(|edge| edge.from_id == from_id && edge.to_id == to_id)
    {
        return Err(MutationError::Conflict {
            message: "dependency already exists".to_string(),
            context: ConflictContext::Existing(existing.id),
        });
    }

    let fan_out = state
        .dependencies
        .values()
        .filter(|edge| edge.from_id == from_id)
        .count();
    if fan_out >= policy.max_edges_per_item {
        return Err(MutationError::validation(
            "from_id",
            format!("a work item may depend on at most {} others", policy.max_edges_per_item),
        ));
    }
    let fan_in = state
        .dependencies
        .values()
        .filter(|edge| edge.to_id == to_id)
        .count();
    if fan_in >= policy.max_edges_per_item {
        return Err(MutationError::validation(
            "to_id",
            format!("a work item may be depended on by at most {} others", policy.max_edges_per_item),
        ));
    }

    if kind == DependencyKind::Blocking {
        DependencyGraph::for_project(state, project_id).would_cycle(from_id, to_id)?;
    }
    Ok(project_id)
}

/// Reject re-parenting `item_id` under `new_parent_id` when the new parent
/// already descends from it. The path runs from the new parent up to the item.
pub fn check_parent(state: &StoreState, item_id: EntityId, new_parent_id: EntityId) -> Result<()> {
    if item_id == new_parent_id {
        return Err(MutationError::validation(
            "parent_id",
            "a work item cannot be its own parent",
        ));
    }

    let item = state.live_work_item(item_id)?;
    let parent = state.live_work_item(new_parent_id)?;
    if parent.project_id != item.project_id {
        return Err(MutationError::validation(
            "parent_id",
            "parent must belong to the same project",
        ));
    }

    let mut path = vec![new_parent_id];
    let mut seen = HashSet::from([new_parent_id]);
    let mut cursor = parent.parent_id;
    while let Some(ancestor) = cursor {
        path.push(ancestor);
        if ancestor == item_id {
            return Err(MutationError::Conflict {
                message: "work item would become its own ancestor".to_string(),
                context: ConflictContext::CyclePath(path),
            });
        }
        if !seen.insert(ancestor) {
            break;
        }
        cursor = state.work_items.get(&ancestor).and_then(|node| node.parent_id);
    }
    Ok(())
}
