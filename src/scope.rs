//! Scope strings and the execution-queue resolver.
//!
//! A scope selects a subtree of the backlog: `P1`, `P1.M2`, `P1.M2.T3`, or
//! `P1.M2.T3.S4`. An absent scope means the first phase. Resolution flattens
//! the selected subtree into a depth-first pre-order sequence; hierarchy is
//! encoded only by emission order. The resolver is pure and deterministic and
//! never observes status.

use regex::Regex;
use std::sync::OnceLock;

use crate::errors::OrchestratorError;
use crate::model::{Backlog, ItemId, ItemLevel, ItemRef};

fn scope_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^P\d+(\.M\d+(\.T\d+(\.S\d+)?)?)?$").expect("valid scope regex"))
}

/// Parse a CLI scope string into an item id.
pub fn parse_scope(raw: &str) -> Result<ItemId, OrchestratorError> {
    if !scope_regex().is_match(raw) {
        return Err(OrchestratorError::InvalidScope(raw.to_string()));
    }
    ItemId::parse(raw).map_err(|_| OrchestratorError::InvalidScope(raw.to_string()))
}

/// The default scope when none was given: the first phase.
pub fn default_scope(backlog: &Backlog) -> Result<ItemId, OrchestratorError> {
    backlog
        .backlog
        .first()
        .map(|p| p.id.clone())
        .ok_or_else(|| OrchestratorError::ScopeNotFound("<first phase>".to_string()))
}

/// One entry of the flattened execution queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub id: ItemId,
    pub level: ItemLevel,
}

/// Flatten the subtree rooted at `scope` into DFS pre-order.
pub fn resolve(backlog: &Backlog, scope: &ItemId) -> Result<Vec<QueueItem>, OrchestratorError> {
    let root = backlog
        .find(scope)
        .ok_or_else(|| OrchestratorError::ScopeNotFound(scope.to_string()))?;

    let mut queue = Vec::new();
    emit(root, &mut queue);
    Ok(queue)
}

fn emit(item: ItemRef<'_>, queue: &mut Vec<QueueItem>) {
    queue.push(QueueItem {
        id: item.id().clone(),
        level: item.level(),
    });
    match item {
        ItemRef::Phase(phase) => {
            for milestone in &phase.milestones {
                emit(ItemRef::Milestone(milestone), queue);
            }
        }
        ItemRef::Milestone(milestone) => {
            for task in &milestone.tasks {
                emit(ItemRef::Task(task), queue);
            }
        }
        ItemRef::Task(task) => {
            for subtask in &task.subtasks {
                emit(ItemRef::Subtask(subtask), queue);
            }
        }
        ItemRef::Subtask(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::linear_backlog;

    #[test]
    fn test_parse_scope_accepts_grammar() {
        for raw in ["P1", "P1.M2", "P10.M2.T33", "P1.M1.T1.S4"] {
            assert_eq!(parse_scope(raw).unwrap().to_string(), raw);
        }
    }

    #[test]
    fn test_parse_scope_rejects_bad_strings() {
        for raw in ["", "p1", "P1.", "P1.T1", "M1", "P1.M1.T1.S1.X2", "P1 M1", "P-1"] {
            assert!(
                matches!(parse_scope(raw), Err(OrchestratorError::InvalidScope(_))),
                "should reject {raw:?}"
            );
        }
    }

    #[test]
    fn test_resolve_phase_scope_is_dfs_preorder() {
        let backlog = linear_backlog(2);
        let queue = resolve(&backlog, &ItemId::parse("P1").unwrap()).unwrap();
        let ids: Vec<String> = queue.iter().map(|q| q.id.to_string()).collect();
        assert_eq!(
            ids,
            vec!["P1", "P1.M1", "P1.M1.T1", "P1.M1.T1.S1", "P1.M1.T1.S2"]
        );
        assert_eq!(queue[0].level, ItemLevel::Phase);
        assert_eq!(queue[4].level, ItemLevel::Subtask);
    }

    #[test]
    fn test_resolve_subtask_scope_yields_one_item() {
        let backlog = linear_backlog(2);
        let queue = resolve(&backlog, &ItemId::parse("P1.M1.T1.S2").unwrap()).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].id.to_string(), "P1.M1.T1.S2");
    }

    #[test]
    fn test_resolve_unknown_scope_fails() {
        let backlog = linear_backlog(1);
        assert!(matches!(
            resolve(&backlog, &ItemId::parse("P2").unwrap()),
            Err(OrchestratorError::ScopeNotFound(_))
        ));
    }

    #[test]
    fn test_resolver_ignores_status() {
        use crate::model::ItemStatus;
        let backlog = linear_backlog(2);
        let done = backlog
            .with_status(&ItemId::parse("P1.M1.T1.S1").unwrap(), ItemStatus::Complete)
            .unwrap();
        let scope = ItemId::parse("P1").unwrap();
        assert_eq!(
            resolve(&backlog, &scope).unwrap(),
            resolve(&done, &scope).unwrap()
        );
    }

    #[test]
    fn test_default_scope_is_first_phase() {
        let backlog = linear_backlog(1);
        assert_eq!(default_scope(&backlog).unwrap().to_string(), "P1");
        assert!(default_scope(&Backlog::default()).is_err());
    }
}
