//! Backlog schema validation.
//!
//! Enforced on every load and before every serialization, so `tasks.json` on
//! disk always parses back under the schema. Checks, in order:
//! - type tags agree with the containment level
//! - id prefixes agree with the declared parent
//! - no duplicate ids
//! - title length 1..=200
//! - story points 1..=21
//! - CONTRACT DEFINITION blocks parse
//! - every dependency resolves to a subtask in the same backlog, no self-edge
//! - the dependency graph is a DAG (Kahn's algorithm)

use std::collections::{HashMap, HashSet};

use crate::errors::SchemaError;
use crate::model::backlog::Backlog;
use crate::model::contract::ContractScope;
use crate::model::id::{ItemId, ItemLevel};

pub fn validate_backlog(backlog: &Backlog) -> Result<(), SchemaError> {
    let mut seen: HashSet<String> = HashSet::new();

    for phase in &backlog.backlog {
        check_header(
            &phase.id,
            ItemLevel::Phase,
            &phase.type_tag,
            &phase.title,
            None,
            &mut seen,
        )?;
        for milestone in &phase.milestones {
            check_header(
                &milestone.id,
                ItemLevel::Milestone,
                &milestone.type_tag,
                &milestone.title,
                Some(&phase.id),
                &mut seen,
            )?;
            for task in &milestone.tasks {
                check_header(
                    &task.id,
                    ItemLevel::Task,
                    &task.type_tag,
                    &task.title,
                    Some(&milestone.id),
                    &mut seen,
                )?;
                for subtask in &task.subtasks {
                    check_header(
                        &subtask.id,
                        ItemLevel::Subtask,
                        &subtask.type_tag,
                        &subtask.title,
                        Some(&task.id),
                        &mut seen,
                    )?;
                    if !(1..=21).contains(&subtask.story_points) {
                        return Err(SchemaError::StoryPointsRange {
                            id: subtask.id.to_string(),
                            points: subtask.story_points as u64,
                        });
                    }
                    ContractScope::parse(&subtask.id.to_string(), &subtask.context_scope)?;
                }
            }
        }
    }

    validate_dependencies(backlog)?;
    validate_acyclic(backlog)
}

fn check_header(
    id: &ItemId,
    level: ItemLevel,
    type_tag: &str,
    title: &str,
    parent: Option<&ItemId>,
    seen: &mut HashSet<String>,
) -> Result<(), SchemaError> {
    if id.level() != level || type_tag != level.type_tag() {
        return Err(SchemaError::InvalidId {
            id: id.to_string(),
            reason: format!("expected a {} here, found type tag '{}'", level.type_tag(), type_tag),
        });
    }
    if let Some(parent) = parent
        && id.parent().as_ref() != Some(parent)
    {
        return Err(SchemaError::ParentMismatch {
            id: id.to_string(),
            parent: parent.to_string(),
        });
    }
    if !seen.insert(id.to_string()) {
        return Err(SchemaError::DuplicateId(id.to_string()));
    }
    let len = title.chars().count();
    if len == 0 || len > 200 {
        return Err(SchemaError::TitleLength {
            id: id.to_string(),
            len,
        });
    }
    Ok(())
}

fn validate_dependencies(backlog: &Backlog) -> Result<(), SchemaError> {
    let subtask_ids: HashSet<&ItemId> = backlog.subtasks().map(|s| &s.id).collect();
    for subtask in backlog.subtasks() {
        for dep in &subtask.dependencies {
            if dep == &subtask.id {
                return Err(SchemaError::SelfDependency {
                    id: subtask.id.to_string(),
                });
            }
            if !dep.is_subtask() || !subtask_ids.contains(dep) {
                return Err(SchemaError::UnknownDependency {
                    id: subtask.id.to_string(),
                    dependency: dep.to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Kahn's algorithm over the subtask dependency graph.
fn validate_acyclic(backlog: &Backlog) -> Result<(), SchemaError> {
    let subtasks: Vec<&ItemId> = backlog.subtasks().map(|s| &s.id).collect();
    let index: HashMap<&ItemId, usize> = subtasks.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); subtasks.len()];
    let mut in_degree: Vec<usize> = vec![0; subtasks.len()];
    for (i, subtask) in backlog.subtasks().enumerate() {
        for dep in &subtask.dependencies {
            let from = index[dep];
            dependents[from].push(i);
            in_degree[i] += 1;
        }
    }

    let mut queue: Vec<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, deg)| *deg == 0)
        .map(|(i, _)| i)
        .collect();
    let mut processed = 0;

    while let Some(node) = queue.pop() {
        processed += 1;
        for &dependent in &dependents[node] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                queue.push(dependent);
            }
        }
    }

    if processed != subtasks.len() {
        let cycle: Vec<String> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg > 0)
            .map(|(i, _)| subtasks[i].to_string())
            .collect();
        return Err(SchemaError::DependencyCycle(cycle));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{chained_backlog, contract_block, linear_backlog};
    use crate::model::{ItemId, Subtask};

    #[test]
    fn test_valid_backlog_passes() {
        validate_backlog(&linear_backlog(3)).unwrap();
        validate_backlog(&chained_backlog(3)).unwrap();
    }

    #[test]
    fn test_empty_backlog_passes() {
        validate_backlog(&Backlog::default()).unwrap();
    }

    #[test]
    fn test_story_points_bounds() {
        for (points, ok) in [(0u8, false), (1, true), (21, true), (22, false)] {
            let mut backlog = linear_backlog(1);
            backlog.backlog[0].milestones[0].tasks[0].subtasks[0].story_points = points;
            assert_eq!(validate_backlog(&backlog).is_ok(), ok, "points={points}");
        }
    }

    #[test]
    fn test_decimal_story_points_rejected_at_parse() {
        let mut json = serde_json::to_value(&linear_backlog(1)).unwrap();
        json["backlog"][0]["milestones"][0]["tasks"][0]["subtasks"][0]["story_points"] =
            serde_json::json!(0.5);
        assert!(serde_json::from_value::<Backlog>(json).is_err());
    }

    #[test]
    fn test_title_length_bounds() {
        let mut backlog = linear_backlog(1);
        backlog.backlog[0].title = String::new();
        assert!(matches!(
            validate_backlog(&backlog),
            Err(SchemaError::TitleLength { .. })
        ));

        let mut backlog = linear_backlog(1);
        backlog.backlog[0].title = "x".repeat(201);
        assert!(validate_backlog(&backlog).is_err());

        let mut backlog = linear_backlog(1);
        backlog.backlog[0].title = "x".repeat(200);
        assert!(validate_backlog(&backlog).is_ok());
    }

    #[test]
    fn test_wrong_type_tag() {
        let mut backlog = linear_backlog(1);
        backlog.backlog[0].type_tag = "phase".to_string();
        assert!(validate_backlog(&backlog).is_err());
    }

    #[test]
    fn test_parent_prefix_mismatch() {
        let mut backlog = linear_backlog(1);
        backlog.backlog[0].milestones[0].id = ItemId::parse("P2.M1").unwrap();
        assert!(matches!(
            validate_backlog(&backlog),
            Err(SchemaError::ParentMismatch { .. })
        ));
    }

    #[test]
    fn test_duplicate_id() {
        let mut backlog = linear_backlog(2);
        let first = backlog.backlog[0].milestones[0].tasks[0].subtasks[0].id.clone();
        backlog.backlog[0].milestones[0].tasks[0].subtasks[1].id = first;
        assert!(matches!(
            validate_backlog(&backlog),
            Err(SchemaError::DuplicateId(_) | SchemaError::ParentMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_dependency() {
        let mut backlog = linear_backlog(1);
        backlog.backlog[0].milestones[0].tasks[0].subtasks[0].dependencies =
            vec![ItemId::parse("P9.M9.T9.S9").unwrap()];
        assert!(matches!(
            validate_backlog(&backlog),
            Err(SchemaError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_non_subtask_dependency() {
        let mut backlog = linear_backlog(1);
        backlog.backlog[0].milestones[0].tasks[0].subtasks[0].dependencies =
            vec![ItemId::parse("P1").unwrap()];
        assert!(matches!(
            validate_backlog(&backlog),
            Err(SchemaError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_self_dependency() {
        let mut backlog = linear_backlog(1);
        let own = backlog.backlog[0].milestones[0].tasks[0].subtasks[0].id.clone();
        backlog.backlog[0].milestones[0].tasks[0].subtasks[0].dependencies = vec![own];
        assert!(matches!(
            validate_backlog(&backlog),
            Err(SchemaError::SelfDependency { .. })
        ));
    }

    #[test]
    fn test_cycle_detection() {
        let mut backlog = linear_backlog(3);
        let task = &mut backlog.backlog[0].milestones[0].tasks[0];
        let (s1, s2, s3) = (
            task.subtasks[0].id.clone(),
            task.subtasks[1].id.clone(),
            task.subtasks[2].id.clone(),
        );
        task.subtasks[0].dependencies = vec![s3];
        task.subtasks[1].dependencies = vec![s1];
        task.subtasks[2].dependencies = vec![s2];
        assert!(matches!(
            validate_backlog(&backlog),
            Err(SchemaError::DependencyCycle(_))
        ));
    }

    #[test]
    fn test_malformed_contract() {
        let mut backlog = linear_backlog(1);
        backlog.backlog[0].milestones[0].tasks[0].subtasks[0].context_scope =
            "not a contract".to_string();
        assert!(matches!(
            validate_backlog(&backlog),
            Err(SchemaError::MalformedContract { .. })
        ));
    }

    #[test]
    fn test_cross_task_dependency_is_valid() {
        let mut backlog = linear_backlog(1);
        let mut second = crate::model::Task::new(
            ItemId::parse("P1.M1.T2").unwrap(),
            "Task two",
            "second task",
        );
        second.subtasks.push(
            Subtask::new(
                ItemId::parse("P1.M1.T2.S1").unwrap(),
                "Cross-task dependent",
                2,
                &contract_block(),
            )
            .with_dependencies(vec![ItemId::parse("P1.M1.T1.S1").unwrap()]),
        );
        backlog.backlog[0].milestones[0].tasks.push(second);
        validate_backlog(&backlog).unwrap();
    }
}
