//! PRD delta analysis and delta-session creation.
//!
//! When a PRD presents whose hash differs from the active session's, a child
//! session is derived instead of starting over: completed subtasks that
//! survive in the new decomposition carry their status forward, while added
//! and modified items start over as `Planned` and removed items are dropped.
//!
//! The diff is deterministic: item ids present in both decompositions are
//! compared on their defining content, and a line-oriented diff over the
//! PRD's `## ` section headings recovers items whose requirement text changed
//! even when the decomposition kept them intact.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::info;

use crate::errors::SessionError;
use crate::model::{Backlog, ItemId, ItemStatus, Subtask};
use crate::session::{self, SessionManager};

/// Descriptor of the differences between two PRD decompositions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeltaSpec {
    pub added: Vec<ItemId>,
    pub modified: Vec<ItemId>,
    pub removed: Vec<ItemId>,
    /// Free-text patch instruction assembled from the heading-level PRD diff.
    pub patch_instructions: String,
}

impl DeltaSpec {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

/// Compute the delta between a parent decomposition and the decomposition of
/// a changed PRD.
pub fn compute_delta(
    old_prd: &str,
    new_prd: &str,
    old_backlog: &Backlog,
    new_backlog: &Backlog,
) -> DeltaSpec {
    let old_subtasks: HashMap<&ItemId, &Subtask> =
        old_backlog.subtasks().map(|s| (&s.id, s)).collect();
    let new_subtasks: HashMap<&ItemId, &Subtask> =
        new_backlog.subtasks().map(|s| (&s.id, s)).collect();

    let mut added: Vec<ItemId> = new_subtasks
        .keys()
        .filter(|id| !old_subtasks.contains_key(*id))
        .map(|id| (*id).clone())
        .collect();
    let mut removed: Vec<ItemId> = old_subtasks
        .keys()
        .filter(|id| !new_subtasks.contains_key(*id))
        .map(|id| (*id).clone())
        .collect();

    // Sections whose body text changed, keyed by normalized heading.
    let changed_headings = changed_sections(old_prd, new_prd);

    let mut modified: Vec<ItemId> = Vec::new();
    for (id, new_subtask) in &new_subtasks {
        let Some(old_subtask) = old_subtasks.get(*id) else {
            continue;
        };
        if subtask_definition_changed(old_subtask, new_subtask)
            || heading_matches_title(&changed_headings, &new_subtask.title)
        {
            modified.push((*id).clone());
        }
    }

    added.sort();
    modified.sort();
    removed.sort();

    let patch_instructions = render_patch_instructions(old_prd, new_prd, &changed_headings);
    DeltaSpec {
        added,
        modified,
        removed,
        patch_instructions,
    }
}

/// Identity fields of a subtask that force regeneration when they change.
fn subtask_definition_changed(old: &Subtask, new: &Subtask) -> bool {
    old.title != new.title
        || old.story_points != new.story_points
        || old.context_scope != new.context_scope
        || old.dependencies != new.dependencies
}

/// Split a PRD into `(normalized heading, body)` pairs over `## ` lines.
fn sections(prd: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let mut heading: Option<String> = None;
    let mut body = String::new();
    for line in prd.lines() {
        if let Some(title) = line.strip_prefix("## ") {
            if let Some(prev) = heading.take() {
                map.insert(prev, std::mem::take(&mut body));
            }
            heading = Some(normalize(title));
        } else if heading.is_some() {
            body.push_str(line.trim_end());
            body.push('\n');
        }
    }
    if let Some(prev) = heading {
        map.insert(prev, body);
    }
    map
}

/// Normalized headings of sections present in both PRDs whose body changed,
/// plus headings only present in one of them.
fn changed_sections(old_prd: &str, new_prd: &str) -> HashSet<String> {
    let old = sections(old_prd);
    let new = sections(new_prd);
    let mut changed = HashSet::new();
    for (heading, body) in &new {
        match old.get(heading) {
            Some(old_body) if old_body == body => {}
            _ => {
                changed.insert(heading.clone());
            }
        }
    }
    for heading in old.keys() {
        if !new.contains_key(heading) {
            changed.insert(heading.clone());
        }
    }
    changed
}

fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Fuzzy id recovery: a changed heading matches an item title when either
/// normalized form contains the other.
fn heading_matches_title(changed: &HashSet<String>, title: &str) -> bool {
    let title = normalize(title);
    if title.is_empty() {
        return false;
    }
    changed
        .iter()
        .any(|h| !h.is_empty() && (h.contains(&title) || title.contains(h)))
}

fn render_patch_instructions(
    old_prd: &str,
    new_prd: &str,
    changed: &HashSet<String>,
) -> String {
    let old = sections(old_prd);
    let new = sections(new_prd);
    let mut lines: Vec<String> = Vec::new();
    let mut sorted: Vec<&String> = changed.iter().collect();
    sorted.sort();
    for heading in sorted {
        let line = match (old.contains_key(heading), new.contains_key(heading)) {
            (false, true) => format!("Section '{heading}' was added."),
            (true, false) => format!("Section '{heading}' was removed."),
            _ => format!("Section '{heading}' changed; re-plan the affected subtasks."),
        };
        lines.push(line);
    }
    if lines.is_empty() {
        "No PRD section changes detected.".to_string()
    } else {
        lines.join("\n")
    }
}

/// Seed a child backlog from the new decomposition, carrying forward every
/// completed subtask from the parent that survives unmodified.
pub fn apply_delta(parent: &Backlog, new_backlog: &Backlog, delta: &DeltaSpec) -> Backlog {
    let touched: HashSet<&ItemId> = delta.added.iter().chain(delta.modified.iter()).collect();
    let completed: HashSet<ItemId> = parent
        .subtasks()
        .filter(|s| s.status == ItemStatus::Complete)
        .map(|s| s.id.clone())
        .collect();

    let mut seeded = new_backlog.clone();
    for phase in &mut seeded.backlog {
        for milestone in &mut phase.milestones {
            for task in &mut milestone.tasks {
                for subtask in &mut task.subtasks {
                    subtask.status = if completed.contains(&subtask.id)
                        && !touched.contains(&subtask.id)
                    {
                        ItemStatus::Complete
                    } else {
                        ItemStatus::Planned
                    };
                }
            }
        }
    }
    seeded.derive_parent_statuses();
    seeded
}

/// Create a child session for a changed PRD.
///
/// Allocates the next sequence with the new PRD's hash, records the parent
/// link, and seeds `tasks.json` by applying the delta. The parent session
/// must exist under the plan root.
pub fn create_delta_session(
    plan_root: &Path,
    parent_session_id: &str,
    parent_backlog: &Backlog,
    new_prd_bytes: &[u8],
    new_backlog: &Backlog,
    delta: &DeltaSpec,
) -> Result<SessionManager, SessionError> {
    let parent_exists = session::list_sessions(plan_root)?
        .iter()
        .any(|s| s.id == parent_session_id);
    if !parent_exists {
        return Err(SessionError::MissingParent(parent_session_id.to_string()));
    }

    let created = session::create_session_dir(plan_root, new_prd_bytes, Some(parent_session_id))?;
    info!(
        session = %created.id,
        parent = parent_session_id,
        added = delta.added.len(),
        modified = delta.modified.len(),
        removed = delta.removed.len(),
        "created delta session"
    );

    let manager = SessionManager::from_session(created);
    let seeded = apply_delta(parent_backlog, new_backlog, delta);
    manager.set_backlog(seeded)?;
    Ok(manager)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{contract_block, linear_backlog};
    use tempfile::tempdir;

    fn backlog_with_extra_subtask() -> Backlog {
        let mut backlog = linear_backlog(2);
        let task = &mut backlog.backlog[0].milestones[0].tasks[0];
        task.subtasks.push(
            Subtask::new(
                ItemId::parse("P1.M1.T1.S3").unwrap(),
                "Subtask 3",
                5,
                &contract_block(),
            )
            .with_dependencies(vec![ItemId::parse("P1.M1.T1.S1").unwrap()]),
        );
        backlog
    }

    #[test]
    fn test_compute_delta_added_and_removed() {
        let old = linear_backlog(2);
        let new = backlog_with_extra_subtask();
        let delta = compute_delta("# PRD", "# PRD", &old, &new);
        assert_eq!(delta.added.len(), 1);
        assert_eq!(delta.added[0].to_string(), "P1.M1.T1.S3");
        assert!(delta.removed.is_empty());

        let reverse = compute_delta("# PRD", "# PRD", &new, &old);
        assert_eq!(reverse.removed.len(), 1);
        assert!(reverse.added.is_empty());
    }

    #[test]
    fn test_compute_delta_modified_by_definition() {
        let old = linear_backlog(2);
        let mut new = linear_backlog(2);
        new.backlog[0].milestones[0].tasks[0].subtasks[0].title = "Renamed subtask".to_string();
        let delta = compute_delta("", "", &old, &new);
        assert_eq!(delta.modified.len(), 1);
        assert_eq!(delta.modified[0].to_string(), "P1.M1.T1.S1");
    }

    #[test]
    fn test_compute_delta_modified_by_section_change() {
        let old_prd = "# PRD\n\n## Subtask 1\noriginal requirement\n\n## Subtask 2\nstable\n";
        let new_prd = "# PRD\n\n## Subtask 1\nchanged requirement\n\n## Subtask 2\nstable\n";
        let backlog = linear_backlog(2);
        let delta = compute_delta(old_prd, new_prd, &backlog, &backlog);
        assert_eq!(delta.modified.len(), 1);
        assert_eq!(delta.modified[0].to_string(), "P1.M1.T1.S1");
        assert!(delta.patch_instructions.contains("subtask 1"));
    }

    #[test]
    fn test_compute_delta_unchanged_is_empty() {
        let backlog = linear_backlog(2);
        let prd = "# PRD\n\n## Subtask 1\nsame\n";
        let delta = compute_delta(prd, prd, &backlog, &backlog);
        assert!(delta.is_empty(), "{delta:?}");
    }

    #[test]
    fn test_apply_delta_carries_forward_completed() {
        let mut parent = linear_backlog(2);
        let s1 = ItemId::parse("P1.M1.T1.S1").unwrap();
        let s2 = ItemId::parse("P1.M1.T1.S2").unwrap();
        parent = parent.with_status(&s1, ItemStatus::Complete).unwrap();
        parent = parent.with_status(&s2, ItemStatus::Complete).unwrap();

        let new = backlog_with_extra_subtask();
        let delta = compute_delta("", "", &parent, &new);
        let seeded = apply_delta(&parent, &new, &delta);

        assert_eq!(seeded.status_of(&s1), Some(ItemStatus::Complete));
        assert_eq!(seeded.status_of(&s2), Some(ItemStatus::Complete));
        assert_eq!(
            seeded.status_of(&ItemId::parse("P1.M1.T1.S3").unwrap()),
            Some(ItemStatus::Planned)
        );
    }

    #[test]
    fn test_apply_delta_resets_modified() {
        let mut parent = linear_backlog(2);
        let s1 = ItemId::parse("P1.M1.T1.S1").unwrap();
        parent = parent.with_status(&s1, ItemStatus::Complete).unwrap();

        let mut new = linear_backlog(2);
        new.backlog[0].milestones[0].tasks[0].subtasks[0].title = "Reworked".to_string();
        let delta = compute_delta("", "", &parent, &new);
        let seeded = apply_delta(&parent, &new, &delta);
        assert_eq!(seeded.status_of(&s1), Some(ItemStatus::Planned));
    }

    #[test]
    fn test_create_delta_session_links_parent() {
        let dir = tempdir().unwrap();
        let plan_root = dir.path().join("plans");
        std::fs::create_dir_all(&plan_root).unwrap();

        let parent_manager = {
            let prd = dir.path().join("PRD.md");
            std::fs::write(&prd, "# v1").unwrap();
            SessionManager::initialize(&prd, &plan_root).unwrap()
        };
        let mut parent_backlog = linear_backlog(2);
        for i in 1..=2 {
            let id = ItemId::parse(&format!("P1.M1.T1.S{i}")).unwrap();
            parent_backlog = parent_backlog.with_status(&id, ItemStatus::Complete).unwrap();
        }
        parent_manager.set_backlog(parent_backlog.clone()).unwrap();

        let new_backlog = backlog_with_extra_subtask();
        let delta = compute_delta("# v1", "# v2", &parent_backlog, &new_backlog);
        let child = create_delta_session(
            &plan_root,
            &parent_manager.session().id,
            &parent_backlog,
            b"# v2",
            &new_backlog,
            &delta,
        )
        .unwrap();

        assert!(child.session().id.starts_with("002_"));
        let link = std::fs::read_to_string(child.session().parent_link_path()).unwrap();
        assert_eq!(link.trim(), parent_manager.session().id);

        let seeded = child.load_backlog().unwrap();
        assert_eq!(
            seeded.status_of(&ItemId::parse("P1.M1.T1.S1").unwrap()),
            Some(ItemStatus::Complete)
        );
        assert_eq!(
            seeded.status_of(&ItemId::parse("P1.M1.T1.S3").unwrap()),
            Some(ItemStatus::Planned)
        );
    }

    #[test]
    fn test_create_delta_session_requires_parent() {
        let dir = tempdir().unwrap();
        let plan_root = dir.path().join("plans");
        std::fs::create_dir_all(&plan_root).unwrap();
        let backlog = linear_backlog(1);
        let err = create_delta_session(
            &plan_root,
            "001_missing00000",
            &backlog,
            b"# v2",
            &backlog,
            &DeltaSpec::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::MissingParent(_)));
    }
}
