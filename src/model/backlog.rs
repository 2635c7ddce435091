//! Backlog data model: the four-level task hierarchy for one session.
//!
//! Phases own milestones, milestones own tasks, tasks own subtasks. Hierarchy
//! is forward containment only; ancestry is recovered from id prefixes. The
//! serialized form is the `tasks.json` schema: a `{"backlog": [...]}` object
//! with a `type` tag on every entity.

use serde::{Deserialize, Serialize};

use crate::errors::SessionError;
use crate::model::contract::ContractScope;
use crate::model::id::{ItemId, ItemLevel};

/// Lifecycle status of any backlog item. Closed set; unknown values are
/// rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ItemStatus {
    #[default]
    Planned,
    Researching,
    Implementing,
    Validating,
    Complete,
    Failed,
    Blocked,
}

impl ItemStatus {
    /// Terminal statuses never transition again within a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Blocked)
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }

    /// Statuses that count as "still pending" for dependency gating.
    pub fn is_pending(&self) -> bool {
        !self.is_terminal()
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Planned => "Planned",
            Self::Researching => "Researching",
            Self::Implementing => "Implementing",
            Self::Validating => "Validating",
            Self::Complete => "Complete",
            Self::Failed => "Failed",
            Self::Blocked => "Blocked",
        };
        f.write_str(s)
    }
}

/// A phase: the top level of the hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub id: ItemId,
    #[serde(rename = "type")]
    pub type_tag: String,
    pub title: String,
    pub status: ItemStatus,
    pub description: String,
    pub milestones: Vec<Milestone>,
}

/// A milestone within a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub id: ItemId,
    #[serde(rename = "type")]
    pub type_tag: String,
    pub title: String,
    pub status: ItemStatus,
    pub description: String,
    pub tasks: Vec<Task>,
}

/// A task within a milestone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: ItemId,
    #[serde(rename = "type")]
    pub type_tag: String,
    pub title: String,
    pub status: ItemStatus,
    pub description: String,
    pub subtasks: Vec<Subtask>,
}

/// A subtask: the leaf work unit, the only entity carrying dependencies and
/// story points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: ItemId,
    #[serde(rename = "type")]
    pub type_tag: String,
    pub title: String,
    pub status: ItemStatus,
    pub story_points: u8,
    #[serde(default)]
    pub dependencies: Vec<ItemId>,
    pub context_scope: String,
}

impl Phase {
    pub fn new(id: ItemId, title: &str, description: &str) -> Self {
        Self {
            id,
            type_tag: ItemLevel::Phase.type_tag().to_string(),
            title: title.to_string(),
            status: ItemStatus::Planned,
            description: description.to_string(),
            milestones: Vec::new(),
        }
    }
}

impl Milestone {
    pub fn new(id: ItemId, title: &str, description: &str) -> Self {
        Self {
            id,
            type_tag: ItemLevel::Milestone.type_tag().to_string(),
            title: title.to_string(),
            status: ItemStatus::Planned,
            description: description.to_string(),
            tasks: Vec::new(),
        }
    }
}

impl Task {
    pub fn new(id: ItemId, title: &str, description: &str) -> Self {
        Self {
            id,
            type_tag: ItemLevel::Task.type_tag().to_string(),
            title: title.to_string(),
            status: ItemStatus::Planned,
            description: description.to_string(),
            subtasks: Vec::new(),
        }
    }
}

impl Subtask {
    pub fn new(id: ItemId, title: &str, story_points: u8, context_scope: &str) -> Self {
        Self {
            id,
            type_tag: ItemLevel::Subtask.type_tag().to_string(),
            title: title.to_string(),
            status: ItemStatus::Planned,
            story_points,
            dependencies: Vec::new(),
            context_scope: context_scope.to_string(),
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<ItemId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Parse the CONTRACT DEFINITION block of this subtask.
    pub fn contract(&self) -> Result<ContractScope, crate::errors::SchemaError> {
        ContractScope::parse(&self.id.to_string(), &self.context_scope)
    }
}

/// Borrowed view over any backlog item, tagged by level.
#[derive(Debug, Clone, Copy)]
pub enum ItemRef<'a> {
    Phase(&'a Phase),
    Milestone(&'a Milestone),
    Task(&'a Task),
    Subtask(&'a Subtask),
}

impl<'a> ItemRef<'a> {
    pub fn id(&self) -> &ItemId {
        match self {
            Self::Phase(p) => &p.id,
            Self::Milestone(m) => &m.id,
            Self::Task(t) => &t.id,
            Self::Subtask(s) => &s.id,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Self::Phase(p) => &p.title,
            Self::Milestone(m) => &m.title,
            Self::Task(t) => &t.title,
            Self::Subtask(s) => &s.title,
        }
    }

    pub fn status(&self) -> ItemStatus {
        match self {
            Self::Phase(p) => p.status,
            Self::Milestone(m) => m.status,
            Self::Task(t) => t.status,
            Self::Subtask(s) => s.status,
        }
    }

    pub fn level(&self) -> ItemLevel {
        match self {
            Self::Phase(_) => ItemLevel::Phase,
            Self::Milestone(_) => ItemLevel::Milestone,
            Self::Task(_) => ItemLevel::Task,
            Self::Subtask(_) => ItemLevel::Subtask,
        }
    }

    /// Free-text description (subtasks carry their contract instead).
    pub fn description(&self) -> &str {
        match self {
            Self::Phase(p) => &p.description,
            Self::Milestone(m) => &m.description,
            Self::Task(t) => &t.description,
            Self::Subtask(s) => &s.context_scope,
        }
    }
}

/// The full backlog for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Backlog {
    pub backlog: Vec<Phase>,
}

impl Backlog {
    pub fn new(phases: Vec<Phase>) -> Self {
        Self { backlog: phases }
    }

    /// Find any item by id.
    pub fn find(&self, id: &ItemId) -> Option<ItemRef<'_>> {
        let phase = self.backlog.iter().find(|p| &p.id == id || id.is_within(&p.id))?;
        if &phase.id == id {
            return Some(ItemRef::Phase(phase));
        }
        let milestone = phase
            .milestones
            .iter()
            .find(|m| &m.id == id || id.is_within(&m.id))?;
        if &milestone.id == id {
            return Some(ItemRef::Milestone(milestone));
        }
        let task = milestone
            .tasks
            .iter()
            .find(|t| &t.id == id || id.is_within(&t.id))?;
        if &task.id == id {
            return Some(ItemRef::Task(task));
        }
        task.subtasks
            .iter()
            .find(|s| &s.id == id)
            .map(ItemRef::Subtask)
    }

    /// Find a subtask by id.
    pub fn subtask(&self, id: &ItemId) -> Option<&Subtask> {
        match self.find(id) {
            Some(ItemRef::Subtask(s)) => Some(s),
            _ => None,
        }
    }

    /// Current status of an item.
    pub fn status_of(&self, id: &ItemId) -> Option<ItemStatus> {
        self.find(id).map(|item| item.status())
    }

    /// All subtasks in declaration (DFS pre-) order.
    pub fn subtasks(&self) -> impl Iterator<Item = &Subtask> {
        self.backlog
            .iter()
            .flat_map(|p| &p.milestones)
            .flat_map(|m| &m.tasks)
            .flat_map(|t| &t.subtasks)
    }

    /// Number of items at every level.
    pub fn item_count(&self) -> usize {
        self.backlog
            .iter()
            .map(|p| {
                1 + p
                    .milestones
                    .iter()
                    .map(|m| 1 + m.tasks.iter().map(|t| 1 + t.subtasks.len()).sum::<usize>())
                    .sum::<usize>()
            })
            .sum()
    }

    /// Immutable status update: returns a new backlog with `id` set to
    /// `status`. Never touches disk.
    pub fn with_status(&self, id: &ItemId, status: ItemStatus) -> Result<Backlog, SessionError> {
        let mut next = self.clone();
        if !next.set_status(id, status) {
            return Err(SessionError::UnknownItem(id.to_string()));
        }
        Ok(next)
    }

    fn set_status(&mut self, id: &ItemId, status: ItemStatus) -> bool {
        for phase in &mut self.backlog {
            if &phase.id == id {
                phase.status = status;
                return true;
            }
            if !id.is_within(&phase.id) {
                continue;
            }
            for milestone in &mut phase.milestones {
                if &milestone.id == id {
                    milestone.status = status;
                    return true;
                }
                if !id.is_within(&milestone.id) {
                    continue;
                }
                for task in &mut milestone.tasks {
                    if &task.id == id {
                        task.status = status;
                        return true;
                    }
                    if !id.is_within(&task.id) {
                        continue;
                    }
                    for subtask in &mut task.subtasks {
                        if &subtask.id == id {
                            subtask.status = status;
                            return true;
                        }
                    }
                }
            }
        }
        false
    }

    /// Derive parent statuses from children, bottom-up. All children
    /// `Complete` promotes the parent; any child `Failed`/`Blocked` with no
    /// child still pending demotes it to `Failed`. Parents with pending
    /// children keep their scheduler-assigned status.
    pub fn derive_parent_statuses(&mut self) {
        for phase in &mut self.backlog {
            for milestone in &mut phase.milestones {
                for task in &mut milestone.tasks {
                    if let Some(status) = derived(task.subtasks.iter().map(|s| s.status)) {
                        task.status = status;
                    }
                }
                if let Some(status) = derived(milestone.tasks.iter().map(|t| t.status)) {
                    milestone.status = status;
                }
            }
            if let Some(status) = derived(phase.milestones.iter().map(|m| m.status)) {
                phase.status = status;
            }
        }
    }
}

fn derived(children: impl Iterator<Item = ItemStatus>) -> Option<ItemStatus> {
    let mut saw_any = false;
    let mut all_complete = true;
    let mut any_failed = false;
    let mut any_pending = false;
    for status in children {
        saw_any = true;
        all_complete &= status.is_complete();
        any_failed |= matches!(status, ItemStatus::Failed | ItemStatus::Blocked);
        any_pending |= status.is_pending();
    }
    if !saw_any {
        return None;
    }
    if all_complete {
        Some(ItemStatus::Complete)
    } else if any_failed && !any_pending {
        Some(ItemStatus::Failed)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::linear_backlog;

    #[test]
    fn test_find_at_every_level() {
        let backlog = linear_backlog(2);
        for (raw, expected) in [
            ("P1", ItemLevel::Phase),
            ("P1.M1", ItemLevel::Milestone),
            ("P1.M1.T1", ItemLevel::Task),
            ("P1.M1.T1.S2", ItemLevel::Subtask),
        ] {
            let id = ItemId::parse(raw).unwrap();
            let item = backlog.find(&id).expect(raw);
            assert_eq!(item.level(), expected);
            assert_eq!(item.id(), &id);
        }
        assert!(backlog.find(&ItemId::parse("P2").unwrap()).is_none());
        assert!(backlog.find(&ItemId::parse("P1.M1.T1.S3").unwrap()).is_none());
    }

    #[test]
    fn test_with_status_is_immutable() {
        let backlog = linear_backlog(1);
        let id = ItemId::parse("P1.M1.T1.S1").unwrap();
        let updated = backlog.with_status(&id, ItemStatus::Complete).unwrap();
        assert_eq!(backlog.status_of(&id), Some(ItemStatus::Planned));
        assert_eq!(updated.status_of(&id), Some(ItemStatus::Complete));
    }

    #[test]
    fn test_with_status_unknown_id() {
        let backlog = linear_backlog(1);
        let missing = ItemId::parse("P1.M1.T1.S9").unwrap();
        assert!(matches!(
            backlog.with_status(&missing, ItemStatus::Complete),
            Err(SessionError::UnknownItem(_))
        ));
    }

    #[test]
    fn test_status_serialization_spellings() {
        let json = serde_json::to_string(&ItemStatus::Researching).unwrap();
        assert_eq!(json, "\"Researching\"");
        assert!(serde_json::from_str::<ItemStatus>("\"researching\"").is_err());
        assert!(serde_json::from_str::<ItemStatus>("\"Done\"").is_err());
    }

    #[test]
    fn test_derive_parent_statuses_complete() {
        let mut backlog = linear_backlog(2);
        let s1 = ItemId::parse("P1.M1.T1.S1").unwrap();
        let s2 = ItemId::parse("P1.M1.T1.S2").unwrap();
        backlog = backlog.with_status(&s1, ItemStatus::Complete).unwrap();
        backlog = backlog.with_status(&s2, ItemStatus::Complete).unwrap();
        backlog.derive_parent_statuses();
        assert_eq!(
            backlog.status_of(&ItemId::parse("P1.M1.T1").unwrap()),
            Some(ItemStatus::Complete)
        );
        assert_eq!(
            backlog.status_of(&ItemId::parse("P1").unwrap()),
            Some(ItemStatus::Complete)
        );
    }

    #[test]
    fn test_derive_parent_statuses_failed() {
        let mut backlog = linear_backlog(2);
        let s1 = ItemId::parse("P1.M1.T1.S1").unwrap();
        let s2 = ItemId::parse("P1.M1.T1.S2").unwrap();
        backlog = backlog.with_status(&s1, ItemStatus::Complete).unwrap();
        backlog = backlog.with_status(&s2, ItemStatus::Failed).unwrap();
        backlog.derive_parent_statuses();
        assert_eq!(
            backlog.status_of(&ItemId::parse("P1.M1.T1").unwrap()),
            Some(ItemStatus::Failed)
        );
    }

    #[test]
    fn test_derive_parent_statuses_keeps_pending_parents() {
        let mut backlog = linear_backlog(2);
        let s1 = ItemId::parse("P1.M1.T1.S1").unwrap();
        backlog = backlog.with_status(&s1, ItemStatus::Failed).unwrap();
        backlog.derive_parent_statuses();
        // S2 is still Planned, so the task keeps its scheduler status.
        assert_eq!(
            backlog.status_of(&ItemId::parse("P1.M1.T1").unwrap()),
            Some(ItemStatus::Planned)
        );
    }

    #[test]
    fn test_subtask_iteration_order() {
        let backlog = linear_backlog(3);
        let ids: Vec<String> = backlog.subtasks().map(|s| s.id.to_string()).collect();
        assert_eq!(ids, vec!["P1.M1.T1.S1", "P1.M1.T1.S2", "P1.M1.T1.S3"]);
    }

    #[test]
    fn test_item_count() {
        assert_eq!(linear_backlog(3).item_count(), 6);
    }
}
