//! Hierarchical item identifiers.
//!
//! Identifier grammar: `P<n>`, `P<n>.M<n>`, `P<n>.M<n>.T<n>`,
//! `P<n>.M<n>.T<n>.S<n>` where `<n>` is a positive decimal without leading
//! zeros. Lowercase letters, alternative separators, and extra levels are
//! invalid. Hierarchy is encoded in the id itself: ancestors are prefix
//! truncations, so no back-pointers are stored in the backlog tree.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::SchemaError;

/// The four levels of the backlog hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ItemLevel {
    Phase,
    Milestone,
    Task,
    Subtask,
}

impl ItemLevel {
    /// Level prefix letter used in identifiers.
    pub fn letter(&self) -> char {
        match self {
            Self::Phase => 'P',
            Self::Milestone => 'M',
            Self::Task => 'T',
            Self::Subtask => 'S',
        }
    }

    /// Type tag as serialized in `tasks.json`.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Self::Phase => "Phase",
            Self::Milestone => "Milestone",
            Self::Task => "Task",
            Self::Subtask => "Subtask",
        }
    }

    fn from_depth(depth: usize) -> Option<Self> {
        match depth {
            1 => Some(Self::Phase),
            2 => Some(Self::Milestone),
            3 => Some(Self::Task),
            4 => Some(Self::Subtask),
            _ => None,
        }
    }
}

/// A parsed, validated item identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId {
    segments: Vec<u32>,
}

const LEVEL_LETTERS: [char; 4] = ['P', 'M', 'T', 'S'];

impl ItemId {
    /// Parse a dotted identifier, enforcing the full grammar.
    pub fn parse(s: &str) -> Result<Self, SchemaError> {
        let invalid = |reason: &str| SchemaError::InvalidId {
            id: s.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = s.split('.').collect();
        if parts.is_empty() || parts.len() > 4 {
            return Err(invalid("expected 1 to 4 dot-separated segments"));
        }

        let mut segments = Vec::with_capacity(parts.len());
        for (depth, part) in parts.iter().enumerate() {
            let mut chars = part.chars();
            let letter = chars
                .next()
                .ok_or_else(|| invalid("empty segment"))?;
            if letter != LEVEL_LETTERS[depth] {
                return Err(invalid(&format!(
                    "segment {} must start with '{}'",
                    depth + 1,
                    LEVEL_LETTERS[depth]
                )));
            }
            let digits: &str = &part[1..];
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid("segment number must be decimal digits"));
            }
            if digits.starts_with('0') {
                return Err(invalid("segment number must be positive without leading zeros"));
            }
            let n: u32 = digits
                .parse()
                .map_err(|_| invalid("segment number out of range"))?;
            segments.push(n);
        }

        Ok(Self { segments })
    }

    /// Construct a subtask id from its four components.
    pub fn subtask(phase: u32, milestone: u32, task: u32, subtask: u32) -> Self {
        Self {
            segments: vec![phase, milestone, task, subtask],
        }
    }

    /// Construct a phase id.
    pub fn phase(phase: u32) -> Self {
        Self {
            segments: vec![phase],
        }
    }

    /// The hierarchy level this id names.
    pub fn level(&self) -> ItemLevel {
        ItemLevel::from_depth(self.segments.len()).expect("segments length is validated at parse")
    }

    pub fn is_subtask(&self) -> bool {
        self.level() == ItemLevel::Subtask
    }

    /// Parent id, if any (prefix truncation by one segment).
    pub fn parent(&self) -> Option<ItemId> {
        if self.segments.len() <= 1 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// All ancestors, outermost first (phase, then milestone, ...).
    pub fn ancestors(&self) -> Vec<ItemId> {
        (1..self.segments.len())
            .map(|len| Self {
                segments: self.segments[..len].to_vec(),
            })
            .collect()
    }

    /// Whether `self` is `other` or lies underneath it in the hierarchy.
    pub fn is_within(&self, other: &ItemId) -> bool {
        self.segments.len() >= other.segments.len()
            && self.segments[..other.segments.len()] == other.segments[..]
    }

    /// Numeric segment at a depth (0 = phase).
    pub fn segment(&self, depth: usize) -> Option<u32> {
        self.segments.get(depth).copied()
    }

    /// Extend this id by one child segment at the next level down.
    pub fn child(&self, n: u32) -> Option<ItemId> {
        if self.segments.len() >= 4 {
            return None;
        }
        let mut segments = self.segments.clone();
        segments.push(n);
        Some(Self { segments })
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (depth, n) in self.segments.iter().enumerate() {
            if depth > 0 {
                f.write_str(".")?;
            }
            write!(f, "{}{}", LEVEL_LETTERS[depth], n)?;
        }
        Ok(())
    }
}

impl FromStr for ItemId {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ItemId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ItemId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
