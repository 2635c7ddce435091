//! Strict parser for a subtask's CONTRACT DEFINITION block.
//!
//! The `context_scope` field of every subtask carries exactly this shape:
//!
//! ```text
//! CONTRACT DEFINITION:
//! 1. RESEARCH NOTE: <text>
//! 2. INPUT: <text>
//! 3. LOGIC: <text>
//! 4. OUTPUT: <text>
//! ```
//!
//! Section names are case-sensitive; numbering and order are strict. Section
//! text may continue over following lines up to the next numbered header.

use serde::{Deserialize, Serialize};

use crate::errors::SchemaError;

const HEADER: &str = "CONTRACT DEFINITION:";
const SECTIONS: [&str; 4] = ["RESEARCH NOTE", "INPUT", "LOGIC", "OUTPUT"];

/// Parsed contract sections of a subtask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractScope {
    pub research_note: String,
    pub input: String,
    pub logic: String,
    pub output: String,
}

impl ContractScope {
    /// Parse the raw `context_scope` text of subtask `id`.
    pub fn parse(id: &str, raw: &str) -> Result<Self, SchemaError> {
        let malformed = |reason: &str| SchemaError::MalformedContract {
            id: id.to_string(),
            reason: reason.to_string(),
        };

        let mut lines = raw.lines();
        let first = lines
            .by_ref()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| malformed("empty contract"))?;
        if first.trim_end() != HEADER {
            return Err(malformed(&format!("first line must be '{HEADER}'")));
        }

        let mut sections: Vec<String> = Vec::with_capacity(4);
        let mut current: Option<String> = None;

        for line in lines {
            let trimmed = line.trim_start();
            let next_index = sections.len() + usize::from(current.is_some());
            if next_index < SECTIONS.len() {
                let expected_prefix = format!("{}. {}:", next_index + 1, SECTIONS[next_index]);
                if let Some(rest) = trimmed.strip_prefix(&expected_prefix) {
                    if let Some(done) = current.take() {
                        sections.push(done);
                    }
                    current = Some(rest.trim().to_string());
                    continue;
                }
            }
            // A numbered header out of order or with a wrong name is a hard error.
            if looks_like_section_header(trimmed) {
                return Err(malformed(&format!(
                    "unexpected section header '{}'",
                    trimmed.trim_end()
                )));
            }
            match current.as_mut() {
                Some(text) => {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(line.trim_end());
                }
                None if trimmed.is_empty() => {}
                None => return Err(malformed("text before section 1")),
            }
        }
        if let Some(done) = current.take() {
            sections.push(done);
        }

        if sections.len() != 4 {
            return Err(malformed(&format!(
                "expected 4 sections, found {}",
                sections.len()
            )));
        }

        let mut iter = sections.into_iter();
        Ok(Self {
            research_note: iter.next().unwrap(),
            input: iter.next().unwrap(),
            logic: iter.next().unwrap(),
            output: iter.next().unwrap(),
        })
    }

    /// Render back into the canonical block form.
    pub fn render(&self) -> String {
        format!(
            "{HEADER}\n1. {}: {}\n2. {}: {}\n3. {}: {}\n4. {}: {}",
            SECTIONS[0],
            self.research_note,
            SECTIONS[1],
            self.input,
            SECTIONS[2],
            self.logic,
            SECTIONS[3],
            self.output
        )
    }
}

/// Heuristic for `N. NAME:` lines used to reject out-of-order sections.
fn looks_like_section_header(line: &str) -> bool {
    let Some((num, rest)) = line.split_once(". ") else {
        return false;
    };
    num.len() == 1
        && num.bytes().all(|b| b.is_ascii_digit())
        && SECTIONS.iter().any(|s| rest.starts_with(&format!("{s}:")))
}
