//! Backlog data model, identifier grammar, contract parsing, and schema
//! validation.

pub mod backlog;
pub mod contract;
pub mod id;
pub mod validate;

pub use backlog::{Backlog, ItemRef, ItemStatus, Milestone, Phase, Subtask, Task};
pub use contract::ContractScope;
pub use id::{ItemId, ItemLevel};
pub use validate::validate_backlog;
