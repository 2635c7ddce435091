//! Git commit step for completed subtasks.

use anyhow::{Context, Result};
use git2::{IndexAddOption, Repository, Signature};
use std::path::Path;

pub struct GitCommitter {
    repo: Repository,
}

impl GitCommitter {
    pub fn new(project_dir: &Path) -> Result<Self> {
        let repo = Repository::discover(project_dir).context("Failed to open git repository")?;
        Ok(Self { repo })
    }

    /// Stage everything and commit with a message referencing the subtask.
    /// Returns the new commit id, or `None` when the working tree matched
    /// HEAD and there was nothing to commit.
    pub fn commit_subtask(&self, subtask_id: &str, title: &str) -> Result<Option<String>> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;

        let parent = self.head_commit();
        if let Some(ref parent) = parent
            && parent.tree_id() == tree_id
        {
            return Ok(None);
        }

        let sig = self
            .repo
            .signature()
            .or_else(|_| Signature::now("anvil", "anvil@localhost"))?;
        let message = format!("{subtask_id}: {title}");

        let commit_id = match parent {
            Some(parent) => {
                self.repo
                    .commit(Some("HEAD"), &sig, &sig, &message, &tree, &[&parent])?
            }
            // Unborn branch: initial commit has no parents.
            None => self
                .repo
                .commit(Some("HEAD"), &sig, &sig, &message, &tree, &[])?,
        };
        Ok(Some(commit_id.to_string()))
    }

    fn head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }
}
