//! Version-control collaborator.
//!
//! Phases talk to version control only through [`VersionControl`]. The git
//! implementation creates worktrees for isolation and shells out to `git`
//! and `gh`.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use crate::error::{Error, Result};

/// Operations the workflow needs from version control.
pub trait VersionControl: Send + Sync {
    /// Creates an isolated workspace on a new branch and returns its path.
    fn create_isolated_workspace(&self, branch_name: &str) -> Result<PathBuf>;

    /// Commits all changes. Returns `None` when there was nothing to commit.
    fn commit(&self, workspace: &Path, message: &str) -> Result<Option<String>>;

    /// Rebases the workspace branch onto `base`.
    ///
    /// Stops with [`Error::Conflict`] listing the conflicting files, leaving
    /// the rebase in progress so the conflicts can be resolved.
    fn rebase_onto(&self, workspace: &Path, base: &str) -> Result<()>;

    /// Stages resolved files and continues an in-progress rebase.
    fn continue_rebase(&self, workspace: &Path) -> Result<()>;

    /// Abandons an in-progress rebase.
    fn abort_rebase(&self, workspace: &Path) -> Result<()>;

    /// Pushes the branch and opens a change request. Returns its URL.
    fn push_and_open_change_request(
        &self,
        workspace: &Path,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<String>;

    /// Stashes uncommitted changes. Returns false if there were none.
    fn stash(&self, workspace: &Path) -> Result<bool>;

    /// Restores the most recent stash.
    fn unstash(&self, workspace: &Path) -> Result<()>;
}

/// Git worktree implementation.
#[derive(Debug, Clone)]
pub struct GitVcs {
    /// Path to the git repository.
    repo_path: PathBuf,
    /// Directory worktrees are created under.
    worktree_base: PathBuf,
}

impl GitVcs {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        let repo_path = repo_path.into();
        Self {
            worktree_base: std::env::temp_dir().join("assembly-line-workspaces"),
            repo_path,
        }
    }

    pub fn with_worktree_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.worktree_base = base.into();
        self
    }

    fn git(dir: &Path, args: &[&str]) -> Result<Output> {
        Ok(Command::new("git").current_dir(dir).args(args).output()?)
    }

    fn git_ok(dir: &Path, args: &[&str], what: &str) -> Result<String> {
        let output = Self::git(dir, args)?;
        if !output.status.success() {
            return Err(Error::Git(format!(
                "{}: {}",
                what,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn conflicted_files(workspace: &Path) -> Result<Vec<String>> {
        let out = Self::git_ok(
            workspace,
            &["diff", "--name-only", "--diff-filter=U"],
            "failed to list conflicts",
        )?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Maps a failed rebase step to `Conflict` or a plain git error.
    fn rebase_failure(workspace: &Path, output: &Output) -> Error {
        match Self::conflicted_files(workspace) {
            Ok(files) if !files.is_empty() => {
                tracing::warn!(files = ?files, "rebase stopped on conflicts");
                Error::Conflict { files }
            }
            _ => Error::Git(format!(
                "rebase failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )),
        }
    }
}

impl VersionControl for GitVcs {
    fn create_isolated_workspace(&self, branch_name: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.worktree_base)?;
        let path = self.worktree_base.join(branch_name.replace('/', "-"));

        let output = Command::new("git")
            .current_dir(&self.repo_path)
            .args(["worktree", "add", "-b", branch_name])
            .arg(&path)
            .arg("HEAD")
            .output()?;

        if !output.status.success() {
            return Err(Error::Git(format!(
                "git worktree add failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        tracing::info!(path = ?path, branch = %branch_name, "created workspace worktree");
        Ok(path)
    }

    fn commit(&self, workspace: &Path, message: &str) -> Result<Option<String>> {
        let status = Self::git_ok(workspace, &["status", "--porcelain"], "failed to read status")?;
        if status.is_empty() {
            return Ok(None);
        }

        Self::git_ok(workspace, &["add", "-A"], "failed to stage changes")?;

        let commit = Self::git(workspace, &["commit", "-m", message])?;
        if !commit.status.success() {
            let stderr = String::from_utf8_lossy(&commit.stderr);
            if stderr.contains("nothing to commit") {
                return Ok(None);
            }
            return Err(Error::Git(format!("failed to commit: {}", stderr.trim())));
        }

        let hash = Self::git_ok(workspace, &["rev-parse", "HEAD"], "failed to read HEAD")?;
        tracing::info!(commit = %hash, "committed workspace changes");
        Ok(Some(hash))
    }

    fn rebase_onto(&self, workspace: &Path, base: &str) -> Result<()> {
        let output = Self::git(workspace, &["rebase", base])?;
        if output.status.success() {
            tracing::info!(base = %base, "rebased cleanly");
            return Ok(());
        }
        Err(Self::rebase_failure(workspace, &output))
    }

    fn continue_rebase(&self, workspace: &Path) -> Result<()> {
        Self::git_ok(workspace, &["add", "-A"], "failed to stage resolutions")?;
        let output = Self::git(workspace, &["-c", "core.editor=true", "rebase", "--continue"])?;
        if output.status.success() {
            return Ok(());
        }
        Err(Self::rebase_failure(workspace, &output))
    }

    fn abort_rebase(&self, workspace: &Path) -> Result<()> {
        Self::git_ok(workspace, &["rebase", "--abort"], "failed to abort rebase")?;
        Ok(())
    }

    fn push_and_open_change_request(
        &self,
        workspace: &Path,
        branch: &str,
        base: &str,
        title: &str,
        body: &str,
    ) -> Result<String> {
        Self::git_ok(
            workspace,
            &["push", "-u", "origin", branch],
            "failed to push branch",
        )?;

        let output = Command::new("gh")
            .current_dir(workspace)
            .args([
                "pr", "create", "--title", title, "--body", body, "--head", branch, "--base", base,
            ])
            .output()?;

        if !output.status.success() {
            return Err(Error::Git(format!(
                "failed to create PR: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        // gh prints the PR URL as the last line
        let stdout = String::from_utf8_lossy(&output.stdout);
        let url = stdout
            .lines()
            .rev()
            .find(|l| l.starts_with("http"))
            .unwrap_or_else(|| stdout.trim())
            .to_string();
        tracing::info!(url = %url, "opened pull request");
        Ok(url)
    }

    fn stash(&self, workspace: &Path) -> Result<bool> {
        let status = Self::git_ok(workspace, &["status", "--porcelain"], "failed to read status")?;
        if status.is_empty() {
            return Ok(false);
        }
        Self::git_ok(
            workspace,
            &["stash", "push", "--include-untracked", "-m", "assembly-line baseline"],
            "failed to stash",
        )?;
        Ok(true)
    }

    fn unstash(&self, workspace: &Path) -> Result<()> {
        Self::git_ok(workspace, &["stash", "pop"], "failed to restore stash")?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    pub(crate) fn create_test_repo() -> TempDir {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let run = |args: &[&str]| {
            Command::new("git")
                .current_dir(temp_dir.path())
                .args(args)
                .output()
                .expect("failed to run git");
        };

        run(&["init", "-b", "main"]);
        run(&["config", "user.email", "test@test.com"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(temp_dir.path().join("README.md"), "# Test\n").unwrap();
        run(&["add", "-A"]);
        run(&["commit", "-m", "Initial"]);

        temp_dir
    }

    #[test]
    fn creates_workspace_and_commits() {
        let repo = create_test_repo();
        let base = TempDir::new().unwrap();
        let vcs = GitVcs::new(repo.path()).with_worktree_base(base.path());

        let ws = vcs.create_isolated_workspace("assembly/add-cache").unwrap();
        assert!(ws.join("README.md").is_file());
        assert_eq!(ws, base.path().join("assembly-add-cache"));

        assert_eq!(vcs.commit(&ws, "nothing").unwrap(), None);

        std::fs::write(ws.join("cache.rs"), "// cache\n").unwrap();
        let hash = vcs.commit(&ws, "Add cache").unwrap();
        assert!(hash.is_some_and(|h| h.len() >= 7));
    }

    #[test]
    fn stash_and_unstash_round_trip() {
        let repo = create_test_repo();
        let vcs = GitVcs::new(repo.path());

        assert!(!vcs.stash(repo.path()).unwrap());
        std::fs::write(repo.path().join("wip.txt"), "wip").unwrap();
        assert!(vcs.stash(repo.path()).unwrap());
        assert!(!repo.path().join("wip.txt").exists());
        vcs.unstash(repo.path()).unwrap();
        assert!(repo.path().join("wip.txt").exists());
    }

    #[test]
    fn rebase_reports_conflicting_files() {
        let repo = create_test_repo();
        let base = TempDir::new().unwrap();
        let vcs = GitVcs::new(repo.path()).with_worktree_base(base.path());
        let ws = vcs.create_isolated_workspace("assembly/conflict").unwrap();

        std::fs::write(ws.join("README.md"), "# Branch\n").unwrap();
        vcs.commit(&ws, "branch edit").unwrap();
        std::fs::write(repo.path().join("README.md"), "# Main\n").unwrap();
        vcs.commit(repo.path(), "main edit").unwrap();

        match vcs.rebase_onto(&ws, "main") {
            Err(Error::Conflict { files }) => assert_eq!(files, vec!["README.md"]),
            other => panic!("expected conflict, got {other:?}"),
        }
        vcs.abort_rebase(&ws).unwrap();
    }

    #[test]
    fn rebase_without_conflicts_succeeds() {
        let repo = create_test_repo();
        let base = TempDir::new().unwrap();
        let vcs = GitVcs::new(repo.path()).with_worktree_base(base.path());
        let ws = vcs.create_isolated_workspace("assembly/clean").unwrap();

        std::fs::write(ws.join("feature.txt"), "feature").unwrap();
        vcs.commit(&ws, "feature").unwrap();
        std::fs::write(repo.path().join("other.txt"), "other").unwrap();
        vcs.commit(repo.path(), "other").unwrap();

        vcs.rebase_onto(&ws, "main").unwrap();
        assert!(ws.join("other.txt").is_file());
    }
}
