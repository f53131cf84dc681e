//! Git capability seam. The runtime only needs a handful of porcelain calls
//! (branch read/rename, worktree add/remove); production shells out to `git`,
//! tests inject a fake.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::error::CoreError;

#[async_trait::async_trait]
pub trait GitRunner: Send + Sync {
    async fn is_git_repo(&self, path: &Path) -> bool;
    async fn current_branch(&self, repo: &Path) -> Result<String, CoreError>;
    async fn rename_branch(&self, repo: &Path, from: &str, to: &str) -> Result<(), CoreError>;
    async fn add_worktree(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
        create_branch: bool,
    ) -> Result<(), CoreError>;
    async fn remove_worktree(&self, repo: &Path, path: &Path) -> Result<(), CoreError>;
}

/// Shells out to the `git` binary.
pub struct CliGitRunner;

impl CliGitRunner {
    async fn run(repo: &Path, args: &[&str]) -> Result<String, CoreError> {
        let out = Command::new("git")
            .arg("-C")
            .arg(repo)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| CoreError::Git(format!("failed to run git: {e}")))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(CoreError::Git(format!(
                "git {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

#[async_trait::async_trait]
impl GitRunner for CliGitRunner {
    async fn is_git_repo(&self, path: &Path) -> bool {
        Self::run(path, &["rev-parse", "--is-inside-work-tree"])
            .await
            .map(|s| s == "true")
            .unwrap_or(false)
    }

    async fn current_branch(&self, repo: &Path) -> Result<String, CoreError> {
        Self::run(repo, &["branch", "--show-current"]).await
    }

    async fn rename_branch(&self, repo: &Path, from: &str, to: &str) -> Result<(), CoreError> {
        Self::run(repo, &["branch", "-m", from, to]).await.map(|_| ())
    }

    async fn add_worktree(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
        create_branch: bool,
    ) -> Result<(), CoreError> {
        let path_str = path.to_string_lossy();
        let path_str: &str = &path_str;
        let mut args = vec!["worktree", "add"];
        if create_branch {
            args.extend(["-b", branch, path_str]);
        } else {
            args.extend([path_str, branch]);
        }
        Self::run(repo, &args).await.map(|_| ())
    }

    async fn remove_worktree(&self, repo: &Path, path: &Path) -> Result<(), CoreError> {
        let path_str = path.to_string_lossy();
        let path_str: &str = &path_str;
        Self::run(repo, &["worktree", "remove", "--force", path_str])
            .await
            .map(|_| ())
    }
}
