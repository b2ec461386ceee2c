//! Mutating and network git operations, run through the `git` binary.
//!
//! Reads go through `git2` in the inspector. Everything that changes a
//! repository or talks to the remote lives here, bounded by a timeout and with
//! terminal prompts disabled so an unattended run can never hang on credentials.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::errors::{CommandError, GuardError};
use crate::exec::{CommandRunner, Invocation, run_checked};
use crate::inspector::REMOTE;
use crate::lock::LOCK_FILE_NAME;

/// Identity used for rescue commits, independent of the host's git config.
pub const COMMITTER_NAME: &str = "trunkguard";
pub const COMMITTER_EMAIL: &str = "trunkguard@localhost";

#[derive(Clone)]
pub struct GitCli {
    runner: Arc<dyn CommandRunner>,
    network_timeout: Duration,
    local_timeout: Duration,
}

impl GitCli {
    pub fn new(runner: Arc<dyn CommandRunner>, network_timeout: Duration, local_timeout: Duration) -> Self {
        Self {
            runner,
            network_timeout,
            local_timeout,
        }
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    fn git(&self, repo: &Path) -> Invocation {
        Invocation::new("git")
            .arg("-C")
            .arg(repo.as_os_str())
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_ASKPASS", "")
    }

    async fn local(&self, invocation: Invocation) -> Result<String, GuardError> {
        self.run(invocation.timeout(self.local_timeout)).await
    }

    async fn network(&self, invocation: Invocation) -> Result<String, GuardError> {
        self.run(invocation.timeout(self.network_timeout)).await
    }

    async fn run(&self, invocation: Invocation) -> Result<String, GuardError> {
        debug!(command = %invocation.render(), "git");
        let output = run_checked(self.runner.as_ref(), &invocation).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// `git fetch origin --prune`
    pub async fn fetch(&self, repo: &Path) -> Result<(), GuardError> {
        self.network(self.git(repo).args(["fetch", REMOTE, "--prune"]))
            .await?;
        Ok(())
    }

    /// Push a local branch under its own name and record the upstream.
    pub async fn push_branch(&self, repo: &Path, branch: &str) -> Result<(), GuardError> {
        let refspec = format!("refs/heads/{0}:refs/heads/{0}", branch);
        self.network(self.git(repo).args(["push", "--set-upstream", REMOTE]).arg(refspec))
            .await?;
        Ok(())
    }

    /// Push `HEAD` to a new remote branch without touching local refs.
    pub async fn push_head_as(&self, repo: &Path, remote_branch: &str) -> Result<(), GuardError> {
        let refspec = format!("HEAD:refs/heads/{}", remote_branch);
        self.network(self.git(repo).args(["push", REMOTE]).arg(refspec))
            .await?;
        Ok(())
    }

    /// Push a local branch's tip to a new remote branch, leaving HEAD alone.
    pub async fn push_branch_as(
        &self,
        repo: &Path,
        local_branch: &str,
        remote_branch: &str,
    ) -> Result<(), GuardError> {
        let refspec = format!("refs/heads/{}:refs/heads/{}", local_branch, remote_branch);
        self.network(self.git(repo).args(["push", REMOTE]).arg(refspec))
            .await?;
        Ok(())
    }

    /// Add a linked worktree at `path` on a new `branch` starting at `start`.
    pub async fn worktree_add(
        &self,
        repo: &Path,
        path: &Path,
        branch: &str,
        start: &str,
    ) -> Result<(), GuardError> {
        self.local(
            self.git(repo)
                .args(["worktree", "add", "-b", branch])
                .arg(path.as_os_str())
                .arg(start),
        )
        .await?;
        Ok(())
    }

    pub async fn worktree_remove(&self, repo: &Path, path: &Path) -> Result<(), GuardError> {
        self.local(
            self.git(repo)
                .args(["worktree", "remove", "--force"])
                .arg(path.as_os_str()),
        )
        .await?;
        Ok(())
    }

    pub async fn worktree_prune(&self, repo: &Path) -> Result<(), GuardError> {
        self.local(self.git(repo).args(["worktree", "prune"])).await?;
        Ok(())
    }

    /// Stage everything in `worktree` and commit with the tool's own identity,
    /// skipping hooks and signing.
    pub async fn commit_all(&self, worktree: &Path, message: &str) -> Result<(), GuardError> {
        self.local(self.git(worktree).args(["add", "--all"])).await?;
        self.local(
            self.git(worktree)
                .arg("-c")
                .arg(format!("user.name={}", COMMITTER_NAME))
                .arg("-c")
                .arg(format!("user.email={}", COMMITTER_EMAIL))
                .args(["-c", "commit.gpgsign=false", "commit", "--no-verify", "--allow-empty", "-m"])
                .arg(message),
        )
        .await?;
        Ok(())
    }

    /// Force `trunk` to the remote trunk head and check it out.
    pub async fn checkout_trunk(&self, repo: &Path, trunk: &str) -> Result<(), GuardError> {
        self.local(
            self.git(repo)
                .args(["checkout", "--force", "-B", trunk])
                .arg(format!("{}/{}", REMOTE, trunk)),
        )
        .await?;
        Ok(())
    }

    pub async fn reset_hard(&self, repo: &Path, trunk: &str) -> Result<(), GuardError> {
        self.local(
            self.git(repo)
                .args(["reset", "--hard"])
                .arg(format!("{}/{}", REMOTE, trunk)),
        )
        .await?;
        Ok(())
    }

    /// Remove untracked files and directories, keeping the session lock.
    pub async fn clean(&self, repo: &Path) -> Result<(), GuardError> {
        self.local(
            self.git(repo)
                .args(["clean", "-fd", "-e"])
                .arg(format!("{}*", LOCK_FILE_NAME)),
        )
        .await?;
        Ok(())
    }

    /// `force` uses `-D`; otherwise git refuses to delete unmerged branches.
    pub async fn delete_branch(&self, repo: &Path, branch: &str, force: bool) -> Result<(), GuardError> {
        let flag = if force { "-D" } else { "-d" };
        self.local(self.git(repo).args(["branch", flag, branch])).await?;
        Ok(())
    }

    /// `tar -czf <archive> -C <parent> <name>`
    pub async fn archive(&self, source: &Path, archive: &Path) -> Result<(), GuardError> {
        let (Some(parent), Some(name)) = (source.parent(), source.file_name()) else {
            return Err(GuardError::InvariantViolation(format!(
                "cannot archive '{}'",
                source.display()
            )));
        };
        if let Some(dir) = archive.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        self.local(
            Invocation::new("tar")
                .arg("-czf")
                .arg(archive.as_os_str())
                .arg("-C")
                .arg(parent.as_os_str())
                .arg(name),
        )
        .await?;
        Ok(())
    }
}

/// Confirm `git` is installed. Missing tools are a configuration error.
pub async fn ensure_available(runner: &dyn CommandRunner) -> Result<(), GuardError> {
    match run_checked(runner, &Invocation::new("git").arg("--version")).await {
        Ok(_) => Ok(()),
        Err(err @ CommandError::NotFound { .. }) => Err(err.into()),
        Err(other) => Err(GuardError::Configuration(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedRunner, failure};

    fn cli(runner: Arc<ScriptedRunner>) -> GitCli {
        GitCli::new(runner, Duration::from_secs(60), Duration::from_secs(300))
    }

    #[tokio::test]
    async fn test_network_calls_use_network_timeout_and_no_prompt() {
        let runner = Arc::new(ScriptedRunner::ok());
        let git = cli(runner.clone());
        git.fetch(Path::new("/r")).await.unwrap();
        git.push_branch(Path::new("/r"), "feature/x").await.unwrap();

        let calls = runner.calls();
        assert_eq!(calls[0].render(), "git -C /r fetch origin --prune");
        assert_eq!(
            calls[1].render(),
            "git -C /r push --set-upstream origin refs/heads/feature/x:refs/heads/feature/x"
        );
        for call in &calls {
            assert_eq!(call.timeout, Some(Duration::from_secs(60)));
            assert!(call.envs.contains(&("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())));
        }
    }

    #[tokio::test]
    async fn test_reset_sequence_commands() {
        let runner = Arc::new(ScriptedRunner::ok());
        let git = cli(runner.clone());
        let repo = Path::new("/r");
        git.checkout_trunk(repo, "master").await.unwrap();
        git.reset_hard(repo, "master").await.unwrap();
        git.clean(repo).await.unwrap();
        assert_eq!(
            runner.rendered(),
            vec![
                "git -C /r checkout --force -B master origin/master",
                "git -C /r reset --hard origin/master",
                "git -C /r clean -fd -e .session-lock*",
            ]
        );
        assert_eq!(runner.calls()[0].timeout, Some(Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn test_commit_all_uses_fixed_identity() {
        let runner = Arc::new(ScriptedRunner::ok());
        let git = cli(runner.clone());
        git.commit_all(Path::new("/wt"), "rescue").await.unwrap();
        let rendered = runner.rendered();
        assert_eq!(rendered[0], "git -C /wt add --all");
        assert!(rendered[1].contains("user.name=trunkguard"));
        assert!(rendered[1].contains("commit --no-verify"));
        assert!(rendered[1].ends_with("-m rescue"));
    }

    #[tokio::test]
    async fn test_push_rejection_is_transient() {
        let runner = Arc::new(ScriptedRunner::new(|_| {
            Ok(failure("! [rejected] (fetch first)"))
        }));
        let err = cli(runner)
            .push_head_as(Path::new("/r"), "rescue-h-r-1")
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::TransientIo(_)));
    }

    #[tokio::test]
    async fn test_archive_command() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Arc::new(ScriptedRunner::ok());
        let out = dir.path().join("archive/t--r--1.tar.gz");
        cli(runner.clone())
            .archive(Path::new("/ws/task-1/repo"), &out)
            .await
            .unwrap();
        assert!(out.parent().unwrap().is_dir());
        assert_eq!(
            runner.rendered()[0],
            format!("tar -czf {} -C /ws/task-1 repo", out.display())
        );
    }

    #[tokio::test]
    async fn test_ensure_available() {
        assert!(ensure_available(&ScriptedRunner::ok()).await.is_ok());
        let missing = ScriptedRunner::new(|_| {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "nope"))
        });
        assert!(ensure_available(&missing).await.unwrap_err().is_fatal_to_run());
    }
}
