//! CanonicalReconciler: bring every canonical clone back to clean, on trunk,
//! at the remote trunk head.
//!
//! The reset is deliberately nuclear. Safety comes from the evacuation that
//! precedes it and from re-verifying the repository right before it runs.

use std::path::Path;

use tracing::{debug, info};

use crate::audit::{Action, ActionJournal};
use crate::errors::GuardError;
use crate::git::GitCli;
use crate::inspector::{
    Inspection, Inspector, ReferenceBranch, RepoState, changed_paths, discover_trunk,
};
use crate::layout::{CanonicalRepository, is_git_checkout};
use crate::lock::{Freshness, SessionLockManager};
use crate::report::{ItemOutcome, RunReport};
use crate::rescue::{Evacuation, RescueBranch, RescueEvacuator, RescueTarget, ResetPermit};

#[derive(Debug)]
pub enum ReconcileOutcome {
    /// Fresh session lock or index lock
    Locked(Freshness),
    AlreadyConverged,
    Reset { rescued: Vec<RescueBranch> },
    /// Dry run: the reset (and any rescue) was only described
    Planned { rescued: Vec<RescueBranch> },
}

impl ReconcileOutcome {
    fn item_outcome(&self) -> ItemOutcome {
        match self {
            ReconcileOutcome::Locked(_) => ItemOutcome::Skipped,
            ReconcileOutcome::AlreadyConverged => ItemOutcome::Noop,
            ReconcileOutcome::Reset { .. } => ItemOutcome::Acted,
            ReconcileOutcome::Planned { .. } => ItemOutcome::Planned,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Locked(_) => "locked",
            ReconcileOutcome::AlreadyConverged => "converged",
            ReconcileOutcome::Reset { .. } => "reset",
            ReconcileOutcome::Planned { .. } => "would_reset",
        }
    }

    fn detail(&self) -> Option<String> {
        match self {
            ReconcileOutcome::Locked(Freshness::IndexLocked) => Some("index.lock present".into()),
            ReconcileOutcome::Locked(Freshness::Fresh { lock }) => {
                Some(format!("session lock held by {} (pid {})", lock.host, lock.pid))
            }
            ReconcileOutcome::Locked(Freshness::Unreadable { reason }) => {
                Some(format!("session lock unreadable: {}", reason))
            }
            ReconcileOutcome::Reset { rescued } | ReconcileOutcome::Planned { rescued }
                if !rescued.is_empty() =>
            {
                let names: Vec<&str> = rescued.iter().map(|b| b.name.as_str()).collect();
                Some(format!("rescued to {}", names.join(", ")))
            }
            _ => None,
        }
    }
}

pub struct CanonicalReconciler<'a> {
    git: &'a GitCli,
    inspector: &'a Inspector,
    locks: &'a SessionLockManager,
    journal: &'a ActionJournal,
    host: &'a str,
    scratch_dir: &'a Path,
}

impl<'a> CanonicalReconciler<'a> {
    pub fn new(
        git: &'a GitCli,
        inspector: &'a Inspector,
        locks: &'a SessionLockManager,
        journal: &'a ActionJournal,
        host: &'a str,
        scratch_dir: &'a Path,
    ) -> Self {
        Self {
            git,
            inspector,
            locks,
            journal,
            host,
            scratch_dir,
        }
    }

    /// Reconcile every repository, isolating failures per repository.
    pub async fn reconcile_all(&self, repos: &[CanonicalRepository], report: &mut RunReport) {
        for repo in repos {
            match self.reconcile(repo).await {
                Ok(outcome) => {
                    report.record(
                        &repo.name,
                        outcome.item_outcome(),
                        Some(outcome.label()),
                        outcome.detail(),
                    );
                }
                Err(e) => report.fail(&repo.name, None, &e),
            }
        }
    }

    pub async fn reconcile(&self, repo: &CanonicalRepository) -> Result<ReconcileOutcome, GuardError> {
        let root = repo.root.as_path();
        if !is_git_checkout(root) {
            return Err(GuardError::TransientIo(format!(
                "{}: not a git checkout",
                root.display()
            )));
        }
        let freshness = self.locks.freshness(root);
        if freshness.is_fresh() {
            info!(repo = %repo.name, "in use, skipping");
            return Ok(ReconcileOutcome::Locked(freshness));
        }

        let trunk = discover_trunk(root, repo.trunk.as_deref());
        self.fetch(repo).await?;

        let reference = self
            .inspector
            .reference_for(&repo.name, root, Some(&trunk))
            .ok_or_else(|| {
                GuardError::TransientIo(format!("{}: no origin/{} to reconcile against", repo.name, trunk))
            })?;
        let trunk = reference.trunk.clone();

        let state = known(self.inspector.inspect(root, Some(&reference)))?;
        if !state.dirty && state.is_on(&trunk) && state.head == Some(reference.oid) {
            debug!(repo = %repo.name, trunk = %trunk, "already converged");
            return Ok(ReconcileOutcome::AlreadyConverged);
        }

        let evacuator = RescueEvacuator::new(self.git, self.journal, self.host, self.scratch_dir);
        let evacuation = evacuator
            .evacuate(&RescueTarget {
                name: &repo.name,
                root,
                trunk: &trunk,
                reference: Some(&reference),
                state: &state,
            })
            .await?;
        let rescued = evacuation.branches().to_vec();

        if self.journal.is_dry_run() {
            self.plan_reset(&repo.name, &trunk);
            return Ok(ReconcileOutcome::Planned { rescued });
        }

        // The repository may have changed while the rescue was pushing.
        if self.locks.freshness(root).is_fresh() {
            info!(repo = %repo.name, "became active during evacuation, reset skipped");
            return Ok(ReconcileOutcome::Locked(self.locks.freshness(root)));
        }
        let permit = self.verify_permit(root, &reference, &evacuation)?;
        self.reset(&repo.name, permit, &trunk).await?;
        info!(repo = %repo.name, trunk = %trunk, rescued = rescued.len(), "reset to remote trunk");
        Ok(ReconcileOutcome::Reset { rescued })
    }

    async fn fetch(&self, repo: &CanonicalRepository) -> Result<(), GuardError> {
        let record = self.journal.plan(&repo.name, Action::Fetch, None);
        if self.journal.is_dry_run() {
            return Ok(());
        }
        self.journal.settle(record, self.git.fetch(&repo.root).await)?;
        self.inspector.forget(&repo.name);
        Ok(())
    }

    fn verify_permit<'p>(
        &self,
        root: &Path,
        reference: &ReferenceBranch,
        evacuation: &'p Evacuation,
    ) -> Result<&'p ResetPermit, GuardError> {
        let permit = evacuation.permit();
        if permit.root() != root {
            return Err(GuardError::InvariantViolation(format!(
                "reset permit for {} presented for {}",
                permit.root().display(),
                root.display()
            )));
        }
        let state = known(self.inspector.inspect(root, Some(reference)))?;
        let changes = if state.dirty {
            changed_paths(root)?
        } else {
            Vec::new()
        };
        permit.verify(&state, &changes)?;
        Ok(permit)
    }

    fn plan_reset(&self, name: &str, trunk: &str) {
        let target = format!("origin/{}", trunk);
        self.journal.plan(name, Action::Checkout, Some(trunk.to_string()));
        self.journal.plan(name, Action::Reset, Some(target));
        self.journal.plan(name, Action::Clean, None);
    }

    /// Force checkout, hard reset, clean. Only callable with a verified permit.
    async fn reset(&self, name: &str, permit: &ResetPermit, trunk: &str) -> Result<(), GuardError> {
        let root = permit.root();

        let record = self.journal.plan(name, Action::Checkout, Some(trunk.to_string()));
        self.journal.settle(record, self.git.checkout_trunk(root, trunk).await)?;

        let record = self.journal.plan(name, Action::Reset, Some(format!("origin/{}", trunk)));
        self.journal.settle(record, self.git.reset_hard(root, trunk).await)?;

        let record = self.journal.plan(name, Action::Clean, None);
        self.journal.settle(record, self.git.clean(root).await)
    }
}

/// UNKNOWN means skip: nothing fetch-dependent or destructive runs.
fn known(inspection: Inspection) -> Result<RepoState, GuardError> {
    match inspection {
        Inspection::Known(state) => Ok(state),
        Inspection::Unknown { reason } => Err(GuardError::TransientIo(format!(
            "repository state unknown: {}",
            reason
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{ActionOutcome, Component, read_journal};
    use crate::errors::ErrorKind;
    use crate::test_support::{
        ScriptedRunner, checkout_new_branch, checkout_new_branch_at, commit_file, failure,
        init_repo, set_remote_ref, success,
    };
    use std::fs;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        dir: TempDir,
        runner: Arc<ScriptedRunner>,
        git: GitCli,
        inspector: Inspector,
        locks: SessionLockManager,
        journal: ActionJournal,
    }

    impl Fixture {
        fn new(runner: ScriptedRunner, dry_run: bool) -> Self {
            let dir = tempdir().unwrap();
            let runner = Arc::new(runner);
            let git = GitCli::new(runner.clone(), Duration::from_secs(5), Duration::from_secs(5));
            let journal = ActionJournal::new(
                &dir.path().join("state/journal.jsonl"),
                Component::Reconcile,
                "build-01",
                dry_run,
            );
            Self {
                dir,
                runner,
                git,
                inspector: Inspector::new(),
                locks: SessionLockManager::new("build-01"),
                journal,
            }
        }

        fn repo(&self, name: &str) -> CanonicalRepository {
            CanonicalRepository {
                name: name.to_string(),
                root: self.dir.path().join("canonical").join(name),
                trunk: None,
            }
        }

        /// A canonical clone on master, level with origin/master.
        fn clean_repo(&self, name: &str) -> CanonicalRepository {
            let repo = self.repo(name);
            init_repo(&repo.root);
            let oid = commit_file(&repo.root, "a.txt", "one", "first");
            set_remote_ref(&repo.root, "master", oid);
            repo
        }

        fn scratch(&self) -> PathBuf {
            self.dir.path().join("state/rescue")
        }

        async fn run(&self, repos: &[CanonicalRepository]) -> RunReport {
            let scratch = self.scratch();
            let reconciler = CanonicalReconciler::new(
                &self.git,
                &self.inspector,
                &self.locks,
                &self.journal,
                "build-01",
                &scratch,
            );
            let mut report =
                RunReport::new(Component::Reconcile, self.journal.run_id(), "build-01", self.journal.is_dry_run());
            reconciler.reconcile_all(repos, &mut report).await;
            report
        }
    }

    #[tokio::test]
    async fn test_converged_repo_only_fetches() {
        let fx = Fixture::new(ScriptedRunner::ok(), false);
        let repo = fx.clean_repo("repo-x");
        let report = fx.run(&[repo]).await;

        assert_eq!(report.items[0].outcome, ItemOutcome::Noop);
        assert_eq!(fx.runner.rendered().len(), 1);
        assert!(fx.runner.rendered()[0].ends_with("fetch origin --prune"));
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let fx = Fixture::new(ScriptedRunner::ok(), false);
        let repo = fx.clean_repo("repo-x");
        fx.run(std::slice::from_ref(&repo)).await;
        let report = fx.run(&[repo]).await;
        assert_eq!(report.items[0].decision.as_deref(), Some("converged"));
        assert!(fx.runner.position("reset --hard").is_none());
        assert!(fx.runner.position("rescue-").is_none());
    }

    #[tokio::test]
    async fn test_fresh_session_lock_skips_everything() {
        let fx = Fixture::new(ScriptedRunner::ok(), false);
        let repo = fx.clean_repo("repo-x");
        fs::write(repo.root.join("a.txt"), "dirty").unwrap();
        fx.locks.touch(&repo.root).unwrap();

        let report = fx.run(&[repo]).await;
        assert_eq!(report.items[0].outcome, ItemOutcome::Skipped);
        assert!(fx.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_index_lock_skips_everything() {
        let fx = Fixture::new(ScriptedRunner::ok(), false);
        let repo = fx.clean_repo("repo-x");
        fs::write(repo.root.join(".git/index.lock"), "").unwrap();

        let report = fx.run(&[repo]).await;
        assert_eq!(report.items[0].detail.as_deref(), Some("index.lock present"));
        assert!(fx.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_dirty_repo_resets_only_after_rescue_push() {
        let fx = Fixture::new(ScriptedRunner::ok(), false);
        let repo = fx.clean_repo("repo-x");
        checkout_new_branch(&repo.root, "feature/y");
        fs::write(repo.root.join("a.txt"), "modified").unwrap();
        fs::write(repo.root.join("b.txt"), "untracked").unwrap();

        let report = fx.run(&[repo]).await;
        assert_eq!(report.items[0].outcome, ItemOutcome::Acted);
        assert!(report.items[0].detail.as_deref().unwrap().contains("rescue-build-01-repo-x-"));

        let push = fx.runner.position("push origin HEAD:refs/heads/rescue-").unwrap();
        let checkout = fx.runner.position("checkout --force -B master origin/master").unwrap();
        let reset = fx.runner.position("reset --hard origin/master").unwrap();
        let clean = fx.runner.position("clean -fd").unwrap();
        assert!(push < checkout && checkout < reset && reset < clean);

        let actions: Vec<Action> = read_journal(&fx.dir.path().join("state/journal.jsonl"))
            .unwrap()
            .into_iter()
            .filter(|r| r.outcome == ActionOutcome::Succeeded)
            .map(|r| r.action)
            .collect();
        assert_eq!(
            actions,
            vec![Action::Fetch, Action::RescuePush, Action::Checkout, Action::Reset, Action::Clean]
        );
    }

    #[tokio::test]
    async fn test_failed_rescue_push_never_resets() {
        let runner = ScriptedRunner::new(|inv| {
            if inv.arg_strings().iter().any(|a| a == "push") {
                Ok(failure("! [rejected]"))
            } else {
                Ok(success(""))
            }
        });
        let fx = Fixture::new(runner, false);
        let repo = fx.clean_repo("repo-x");
        fs::write(repo.root.join("b.txt"), "untracked").unwrap();

        let report = fx.run(&[repo]).await;
        assert_eq!(report.items[0].outcome, ItemOutcome::Failed);
        assert_eq!(report.items[0].error_kind, Some(ErrorKind::TransientIo));
        assert!(fx.runner.position("reset --hard").is_none());
        assert!(fx.runner.position("checkout").is_none());
        assert!(fx.runner.position("clean").is_none());
    }

    #[tokio::test]
    async fn test_fetch_failure_skips_repo_and_continues() {
        let runner = ScriptedRunner::new(|inv| {
            let repo_a = inv.render().contains("repo-a");
            if repo_a && inv.arg_strings().iter().any(|a| a == "fetch") {
                Ok(failure("Could not resolve host"))
            } else {
                Ok(success(""))
            }
        });
        let fx = Fixture::new(runner, false);
        let a = fx.clean_repo("repo-a");
        fs::write(a.root.join("b.txt"), "untracked").unwrap();
        let b = fx.clean_repo("repo-b");

        let report = fx.run(&[a, b]).await;
        assert_eq!(report.items[0].outcome, ItemOutcome::Failed);
        assert_eq!(report.items[1].outcome, ItemOutcome::Noop);
        assert_eq!(fx.runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_repository_is_isolated() {
        let fx = Fixture::new(ScriptedRunner::ok(), false);
        let missing = fx.repo("repo-gone");
        let present = fx.clean_repo("repo-x");

        let report = fx.run(&[missing, present]).await;
        assert_eq!(report.items[0].outcome, ItemOutcome::Failed);
        assert_eq!(report.items[1].outcome, ItemOutcome::Noop);
        assert!(fx.runner.position("repo-gone").is_none());
    }

    #[tokio::test]
    async fn test_dry_run_describes_without_executing() {
        let fx = Fixture::new(ScriptedRunner::ok(), true);
        let repo = fx.clean_repo("repo-x");
        fs::write(repo.root.join("b.txt"), "untracked").unwrap();

        let report = fx.run(&[repo]).await;
        assert_eq!(report.items[0].outcome, ItemOutcome::Planned);
        assert!(fx.runner.calls().is_empty());
        let planned = fx.journal.planned();
        assert!(planned[0].contains("fetch repo-x"));
        assert!(planned.iter().any(|p| p.contains("push rescue branch")));
        assert!(planned.iter().any(|p| p.contains("hard reset repo-x (origin/master)")));
    }

    #[tokio::test]
    async fn test_dirt_appearing_during_rescue_is_an_invariant_violation() {
        let late: Arc<Mutex<Option<PathBuf>>> = Arc::default();
        let late_path = late.clone();
        let runner = ScriptedRunner::new(move |inv| {
            if inv.arg_strings().iter().any(|a| a == "push")
                && let Some(path) = late_path.lock().unwrap().as_ref()
            {
                fs::write(path, "written while pushing").unwrap();
            }
            Ok(success(""))
        });
        let fx = Fixture::new(runner, false);
        let repo = fx.clean_repo("repo-x");
        fs::write(repo.root.join("b.txt"), "untracked").unwrap();
        *late.lock().unwrap() = Some(repo.root.join("late.txt"));

        let report = fx.run(&[repo]).await;
        assert_eq!(report.items[0].error_kind, Some(ErrorKind::InvariantViolation));
        assert_eq!(report.counts.invariant_violations, 1);
        assert!(fx.runner.position("reset --hard").is_none());
    }

    #[tokio::test]
    async fn test_unpushed_trunk_commits_are_pushed_before_reset() {
        let fx = Fixture::new(ScriptedRunner::ok(), false);
        let repo = fx.clean_repo("repo-x");
        commit_file(&repo.root, "c.txt", "local only", "local commit");

        let report = fx.run(&[repo]).await;
        assert_eq!(report.items[0].outcome, ItemOutcome::Acted);
        let push = fx.runner.position("-commits").unwrap();
        let reset = fx.runner.position("reset --hard").unwrap();
        assert!(push < reset);
    }

    #[tokio::test]
    async fn test_local_trunk_commits_survive_reset_from_another_branch() {
        let fx = Fixture::new(ScriptedRunner::ok(), false);
        let repo = fx.clean_repo("repo-x");
        let base = git2::Repository::open(&repo.root)
            .unwrap()
            .refname_to_id("refs/remotes/origin/master")
            .unwrap();
        commit_file(&repo.root, "precious.txt", "local only", "never pushed");
        checkout_new_branch_at(&repo.root, "feature/y", base);

        let report = fx.run(&[repo]).await;
        assert_eq!(report.items[0].outcome, ItemOutcome::Acted);
        assert!(report.items[0].detail.as_deref().unwrap().contains("-trunk-commits"));

        let push = fx
            .runner
            .position("push origin refs/heads/master:refs/heads/rescue-build-01-repo-x-")
            .unwrap();
        let checkout = fx.runner.position("checkout --force -B master origin/master").unwrap();
        assert!(push < checkout);
    }

    #[tokio::test]
    async fn test_failed_local_trunk_push_never_resets() {
        let runner = ScriptedRunner::new(|inv| {
            if inv.arg_strings().iter().any(|a| a == "push") {
                Ok(failure("! [rejected]"))
            } else {
                Ok(success(""))
            }
        });
        let fx = Fixture::new(runner, false);
        let repo = fx.clean_repo("repo-x");
        let base = git2::Repository::open(&repo.root)
            .unwrap()
            .refname_to_id("refs/remotes/origin/master")
            .unwrap();
        commit_file(&repo.root, "precious.txt", "local only", "never pushed");
        checkout_new_branch_at(&repo.root, "feature/y", base);

        let report = fx.run(&[repo]).await;
        assert_eq!(report.items[0].outcome, ItemOutcome::Failed);
        assert!(fx.runner.position("checkout").is_none());
        assert!(fx.runner.position("reset --hard").is_none());
    }
}
