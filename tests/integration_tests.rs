//! Integration tests for trunkguard
//!
//! These drive the compiled binary against temporary directories. Scenarios
//! that need the real `git` binary are skipped when it is not installed.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;
use tempfile::TempDir;

/// Isolated roots for one test run.
struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        let sandbox = Self {
            dir: TempDir::new().unwrap(),
        };
        fs::create_dir_all(sandbox.canonical_root()).unwrap();
        fs::create_dir_all(sandbox.workspace_root()).unwrap();
        sandbox
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn canonical_root(&self) -> PathBuf {
        self.path().join("canonical")
    }

    fn workspace_root(&self) -> PathBuf {
        self.path().join("workspaces")
    }

    fn state_dir(&self) -> PathBuf {
        self.path().join("state")
    }

    fn config_path(&self) -> PathBuf {
        self.path().join("config").join("config.toml")
    }

    /// A trunkguard command wired to this sandbox only.
    fn trunkguard(&self) -> Command {
        let mut cmd = cargo_bin_cmd!("trunkguard");
        cmd.current_dir(self.path())
            .env("TRUNKGUARD_CONFIG", self.config_path())
            .env("TRUNKGUARD_HOST", "ci-host")
            .env("TRUNKGUARD_CANONICAL_ROOT", self.canonical_root())
            .env("TRUNKGUARD_WORKSPACE_ROOT", self.workspace_root())
            .env("TRUNKGUARD_STATE_DIR", self.state_dir())
            .env_remove("TRUNKGUARD_ROLE")
            .env_remove("RUST_LOG");
        cmd
    }
}

fn git_available() -> bool {
    StdCommand::new("git")
        .arg("--version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

fn git_cmd(dir: &Path) -> StdCommand {
    let mut cmd = StdCommand::new("git");
    cmd.current_dir(dir)
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .args([
            "-c",
            "user.name=Test",
            "-c",
            "user.email=test@example.com",
            "-c",
            "commit.gpgsign=false",
            "-c",
            "init.defaultBranch=master",
        ]);
    cmd
}

fn git(dir: &Path, args: &[&str]) -> String {
    run(git_cmd(dir).args(args))
}

fn run(cmd: &mut StdCommand) -> String {
    let out = cmd.output().unwrap();
    assert!(
        out.status.success(),
        "{:?} failed: {}",
        cmd,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).to_string()
}

/// A bare remote with one commit on `master`, optionally back-dated.
fn seeded_remote(root: &Path, commit_date: Option<&str>) -> PathBuf {
    let remote = root.join("remote.git");
    git(root, &["init", "--bare", "remote.git"]);
    let seed = root.join("seed");
    git(root, &["init", "seed"]);
    git(&seed, &["symbolic-ref", "HEAD", "refs/heads/master"]);
    fs::write(seed.join("README.md"), "hello\n").unwrap();
    git(&seed, &["add", "README.md"]);
    let mut commit = git_cmd(&seed);
    commit.args(["commit", "-m", "initial"]);
    if let Some(date) = commit_date {
        commit
            .env("GIT_AUTHOR_DATE", date)
            .env("GIT_COMMITTER_DATE", date);
    }
    run(&mut commit);
    git(&seed, &["push", remote.to_str().unwrap(), "master"]);
    remote
}

fn clone(remote: &Path, dest: &Path) {
    fs::create_dir_all(dest.parent().unwrap()).unwrap();
    git(
        dest.parent().unwrap(),
        &["clone", remote.to_str().unwrap(), dest.to_str().unwrap()],
    );
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_components() {
        cargo_bin_cmd!("trunkguard")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("reconcile"))
            .stdout(predicate::str::contains("queue-enforce"))
            .stdout(predicate::str::contains("cleanup"));
    }

    #[test]
    fn test_version() {
        cargo_bin_cmd!("trunkguard")
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("trunkguard"));
    }

    #[test]
    fn test_unknown_role_is_rejected() {
        let sandbox = Sandbox::new();
        sandbox
            .trunkguard()
            .args(["--role", "overlord", "status"])
            .assert()
            .failure();
    }
}

// =============================================================================
// Configuration Tests
// =============================================================================

mod configuration {
    use super::*;

    #[test]
    fn test_config_init_writes_defaults_once() {
        let sandbox = Sandbox::new();

        sandbox
            .trunkguard()
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created"));
        let content = fs::read_to_string(sandbox.config_path()).unwrap();
        assert!(content.contains("cooldown_hours = 24"));
        assert!(content.contains("role = \"follower\""));

        sandbox
            .trunkguard()
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_config_show_applies_environment_overrides() {
        let sandbox = Sandbox::new();
        sandbox
            .trunkguard()
            .env("TRUNKGUARD_ROLE", "leader")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("using defaults"))
            .stdout(predicate::str::contains("role = \"leader\""))
            .stdout(predicate::str::contains("Acting host: ci-host"))
            .stdout(predicate::str::contains(
                sandbox.canonical_root().display().to_string(),
            ));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let sandbox = Sandbox::new();
        fs::create_dir_all(sandbox.config_path().parent().unwrap()).unwrap();
        fs::write(
            sandbox.config_path(),
            "[gc]\ncooldown_hours = 200\narchive_after_hours = 100\n\n[queue]\nrescue_branch_patterns = [\"(\"]\n",
        )
        .unwrap();

        sandbox
            .trunkguard()
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("gc.cooldown_hours"))
            .stdout(predicate::str::contains("invalid regex"));
    }

    #[test]
    fn test_invalid_rescue_pattern_aborts_runs() {
        let sandbox = Sandbox::new();
        fs::create_dir_all(sandbox.config_path().parent().unwrap()).unwrap();
        fs::write(
            sandbox.config_path(),
            "[queue]\nrescue_branch_patterns = [\"(\"]\n",
        )
        .unwrap();

        sandbox.trunkguard().arg("status").assert().failure();
    }

    #[test]
    fn test_explicit_missing_config_file_fails() {
        let sandbox = Sandbox::new();
        sandbox
            .trunkguard()
            .args(["--config", "/nonexistent/trunkguard.toml", "status"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Config file not found"));
    }

    #[test]
    fn test_missing_canonical_root_is_a_configuration_error() {
        let sandbox = Sandbox::new();
        sandbox
            .trunkguard()
            .env("TRUNKGUARD_CANONICAL_ROOT", sandbox.path().join("absent"))
            .args(["gc", "--dry-run"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("canonical root"));
    }
}

// =============================================================================
// Session Lock Tests
// =============================================================================

mod session_locks {
    use super::*;

    #[test]
    fn test_touch_status_clear_cycle() {
        let sandbox = Sandbox::new();
        let target = sandbox.workspace_root().join("task-1").join("app");
        fs::create_dir_all(&target).unwrap();
        let target_arg = target.to_str().unwrap();

        sandbox
            .trunkguard()
            .args(["lock", "status", target_arg])
            .assert()
            .success()
            .stdout(predicate::str::contains("unlocked"));

        sandbox
            .trunkguard()
            .args(["lock", "touch", target_arg])
            .assert()
            .success()
            .stdout(predicate::str::contains("ci-host"));
        let raw = fs::read_to_string(target.join(".session-lock")).unwrap();
        assert!(raw.contains(":ci-host:"));

        sandbox
            .trunkguard()
            .args(["lock", "status", target_arg])
            .assert()
            .success()
            .stdout(predicate::str::contains("fresh"));

        sandbox
            .trunkguard()
            .args(["lock", "clear", target_arg])
            .assert()
            .success()
            .stdout(predicate::str::contains("Cleared"));
        assert!(!target.join(".session-lock").exists());
    }

    #[test]
    fn test_old_lock_reports_stale() {
        let sandbox = Sandbox::new();
        let target = sandbox.path().join("old");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join(".session-lock"), "1600000000:other-host:42\n").unwrap();

        sandbox
            .trunkguard()
            .args(["lock", "status", target.to_str().unwrap()])
            .assert()
            .success()
            .stdout(predicate::str::contains("stale"))
            .stdout(predicate::str::contains("other-host"));
    }

    #[test]
    fn test_touching_a_missing_path_fails() {
        let sandbox = Sandbox::new();
        sandbox
            .trunkguard()
            .args(["lock", "touch", sandbox.path().join("nope").to_str().unwrap()])
            .assert()
            .failure();
    }
}

// =============================================================================
// Status Digest Tests
// =============================================================================

mod status_digest {
    use super::*;

    #[test]
    fn test_no_reports_is_healthy() {
        let sandbox = Sandbox::new();
        sandbox
            .trunkguard()
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("trunkguard OK"));
    }

    #[test]
    fn test_failed_items_surface_in_digest() {
        let sandbox = Sandbox::new();
        let reports = sandbox.state_dir().join("reports");
        fs::create_dir_all(&reports).unwrap();
        fs::write(
            reports.join("gc.json"),
            r#"{
                "run_id": "6f1c1f34-3c7a-4a38-9a51-6f0e8e1f4d2a",
                "component": "gc",
                "host": "ci-host",
                "dry_run": false,
                "started_at": "2026-10-18T10:00:00Z",
                "finished_at": "2026-10-18T10:01:00Z",
                "items": [
                    {"target": "task-3/app", "outcome": "escalated", "decision": "escalate", "detail": "dirty and stale"}
                ],
                "counts": {
                    "processed": 1, "acted": 0, "skipped": 0, "failed": 0, "escalated": 1,
                    "dirty_stale": 1, "deferred_prs": 0, "invariant_violations": 0
                }
            }"#,
        )
        .unwrap();

        sandbox
            .trunkguard()
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("trunkguard ATTENTION"))
            .stdout(predicate::str::contains("dirty_stale=1"))
            .stdout(predicate::str::contains("task-3/app"));
    }
}

// =============================================================================
// Component Run Tests
// =============================================================================

mod component_runs {
    use super::*;

    #[test]
    fn test_gc_dry_run_on_empty_root() {
        if !git_available() {
            return;
        }
        let sandbox = Sandbox::new();
        sandbox
            .trunkguard()
            .args(["gc", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("nothing would change"))
            .stdout(predicate::str::contains("gc: processed=0"));
        // Dry runs never leave a report behind.
        assert!(!sandbox.state_dir().join("reports/gc.json").exists());
    }

    #[test]
    fn test_queue_enforce_is_skipped_on_followers() {
        if !git_available() {
            return;
        }
        let sandbox = Sandbox::new();
        sandbox
            .trunkguard()
            .arg("queue-enforce")
            .assert()
            .success()
            .stdout(predicate::str::contains("leader only"));
    }

    #[test]
    fn test_cleanup_of_unknown_task_is_a_noop() {
        let sandbox = Sandbox::new();
        sandbox
            .trunkguard()
            .args(["cleanup", "task-404", "--yes"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No workspaces"));
    }

    #[test]
    fn test_cleanup_rejects_path_like_task_ids() {
        let sandbox = Sandbox::new();
        sandbox
            .trunkguard()
            .args(["cleanup", "../etc", "--yes"])
            .assert()
            .failure();
    }

    #[test]
    fn test_reconcile_unknown_repo_fails() {
        if !git_available() {
            return;
        }
        let sandbox = Sandbox::new();
        sandbox
            .trunkguard()
            .args(["reconcile", "--repo", "ghost"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("ghost"));
    }
}

// =============================================================================
// End-to-end Scenarios (real git, local bare remote)
// =============================================================================

mod end_to_end {
    use super::*;

    #[test]
    fn test_reconcile_rescues_dirty_canonical_before_reset() {
        if !git_available() {
            return;
        }
        let sandbox = Sandbox::new();
        let remote = seeded_remote(sandbox.path(), None);
        let canonical = sandbox.canonical_root().join("app");
        clone(&remote, &canonical);

        fs::write(canonical.join("README.md"), "edited in place\n").unwrap();
        fs::write(canonical.join("notes.txt"), "scratch\n").unwrap();

        sandbox
            .trunkguard()
            .arg("reconcile")
            .assert()
            .success()
            .stdout(predicate::str::contains("reconcile: processed=1 acted=1"));

        // The dirty content is on the remote before anything was discarded.
        let refs = git(
            &remote,
            &["for-each-ref", "--format=%(refname:short)", "refs/heads/"],
        );
        let rescue = refs
            .lines()
            .find(|name| name.starts_with("rescue-ci-host-app-"))
            .expect("rescue branch pushed")
            .to_string();
        let files = git(&remote, &["ls-tree", "-r", "--name-only", &rescue]);
        assert!(files.contains("notes.txt"));
        let readme = git(&remote, &["show", &format!("{}:README.md", rescue)]);
        assert_eq!(readme, "edited in place\n");

        // The canonical clone is back on a clean trunk.
        assert_eq!(git(&canonical, &["status", "--porcelain"]), "");
        assert_eq!(
            fs::read_to_string(canonical.join("README.md")).unwrap(),
            "hello\n"
        );
        assert!(!canonical.join("notes.txt").exists());

        // The journal holds the push before the reset.
        let journal = fs::read_to_string(sandbox.state_dir().join("journal.jsonl")).unwrap();
        let push = journal.find("\"action\":\"rescue_push\"").expect("rescue push journaled");
        let reset = journal.find("\"action\":\"reset\"").expect("reset journaled");
        assert!(push < reset);

        // A second run has nothing left to do.
        sandbox
            .trunkguard()
            .arg("reconcile")
            .assert()
            .success()
            .stdout(predicate::str::contains("reconcile: processed=1 acted=0"));
    }

    #[test]
    fn test_reconcile_keeps_local_trunk_commits_when_on_another_branch() {
        if !git_available() {
            return;
        }
        let sandbox = Sandbox::new();
        let remote = seeded_remote(sandbox.path(), None);
        let canonical = sandbox.canonical_root().join("app");
        clone(&remote, &canonical);

        fs::write(canonical.join("precious.txt"), "never pushed\n").unwrap();
        git(&canonical, &["add", "precious.txt"]);
        git(&canonical, &["commit", "-m", "local trunk work"]);
        let precious = git(&canonical, &["rev-parse", "HEAD"]).trim().to_string();
        git(&canonical, &["checkout", "-b", "feature/y", "origin/master"]);

        sandbox
            .trunkguard()
            .arg("reconcile")
            .assert()
            .success()
            .stdout(predicate::str::contains("reconcile: processed=1 acted=1"));

        let holders = git(
            &remote,
            &["branch", "--format=%(refname:short)", "--contains", &precious],
        );
        assert!(
            holders
                .lines()
                .any(|name| name.starts_with("rescue-ci-host-app-") && name.ends_with("-trunk-commits")),
            "{holders}"
        );
        assert_eq!(git(&canonical, &["rev-parse", "--abbrev-ref", "HEAD"]).trim(), "master");
    }

    #[test]
    fn test_reconcile_respects_fresh_session_lock() {
        if !git_available() {
            return;
        }
        let sandbox = Sandbox::new();
        let remote = seeded_remote(sandbox.path(), None);
        let canonical = sandbox.canonical_root().join("app");
        clone(&remote, &canonical);
        fs::write(canonical.join("notes.txt"), "agent at work\n").unwrap();

        sandbox
            .trunkguard()
            .args(["lock", "touch", canonical.to_str().unwrap()])
            .assert()
            .success();
        sandbox
            .trunkguard()
            .arg("reconcile")
            .assert()
            .success()
            .stdout(predicate::str::contains("skipped=1"));

        assert!(canonical.join("notes.txt").exists());
    }

    #[test]
    fn test_gc_deletes_merged_workspace_after_cooldown() {
        if !git_available() {
            return;
        }
        let sandbox = Sandbox::new();
        let remote = seeded_remote(sandbox.path(), Some("2020-01-01T00:00:00Z"));
        let merged = sandbox.workspace_root().join("task-9").join("app");
        clone(&remote, &merged);
        let busy = sandbox.workspace_root().join("task-10").join("app");
        clone(&remote, &busy);
        fs::write(busy.join("wip.txt"), "still going\n").unwrap();
        sandbox
            .trunkguard()
            .args(["lock", "touch", busy.to_str().unwrap()])
            .assert()
            .success();

        sandbox
            .trunkguard()
            .args(["gc", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("would perform"))
            .stdout(predicate::str::contains("task-9/app"));
        assert!(merged.exists());

        sandbox.trunkguard().arg("gc").assert().success();
        assert!(!merged.exists());
        assert!(!sandbox.workspace_root().join("task-9").exists());
        assert!(busy.join("wip.txt").exists());
        assert!(sandbox.state_dir().join("reports/gc.json").exists());
    }
}
