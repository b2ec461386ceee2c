//! Test doubles and git fixtures shared by the unit tests.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Output};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use git2::{Oid, Repository, RepositoryInitOptions, Signature};

use crate::errors::GuardError;
use crate::exec::{CommandRunner, Invocation};
use crate::github::{CodeHost, PullRequestRecord};

type Responder = Box<dyn Fn(&Invocation) -> io::Result<Output> + Send + Sync>;

/// A [`CommandRunner`] that answers from a closure and records every call.
pub struct ScriptedRunner {
    respond: Responder,
    calls: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new(respond: impl Fn(&Invocation) -> io::Result<Output> + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every command succeeds with empty output.
    pub fn ok() -> Self {
        Self::new(|_| Ok(success("")))
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls rendered as `program arg...`, handy for ordering assertions.
    pub fn rendered(&self) -> Vec<String> {
        self.calls().iter().map(Invocation::render).collect()
    }

    /// Index of the first rendered call containing `needle`.
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.rendered().iter().position(|c| c.contains(needle))
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation) -> io::Result<Output> {
        self.calls.lock().unwrap().push(invocation.clone());
        (self.respond)(invocation)
    }
}

pub fn success(stdout: &str) -> Output {
    Output {
        status: ExitStatus::from_raw(0),
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
    }
}

pub fn failure(stderr: &str) -> Output {
    Output {
        // Raw wait status: exit code 1
        status: ExitStatus::from_raw(1 << 8),
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

// ── git fixtures ─────────────────────────────────────────────────────

/// A repository on `master` with a committer identity configured.
pub fn init_repo(dir: &Path) -> Repository {
    let mut opts = RepositoryInitOptions::new();
    opts.initial_head("master");
    let repo = Repository::init_opts(dir, &opts).unwrap();
    let mut config = repo.config().unwrap();
    config.set_str("user.name", "test").unwrap();
    config.set_str("user.email", "test@test.com").unwrap();
    drop(config);
    repo
}

/// Write `name`, stage everything and commit on HEAD.
pub fn commit_file(dir: &Path, name: &str, content: &str, msg: &str) -> Oid {
    let repo = Repository::open(dir).unwrap();
    let file_path = dir.join(name);
    if let Some(parent) = file_path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&file_path, content).unwrap();
    let mut index = repo.index().unwrap();
    index.add_path(Path::new(name)).unwrap();
    index.write().unwrap();
    let tree_id = index.write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    let sig = Signature::now("test", "test@test.com").unwrap();
    match repo.head().ok().and_then(|h| h.peel_to_commit().ok()) {
        Some(parent) => repo
            .commit(Some("HEAD"), &sig, &sig, msg, &tree, &[&parent])
            .unwrap(),
        None => repo.commit(Some("HEAD"), &sig, &sig, msg, &tree, &[]).unwrap(),
    }
}

/// Point `refs/remotes/origin/<branch>` at `oid`, as a fetch would.
pub fn set_remote_ref(dir: &Path, branch: &str, oid: Oid) {
    let repo = Repository::open(dir).unwrap();
    repo.reference(
        &format!("refs/remotes/origin/{}", branch),
        oid,
        true,
        "test fixture",
    )
    .unwrap();
}

/// Create and check out a local branch at HEAD.
pub fn checkout_new_branch(dir: &Path, name: &str) {
    let repo = Repository::open(dir).unwrap();
    let head = repo.head().unwrap().peel_to_commit().unwrap();
    repo.branch(name, &head, true).unwrap();
    repo.set_head(&format!("refs/heads/{}", name)).unwrap();
}

/// Create a local branch at `at` and force-check it out, as
/// `git checkout -b <name> <at>` would.
pub fn checkout_new_branch_at(dir: &Path, name: &str, at: Oid) {
    let repo = Repository::open(dir).unwrap();
    let commit = repo.find_commit(at).unwrap();
    repo.branch(name, &commit, true).unwrap();
    repo.checkout_tree(commit.as_object(), Some(git2::build::CheckoutBuilder::new().force()))
        .unwrap();
    repo.set_head(&format!("refs/heads/{}", name)).unwrap();
}

// ── code host ────────────────────────────────────────────────────────

/// One recorded pull-request operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    CreateDraft { head: String, base: String, title: String },
    RequestUpdate(u64),
    DisableAutoMerge(u64),
    Close(u64),
}

/// In-memory [`CodeHost`]: serves canned records and records mutations.
#[derive(Default)]
pub struct FakeCodeHost {
    pub records: Mutex<Vec<PullRequestRecord>>,
    pub calls: Mutex<Vec<HostCall>>,
    pub fail_reads: bool,
    pub fail_writes: bool,
    /// Draft creation fails for these head branches
    pub rejected_heads: Vec<String>,
}

impl FakeCodeHost {
    pub fn with_records(records: Vec<PullRequestRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: HostCall) -> Result<(), GuardError> {
        if self.fail_writes {
            return Err(GuardError::TransientIo("code host unavailable".into()));
        }
        self.calls.lock().unwrap().push(call);
        Ok(())
    }

    fn read_guard(&self) -> Result<(), GuardError> {
        if self.fail_reads {
            return Err(GuardError::TransientIo("code host unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CodeHost for FakeCodeHost {
    async fn pr_for_branch(
        &self,
        _repo_dir: &Path,
        branch: &str,
    ) -> Result<Option<PullRequestRecord>, GuardError> {
        self.read_guard()?;
        let matching: Vec<PullRequestRecord> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.head_ref_name == branch)
            .cloned()
            .collect();
        Ok(crate::github::select_for_branch(matching))
    }

    async fn list_open(&self, _repo_dir: &Path) -> Result<Vec<PullRequestRecord>, GuardError> {
        self.read_guard()?;
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.state == crate::github::PrState::Open)
            .cloned()
            .collect())
    }

    async fn create_draft(
        &self,
        _repo_dir: &Path,
        head: &str,
        base: &str,
        title: &str,
        _body: &str,
    ) -> Result<(), GuardError> {
        if self.rejected_heads.iter().any(|h| h == head) {
            return Err(GuardError::TransientIo(format!("cannot create PR for {}", head)));
        }
        self.record(HostCall::CreateDraft {
            head: head.to_string(),
            base: base.to_string(),
            title: title.to_string(),
        })
    }

    async fn request_update(&self, _repo_dir: &Path, number: u64) -> Result<(), GuardError> {
        self.record(HostCall::RequestUpdate(number))
    }

    async fn disable_auto_merge(&self, _repo_dir: &Path, number: u64) -> Result<(), GuardError> {
        self.record(HostCall::DisableAutoMerge(number))
    }

    async fn close_and_delete_branch(
        &self,
        _repo_dir: &Path,
        number: u64,
    ) -> Result<(), GuardError> {
        self.record(HostCall::Close(number))
    }
}

/// An open PR with the given merge fields, for queue and janitor tests.
pub fn pr(
    number: u64,
    head: &str,
    merge_state: &str,
    updated_at: DateTime<Utc>,
    auto_merge: bool,
) -> PullRequestRecord {
    let json = serde_json::json!({
        "number": number,
        "state": "OPEN",
        "headRefName": head,
        "mergeStateStatus": merge_state,
        "mergeable": if merge_state == "DIRTY" { "CONFLICTING" } else { "MERGEABLE" },
        "updatedAt": updated_at.to_rfc3339(),
        "autoMergeRequest": if auto_merge { serde_json::json!({"mergeMethod": "SQUASH"}) } else { serde_json::Value::Null },
    });
    serde_json::from_value(json).unwrap()
}
