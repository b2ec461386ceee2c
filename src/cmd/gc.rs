//! Workspace garbage collection: `trunkguard gc`.

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use trunkguard::audit::Component;
use trunkguard::config::Config;
use trunkguard::gc::{WorkspaceDisposer, WorkspaceLifecycleController};
use trunkguard::github;
use trunkguard::inspector::Inspector;
use trunkguard::layout::canonical_repositories;
use trunkguard::lock::SessionLockManager;

use super::RunContext;

pub async fn cmd_gc(config: Config, dry_run: bool) -> Result<()> {
    let Some(ctx) = RunContext::open(config, Component::Gc, dry_run).await? else {
        return Ok(());
    };

    // Without `gh`, merged status comes from git ancestry alone.
    if let Err(e) = github::ensure_available(ctx.runner.as_ref()).await {
        warn!(error = %e, "code host unavailable, pull request status will not be consulted");
    }
    let code_host = ctx.code_host();

    let canonicals = canonical_repositories(&ctx.config)?;
    let inspector = Inspector::new();
    let locks = SessionLockManager::new(&ctx.config.host);
    let disposer = WorkspaceDisposer::new(&ctx.git, &ctx.journal, &ctx.config.host, &ctx.config.archive_dir);
    let controller = WorkspaceLifecycleController::new(
        &ctx.config.workspace_root,
        &canonicals,
        ctx.config.gc,
        &inspector,
        &locks,
        &code_host,
        disposer,
    );

    info!(
        root = %ctx.config.workspace_root.display(),
        cooldown_hours = ctx.config.gc.cooldown_hours,
        archive_after_hours = ctx.config.gc.archive_after_hours,
        dry_run,
        "collecting workspaces"
    );
    let mut report = ctx.new_report(Component::Gc);
    controller.run(&mut report, Utc::now()).await;
    ctx.finish(report)
}
