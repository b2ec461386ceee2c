//! Canonical clone reconciliation: `trunkguard reconcile`.

use anyhow::Result;
use tracing::info;

use trunkguard::audit::Component;
use trunkguard::config::Config;
use trunkguard::errors::GuardError;
use trunkguard::inspector::Inspector;
use trunkguard::layout::canonical_repositories;
use trunkguard::lock::SessionLockManager;
use trunkguard::reconcile::CanonicalReconciler;

use super::RunContext;

pub async fn cmd_reconcile(config: Config, dry_run: bool, only: Option<&str>) -> Result<()> {
    let Some(ctx) = RunContext::open(config, Component::Reconcile, dry_run).await? else {
        return Ok(());
    };

    let mut repos = canonical_repositories(&ctx.config)?;
    if let Some(name) = only {
        repos.retain(|repo| repo.name == name);
        if repos.is_empty() {
            return Err(GuardError::Configuration(format!(
                "no canonical repository named '{}' under {}",
                name,
                ctx.config.canonical_root.display()
            ))
            .into());
        }
    }
    info!(repos = repos.len(), dry_run, "reconciling canonical repositories");

    let inspector = Inspector::new();
    let locks = SessionLockManager::new(&ctx.config.host);
    let scratch = ctx.config.rescue_dir();
    let reconciler = CanonicalReconciler::new(
        &ctx.git,
        &inspector,
        &locks,
        &ctx.journal,
        &ctx.config.host,
        &scratch,
    );

    let mut report = ctx.new_report(Component::Reconcile);
    reconciler.reconcile_all(&repos, &mut report).await;
    ctx.finish(report)
}
