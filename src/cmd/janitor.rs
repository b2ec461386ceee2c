//! Workspace durability sweep: `trunkguard janitor`.

use anyhow::Result;
use tracing::info;

use trunkguard::audit::Component;
use trunkguard::config::Config;
use trunkguard::inspector::Inspector;
use trunkguard::janitor::{DurabilityJanitor, PrBudget};
use trunkguard::layout::canonical_repositories;

use super::RunContext;

pub async fn cmd_janitor(config: Config, dry_run: bool) -> Result<()> {
    let Some(ctx) = RunContext::open(config, Component::Janitor, dry_run).await? else {
        return Ok(());
    };
    let code_host = ctx.require_code_host().await?;

    let canonicals = canonical_repositories(&ctx.config)?;
    let inspector = Inspector::new();
    let janitor = DurabilityJanitor::new(
        &canonicals,
        &inspector,
        &ctx.git,
        &code_host,
        &ctx.journal,
        &ctx.config.host,
    );

    let mut budget = PrBudget::new(ctx.config.pr_budget);
    info!(budget = ctx.config.pr_budget, dry_run, "janitor starting");
    let mut report = ctx.new_report(Component::Janitor);
    janitor
        .run(&ctx.config.workspace_root, &mut budget, &mut report)
        .await;
    ctx.finish(report)
}
