//! Merge-queue hygiene: `trunkguard queue-enforce`.

use anyhow::Result;
use chrono::Utc;
use console::style;
use tracing::info;

use trunkguard::audit::Component;
use trunkguard::config::Config;
use trunkguard::guard_config::Role;
use trunkguard::inspector::Inspector;
use trunkguard::layout::canonical_repositories;
use trunkguard::queue::QueueHygieneEnforcer;

use super::RunContext;

pub async fn cmd_queue_enforce(config: Config, dry_run: bool) -> Result<()> {
    let role = config.role;
    let Some(ctx) = RunContext::open(config, Component::QueueEnforce, dry_run).await? else {
        return Ok(());
    };

    if role != Role::Leader {
        info!(role = %role, "queue enforcement runs on the leader only, skipping");
        println!(
            "{} queue-enforce runs on the leader only (this host is a {})",
            style("skipped:").yellow(),
            role
        );
        let mut report = ctx.new_report(Component::QueueEnforce);
        report.skip_run(&format!("role is {}", role));
        return ctx.finish(report);
    }

    let code_host = ctx.require_code_host().await?;
    let repos = canonical_repositories(&ctx.config)?;
    let inspector = Inspector::new();
    let enforcer = QueueHygieneEnforcer::new(
        &ctx.config.queue,
        &code_host,
        &ctx.git,
        &inspector,
        &ctx.journal,
    );

    let mut report = ctx.new_report(Component::QueueEnforce);
    enforcer.run(&repos, &mut report, Utc::now()).await;
    ctx.finish(report)
}
