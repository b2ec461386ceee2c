//! Explicit task teardown: `trunkguard cleanup <task-id>`.

use anyhow::Result;
use console::style;
use dialoguer::Confirm;

use trunkguard::audit::Component;
use trunkguard::cleanup::TaskCleanup;
use trunkguard::config::Config;
use trunkguard::gc::WorkspaceDisposer;
use trunkguard::inspector::Inspector;
use trunkguard::layout::canonical_repositories;
use trunkguard::lock::SessionLockManager;
use trunkguard::rescue::RescueEvacuator;

use super::RunContext;

pub async fn cmd_cleanup(
    config: Config,
    task_id: &str,
    dry_run: bool,
    force: bool,
    yes: bool,
) -> Result<()> {
    let targets = TaskCleanup::targets(&config.workspace_root, task_id)?;
    if targets.is_empty() {
        println!("No workspaces for task '{}'", task_id);
        return Ok(());
    }

    if !dry_run && !yes {
        println!("Workspaces of task '{}':", task_id);
        for ws in &targets {
            println!("  {}", ws.path.display());
        }
        let prompt = if force {
            "Remove them, evacuating any unpushed work first?"
        } else {
            "Remove them?"
        };
        let confirm = Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirm {
            println!("Cleanup cancelled");
            return Ok(());
        }
    }

    let Some(ctx) = RunContext::open(config, Component::Cleanup, dry_run).await? else {
        return Ok(());
    };

    let canonicals = canonical_repositories(&ctx.config)?;
    let inspector = Inspector::new();
    let locks = SessionLockManager::new(&ctx.config.host);
    let scratch = ctx.config.rescue_dir();
    let cleanup = TaskCleanup::new(
        &canonicals,
        &inspector,
        &locks,
        RescueEvacuator::new(&ctx.git, &ctx.journal, &ctx.config.host, &scratch),
        WorkspaceDisposer::new(&ctx.git, &ctx.journal, &ctx.config.host, &ctx.config.archive_dir),
    );

    let mut report = ctx.new_report(Component::Cleanup);
    cleanup
        .run(&ctx.config.workspace_root, task_id, force, &mut report)
        .await?;

    let refused = report.counts.skipped;
    ctx.finish(report)?;
    if refused > 0 && !force {
        println!(
            "{} {} workspace(s) kept; rerun with --force to evacuate and remove them",
            style("note:").cyan(),
            refused
        );
    }
    Ok(())
}
