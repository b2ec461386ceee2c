//! Health digest: `trunkguard status`.

use anyhow::Result;
use console::style;

use trunkguard::config::Config;
use trunkguard::report::{RunReport, render_digest};

use super::print_report;

/// Print the digest; `verbose` adds every component's latest report.
pub fn cmd_status(config: &Config, verbose: bool) -> Result<()> {
    let reports = RunReport::load_all(&config.reports_dir())?;

    for (i, line) in render_digest(&reports).into_iter().enumerate() {
        if i == 0 && reports.iter().all(RunReport::is_healthy) {
            println!("{}", style(line).green());
        } else if i == 0 {
            println!("{}", style(line).yellow().bold());
        } else {
            println!("{}", line);
        }
    }

    if verbose {
        if reports.is_empty() {
            println!();
            println!("No run reports in {}", config.reports_dir().display());
        }
        for report in &reports {
            println!();
            let finished = report
                .finished_at
                .map(|at| at.format("%Y-%m-%d %H:%M UTC").to_string())
                .unwrap_or_else(|| "unfinished".to_string());
            println!("{} on {}, {}", report.component, report.host, finished);
            print_report(report, true);
        }
    }
    Ok(())
}
