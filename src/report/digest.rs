use super::{ItemOutcome, ItemReport, RunReport};
use crate::errors::ErrorKind;

/// Upper bound on digest length when something needs attention.
pub const MAX_DIGEST_LINES: usize = 6;

/// Render the status block consumed by the heartbeat surface: one line when
/// healthy, at most [`MAX_DIGEST_LINES`] otherwise.
pub fn render_digest(reports: &[RunReport]) -> Vec<String> {
    let dirty_stale: usize = reports.iter().map(|r| r.counts.dirty_stale).sum();
    let escalated: usize = reports.iter().map(|r| r.counts.escalated).sum();
    let deferred: usize = reports.iter().map(|r| r.counts.deferred_prs).sum();
    let counts = format!(
        "dirty_stale={} escalated={} deferred_prs={}",
        dirty_stale, escalated, deferred
    );

    if reports.iter().all(RunReport::is_healthy) {
        return vec![format!("trunkguard OK {}", counts)];
    }

    let mut lines = vec![format!("trunkguard ATTENTION {}", counts)];

    let mut notable: Vec<(u8, String)> = reports
        .iter()
        .flat_map(|report| {
            report
                .items
                .iter()
                .filter_map(move |item| severity(item).map(|rank| (rank, describe(report, item))))
        })
        .collect();
    notable.sort_by_key(|(rank, _)| *rank);

    let room = MAX_DIGEST_LINES - 1;
    if notable.len() > room {
        let hidden = notable.len() - (room - 1);
        lines.extend(notable.into_iter().take(room - 1).map(|(_, line)| line));
        lines.push(format!("... {} more, see `trunkguard status --verbose`", hidden));
    } else {
        lines.extend(notable.into_iter().map(|(_, line)| line));
    }
    lines
}

fn severity(item: &ItemReport) -> Option<u8> {
    match (item.outcome, item.error_kind) {
        (_, Some(ErrorKind::InvariantViolation)) => Some(0),
        (ItemOutcome::Escalated, _) => Some(1),
        (ItemOutcome::Failed, _) => Some(2),
        (ItemOutcome::Deferred, _) => Some(3),
        _ => None,
    }
}

fn describe(report: &RunReport, item: &ItemReport) -> String {
    let label = match (item.outcome, item.error_kind) {
        (_, Some(ErrorKind::InvariantViolation)) => "INVARIANT",
        (ItemOutcome::Escalated, _) => "escalated",
        (ItemOutcome::Failed, _) => "failed",
        _ => "deferred",
    };
    let mut line = format!("{} {} {}", report.component, label, item.target);
    if let Some(detail) = &item.detail {
        let short: String = detail.chars().take(80).collect();
        line.push_str(": ");
        line.push_str(&short);
    }
    line
}
