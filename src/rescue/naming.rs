use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;

use crate::util::{compact_timestamp, slugify};

// Ticket-style keys such as `PROJ-123` or `task-7`
static CORRELATION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b([a-z][a-z0-9]*-\d+)\b").unwrap());

pub const RESCUE_PREFIX: &str = "rescue-";

/// `rescue-<host>-<repo>-<timestamp>`
pub fn rescue_branch_name(host: &str, repo: &str, at: DateTime<Utc>) -> String {
    let host = non_empty(slugify(host, 40), "host");
    let repo = non_empty(slugify(repo, 40), "repo");
    format!("{}{}-{}-{}", RESCUE_PREFIX, host, repo, compact_timestamp(at))
}

fn non_empty(slug: String, fallback: &str) -> String {
    if slug.is_empty() {
        fallback.to_string()
    } else {
        slug
    }
}

/// Key tying a rescue back to its task: the first ticket-like token in the
/// branch name, else the slugged branch, else `detached`.
pub fn correlation_key(branch: Option<&str>) -> String {
    let Some(branch) = branch else {
        return "detached".to_string();
    };
    if let Some(found) = CORRELATION_REGEX.captures(branch).and_then(|c| c.get(1)) {
        return found.as_str().to_string();
    }
    non_empty(slugify(branch, 60), "detached")
}

pub fn rescue_commit_message(
    repo: &str,
    origin_branch: Option<&str>,
    host: &str,
    paths: usize,
) -> String {
    let origin = origin_branch.unwrap_or("(detached HEAD)");
    format!(
        "trunkguard rescue: {} from {}\n\norigin-branch: {}\ncorrelation: {}\nhost: {}\npaths: {}\n",
        repo,
        origin,
        origin,
        correlation_key(origin_branch),
        host,
        paths
    )
}
