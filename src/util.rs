//! Shared utility functions for trunkguard.

use chrono::{DateTime, Utc};
use std::process::Command;

/// Convert free text to a ref-safe slug, limited to `max_len` characters.
pub fn slugify(text: &str, max_len: usize) -> String {
    let slug: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    }
}

/// Name of the acting host. `TRUNKGUARD_HOST` wins so runs are attributable
/// even inside containers with random hostnames.
pub fn resolve_hostname() -> String {
    for var in ["TRUNKGUARD_HOST", "HOSTNAME", "COMPUTERNAME"] {
        if let Ok(value) = std::env::var(var) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }

    Command::new("hostname")
        .output()
        .ok()
        .filter(|out| out.status.success())
        .map(|out| String::from_utf8_lossy(&out.stdout).trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown-host".to_string())
}

/// Compact UTC stamp used in branch and archive names, e.g. `20261018T142501Z`.
pub fn compact_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%SZ").to_string()
}

/// Whole hours elapsed between `since` and `now`, clamped at zero.
pub fn hours_between(since: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - since).num_hours().max(0)
}
