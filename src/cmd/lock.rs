//! Session lock management: `trunkguard lock touch|clear|status <path>`.

use anyhow::Result;
use chrono::Utc;
use console::style;

use trunkguard::config::Config;
use trunkguard::lock::{FRESH_THRESHOLD_HOURS, Freshness, SessionLockManager};
use trunkguard::util::hours_between;

use super::super::LockCommands;

pub fn cmd_lock(config: &Config, command: LockCommands) -> Result<()> {
    let locks = SessionLockManager::new(&config.host);

    match command {
        LockCommands::Touch { path } => {
            let lock = locks.touch(&path)?;
            println!(
                "Locked {} ({}, pid {}, fresh for {}h)",
                path.display(),
                lock.host,
                lock.pid,
                FRESH_THRESHOLD_HOURS
            );
        }
        LockCommands::Clear { path } => {
            if locks.clear(&path)? {
                println!("Cleared session lock on {}", path.display());
            } else {
                println!("No session lock on {}", path.display());
            }
        }
        LockCommands::Status { path } => {
            let now = Utc::now();
            let line = match locks.freshness_at(&path, now) {
                Freshness::Fresh { lock } => format!(
                    "{} held by {} (pid {}), touched {}h ago",
                    style("fresh").red(),
                    lock.host,
                    lock.pid,
                    hours_between(lock.timestamp, now)
                ),
                Freshness::IndexLocked => {
                    format!("{} git index.lock present", style("in use").red())
                }
                Freshness::Stale { lock } => format!(
                    "{} last touched by {} {}h ago",
                    style("stale").green(),
                    lock.host,
                    hours_between(lock.timestamp, now)
                ),
                Freshness::Absent => format!("{}", style("unlocked").green()),
                Freshness::Unreadable { reason } => {
                    format!("{} treated as in use: {}", style("unreadable").red(), reason)
                }
            };
            println!("{}: {}", path.display(), line);
        }
    }
    Ok(())
}
