//! File-level configuration for trunkguard.
//!
//! Reads `config.toml` (see [`crate::config::Config::locate`] for the search
//! order). Every field has a default so an absent file is a valid setup.
//!
//! # Configuration File Format
//!
//! ```toml
//! [paths]
//! canonical_root = "~/src/canonical"
//! workspace_root = "~/src/tasks"
//! state_dir = "~/.local/state/trunkguard"
//!
//! [[repos]]
//! name = "repo-x"
//! trunk = "main"
//!
//! [gc]
//! cooldown_hours = 24
//! archive_after_hours = 168
//!
//! [janitor]
//! pr_budget = 3
//!
//! [queue]
//! update_after_hours = 6
//! stuck_after_hours = 72
//! rescue_branch_patterns = ["^rescue-", "^stash-evac"]
//! pr_list_limit = 500
//!
//! [controller]
//! role = "leader"
//!
//! [network]
//! timeout_secs = 60
//!
//! [logging]
//! format = "text"
//! file = true
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::github::DEFAULT_PR_LIST_LIMIT;

/// Which writer this host is for cross-host side effects.
///
/// Only a `leader` runs the queue hygiene pass; every host may reconcile and
/// collect its own workspaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Leader,
    #[default]
    Follower,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Leader => write!(f, "leader"),
            Role::Follower => write!(f, "follower"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "leader" | "controller" => Ok(Role::Leader),
            "follower" => Ok(Role::Follower),
            _ => anyhow::bail!("Invalid role '{}'. Valid values: leader, follower", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    /// Defaults to `<state_dir>/archive`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_dir: Option<PathBuf>,
}

/// One canonical repository under `canonical_root`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoEntry {
    pub name: String,
    /// Trunk branch; discovered from the remote when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trunk: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcSection {
    /// Merged workspaces younger than this are kept
    #[serde(default = "default_cooldown_hours")]
    pub cooldown_hours: u64,
    /// Unmerged workspaces older than this are archived (clean) or escalated (dirty)
    #[serde(default = "default_archive_after_hours")]
    pub archive_after_hours: u64,
}

fn default_cooldown_hours() -> u64 {
    24
}

fn default_archive_after_hours() -> u64 {
    168
}

impl Default for GcSection {
    fn default() -> Self {
        Self {
            cooldown_hours: default_cooldown_hours(),
            archive_after_hours: default_archive_after_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JanitorSection {
    /// Maximum draft pull requests created per run
    #[serde(default = "default_pr_budget")]
    pub pr_budget: usize,
}

fn default_pr_budget() -> usize {
    3
}

impl Default for JanitorSection {
    fn default() -> Self {
        Self {
            pr_budget: default_pr_budget(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSection {
    #[serde(default = "default_update_after_hours")]
    pub update_after_hours: u64,
    #[serde(default = "default_stuck_after_hours")]
    pub stuck_after_hours: u64,
    #[serde(default = "default_rescue_branch_patterns")]
    pub rescue_branch_patterns: Vec<String>,
    /// Records requested per `gh pr list` call
    #[serde(default = "default_pr_list_limit")]
    pub pr_list_limit: usize,
}

fn default_pr_list_limit() -> usize {
    DEFAULT_PR_LIST_LIMIT
}

fn default_update_after_hours() -> u64 {
    6
}

fn default_stuck_after_hours() -> u64 {
    72
}

pub fn default_rescue_branch_patterns() -> Vec<String> {
    vec!["^rescue-".to_string(), "^stash-evac".to_string()]
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            update_after_hours: default_update_after_hours(),
            stuck_after_hours: default_stuck_after_hours(),
            rescue_branch_patterns: default_rescue_branch_patterns(),
            pr_list_limit: default_pr_list_limit(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerSection {
    #[serde(default)]
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutSection {
    pub timeout_secs: u64,
}

fn default_network_timeout() -> TimeoutSection {
    TimeoutSection { timeout_secs: 60 }
}

fn default_local_timeout() -> TimeoutSection {
    TimeoutSection { timeout_secs: 300 }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
    /// Also write a daily-rolling log under `<state_dir>/logs`
    #[serde(default)]
    pub file: bool,
}

/// The complete config.toml structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardToml {
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub repos: Vec<RepoEntry>,
    #[serde(default)]
    pub gc: GcSection,
    #[serde(default)]
    pub janitor: JanitorSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub controller: ControllerSection,
    #[serde(default = "default_network_timeout")]
    pub network: TimeoutSection,
    #[serde(default = "default_local_timeout")]
    pub local: TimeoutSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl Default for GuardToml {
    fn default() -> Self {
        Self {
            paths: PathsSection::default(),
            repos: Vec::new(),
            gc: GcSection::default(),
            janitor: JanitorSection::default(),
            queue: QueueSection::default(),
            controller: ControllerSection::default(),
            network: default_network_timeout(),
            local: default_local_timeout(),
            logging: LoggingSection::default(),
        }
    }
}

impl GuardToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid trunkguard configuration")
    }

    /// Load from `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Non-fatal problems worth showing to a human.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.gc.cooldown_hours >= self.gc.archive_after_hours {
            warnings.push(format!(
                "gc.cooldown_hours ({}) >= gc.archive_after_hours ({}): merged workspaces will outlive unmerged ones",
                self.gc.cooldown_hours, self.gc.archive_after_hours
            ));
        }
        if self.janitor.pr_budget == 0 {
            warnings.push(
                "janitor.pr_budget is 0: no draft pull requests will ever be created".to_string(),
            );
        }
        if self.queue.update_after_hours >= self.queue.stuck_after_hours {
            warnings.push(format!(
                "queue.update_after_hours ({}) >= queue.stuck_after_hours ({}): branch updates will never be requested",
                self.queue.update_after_hours, self.queue.stuck_after_hours
            ));
        }
        if self.queue.pr_list_limit == 0 {
            warnings.push("queue.pr_list_limit is 0: no pull requests will be listed".to_string());
        }
        for pattern in &self.queue.rescue_branch_patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                warnings.push(format!("queue.rescue_branch_patterns: invalid regex '{}': {}", pattern, e));
            }
        }
        if self.network.timeout_secs == 0 {
            warnings.push("network.timeout_secs is 0: every remote call will time out".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for repo in &self.repos {
            if !seen.insert(repo.name.as_str()) {
                warnings.push(format!("repos: '{}' is listed more than once", repo.name));
            }
            if repo.name.contains('/') || repo.name.is_empty() {
                warnings.push(format!(
                    "repos: '{}' must be a single directory name under canonical_root",
                    repo.name
                ));
            }
        }

        warnings
    }
}
