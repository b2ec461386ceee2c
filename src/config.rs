use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::GuardError;
use crate::gc::GcPolicy;
use crate::guard_config::{GuardToml, LoggingSection, RepoEntry, Role};
use crate::queue::QueuePolicy;
use crate::util::resolve_hostname;

pub const ENV_CONFIG: &str = "TRUNKGUARD_CONFIG";
pub const ENV_ROLE: &str = "TRUNKGUARD_ROLE";
pub const ENV_CANONICAL_ROOT: &str = "TRUNKGUARD_CANONICAL_ROOT";
pub const ENV_WORKSPACE_ROOT: &str = "TRUNKGUARD_WORKSPACE_ROOT";
pub const ENV_STATE_DIR: &str = "TRUNKGUARD_STATE_DIR";

/// Runtime configuration for one invocation.
///
/// Bridges the file-level [`GuardToml`] with environment overrides and the
/// values only known at runtime (acting host, resolved directories). CLI
/// overrides are applied by the command layer with the `with_*` builders.
#[derive(Debug, Clone)]
pub struct Config {
    /// The file the settings came from, if any
    pub config_file: Option<PathBuf>,
    pub canonical_root: PathBuf,
    pub workspace_root: PathBuf,
    pub state_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub repos: Vec<RepoEntry>,
    pub gc: GcPolicy,
    pub pr_budget: usize,
    pub queue: QueuePolicy,
    pub pr_list_limit: usize,
    pub role: Role,
    pub host: String,
    pub network_timeout: Duration,
    pub local_timeout: Duration,
    pub logging: LoggingSection,
}

impl Config {
    /// Where the config file lives: explicit path, then `$TRUNKGUARD_CONFIG`,
    /// then `<config_dir>/trunkguard/config.toml`.
    pub fn locate(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Ok(path) = std::env::var(ENV_CONFIG)
            && !path.trim().is_empty()
        {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("trunkguard")
            .join("config.toml")
    }

    /// Load the config file (defaults when absent) and apply environment overrides.
    ///
    /// An explicitly named file that does not exist is an error; the default
    /// location is allowed to be missing.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = Self::locate(explicit);
        if explicit.is_some() && !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        let toml = GuardToml::load_or_default(&path)?;
        let config_file = path.exists().then_some(path);
        let config = Self::from_toml(toml, config_file, |key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Build from parsed TOML. `env` is the environment lookup, injectable for tests.
    pub fn from_toml(
        toml: GuardToml,
        config_file: Option<PathBuf>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, GuardError> {
        let env_path = |key: &str| {
            env(key)
                .filter(|v| !v.trim().is_empty())
                .map(|v| expand_home(Path::new(v.trim())))
        };

        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let canonical_root = env_path(ENV_CANONICAL_ROOT)
            .or_else(|| toml.paths.canonical_root.as_deref().map(expand_home))
            .unwrap_or_else(|| home.join("canonical"));
        let workspace_root = env_path(ENV_WORKSPACE_ROOT)
            .or_else(|| toml.paths.workspace_root.as_deref().map(expand_home))
            .unwrap_or_else(|| home.join("workspaces"));
        let state_dir = env_path(ENV_STATE_DIR)
            .or_else(|| toml.paths.state_dir.as_deref().map(expand_home))
            .unwrap_or_else(default_state_dir);
        let archive_dir = toml
            .paths
            .archive_dir
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| state_dir.join("archive"));

        let role = match env(ENV_ROLE).filter(|v| !v.trim().is_empty()) {
            Some(value) => value
                .parse::<Role>()
                .map_err(|e| GuardError::Configuration(format!("{}: {}", ENV_ROLE, e)))?,
            None => toml.controller.role,
        };

        let queue = QueuePolicy::new(
            toml.queue.update_after_hours,
            toml.queue.stuck_after_hours,
            &toml.queue.rescue_branch_patterns,
        )?;

        Ok(Self {
            config_file,
            canonical_root,
            workspace_root,
            state_dir,
            archive_dir,
            repos: toml.repos,
            gc: GcPolicy {
                cooldown_hours: toml.gc.cooldown_hours as i64,
                archive_after_hours: toml.gc.archive_after_hours as i64,
            },
            pr_budget: toml.janitor.pr_budget,
            queue,
            pr_list_limit: toml.queue.pr_list_limit,
            role,
            host: resolve_hostname(),
            network_timeout: Duration::from_secs(toml.network.timeout_secs),
            local_timeout: Duration::from_secs(toml.local.timeout_secs),
            logging: toml.logging,
        })
    }

    pub fn with_role(mut self, role: Option<Role>) -> Self {
        if let Some(role) = role {
            self.role = role;
        }
        self
    }

    pub fn with_pr_budget(mut self, budget: Option<usize>) -> Self {
        if let Some(budget) = budget {
            self.pr_budget = budget;
        }
        self
    }

    /// The canonical root must exist before any component runs.
    pub fn require_canonical_root(&self) -> Result<(), GuardError> {
        if !self.canonical_root.is_dir() {
            return Err(GuardError::Configuration(format!(
                "canonical root '{}' does not exist or is not a directory",
                self.canonical_root.display()
            )));
        }
        Ok(())
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.state_dir.join("reports")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.state_dir.join("journal.jsonl")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    /// Parent of the temporary worktrees the rescue evacuator creates.
    pub fn rescue_dir(&self) -> PathBuf {
        self.state_dir.join("rescue")
    }

    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            self.state_dir.clone(),
            self.reports_dir(),
            self.locks_dir(),
            self.rescue_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

fn default_state_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("trunkguard")
}

/// Expand a leading `~/` to the home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    path.to_path_buf()
}
