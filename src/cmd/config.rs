//! Configuration view and validation commands: `trunkguard config`.

use anyhow::Result;
use console::style;
use std::path::Path;

use trunkguard::config::Config;
use trunkguard::guard_config::GuardToml;

use super::super::ConfigCommands;

pub fn cmd_config(explicit: Option<&Path>, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = Config::locate(explicit);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("trunkguard configuration");
            println!("========================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No config file at {} (using defaults)", config_path.display());
            }
            println!();

            let config = Config::load(explicit)?;
            println!("[paths]");
            println!("  canonical_root = \"{}\"", config.canonical_root.display());
            println!("  workspace_root = \"{}\"", config.workspace_root.display());
            println!("  state_dir = \"{}\"", config.state_dir.display());
            println!("  archive_dir = \"{}\"", config.archive_dir.display());
            println!();

            if config.repos.is_empty() {
                println!("[repos] every git checkout under canonical_root");
            } else {
                println!("[[repos]]");
                for repo in &config.repos {
                    match &repo.trunk {
                        Some(trunk) => println!("  {} (trunk = \"{}\")", repo.name, trunk),
                        None => println!("  {}", repo.name),
                    }
                }
            }
            println!();

            println!("[gc]");
            println!("  cooldown_hours = {}", config.gc.cooldown_hours);
            println!("  archive_after_hours = {}", config.gc.archive_after_hours);
            println!("[janitor]");
            println!("  pr_budget = {}", config.pr_budget);
            println!("[queue]");
            println!("  update_after_hours = {}", config.queue.update_after_hours());
            println!("  stuck_after_hours = {}", config.queue.stuck_after_hours());
            println!("  pr_list_limit = {}", config.pr_list_limit);
            println!("[controller]");
            println!("  role = \"{}\"", config.role);
            println!("[network]");
            println!("  timeout_secs = {}", config.network_timeout.as_secs());
            println!("[local]");
            println!("  timeout_secs = {}", config.local_timeout.as_secs());
            println!();
            println!("Acting host: {}", config.host);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No config file found. Using defaults (valid).");
                return Ok(());
            }

            let toml = GuardToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("{}", style("Configuration is valid.").green());
            } else {
                println!("{}", style("Configuration warnings:").yellow());
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("Config already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            GuardToml::default().save(&config_path)?;

            println!("Created {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [paths] canonical_root, workspace_root, state_dir");
            println!("  - [[repos]] name, trunk");
            println!("  - [controller] role = \"leader\" on exactly one host");
            println!();
        }
    }

    Ok(())
}
