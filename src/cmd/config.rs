//! Configuration view and validation: `gridrun config`.

use crate::ConfigCommands;
use anyhow::{Context, Result, bail};
use gridrun::BridgeConfig;
use gridrun::config::CONFIG_FILE_NAME;
use std::path::Path;

pub fn cmd_config(root_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = root_dir.join(CONFIG_FILE_NAME);
    let config = BridgeConfig::load(root_dir)?;

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", console::style("gridrun configuration").bold());
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found, using defaults", config_path.display());
            }
            println!("Root dir:    {}", config.root_dir.display());
            println!();
            println!("Effective values (with env overrides):");
            let rendered = toml::to_string_pretty(&config.to_toml())
                .context("Failed to render configuration")?;
            for line in rendered.lines() {
                println!("  {}", line);
            }
            println!();
        }
        Some(ConfigCommands::Validate) => {
            let problems = config.validate();
            if problems.is_empty() {
                println!("{} Configuration is valid", console::style("✓").green());
            } else {
                for problem in &problems {
                    println!("{} {}", console::style("✗").red(), problem);
                }
                bail!("{} configuration problem(s) found", problems.len());
            }
        }
    }

    Ok(())
}
