//! Configuration view and validation commands — `firmforge config`.

use std::path::Path;

use anyhow::Result;
use console::style;

use firmforge::config::Settings;

use super::super::ConfigCommands;

pub fn cmd_config(config_path: Option<&Path>, command: Option<ConfigCommands>) -> Result<()> {
    let settings = Settings::resolve(config_path)?;

    match command {
        None | Some(ConfigCommands::Show) => {
            print!("{}", settings.to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            let problems = settings.validate();
            if problems.is_empty() {
                println!("{}", style("Configuration is valid.").green());
            } else {
                println!("{}", style("Configuration problems:").yellow().bold());
                for problem in &problems {
                    println!("  - {}", problem);
                }
                anyhow::bail!("{} configuration problem(s) found", problems.len());
            }
        }
    }

    Ok(())
}
