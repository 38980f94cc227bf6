//! Configuration view and validation commands — `phasegate config`.

use anyhow::Result;
use phasegate::config::PhasegateConfig;

use super::super::ConfigCommands;

pub fn cmd_config(config: &PhasegateConfig, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            print!("{}", toml::to_string_pretty(config)?);
        }
        Some(ConfigCommands::Validate) => {
            let errors = config.validate();
            if errors.is_empty() {
                println!("Configuration is valid.");
            } else {
                for error in &errors {
                    println!("  - {}", error);
                }
                anyhow::bail!("Configuration has {} problem(s)", errors.len());
            }
        }
    }
    Ok(())
}
