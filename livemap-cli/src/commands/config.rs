//! `livemap config show`

use anyhow::{Context, Result};
use clap::Subcommand;

use livemap_core::config::{config_path_at, load_at};

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration (defaults filled in).
    Show,
}

pub fn run(command: ConfigCommand) -> Result<()> {
    let home = super::home()?;
    match command {
        ConfigCommand::Show => {
            let config = load_at(&home).context("failed to load config")?;
            println!("# {}", config_path_at(&home).display());
            print!(
                "{}",
                serde_yaml::to_string(&config).context("failed to render config")?
            );
        }
    }
    Ok(())
}
