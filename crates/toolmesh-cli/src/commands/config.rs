//! Configuration management commands.

use toolmesh_core::config::IssueSeverity;
use toolmesh_core::Config;

use crate::ConfigAction;

pub fn handle(action: ConfigAction, config: &Config) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            println!("# Configuration directory: {}", Config::config_dir().display());
            print!("{}", config.to_toml()?);
        }
        ConfigAction::Validate => {
            let result = config.validate();
            for issue in &result.issues {
                let level = match issue.severity {
                    IssueSeverity::Error => "error",
                    IssueSeverity::Warning => "warning",
                };
                println!("{}: {}: {}", level, issue.field, issue.message);
            }
            if !result.is_ok() {
                anyhow::bail!("Configuration has {} error(s)", result.errors().len());
            }
            println!("Configuration is valid.");
        }
    }
    Ok(())
}
