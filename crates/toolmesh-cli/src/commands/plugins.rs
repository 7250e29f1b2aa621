//! Configured plugin listing.

use crate::AppContext;

pub fn list(ctx: &AppContext) -> anyhow::Result<()> {
    let plugins = &ctx.config.plugins;
    if plugins.is_empty() {
        println!("No plugins configured.");
        println!("Add [[plugins]] entries to {}", config_path().display());
        return Ok(());
    }

    println!("{:<16} {:<20} {:<16} URL", "TENANT", "PLUGIN", "TRANSPORT");
    for plugin in plugins {
        println!(
            "{:<16} {:<20} {:<16} {}",
            plugin.tenant_id, plugin.plugin_name, plugin.transport, plugin.url
        );
    }
    Ok(())
}

fn config_path() -> std::path::PathBuf {
    toolmesh_core::Config::config_dir().join("config.toml")
}
