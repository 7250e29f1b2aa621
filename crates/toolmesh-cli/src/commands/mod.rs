//! CLI command implementations.

pub mod batch;
pub mod call;
pub mod config;
pub mod plugins;
pub mod tools;
pub mod watch;

use crate::AppContext;

/// Register every configured plugin of a tenant. Fails if none comes up.
async fn register_tenant(ctx: &AppContext, tenant: &str) -> anyhow::Result<()> {
    let mut configured = 0;
    let mut registered = 0;
    for plugin in ctx.config.plugins_for(tenant) {
        configured += 1;
        if ctx.manager.ensure_registered(plugin.clone()).await {
            registered += 1;
        } else {
            eprintln!("Plugin '{}' is unavailable", plugin.plugin_name);
        }
    }

    if configured == 0 {
        anyhow::bail!("No plugins configured for tenant '{}'", tenant);
    }
    if registered == 0 {
        anyhow::bail!("None of the plugins of tenant '{}' could be reached", tenant);
    }
    Ok(())
}
