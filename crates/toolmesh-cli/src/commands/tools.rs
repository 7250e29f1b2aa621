//! Tool listing in function-calling form.

use anyhow::Context;

use crate::AppContext;

pub async fn show(
    ctx: &AppContext,
    tenant: &str,
    plugin: &str,
    use_cache: bool,
) -> anyhow::Result<()> {
    let config = ctx
        .config
        .plugin(tenant, plugin)
        .with_context(|| format!("Plugin '{}' is not configured for tenant '{}'", plugin, tenant))?;

    if !ctx.manager.register(config.clone()).await {
        anyhow::bail!("Could not connect to plugin '{}'", plugin);
    }

    let listed = ctx.manager.get_function_tools(tenant, plugin, use_cache).await;
    ctx.manager.shutdown().await;

    let functions = listed?;
    println!("{}", serde_json::to_string_pretty(&functions)?);
    Ok(())
}
