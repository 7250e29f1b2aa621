//! Long-running status watch.

use std::sync::Arc;

use toolmesh_mcp::{FnObserver, StatusEvent};

use crate::AppContext;

pub async fn run(ctx: &AppContext) -> anyhow::Result<()> {
    if ctx.config.plugins.is_empty() {
        anyhow::bail!("No plugins configured");
    }

    ctx.manager
        .subscribe(Arc::new(FnObserver(|event: &StatusEvent| -> anyhow::Result<()> {
            println!(
                "{} {}/{}: {} -> {} ({})",
                event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                event.tenant_id,
                event.plugin_name,
                event.old_status,
                event.new_status,
                event.reason
            );
            Ok(())
        })));

    for plugin in &ctx.config.plugins {
        ctx.manager.register(plugin.clone()).await;
    }
    ctx.manager.start();
    println!("Watching {} plugin(s); press Ctrl-C to stop.", ctx.config.plugins.len());

    tokio::signal::ctrl_c().await?;
    println!();

    for info in ctx.manager.session_info() {
        println!(
            "{}/{}: {} requests, {} errors, status {}",
            info.tenant_id, info.plugin_name, info.request_count, info.error_count, info.status
        );
    }
    ctx.manager.shutdown().await;
    Ok(())
}
