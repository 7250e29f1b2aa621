//! Single tool call.

use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use toolmesh_mcp::{BatchCallResult, ContextFormat};

use crate::AppContext;

pub async fn run(
    ctx: &AppContext,
    tenant: &str,
    name: &str,
    args: &str,
    timeout: Option<u64>,
    plain: bool,
) -> anyhow::Result<()> {
    let arguments: Value = serde_json::from_str(args).context("--args must be valid JSON")?;
    super::register_tenant(ctx, tenant).await?;

    let (plugin, tool) = ctx.manager.resolve_combined_name(tenant, name)?;
    let outcome = ctx
        .manager
        .call_tool(
            tenant,
            &plugin,
            &tool,
            Some(arguments),
            timeout.map(Duration::from_secs),
        )
        .await;
    ctx.manager.shutdown().await;

    let result = match outcome {
        Ok(output) => BatchCallResult::success("1", name, output),
        Err(e) => BatchCallResult::failure("1", name, e.to_string()),
    };
    let format = if plain {
        ContextFormat::Plain
    } else {
        ContextFormat::Markdown
    };
    println!("{}", ctx.manager.build_context(std::slice::from_ref(&result), format));

    if !result.success {
        std::process::exit(1);
    }
    Ok(())
}
