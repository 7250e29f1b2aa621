//! Batch execution from a request file.

use std::path::Path;

use anyhow::Context;
use toolmesh_mcp::BatchCallRequest;

use crate::AppContext;

pub async fn run(ctx: &AppContext, tenant: &str, file: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let requests: Vec<BatchCallRequest> = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON array of batch requests", file.display()))?;

    super::register_tenant(ctx, tenant).await?;
    let results = ctx.manager.batch_call_tools(tenant, &requests).await;
    ctx.manager.shutdown().await;

    let failed = results.iter().filter(|r| !r.success).count();
    println!("{}", serde_json::to_string_pretty(&results)?);
    eprintln!("{} calls, {} failed", results.len(), failed);
    Ok(())
}
