//! # toolmesh-cli
//!
//! Operator command-line interface for the toolmesh session manager.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use toolmesh_core::Config;
use toolmesh_mcp::McpSessionManager;

mod commands;

/// Application context containing shared state.
pub struct AppContext {
    pub config: Config,
    pub manager: McpSessionManager,
}

/// toolmesh - multi-tenant MCP session manager
#[derive(Parser)]
#[command(name = "toolmesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file to use instead of the default locations
    #[arg(short, long, value_name = "PATH", env = "TOOLMESH_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured plugins
    Plugins,
    /// Show a plugin's tools in function-calling form
    Tools {
        /// Tenant id
        #[arg(short, long)]
        tenant: String,
        /// Plugin name
        #[arg(short, long)]
        plugin: String,
        /// Fetch from the plugin even if a cached list exists
        #[arg(long)]
        no_cache: bool,
    },
    /// Call a tool by its combined name (plugin_tool)
    Call {
        /// Tenant id
        #[arg(short, long)]
        tenant: String,
        /// Combined tool name, e.g. notes_search
        name: String,
        /// Arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
        /// Timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Plain-text output instead of markdown
        #[arg(long)]
        plain: bool,
    },
    /// Run a JSON file of batch requests
    Batch {
        /// Tenant id
        #[arg(short, long)]
        tenant: String,
        /// File holding a JSON array of {id, name, arguments}
        file: PathBuf,
    },
    /// Register every configured plugin and stream status changes
    Watch,
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show the effective configuration
    Show,
    /// Validate the configuration
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let loaded = match &cli.config {
        Some(path) => Config::load_from(path.clone()),
        None => Config::load(),
    };
    let (config, load_error) = match loaded {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    if let Some(e) = load_error {
        tracing::warn!("Failed to load config, using defaults: {}", e);
    }

    let manager = McpSessionManager::with_mcp_connector(config.session.clone());
    let ctx = Arc::new(AppContext { config, manager });

    match cli.command {
        Commands::Plugins => commands::plugins::list(&ctx),
        Commands::Tools {
            tenant,
            plugin,
            no_cache,
        } => commands::tools::show(&ctx, &tenant, &plugin, !no_cache).await,
        Commands::Call {
            tenant,
            name,
            args,
            timeout,
            plain,
        } => commands::call::run(&ctx, &tenant, &name, &args, timeout, plain).await,
        Commands::Batch { tenant, file } => commands::batch::run(&ctx, &tenant, &file).await,
        Commands::Watch => commands::watch::run(&ctx).await,
        Commands::Config { action } => commands::config::handle(action, &ctx.config),
        Commands::Version => {
            println!("toolmesh {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
