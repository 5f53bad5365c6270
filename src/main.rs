use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use inspector::{config::InspectorConfig, gateway, retention, InspectorContext};
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "inspector",
    about = "mcp-agent-inspector — debugging and observability sidecar",
    version
)]
struct Args {
    /// HTTP gateway port
    #[arg(long, default_value_t = inspector::config::DEFAULT_PORT, env = "INSPECTOR_PORT")]
    port: u16,

    /// Directory for per-session trace files
    #[arg(long, env = "TRACES_DIR")]
    traces_dir: Option<PathBuf>,

    /// Base URL of the external durable-workflow service
    #[arg(long, env = "WORKFLOW_SERVICE_URL")]
    workflow_service_url: Option<String>,

    /// Log filter (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "INSPECTOR_LOG")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // INSPECTOR_DEBUG (any non-empty value) wins over the --log default.
    let filter = match std::env::var("INSPECTOR_DEBUG") {
        Ok(v) if !v.is_empty() => "debug".to_string(),
        _ => args.log.clone(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = args.port,
        "inspector starting"
    );

    let config = InspectorConfig::new(
        Some(args.port),
        args.traces_dir,
        args.workflow_service_url,
    );
    info!(traces_dir = %config.traces_dir.display(), "traces directory");

    let ctx = InspectorContext::new(config)?;

    // Prune old chunk files on startup, then daily.
    {
        let traces_dir = ctx.config.traces_dir.clone();
        let retention_days = ctx.config.retention_days;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(24 * 60 * 60));
            loop {
                interval.tick().await;
                match retention::prune_chunks(&traces_dir, retention_days).await {
                    Ok(0) => {}
                    Ok(n) => info!(count = n, "pruned old trace chunks"),
                    Err(e) => warn!(err = %e, "retention pass failed"),
                }
            }
        });
    }

    gateway::serve(Arc::clone(&ctx)).await
}
