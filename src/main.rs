//! Proxy Resource Tracker - Main entry point.
//!
//! Runs SQL statements through one proxy execution context against the
//! configured data sources, prints the results, and releases every resource
//! the context opened.

use clap::Parser;
use proxy_resource_tracker::backend::BackendHandler;
use proxy_resource_tracker::config::Config;
use proxy_resource_tracker::context::ExecutionContext;
use proxy_resource_tracker::db::DataSourceRegistry;
use proxy_resource_tracker::error::ProxyResult;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    // Results go to stdout; logs stay on stderr.
    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Run every statement in one execution context.
async fn run_statements(
    config: &Config,
    handler: &BackendHandler,
    ctx: &ExecutionContext,
) -> ProxyResult<()> {
    for sql in &config.statements {
        let results = handler.execute(ctx, sql, &config.targets).await?;
        let output = serde_json::json!({
            "context_id": ctx.id(),
            "sql": sql,
            "results": results,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output).unwrap_or_else(|_| output.to_string())
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_tracing(&config);

    if config.data_sources.is_empty() {
        eprintln!("Error: At least one data source must be configured.");
        eprintln!();
        eprintln!("Usage: proxy-resource-tracker --data-source <url> --sql <statement>");
        eprintln!("       proxy-resource-tracker --data-source <id>=<url> --sql <statement>");
        eprintln!();
        eprintln!("Examples:");
        eprintln!("  proxy-resource-tracker -d 'ds_0=sqlite:shard0.db?mode=rwc' -s 'SELECT 1'");
        eprintln!(
            "  proxy-resource-tracker -d ds_0=mysql://u:p@db0/orders -d ds_1=mysql://u:p@db1/orders -s 'SELECT COUNT(*) FROM t_order'"
        );
        std::process::exit(1);
    }

    info!(
        data_sources = config.data_sources.len(),
        statements = config.statements.len(),
        "Starting proxy-resource-tracker v{}",
        env!("CARGO_PKG_VERSION")
    );

    let registry = Arc::new(DataSourceRegistry::new());
    for data_source in config.parse_data_sources()? {
        if let Err(e) = registry.connect(&data_source).await {
            error!(data_source = %data_source.id, error = %e, "Failed to connect data source");
            if let Some(suggestion) = e.suggestion() {
                eprintln!("Suggestion: {suggestion}");
            }
            registry.close_all().await;
            return Err(e.into());
        }
    }

    let handler = BackendHandler::new(registry.clone(), config.query_timeout_duration());
    let ctx = ExecutionContext::new();

    let outcome = run_statements(&config, &handler, &ctx).await;
    if let Err(e) = &outcome {
        error!(context_id = %ctx.id(), error = %e, "Statement execution failed");
    }

    // Teardown runs on the error path too.
    let released = ctx
        .finish_with_timeout(config.release_timeout_duration())
        .await;
    registry.close_all().await;

    outcome?;
    released?;
    info!("Shutdown complete");
    Ok(())
}
