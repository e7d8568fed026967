//! SQL Genie session server: WebSocket sessions at /ws, health at /health.

use anyhow::{Context, Result};
use clap::Parser;
use sql_genie::db::init_pool;
use sql_genie::executor::PgQueryExecutor;
use sql_genie::logging::init_tracing;
use sql_genie::server::serve;
use sql_genie::{AppConfig, CompletionModel, LlmClient, Mediator, Pipeline, SchemaDescriptor};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "sql-genie-server")]
#[command(about = "Serve natural-language athlete search sessions over WebSocket")]
struct Args {
    /// Address to listen on (overrides BIND_ADDR)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Static schema descriptor instead of catalog introspection (overrides SCHEMA_FILE)
    #[arg(long)]
    schema_file: Option<PathBuf>,

    /// Maximum rows per answer (overrides ROW_CAP)
    #[arg(long)]
    row_cap: Option<usize>,

    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(&args.log_level);

    let mut config = AppConfig::from_env().context("invalid configuration")?;
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }
    if let Some(path) = args.schema_file {
        config.pipeline.schema_file = Some(path);
    }
    if let Some(cap) = args.row_cap.filter(|c| *c > 0) {
        config.pipeline.row_cap = cap;
    }

    let pool = init_pool(&config.database)
        .await
        .context("could not connect to the athlete database")?;
    let schema = SchemaDescriptor::load(&config.pipeline, Some(&pool), &config.database.schema)
        .await
        .context("could not load the schema descriptor")?;
    info!(tables = schema.tables().len(), "Schema ready");

    let model = Arc::new(LlmClient::from_config(&config.llm));
    if !model.is_configured() {
        warn!("LLM_API_KEY is not set; sessions will connect but questions cannot be answered");
    }

    let pipeline = Pipeline::new(
        Arc::new(schema),
        model,
        Arc::new(PgQueryExecutor::new(pool)),
        &config.pipeline,
    );
    let mediator = Arc::new(Mediator::new(
        Arc::new(pipeline),
        config.server.session_queue_depth,
    ));

    serve(&config.server, mediator).await?;
    Ok(())
}
