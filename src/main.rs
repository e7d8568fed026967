use anyhow::{bail, Context, Result};
use clap::Parser;
use sql_genie::db::init_pool;
use sql_genie::logging::init_tracing;
use sql_genie::session::{classify, Intent};
use sql_genie::{
    AppConfig, LlmClient, PgQueryExecutor, Pipeline, QueryGuard, QueryTranslator, SchemaDescriptor,
    Utterance,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "sql-genie")]
#[command(about = "Ask one question about your athletes and print the answer")]
struct Args {
    /// The question in plain language (a leading /sql is accepted)
    question: String,

    /// Translate and check the SQL, but do not run it
    #[arg(long)]
    dry_run: bool,

    /// Print the sql_result payload as JSON instead of a table
    #[arg(long)]
    json: bool,

    /// Static schema descriptor instead of catalog introspection
    #[arg(long)]
    schema_file: Option<PathBuf>,

    /// Model name (overrides LLM_MODEL)
    #[arg(long)]
    model: Option<String>,

    /// Maximum rows to return (overrides ROW_CAP)
    #[arg(long)]
    row_cap: Option<usize>,

    #[arg(long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    init_tracing(&args.log_level);

    let mut config = AppConfig::from_env().context("invalid configuration")?;
    if let Some(path) = args.schema_file {
        config.pipeline.schema_file = Some(path);
    }
    if let Some(model) = args.model {
        config.llm.model = model;
    }
    if let Some(cap) = args.row_cap.filter(|c| *c > 0) {
        config.pipeline.row_cap = cap;
    }

    // A dry run with a schema file never touches the database.
    let pool = if args.dry_run && config.pipeline.schema_file.is_some() {
        None
    } else {
        Some(
            init_pool(&config.database)
                .await
                .context("could not connect to the athlete database")?,
        )
    };
    let schema = Arc::new(
        SchemaDescriptor::load(&config.pipeline, pool.as_ref(), &config.database.schema)
            .await
            .context("could not load the schema descriptor")?,
    );

    let question = match classify(&args.question, &schema) {
        Intent::Query(q) | Intent::Chat(q) => q,
        Intent::Help => bail!("nothing to ask; pass a question such as \"linebackers in Illinois\""),
    };
    let model = Arc::new(LlmClient::from_config(&config.llm));
    let utterance = Utterance::new(Uuid::new_v4(), question);
    info!(question = %utterance.raw_text, model = %config.llm.model, "Asking");

    let pool = match pool {
        Some(pool) if !args.dry_run => pool,
        _ => {
            let translator = QueryTranslator::new(model, config.pipeline.translate_timeout);
            let candidate = translator
                .translate(&utterance, &schema)
                .await
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            let guarded = QueryGuard::new(config.pipeline.row_cap)
                .validate(&candidate, &schema)
                .into_result()
                .map_err(|e| anyhow::anyhow!(e.user_message()))?;
            println!("{}", guarded.sql());
            return Ok(());
        }
    };

    let pipeline = Pipeline::new(
        schema,
        model,
        Arc::new(PgQueryExecutor::new(pool)),
        &config.pipeline,
    );
    let candidate = pipeline
        .translate(&utterance)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;
    let guarded = pipeline
        .check(&candidate)
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;
    let result = pipeline
        .execute(&guarded)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;
    let payload = pipeline.payload(&guarded, result);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("{}", payload.text);
    }
    Ok(())
}
