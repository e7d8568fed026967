//! The translate → guard → execute chain, shared by the session mediator and the CLI.

use crate::chat::ChatAssistant;
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::executor::{QueryExecutor, QueryResult};
use crate::guard::{GuardedQuery, QueryGuard};
use crate::llm::CompletionModel;
use crate::render::render_result;
use crate::retry::RetryPolicy;
use crate::schema::SchemaDescriptor;
use crate::session::events::SqlResultPayload;
use crate::translator::{CandidateQuery, QueryTranslator, Utterance};
use std::sync::Arc;
use std::time::Duration;

pub struct Pipeline {
    schema: Arc<SchemaDescriptor>,
    translator: QueryTranslator,
    guard: QueryGuard,
    executor: Arc<dyn QueryExecutor>,
    chat: ChatAssistant,
    model_configured: bool,
    model_name: String,
    execute_timeout: Duration,
    row_cap: usize,
}

impl Pipeline {
    pub fn new(
        schema: Arc<SchemaDescriptor>,
        model: Arc<dyn CompletionModel>,
        executor: Arc<dyn QueryExecutor>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            schema,
            translator: QueryTranslator::new(model.clone(), config.translate_timeout),
            guard: QueryGuard::new(config.row_cap),
            executor,
            chat: ChatAssistant::new(model.clone(), config.translate_timeout),
            model_configured: model.is_configured(),
            model_name: model.model_name().to_string(),
            execute_timeout: config.execute_timeout,
            row_cap: config.row_cap,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.translator = self.translator.with_retry_policy(retry.clone());
        self.chat = self.chat.with_retry_policy(retry);
        self
    }

    pub fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    pub fn model_configured(&self) -> bool {
        self.model_configured
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub async fn database_ready(&self) -> bool {
        self.executor.is_ready().await
    }

    pub async fn translate(&self, utterance: &Utterance) -> Result<CandidateQuery> {
        self.translator.translate(utterance, &self.schema).await
    }

    pub fn check(&self, candidate: &CandidateQuery) -> Result<GuardedQuery> {
        self.guard.validate(candidate, &self.schema).into_result()
    }

    pub async fn execute(&self, query: &GuardedQuery) -> Result<QueryResult> {
        self.executor
            .execute(query, self.execute_timeout, self.row_cap)
            .await
    }

    pub async fn reply(&self, message: &str) -> Result<String> {
        self.chat.reply(message).await
    }

    /// Packages an executed query for the `sql_result` event.
    pub fn payload(&self, query: &GuardedQuery, result: QueryResult) -> SqlResultPayload {
        let text = render_result(query.sql(), &result);
        SqlResultPayload {
            sql: query.sql().to_string(),
            columns: result.columns,
            rows: result.rows,
            row_count: result.row_count,
            truncated: result.truncated,
            text,
        }
    }
}
