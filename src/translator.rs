//! Query Translator
//!
//! Turns a coach's question into exactly one candidate SQL statement by prompting the
//! language model with the schema context. The output is untrusted; it still has to
//! pass the guard.

use crate::error::{GenieError, Result, ServiceFailure};
use crate::guard::{first_statement_end, statement_count};
use crate::llm::{CompletionModel, CompletionRequest};
use crate::retry::RetryPolicy;
use crate::schema::SchemaDescriptor;
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

lazy_static! {
    static ref FENCED_BLOCK: Regex =
        Regex::new(r"(?s)```[A-Za-z]*[ \t]*\r?\n?(.*?)```").expect("fence pattern");
    static ref SQL_MARKER: Regex =
        Regex::new(r"(?im)^[ \t]*SQL(?:[ \t]*Query)?[ \t]*:").expect("marker pattern");
    static ref STATEMENT_LINE: Regex = Regex::new(
        r"(?im)^[ \t]*(SELECT|WITH|INSERT|UPDATE|DELETE|DROP|ALTER|CREATE|TRUNCATE|GRANT|REVOKE|MERGE|CALL|COPY|EXPLAIN|SHOW|SET|VALUES)\b"
    )
    .expect("statement pattern");
    static ref TRAILING_STATEMENT: Regex = Regex::new(
        r"(?im)^[ \t]*(SELECT|WITH|INSERT|UPDATE|DELETE|DROP|ALTER|CREATE|TRUNCATE|GRANT|REVOKE|MERGE)\b"
    )
    .expect("trailing statement pattern");
}

const SYSTEM_PROMPT: &str = "You translate a sports recruiting coach's questions into PostgreSQL. \
Reply with exactly one SELECT statement and nothing else: no explanation and no markdown. \
Use only the tables and columns listed in the schema and never invent names. \
Use ILIKE for free-text matches on names, places, sports and positions. \
Only read data; never modify it.";

const FEW_SHOT: &[(&str, &str)] = &[
    (
        "How many recruits do we have in each sport?",
        "SELECT sport, COUNT(*) AS recruits FROM athletes GROUP BY sport ORDER BY recruits DESC;",
    ),
    (
        "Show me the five best students from Ohio",
        "SELECT first_name, last_name, gpa FROM athletes WHERE state ILIKE 'ohio' ORDER BY gpa DESC LIMIT 5;",
    ),
];

/// One inbound message. Ephemeral; never persisted.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub session_id: Uuid,
    pub raw_text: String,
    pub received_at: DateTime<Utc>,
}

impl Utterance {
    pub fn new(session_id: Uuid, raw_text: impl Into<String>) -> Self {
        Self {
            session_id,
            raw_text: raw_text.into(),
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidateQuery {
    pub sql: String,
    pub source_utterance: String,
    /// Not reported by chat-completions providers; kept for models that score output.
    pub confidence: Option<f32>,
}

impl CandidateQuery {
    pub fn new(sql: impl Into<String>, source_utterance: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            source_utterance: source_utterance.into(),
            confidence: None,
        }
    }
}

pub struct QueryTranslator {
    model: Arc<dyn CompletionModel>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl QueryTranslator {
    pub fn new(model: Arc<dyn CompletionModel>, timeout: Duration) -> Self {
        Self {
            model,
            timeout,
            retry: RetryPolicy::translation(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Deterministic: the same question and schema always give the same request.
    pub fn build_request(&self, question: &str, schema: &SchemaDescriptor) -> CompletionRequest {
        let mut prompt = String::from("Database schema:\n");
        prompt.push_str(&schema.prompt_context());
        prompt.push_str("\nExamples of the expected form (use the schema above for real names):\n");
        for (q, sql) in FEW_SHOT {
            prompt.push_str(&format!("Question: {}\nSQL Query: {}\n\n", q, sql));
        }
        prompt.push_str(&format!("Question: {}\nSQL Query:", question.trim()));
        CompletionRequest::new(SYSTEM_PROMPT, prompt)
    }

    pub async fn translate(
        &self,
        utterance: &Utterance,
        schema: &SchemaDescriptor,
    ) -> Result<CandidateQuery> {
        let request = self.build_request(&utterance.raw_text, schema);
        let started = Instant::now();
        let request = &request;
        let sql = self
            .retry
            .retry_with_backoff(move || self.attempt(request), GenieError::is_retryable)
            .await?;
        info!(
            session_id = %utterance.session_id,
            stage = "translate",
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Candidate SQL generated"
        );
        debug!(sql = %sql, "Candidate SQL");
        Ok(CandidateQuery::new(sql, utterance.raw_text.clone()))
    }

    async fn attempt(&self, request: &CompletionRequest) -> Result<String> {
        match tokio::time::timeout(self.timeout, self.model.complete(request)).await {
            Ok(response) => extract_sql(&response?),
            Err(_) => Err(GenieError::service(
                ServiceFailure::Timeout,
                format!("no response within {:?}", self.timeout),
            )),
        }
    }
}

/// Pulls exactly one SQL statement out of a model response.
///
/// Looks for a fenced block first. A response that opens with a statement keyword is
/// then taken whole; otherwise a line starting with an `SQL:` / `SQL Query:` marker,
/// then the first line that opens with a statement keyword. Prose after the
/// terminating `;` is dropped, but a second statement there is an error.
pub fn extract_sql(response: &str) -> Result<String> {
    let text = response.trim();
    let body = if let Some(block) = FENCED_BLOCK.captures(text).and_then(|c| c.get(1)) {
        block.as_str()
    } else if STATEMENT_LINE.find(text).map_or(false, |m| m.start() == 0) {
        text
    } else if let Some(marker) = SQL_MARKER.find(text) {
        &text[marker.end()..]
    } else if let Some(line) = STATEMENT_LINE.captures(text).and_then(|c| c.get(1)) {
        &text[line.start()..]
    } else {
        return Err(GenieError::TranslationParse(
            "response contains no SQL statement".to_string(),
        ));
    };
    // An opening fence the model never closed.
    let body = body.trim().trim_start_matches("```sql").trim_start_matches("```").trim();

    let statement = match first_statement_end(body) {
        Some(end) => {
            if has_trailing_statement(&body[end + 1..]) {
                return Err(GenieError::TranslationParse(
                    "response contains more than one statement".to_string(),
                ));
            }
            &body[..end]
        }
        None => body,
    };

    let statement = statement.trim().trim_end_matches("```").trim();
    match statement_count(statement) {
        Some(1) => Ok(statement.to_string()),
        Some(0) => Err(GenieError::TranslationParse(
            "response contains no SQL statement".to_string(),
        )),
        Some(_) => Err(GenieError::TranslationParse(
            "response contains more than one statement".to_string(),
        )),
        None => Err(GenieError::TranslationParse(
            "response has unbalanced quoting".to_string(),
        )),
    }
}

/// True when some line of `rest` opens a statement that actually parses. Narrative such
/// as "Select any row to see details." starts with a keyword but is not SQL.
fn has_trailing_statement(rest: &str) -> bool {
    TRAILING_STATEMENT.find_iter(rest).any(|m| {
        let tail = &rest[m.start()..];
        let candidate = first_statement_end(tail).map_or(tail, |end| &tail[..end]);
        Parser::parse_sql(&PostgreSqlDialect {}, candidate)
            .map_or(false, |statements| !statements.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::fixtures::athletes_schema;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned responses and counts calls.
    struct Scripted {
        replies: Mutex<VecDeque<Result<String>>>,
        calls: Mutex<usize>,
        delay: Duration,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(0),
                delay: Duration::ZERO,
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl CompletionModel for Scripted {
        async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
            *self.calls.lock().unwrap() += 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("SELECT 1".to_string()))
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    fn translator(model: Arc<Scripted>, timeout: Duration) -> QueryTranslator {
        QueryTranslator::new(model, timeout).with_retry_policy(RetryPolicy {
            initial_delay: Duration::from_millis(1),
            jitter: false,
            ..RetryPolicy::translation()
        })
    }

    fn utterance(text: &str) -> Utterance {
        Utterance::new(Uuid::new_v4(), text)
    }

    #[test]
    fn test_extract_plain_statement() {
        assert_eq!(
            extract_sql("SELECT * FROM athletes;").unwrap(),
            "SELECT * FROM athletes"
        );
    }

    #[test]
    fn test_extract_fenced_block_with_prose() {
        let response = "Here you go:\n```sql\nSELECT first_name FROM athletes WHERE gpa > 3.5;\n```\nThis lists strong students.";
        assert_eq!(
            extract_sql(response).unwrap(),
            "SELECT first_name FROM athletes WHERE gpa > 3.5"
        );
    }

    #[test]
    fn test_extract_after_marker_drops_trailing_narrative() {
        let response = "SQL Query: SELECT sport FROM athletes; This groups nothing; enjoy.";
        assert_eq!(extract_sql(response).unwrap(), "SELECT sport FROM athletes");
    }

    #[test]
    fn test_extract_first_statement_line() {
        let response = "Sure! The query is below.\nSELECT city\nFROM athletes";
        assert_eq!(extract_sql(response).unwrap(), "SELECT city\nFROM athletes");
    }

    #[test]
    fn test_extract_unclosed_fence() {
        assert_eq!(
            extract_sql("```sql\nSELECT 1 FROM athletes").unwrap(),
            "SELECT 1 FROM athletes"
        );
    }

    #[test]
    fn test_extract_rejects_two_statements() {
        let err = extract_sql("SELECT 1;\nDROP TABLE athletes;").unwrap_err();
        assert!(matches!(err, GenieError::TranslationParse(_)));
    }

    #[test]
    fn test_marker_inside_string_literal_is_data() {
        let sql = "SELECT first_name FROM athletes WHERE city = 'SQL: Town'";
        assert_eq!(extract_sql(sql).unwrap(), sql);
    }

    #[test]
    fn test_trailing_narrative_starting_with_keyword_is_dropped() {
        let response = "SELECT first_name FROM athletes;\nSelect any row to see details.";
        assert_eq!(extract_sql(response).unwrap(), "SELECT first_name FROM athletes");
    }

    #[test]
    fn test_statement_after_narrative_still_rejected() {
        let response = "SELECT first_name FROM athletes;\nThen clean up:\nDELETE FROM athletes;";
        assert!(matches!(
            extract_sql(response).unwrap_err(),
            GenieError::TranslationParse(_)
        ));
    }

    #[test]
    fn test_extract_rejects_prose_only() {
        let err = extract_sql("I'm sorry, I can't answer that from this data.").unwrap_err();
        assert!(matches!(err, GenieError::TranslationParse(_)));
    }

    #[test]
    fn test_ddl_passes_through_for_the_guard() {
        assert_eq!(extract_sql("DROP TABLE athletes;").unwrap(), "DROP TABLE athletes");
    }

    #[test]
    fn test_prompt_is_deterministic_and_carries_schema() {
        let model = Arc::new(Scripted::new(vec![]));
        let t = translator(model, Duration::from_secs(1));
        let schema = athletes_schema();
        let a = t.build_request("linebackers in Illinois", &schema);
        let b = t.build_request("linebackers in Illinois", &schema);
        assert_eq!(a, b);
        assert!(a.prompt.contains("primary_position VARCHAR"));
        assert!(a.prompt.ends_with("Question: linebackers in Illinois\nSQL Query:"));
        assert_eq!(a.temperature, 0.0);
    }

    #[tokio::test]
    async fn test_translate_success() {
        let model = Arc::new(Scripted::new(vec![Ok(
            "```sql\nSELECT * FROM athletes WHERE primary_position ILIKE 'linebacker'\n```".to_string(),
        )]));
        let candidate = translator(model.clone(), Duration::from_secs(1))
            .translate(&utterance("linebackers"), &athletes_schema())
            .await
            .unwrap();
        assert_eq!(
            candidate.sql,
            "SELECT * FROM athletes WHERE primary_position ILIKE 'linebacker'"
        );
        assert_eq!(candidate.source_utterance, "linebackers");
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_parse_failure_retried_once() {
        let model = Arc::new(Scripted::new(vec![
            Ok("no idea".to_string()),
            Ok("SELECT sport FROM athletes".to_string()),
        ]));
        let candidate = translator(model.clone(), Duration::from_secs(1))
            .translate(&utterance("sports"), &athletes_schema())
            .await
            .unwrap();
        assert_eq!(candidate.sql, "SELECT sport FROM athletes");
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn test_timeout_surfaces_after_one_retry() {
        let mut scripted = Scripted::new(vec![]);
        scripted.delay = Duration::from_millis(200);
        let model = Arc::new(scripted);

        let err = translator(model.clone(), Duration::from_millis(20))
            .translate(&utterance("anything"), &athletes_schema())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GenieError::TranslationService {
                failure: ServiceFailure::Timeout,
                ..
            }
        ));
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn test_auth_failure_not_retried() {
        let model = Arc::new(Scripted::new(vec![Err(GenieError::service(
            ServiceFailure::Auth,
            "HTTP 401",
        ))]));
        let err = translator(model.clone(), Duration::from_secs(1))
            .translate(&utterance("anything"), &athletes_schema())
            .await
            .unwrap_err();
        assert_eq!(err.category(), "translation_service");
        assert_eq!(model.calls(), 1);
    }
}
