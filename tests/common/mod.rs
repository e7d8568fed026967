#![allow(dead_code)]

use async_trait::async_trait;
use sql_genie::config::PipelineConfig;
use sql_genie::error::{GenieError, Result, ServiceFailure};
use sql_genie::retry::RetryPolicy;
use sql_genie::session::{Mediator, OutboundEvent};
use sql_genie::{
    ColumnSpec, CompletionModel, CompletionRequest, GuardedQuery, Pipeline, QueryExecutor,
    QueryResult, Relationship, Scalar, SchemaDescriptor, TableSpec,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

fn col(name: &str, data_type: &str) -> ColumnSpec {
    ColumnSpec {
        name: name.to_string(),
        data_type: data_type.to_string(),
        nullable: true,
        enumerated_values: None,
    }
}

pub fn athletes_schema() -> SchemaDescriptor {
    SchemaDescriptor::new(
        vec![
            TableSpec {
                name: "athletes".to_string(),
                columns: vec![
                    col("client_id", "integer"),
                    col("first_name", "varchar"),
                    col("last_name", "varchar"),
                    col("sport", "varchar"),
                    col("primary_position", "varchar"),
                    col("state", "varchar"),
                    col("gpa", "numeric"),
                    col("graduation_year", "integer"),
                ],
            },
            TableSpec {
                name: "academic_records".to_string(),
                columns: vec![col("client_id", "integer"), col("sat_score", "integer")],
            },
        ],
        vec![Relationship {
            from_table: "academic_records".to_string(),
            from_column: "client_id".to_string(),
            to_table: "athletes".to_string(),
            to_column: "client_id".to_string(),
        }],
    )
    .unwrap()
}

/// Answers by matching a phrase in the asked question; unmatched questions get prose.
pub struct ScriptedModel {
    mappings: Vec<(String, std::result::Result<String, ServiceFailure>)>,
    delay: Duration,
    configured: bool,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            mappings: Vec::new(),
            delay: Duration::ZERO,
            configured: true,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn answer(mut self, phrase: &str, reply: &str) -> Self {
        self.mappings.push((phrase.to_lowercase(), Ok(reply.to_string())));
        self
    }

    pub fn fail(mut self, phrase: &str, failure: ServiceFailure) -> Self {
        self.mappings.push((phrase.to_lowercase(), Err(failure)));
        self
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn unconfigured(mut self) -> Self {
        self.configured = false;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionModel for ScriptedModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let asked = request
            .prompt
            .rsplit("Question: ")
            .next()
            .unwrap_or_default()
            .to_lowercase();
        for (phrase, reply) in &self.mappings {
            if asked.contains(phrase.as_str()) {
                return match reply {
                    Ok(text) => Ok(text.clone()),
                    Err(failure) => Err(GenieError::service(*failure, "scripted failure")),
                };
            }
        }
        Ok("I'm not sure how to help with that.".to_string())
    }

    fn model_name(&self) -> &str {
        "scripted"
    }

    fn is_configured(&self) -> bool {
        self.configured
    }
}

/// Pretends a table holds `matching` rows for every query and records what it ran.
pub struct ScriptedExecutor {
    matching: usize,
    delay: Duration,
    unreachable: bool,
    executed: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new(matching: usize) -> Self {
        Self {
            matching,
            delay: Duration::ZERO,
            unreachable: false,
            executed: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueryExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        query: &GuardedQuery,
        _timeout: Duration,
        row_cap: usize,
    ) -> Result<QueryResult> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        self.executed.lock().unwrap().push(query.sql().to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.unreachable {
            return Err(GenieError::Execution(
                "connection refused (os error 111) at 10.0.0.7:5432".to_string(),
            ));
        }
        let limit = query.limit().min(row_cap);
        let returned = self.matching.min(limit);
        let rows = (0..returned)
            .map(|i| vec![Scalar::Text(format!("Athlete {}", i)), Scalar::Float(3.6)])
            .collect();
        Ok(QueryResult {
            columns: vec!["first_name".to_string(), "gpa".to_string()],
            rows,
            row_count: returned,
            truncated: self.matching > returned && query.cap_enforced(),
        })
    }

    async fn is_ready(&self) -> bool {
        !self.unreachable
    }
}

pub fn fast_config() -> PipelineConfig {
    PipelineConfig {
        translate_timeout: Duration::from_millis(100),
        execute_timeout: Duration::from_secs(1),
        ..PipelineConfig::default()
    }
}

pub fn mediator(
    model: Arc<ScriptedModel>,
    executor: Arc<ScriptedExecutor>,
    queue_depth: usize,
) -> Mediator {
    let pipeline = Pipeline::new(Arc::new(athletes_schema()), model, executor, &fast_config())
        .with_retry_policy(RetryPolicy {
            initial_delay: Duration::from_millis(1),
            jitter: false,
            ..RetryPolicy::translation()
        });
    Mediator::new(Arc::new(pipeline), queue_depth)
}

pub async fn next_event(events: &mut mpsc::Receiver<OutboundEvent>) -> OutboundEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Events up to and including the first non-status event.
pub async fn until_answer(events: &mut mpsc::Receiver<OutboundEvent>) -> Vec<OutboundEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let done = !matches!(event, OutboundEvent::Status(_));
        seen.push(event);
        if done {
            return seen;
        }
    }
}

pub fn status(text: &str) -> OutboundEvent {
    OutboundEvent::Status(text.to_string())
}
