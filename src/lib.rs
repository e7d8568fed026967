//! SQL Genie
//!
//! Chat sessions in which a coach asks questions about their athletes in plain
//! language. Each question is translated to SQL by a language model, validated by the
//! query guard against the loaded schema, executed read-only with a row cap, and the
//! result is streamed back to the session as events.

pub mod chat;
pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod guard;
pub mod llm;
pub mod logging;
pub mod pipeline;
pub mod render;
pub mod retry;
pub mod schema;
pub mod server;
pub mod session;
pub mod translator;

pub use config::AppConfig;
pub use error::{GenieError, Result};
pub use executor::{PgQueryExecutor, QueryExecutor, QueryResult, Scalar};
pub use guard::{GuardVerdict, GuardedQuery, QueryGuard, RejectionReason};
pub use llm::{CompletionModel, CompletionRequest, LlmClient};
pub use pipeline::Pipeline;
pub use schema::{ColumnSpec, Relationship, SchemaDescriptor, TableSpec};
pub use session::{Mediator, OutboundEvent, SessionHandle};
pub use translator::{CandidateQuery, QueryTranslator, Utterance};
