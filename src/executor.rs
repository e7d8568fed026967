//! Query Executor
//!
//! Runs guarded SQL in a read-only transaction on its own pooled connection and
//! collects at most `row_cap` rows.

use crate::error::{GenieError, Result};
use crate::guard::GuardedQuery;
use async_trait::async_trait;
use futures::{TryStream, TryStreamExt};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgColumn, PgRow, PgTypeKind};
use sqlx::{Column, Executor, PgPool, Row, TypeInfo};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Postgres `query_canceled`, raised when `statement_timeout` fires.
const QUERY_CANCELED: &str = "57014";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => write!(f, "NULL"),
            Scalar::Bool(b) => write!(f, "{}", b),
            Scalar::Int(i) => write!(f, "{}", i),
            Scalar::Float(x) => write!(f, "{}", x),
            Scalar::Text(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Scalar>>,
    pub row_count: usize,
    pub truncated: bool,
}

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(
        &self,
        query: &GuardedQuery,
        timeout: Duration,
        row_cap: usize,
    ) -> Result<QueryResult>;

    /// Cheap liveness probe used for the connect status.
    async fn is_ready(&self) -> bool {
        true
    }
}

pub struct PgQueryExecutor {
    pool: PgPool,
}

impl PgQueryExecutor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn run(&self, query: &GuardedQuery, timeout: Duration, row_cap: usize) -> Result<QueryResult> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("SET LOCAL statement_timeout = {}", timeout.as_millis()))
            .execute(&mut *tx)
            .await?;

        let (fetched, overflowed) = {
            let stream = sqlx::query(query.sql()).fetch(&mut *tx);
            collect_capped(stream, row_cap)
                .await
                .map_err(|e| classify_db_error(e, timeout))?
        };
        let columns = match fetched.first() {
            Some(row) => column_names(row.columns()),
            // No row to read names from; ask the server for the statement's shape.
            None => match (&mut *tx).describe(query.sql()).await {
                Ok(described) => column_names(described.columns()),
                Err(e) => {
                    debug!(error = %e, "Could not describe empty result");
                    Vec::new()
                }
            },
        };
        let rows: Vec<Vec<Scalar>> = fetched.iter().map(decode_row).collect();
        // Never commit, even though nothing could have been written.
        tx.rollback().await?;

        let row_count = rows.len();
        Ok(QueryResult {
            columns,
            rows,
            row_count,
            truncated: is_truncated(overflowed, query.cap_enforced(), row_count, row_cap),
        })
    }
}

#[async_trait]
impl QueryExecutor for PgQueryExecutor {
    async fn execute(
        &self,
        query: &GuardedQuery,
        timeout: Duration,
        row_cap: usize,
    ) -> Result<QueryResult> {
        let started = Instant::now();
        // The server-side statement_timeout normally fires first; this bounds
        // connection acquisition and network stalls as well.
        let outcome = tokio::time::timeout(timeout + Duration::from_secs(1), self.run(query, timeout, row_cap))
            .await
            .unwrap_or(Err(GenieError::ExecutionTimeout(timeout)));
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Ok(result) => info!(
                stage = "execute",
                rows = result.row_count,
                truncated = result.truncated,
                elapsed_ms,
                "Query executed"
            ),
            Err(e) => warn!(stage = "execute", category = e.category(), error = %e, elapsed_ms, "Query failed"),
        }
        outcome
    }

    async fn is_ready(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

fn classify_db_error(err: sqlx::Error, timeout: Duration) -> GenieError {
    let canceled = err
        .as_database_error()
        .and_then(|db| db.code())
        .map_or(false, |code| code == QUERY_CANCELED);
    if canceled {
        GenieError::ExecutionTimeout(timeout)
    } else {
        GenieError::from(err)
    }
}

/// Pulls at most `row_cap` items off `stream`. The flag is set when one more item was
/// available; the stream is not polled past that.
pub(crate) async fn collect_capped<S>(
    mut stream: S,
    row_cap: usize,
) -> std::result::Result<(Vec<S::Ok>, bool), S::Error>
where
    S: TryStream + Unpin,
{
    let mut items = Vec::new();
    while let Some(item) = stream.try_next().await? {
        if items.len() == row_cap {
            return Ok((items, true));
        }
        items.push(item);
    }
    Ok((items, false))
}

fn column_names(columns: &[PgColumn]) -> Vec<String> {
    columns.iter().map(|c| c.name().to_string()).collect()
}

/// `truncated` when more rows existed than were collected, or when the guard's cap
/// bounded the query and the result filled it.
pub(crate) fn is_truncated(overflowed: bool, cap_enforced: bool, row_count: usize, row_cap: usize) -> bool {
    overflowed || (cap_enforced && row_count >= row_cap)
}

fn decode_row(row: &PgRow) -> Vec<Scalar> {
    (0..row.columns().len()).map(|i| decode_cell(row, i)).collect()
}

fn decode_cell(row: &PgRow, idx: usize) -> Scalar {
    let type_info = row.columns()[idx].type_info();
    let type_name = type_info.name().to_uppercase();
    let decoded: std::result::Result<Option<Scalar>, sqlx::Error> = match type_name.as_str() {
        "BOOL" => row.try_get::<Option<bool>, _>(idx).map(|v| v.map(Scalar::Bool)),
        "INT2" => row
            .try_get::<Option<i16>, _>(idx)
            .map(|v| v.map(|n| Scalar::Int(n.into()))),
        "INT4" => row
            .try_get::<Option<i32>, _>(idx)
            .map(|v| v.map(|n| Scalar::Int(n.into()))),
        "INT8" => row.try_get::<Option<i64>, _>(idx).map(|v| v.map(Scalar::Int)),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(idx)
            .map(|v| v.map(|x| Scalar::Float(x.into()))),
        "FLOAT8" => row.try_get::<Option<f64>, _>(idx).map(|v| v.map(Scalar::Float)),
        "NUMERIC" => row
            .try_get::<Option<sqlx::types::BigDecimal>, _>(idx)
            .map(|v| v.map(|d| numeric_scalar(d.to_string()))),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(idx)
            .map(|v| v.map(|d| Scalar::Text(d.format("%Y-%m-%d").to_string()))),
        "TIME" => row
            .try_get::<Option<chrono::NaiveTime>, _>(idx)
            .map(|v| v.map(|t| Scalar::Text(t.format("%H:%M:%S").to_string()))),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(idx)
            .map(|v| v.map(|t| Scalar::Text(t.format("%Y-%m-%dT%H:%M:%S").to_string()))),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx)
            .map(|v| v.map(|t| Scalar::Text(t.to_rfc3339()))),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(idx)
            .map(|v| v.map(|u| Scalar::Text(u.to_string()))),
        "JSON" | "JSONB" => row
            .try_get::<Option<serde_json::Value>, _>(idx)
            .map(|v| v.map(|j| Scalar::Text(j.to_string()))),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CHAR" | "CITEXT" | "UNKNOWN" => row
            .try_get_unchecked::<Option<String>, _>(idx)
            .map(|v| v.map(Scalar::Text)),
        // Enum labels travel as text.
        _ if matches!(type_info.kind(), PgTypeKind::Enum(_)) => row
            .try_get_unchecked::<Option<String>, _>(idx)
            .map(|v| v.map(Scalar::Text)),
        _ => Ok(Some(Scalar::Text(format!("<{}>", type_name.to_lowercase())))),
    };
    match decoded {
        Ok(value) => value.unwrap_or(Scalar::Null),
        Err(e) => {
            debug!(column = idx, type_name = %type_name, error = %e, "Could not decode column");
            Scalar::Text(format!("<{}>", type_name.to_lowercase()))
        }
    }
}

fn numeric_scalar(text: String) -> Scalar {
    match text.parse::<f64>() {
        Ok(x) if x.is_finite() => Scalar::Float(x),
        _ => Scalar::Text(text),
    }
}
