//! Runs against a real Postgres when `TEST_DATABASE_URL` is set; skipped otherwise.

use sql_genie::{
    ColumnSpec, GuardedQuery, PgQueryExecutor, QueryExecutor, QueryGuard, SchemaDescriptor,
    TableSpec,
};
use sql_genie::translator::CandidateQuery;
use sqlx::PgPool;
use std::time::Duration;

const ROSTER: &str = "genie_test_roster";

async fn pool() -> Option<PgPool> {
    let url = match std::env::var("TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("TEST_DATABASE_URL not set; skipping Postgres executor test");
            return None;
        }
    };
    let pool = PgPool::connect(&url).await.unwrap();
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {ROSTER} (first_name TEXT NOT NULL, gpa NUMERIC)"
    ))
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(&format!("DELETE FROM {ROSTER}"))
        .execute(&pool)
        .await
        .unwrap();
    for (name, gpa) in [("Ava", 3.9), ("Ben", 3.1), ("Cal", 3.5), ("Dee", 2.8), ("Eli", 3.7)] {
        sqlx::query(&format!("INSERT INTO {ROSTER} (first_name, gpa) VALUES ($1, $2::numeric)"))
            .bind(name)
            .bind(gpa.to_string())
            .execute(&pool)
            .await
            .unwrap();
    }
    Some(pool)
}

fn roster_schema() -> SchemaDescriptor {
    let column = |name: &str, data_type: &str| ColumnSpec {
        name: name.to_string(),
        data_type: data_type.to_string(),
        nullable: true,
        enumerated_values: None,
    };
    SchemaDescriptor::new(
        vec![TableSpec {
            name: ROSTER.to_string(),
            columns: vec![column("first_name", "text"), column("gpa", "numeric")],
        }],
        vec![],
    )
    .unwrap()
}

fn guarded(sql: &str, cap: usize) -> GuardedQuery {
    QueryGuard::new(cap)
        .validate(&CandidateQuery::new(sql, "roster question"), &roster_schema())
        .into_result()
        .unwrap()
}

#[tokio::test]
async fn test_pg_executor_caps_and_describes() {
    let Some(pool) = pool().await else {
        return;
    };
    let executor = PgQueryExecutor::new(pool);
    let timeout = Duration::from_secs(5);

    // No matches still reports the projected column names.
    let empty = guarded(&format!("SELECT first_name, gpa FROM {ROSTER} WHERE gpa > 10"), 100);
    let result = executor.execute(&empty, timeout, 100).await.unwrap();
    assert_eq!(result.row_count, 0);
    assert_eq!(result.columns, vec!["first_name", "gpa"]);
    assert!(!result.truncated);

    // The guard's LIMIT 10 lets five rows through; the executor stops at three.
    let all = guarded(&format!("SELECT first_name FROM {ROSTER} ORDER BY first_name"), 10);
    let result = executor.execute(&all, timeout, 3).await.unwrap();
    assert_eq!(result.row_count, 3);
    assert_eq!(result.rows.len(), 3);
    assert!(result.truncated);

    // A query limited below the cap that fills its own limit is complete.
    let two = guarded(&format!("SELECT first_name FROM {ROSTER} LIMIT 2"), 100);
    let result = executor.execute(&two, timeout, 100).await.unwrap();
    assert_eq!(result.row_count, 2);
    assert!(!result.truncated);
}
