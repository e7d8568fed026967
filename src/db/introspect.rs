//! Catalog introspection
//!
//! Reads tables, columns, enum labels and foreign keys of one Postgres schema.

use crate::error::{GenieError, Result};
use crate::schema::{ColumnSpec, Relationship, TableSpec};
use sqlx::PgPool;
use std::collections::HashMap;
use tracing::debug;

/// Raw catalog contents, before allow-listing and validation.
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    pub tables: Vec<TableSpec>,
    pub relationships: Vec<Relationship>,
}

/// (table, column, data_type, nullable, udt_name)
type ColumnRow = (String, String, String, bool, String);

const COLUMNS_SQL: &str = r#"
    SELECT c.table_name::text, c.column_name::text, c.data_type::text,
           (c.is_nullable = 'YES') AS nullable, c.udt_name::text
    FROM information_schema.columns c
    JOIN information_schema.tables t
      ON t.table_schema = c.table_schema AND t.table_name = c.table_name
    WHERE c.table_schema = $1
      AND t.table_type IN ('BASE TABLE', 'VIEW')
    ORDER BY c.table_name, c.ordinal_position
"#;

const ENUMS_SQL: &str = r#"
    SELECT t.typname::text, e.enumlabel::text
    FROM pg_type t
    JOIN pg_enum e ON e.enumtypid = t.oid
    JOIN pg_namespace n ON n.oid = t.typnamespace
    WHERE n.nspname = $1
    ORDER BY t.typname, e.enumsortorder
"#;

const FOREIGN_KEYS_SQL: &str = r#"
    SELECT kcu.table_name::text, kcu.column_name::text,
           ccu.table_name::text, ccu.column_name::text
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
      ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema
    JOIN information_schema.constraint_column_usage ccu
      ON ccu.constraint_name = tc.constraint_name AND ccu.table_schema = tc.table_schema
    WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = $1
    ORDER BY 1, 2
"#;

/// Introspect `namespace`. Any database failure is a `SchemaLoad` error.
pub async fn introspect(pool: &PgPool, namespace: &str) -> Result<CatalogSnapshot> {
    let columns: Vec<ColumnRow> = sqlx::query_as(COLUMNS_SQL)
        .bind(namespace)
        .fetch_all(pool)
        .await
        .map_err(|e| GenieError::SchemaLoad(format!("column introspection failed: {}", e)))?;

    let enums: Vec<(String, String)> = sqlx::query_as(ENUMS_SQL)
        .bind(namespace)
        .fetch_all(pool)
        .await
        .map_err(|e| GenieError::SchemaLoad(format!("enum introspection failed: {}", e)))?;

    let foreign_keys: Vec<(String, String, String, String)> = sqlx::query_as(FOREIGN_KEYS_SQL)
        .bind(namespace)
        .fetch_all(pool)
        .await
        .map_err(|e| GenieError::SchemaLoad(format!("foreign key introspection failed: {}", e)))?;

    debug!(
        columns = columns.len(),
        enum_labels = enums.len(),
        foreign_keys = foreign_keys.len(),
        namespace,
        "Catalog rows fetched"
    );
    Ok(assemble(columns, enums, foreign_keys))
}

fn assemble(
    columns: Vec<ColumnRow>,
    enums: Vec<(String, String)>,
    foreign_keys: Vec<(String, String, String, String)>,
) -> CatalogSnapshot {
    let mut labels: HashMap<String, Vec<String>> = HashMap::new();
    for (type_name, label) in enums {
        labels.entry(type_name).or_default().push(label);
    }

    let mut tables: Vec<TableSpec> = Vec::new();
    for (table, column, data_type, nullable, udt_name) in columns {
        let enumerated_values = labels.get(&udt_name).cloned();
        let data_type = if data_type == "USER-DEFINED" {
            udt_name
        } else {
            data_type
        };
        let spec = ColumnSpec {
            name: column,
            data_type,
            nullable,
            enumerated_values,
        };
        // Rows arrive ordered by table, so only the last table can be the current one.
        match tables.last_mut() {
            Some(current) if current.name == table => current.columns.push(spec),
            _ => tables.push(TableSpec {
                name: table,
                columns: vec![spec],
            }),
        }
    }

    let relationships = foreign_keys
        .into_iter()
        .map(|(from_table, from_column, to_table, to_column)| Relationship {
            from_table,
            from_column,
            to_table,
            to_column,
        })
        .collect();

    CatalogSnapshot {
        tables,
        relationships,
    }
}
