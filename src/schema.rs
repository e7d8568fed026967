//! Schema Descriptor
//!
//! Immutable description of the queryable tables. Built once at startup (from the
//! database catalog or a static JSON file) and shared behind an `Arc` by the translator
//! and the guard. There is no hot reload; restart the process to pick up schema changes.

use crate::config::PipelineConfig;
use crate::db::introspect::{introspect, CatalogSnapshot};
use crate::error::{GenieError, Result};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// Closed set of allowed values (enum types), when the database declares one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enumerated_values: Option<Vec<String>>,
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
}

impl TableSpec {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// Foreign-key edge between two tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    tables: Vec<TableSpec>,
    #[serde(default)]
    relationships: Vec<Relationship>,
    /// Database schema the tables live in; qualified names must use it.
    #[serde(skip, default = "default_namespace")]
    namespace: String,
}

pub const DEFAULT_NAMESPACE: &str = "public";

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

impl SchemaDescriptor {
    /// Builds a descriptor, failing when there is nothing to query.
    pub fn new(tables: Vec<TableSpec>, relationships: Vec<Relationship>) -> Result<Self> {
        if tables.is_empty() {
            return Err(GenieError::SchemaLoad(
                "introspection returned zero tables".to_string(),
            ));
        }
        if let Some(empty) = tables.iter().find(|t| t.columns.is_empty()) {
            return Err(GenieError::SchemaLoad(format!(
                "table '{}' has no columns",
                empty.name
            )));
        }
        let mut seen = HashSet::new();
        for table in &tables {
            if !seen.insert(table.name.to_lowercase()) {
                return Err(GenieError::SchemaLoad(format!(
                    "table '{}' is described twice",
                    table.name
                )));
            }
        }
        Ok(Self {
            tables,
            relationships,
            namespace: default_namespace(),
        })
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into().to_lowercase();
        self
    }

    /// Loads a descriptor from a JSON file (`{"tables": [...], "relationships": [...]}`).
    pub fn from_file(path: &Path, allowed_tables: &[String]) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            GenieError::SchemaLoad(format!("cannot read {}: {}", path.display(), e))
        })?;
        let parsed: SchemaDescriptor = serde_json::from_str(&raw).map_err(|e| {
            GenieError::SchemaLoad(format!("invalid schema file {}: {}", path.display(), e))
        })?;
        let (tables, relationships) = restrict(parsed.tables, parsed.relationships, allowed_tables);
        let schema = Self::new(tables, relationships)?;
        info!(
            tables = schema.tables.len(),
            path = %path.display(),
            "Loaded schema descriptor from file"
        );
        Ok(schema)
    }

    /// Startup load: the static file when one is configured, otherwise catalog
    /// introspection of `namespace`. There is no reload after this.
    pub async fn load(
        config: &PipelineConfig,
        pool: Option<&PgPool>,
        namespace: &str,
    ) -> Result<Self> {
        if let Some(path) = &config.schema_file {
            return Ok(Self::from_file(path, &config.schema_tables)?.with_namespace(namespace));
        }
        let pool = pool.ok_or_else(|| {
            GenieError::SchemaLoad("no database connection and no schema file".to_string())
        })?;
        let snapshot = introspect(pool, namespace).await?;
        let schema = Self::from_catalog(snapshot, &config.schema_tables)?.with_namespace(namespace);
        info!(
            tables = schema.tables.len(),
            relationships = schema.relationships.len(),
            namespace,
            "Loaded schema descriptor from catalog"
        );
        Ok(schema)
    }

    /// Builds a descriptor from a catalog snapshot taken by `db::introspect`.
    pub fn from_catalog(snapshot: CatalogSnapshot, allowed_tables: &[String]) -> Result<Self> {
        let (tables, relationships) = restrict(snapshot.tables, snapshot.relationships, allowed_tables);
        Self::new(tables, relationships)
    }

    pub fn tables(&self) -> &[TableSpec] {
        &self.tables
    }

    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn table(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn column(&self, table: &str, column: &str) -> Option<&ColumnSpec> {
        self.table(table).and_then(|t| t.column(column))
    }

    pub fn tables_with_column(&self, column: &str) -> Vec<&TableSpec> {
        self.tables
            .iter()
            .filter(|t| t.column(column).is_some())
            .collect()
    }

    /// Closest known column name, for "did you mean" hints on rejected queries.
    pub fn suggest_column(&self, name: &str) -> Option<&str> {
        let needle = name.to_lowercase();
        self.tables
            .iter()
            .flat_map(|t| t.columns.iter())
            .map(|c| (c.name.as_str(), strsim::jaro_winkler(&needle, &c.name.to_lowercase())))
            .filter(|(_, score)| *score >= 0.85)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(col, _)| col)
    }

    /// Deterministic text rendering embedded in translation prompts.
    pub fn prompt_context(&self) -> String {
        let mut out = String::new();
        for table in &self.tables {
            let _ = writeln!(out, "Table: {} (", table.name);
            for (i, column) in table.columns.iter().enumerate() {
                let _ = write!(out, "    {} {}", column.name, column.data_type.to_uppercase());
                if !column.nullable {
                    out.push_str(" NOT NULL");
                }
                if let Some(values) = &column.enumerated_values {
                    let _ = write!(out, " -- one of: {}", values.join(", "));
                }
                if i + 1 < table.columns.len() {
                    out.push(',');
                }
                out.push('\n');
            }
            out.push_str(")\n");
        }
        for rel in &self.relationships {
            let _ = writeln!(
                out,
                "Relationship: {}.{} references {}.{}",
                rel.from_table, rel.from_column, rel.to_table, rel.to_column
            );
        }
        out
    }
}

fn restrict(
    tables: Vec<TableSpec>,
    relationships: Vec<Relationship>,
    allowed: &[String],
) -> (Vec<TableSpec>, Vec<Relationship>) {
    if allowed.is_empty() {
        return (tables, relationships);
    }
    let allowed_set: HashSet<String> = allowed.iter().map(|t| t.to_lowercase()).collect();
    let kept: Vec<TableSpec> = tables
        .into_iter()
        .filter(|t| allowed_set.contains(&t.name.to_lowercase()))
        .collect();
    for wanted in allowed {
        if !kept.iter().any(|t| t.name.eq_ignore_ascii_case(wanted)) {
            warn!(table = %wanted, "Allow-listed table not found in schema source");
        }
    }
    let kept_names: HashSet<String> = kept.iter().map(|t| t.name.to_lowercase()).collect();
    let relationships = relationships
        .into_iter()
        .filter(|r| {
            kept_names.contains(&r.from_table.to_lowercase())
                && kept_names.contains(&r.to_table.to_lowercase())
        })
        .collect();
    (kept, relationships)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    fn col(name: &str, data_type: &str) -> ColumnSpec {
        ColumnSpec {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable: true,
            enumerated_values: None,
        }
    }

    /// Recruiting schema used across unit tests.
    pub fn athletes_schema() -> SchemaDescriptor {
        let mut client_id = col("client_id", "integer");
        client_id.nullable = false;
        let mut gender = col("gender", "varchar");
        gender.enumerated_values = Some(vec!["female".to_string(), "male".to_string()]);
        SchemaDescriptor::new(
            vec![
                TableSpec {
                    name: "athletes".to_string(),
                    columns: vec![
                        client_id.clone(),
                        col("first_name", "varchar"),
                        col("last_name", "varchar"),
                        gender,
                        col("sport", "varchar"),
                        col("primary_position", "varchar"),
                        col("state", "varchar"),
                        col("city", "varchar"),
                        col("graduation_year", "integer"),
                        col("gpa", "numeric"),
                    ],
                },
                TableSpec {
                    name: "academic_records".to_string(),
                    columns: vec![
                        client_id,
                        col("act_score", "integer"),
                        col("sat_score", "integer"),
                    ],
                },
            ],
            vec![Relationship {
                from_table: "academic_records".to_string(),
                from_column: "client_id".to_string(),
                to_table: "athletes".to_string(),
                to_column: "client_id".to_string(),
            }],
        )
        .expect("fixture schema is valid")
    }
}
