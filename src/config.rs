//! Process configuration
//!
//! Everything is read from the environment (a `.env` file is loaded by the binaries
//! before this runs). Binaries may override selected values from their CLI flags.

use crate::error::{GenieError, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_ROW_CAP: usize = 100;
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Connection parameters for the athlete database.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// Postgres schema (namespace) that is introspected for queryable tables.
    pub schema: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub translate_timeout: Duration,
    pub execute_timeout: Duration,
    pub row_cap: usize,
    /// Restricts introspection to these tables when non-empty.
    pub schema_tables: Vec<String>,
    /// Static schema descriptor used instead of catalog introspection.
    pub schema_file: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            translate_timeout: Duration::from_secs(30),
            execute_timeout: Duration::from_secs(15),
            row_cap: DEFAULT_ROW_CAP,
            schema_tables: Vec::new(),
            schema_file: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub session_queue_depth: usize,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub pipeline: PipelineConfig,
    pub server: ServerConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup. `from_env` is the production path.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database = DatabaseConfig {
            host: get("DB_HOST").unwrap_or_else(|| "localhost".to_string()),
            port: parse_or(&get, "DB_PORT", 5432)?,
            user: get("DB_USER").unwrap_or_else(|| "postgres".to_string()),
            password: get("DB_PASSWORD").unwrap_or_default(),
            database: get("DB_NAME").ok_or_else(|| GenieError::Config("DB_NAME is not set".to_string()))?,
            schema: get("DB_SCHEMA").unwrap_or_else(|| "public".to_string()),
            max_connections: parse_or(&get, "DB_MAX_CONNECTIONS", 10)?,
        };

        let llm = LlmConfig {
            api_key: get("LLM_API_KEY").or_else(|| get("OPENAI_API_KEY")),
            model: get("LLM_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            base_url: get("LLM_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
        };

        let row_cap: usize = parse_or(&get, "ROW_CAP", DEFAULT_ROW_CAP)?;
        if row_cap == 0 {
            return Err(GenieError::Config("ROW_CAP must be at least 1".to_string()));
        }

        let pipeline = PipelineConfig {
            translate_timeout: Duration::from_secs(parse_or(&get, "TRANSLATE_TIMEOUT_SECS", 30)?),
            execute_timeout: Duration::from_secs(parse_or(&get, "EXECUTE_TIMEOUT_SECS", 15)?),
            row_cap,
            schema_tables: get("SCHEMA_TABLES")
                .map(|list| {
                    list.split(',')
                        .map(|t| t.trim().to_string())
                        .filter(|t| !t.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            schema_file: get("SCHEMA_FILE").map(PathBuf::from),
        };

        let queue_depth: usize = parse_or(&get, "SESSION_QUEUE_DEPTH", 8)?;
        let server = ServerConfig {
            bind_addr: parse_or(&get, "BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8000)))?,
            session_queue_depth: queue_depth.max(1),
        };

        Ok(Self {
            database,
            llm,
            pipeline,
            server,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e| GenieError::Config(format!("{} has an invalid value '{}': {}", key, raw, e))),
        None => Ok(default),
    }
}
