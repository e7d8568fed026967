//! Query Guard
//!
//! The only path from model output to the database. Candidate SQL is treated as
//! hostile: it is tokenized and parsed (never substring-matched), checked against the
//! schema descriptor, and re-rendered from the AST with a bounded row limit.
//!
//! Rules run in order and the first failure wins:
//! 1. exactly one statement
//! 2. the statement is a `SELECT` with no data-changing keywords
//! 3. every table and column exists in the schema
//! 4. a row limit no larger than the cap is present (injected or clamped)
//! 5. no data-modifying subqueries, table functions or system objects

use crate::schema::{SchemaDescriptor, TableSpec};
use crate::translator::CandidateQuery;
use crate::error::GenieError;
use sqlparser::ast::{Expr, ObjectName, Query, SelectItem, SetExpr, Statement, TableFactor, Value, Visit, Visitor};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::ControlFlow;
use tracing::{debug, warn};

/// Keywords that may not appear anywhere in an accepted statement.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "MERGE", "GRANT",
    "REVOKE", "EXEC", "EXECUTE", "CALL", "COPY", "VACUUM", "REINDEX", "INTO",
];

const SYSTEM_NAMESPACES: &[&str] = &["pg_catalog", "information_schema", "pg_toast", "sys"];

const SYSTEM_FUNCTIONS: &[&str] = &[
    "current_setting", "set_config", "dblink", "dblink_exec", "lo_import", "lo_export",
    "query_to_xml", "inet_server_addr", "inet_server_port", "version",
];

/// Why a candidate was refused. The `Display` form is safe to show to users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    Empty,
    MultipleStatements,
    NotSelect { statement: String },
    ForbiddenKeyword { keyword: String },
    Unparseable,
    UnknownTable { name: String },
    UnknownColumn { name: String, suggestion: Option<String> },
    SystemAccess { object: String },
    DataModifying,
    RowLocking,
    UnsupportedSource,
}

impl RejectionReason {
    pub fn category(&self) -> &'static str {
        match self {
            RejectionReason::Empty => "empty",
            RejectionReason::MultipleStatements => "multiple_statements",
            RejectionReason::NotSelect { .. } => "not_select",
            RejectionReason::ForbiddenKeyword { .. } => "forbidden_keyword",
            RejectionReason::Unparseable => "unparseable",
            RejectionReason::UnknownTable { .. } => "unknown_table",
            RejectionReason::UnknownColumn { .. } => "unknown_column",
            RejectionReason::SystemAccess { .. } => "system_access",
            RejectionReason::DataModifying => "data_modifying",
            RejectionReason::RowLocking => "row_locking",
            RejectionReason::UnsupportedSource => "unsupported_source",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::Empty => write!(f, "the generated query was empty"),
            RejectionReason::MultipleStatements => {
                write!(f, "only a single statement is allowed")
            }
            RejectionReason::NotSelect { statement } => write!(
                f,
                "only SELECT queries are allowed (found a {} statement)",
                statement
            ),
            RejectionReason::ForbiddenKeyword { keyword } => write!(
                f,
                "forbidden SQL keyword {}; only read-only SELECT queries are allowed",
                keyword
            ),
            RejectionReason::Unparseable => write!(f, "the generated SQL could not be parsed"),
            RejectionReason::UnknownTable { name } => write!(f, "unknown table '{}'", name),
            RejectionReason::UnknownColumn { name, suggestion } => {
                write!(f, "unknown column '{}'", name)?;
                if let Some(s) = suggestion {
                    write!(f, " (did you mean '{}'?)", s)?;
                }
                Ok(())
            }
            RejectionReason::SystemAccess { object } => {
                write!(f, "access to system object '{}' is not allowed", object)
            }
            RejectionReason::DataModifying => {
                write!(f, "data-modifying subqueries are not allowed")
            }
            RejectionReason::RowLocking => {
                write!(f, "row-locking clauses (FOR SHARE, FOR UPDATE) are not allowed")
            }
            RejectionReason::UnsupportedSource => {
                write!(f, "table functions are not allowed as query sources")
            }
        }
    }
}

/// SQL that passed every guard rule. Only this module can construct one, so the
/// executor cannot be handed unvalidated text.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardedQuery {
    sql: String,
    limit: usize,
    cap_enforced: bool,
}

impl GuardedQuery {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Effective row limit of the final SQL (always <= the guard's cap).
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// True when the limit is the guard's cap rather than one the query asked for.
    pub fn cap_enforced(&self) -> bool {
        self.cap_enforced
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuardVerdict {
    Accepted(GuardedQuery),
    Rejected(RejectionReason),
}

impl GuardVerdict {
    pub fn into_result(self) -> crate::error::Result<GuardedQuery> {
        match self {
            GuardVerdict::Accepted(query) => Ok(query),
            GuardVerdict::Rejected(reason) => Err(GenieError::GuardRejected(reason)),
        }
    }
}

pub struct QueryGuard {
    row_cap: usize,
}

impl QueryGuard {
    pub fn new(row_cap: usize) -> Self {
        Self {
            row_cap: row_cap.max(1),
        }
    }

    pub fn row_cap(&self) -> usize {
        self.row_cap
    }

    pub fn validate(&self, candidate: &CandidateQuery, schema: &SchemaDescriptor) -> GuardVerdict {
        let verdict = self.check(&candidate.sql, schema);
        match &verdict {
            GuardVerdict::Accepted(query) => {
                debug!(limit = query.limit, cap_enforced = query.cap_enforced, "Guard accepted query")
            }
            GuardVerdict::Rejected(reason) => {
                warn!(category = reason.category(), "Guard rejected candidate query")
            }
        }
        verdict
    }

    fn check(&self, sql: &str, schema: &SchemaDescriptor) -> GuardVerdict {
        // Rule 1: exactly one statement
        let statements = match significant_statements(sql) {
            Ok(statements) => statements,
            Err(_) => return GuardVerdict::Rejected(RejectionReason::Unparseable),
        };
        let tokens = match statements.as_slice() {
            [] => return GuardVerdict::Rejected(RejectionReason::Empty),
            [only] => only,
            _ => return GuardVerdict::Rejected(RejectionReason::MultipleStatements),
        };

        // Rule 2: SELECT only, checked on real keyword tokens
        if let Some(reason) = check_statement_type(tokens) {
            return GuardVerdict::Rejected(reason);
        }
        let mut parsed = match Parser::parse_sql(&PostgreSqlDialect {}, sql) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, "Candidate SQL failed to parse");
                return GuardVerdict::Rejected(RejectionReason::Unparseable);
            }
        };
        if parsed.len() != 1 {
            return GuardVerdict::Rejected(RejectionReason::MultipleStatements);
        }
        let mut statement = parsed.remove(0);
        if !matches!(statement, Statement::Query(_)) {
            return GuardVerdict::Rejected(RejectionReason::NotSelect {
                statement: "non-query".to_string(),
            });
        }

        let mut refs = ReferenceCollector::default();
        let _ = statement.visit(&mut refs);

        // Rule 3: every identifier resolves against the schema
        if let Some(reason) = refs.unresolved(schema) {
            return GuardVerdict::Rejected(reason);
        }

        // Rule 4: bounded result
        let (limit, cap_enforced) = match &mut statement {
            Statement::Query(query) => apply_row_cap(query, self.row_cap),
            _ => return GuardVerdict::Rejected(RejectionReason::Unparseable),
        };

        // Rule 5: nothing that writes, and nothing outside the user tables
        if let Some(reason) = refs.forbidden_access() {
            return GuardVerdict::Rejected(reason);
        }

        GuardVerdict::Accepted(GuardedQuery {
            sql: statement.to_string(),
            limit,
            cap_enforced,
        })
    }
}

fn is_significant(token: &Token) -> bool {
    !matches!(token, Token::Whitespace(_) | Token::EOF)
}

/// Splits tokenized SQL on top-level `;` and keeps the non-empty statements.
fn significant_statements(sql: &str) -> Result<Vec<Vec<Token>>, sqlparser::tokenizer::TokenizerError> {
    let tokens = Tokenizer::new(&PostgreSqlDialect {}, sql).tokenize()?;
    let mut statements = Vec::new();
    let mut current = Vec::new();
    for token in tokens {
        match token {
            Token::SemiColon => {
                if !current.is_empty() {
                    statements.push(std::mem::take(&mut current));
                }
            }
            t if is_significant(&t) => current.push(t),
            _ => {}
        }
    }
    if !current.is_empty() {
        statements.push(current);
    }
    Ok(statements)
}

/// Number of non-empty statements in `sql`, or `None` when it does not tokenize.
pub(crate) fn statement_count(sql: &str) -> Option<usize> {
    significant_statements(sql).ok().map(|s| s.len())
}

/// Byte offset of the `;` that ends the first statement, ignoring separators inside
/// strings, quoted identifiers and comments.
pub(crate) fn first_statement_end(sql: &str) -> Option<usize> {
    sql.char_indices()
        .filter(|(_, c)| *c == ';')
        .map(|(i, _)| i)
        .find(|&i| {
            // A prefix ending inside a string or comment either fails to tokenize or
            // does not end with a semicolon token.
            Tokenizer::new(&PostgreSqlDialect {}, &sql[..=i])
                .tokenize()
                .map(|tokens| {
                    tokens
                        .iter()
                        .rev()
                        .find(|t| is_significant(t))
                        .map_or(false, |t| *t == Token::SemiColon)
                })
                .unwrap_or(false)
        })
}

fn check_statement_type(tokens: &[Token]) -> Option<RejectionReason> {
    match tokens.first() {
        Some(Token::Word(word)) if word.quote_style.is_none() => {
            let head = word.value.to_uppercase();
            if head != "SELECT" && head != "WITH" {
                return Some(RejectionReason::NotSelect {
                    statement: safe_ident(&head),
                });
            }
        }
        Some(Token::LParen) => {}
        _ => {
            return Some(RejectionReason::NotSelect {
                statement: "unknown".to_string(),
            })
        }
    }

    tokens.iter().find_map(|token| match token {
        Token::Word(word) if word.quote_style.is_none() => {
            let upper = word.value.to_uppercase();
            FORBIDDEN_KEYWORDS
                .contains(&upper.as_str())
                .then(|| RejectionReason::ForbiddenKeyword { keyword: upper })
        }
        _ => None,
    })
}

/// Clamps or injects the row limit. Returns the effective limit and whether the cap
/// (rather than the query's own limit) is what bounds the result.
fn apply_row_cap(query: &mut Query, cap: usize) -> (usize, bool) {
    let mut requested: Option<usize> = None;
    let mut opaque = false;
    if let Some(limit) = &query.limit {
        match literal_usize(limit) {
            Some(n) => requested = Some(n),
            None => opaque = true,
        }
    }
    if let Some(fetch) = &query.fetch {
        match fetch.quantity.as_ref().and_then(literal_usize) {
            Some(n) if !fetch.percent => requested = Some(requested.map_or(n, |r| r.min(n))),
            _ => opaque = true,
        }
    }

    let (limit, cap_enforced) = match requested {
        Some(n) if !opaque && n < cap => (n, false),
        _ => (cap, true),
    };
    query.fetch = None;
    query.limit = Some(Expr::Value(Value::Number(limit.to_string(), false)));
    (limit, cap_enforced)
}

fn literal_usize(expr: &Expr) -> Option<usize> {
    match expr {
        Expr::Value(Value::Number(n, _)) => n.parse().ok(),
        _ => None,
    }
}

/// Keeps only identifier-safe characters so rejection reasons never carry raw input.
fn safe_ident(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '.')
        .take(64)
        .collect()
}

fn lower_parts(name: &ObjectName) -> Vec<String> {
    name.0.iter().map(|ident| ident.value.to_lowercase()).collect()
}

/// Unqualified, or qualified with exactly the descriptor's own schema.
fn in_namespace(prefix: &[String], schema: &SchemaDescriptor) -> bool {
    match prefix {
        [] => true,
        [namespace] => namespace == schema.namespace(),
        _ => false,
    }
}

fn is_system_relation(parts: &[String]) -> bool {
    let namespaced = parts.len() > 1
        && SYSTEM_NAMESPACES.contains(&parts[parts.len() - 2].as_str());
    let pg_named = parts.last().map_or(false, |p| p.starts_with("pg_"));
    namespaced || pg_named
}

fn is_system_function(parts: &[String]) -> bool {
    let Some(name) = parts.last() else {
        return false;
    };
    name.starts_with("pg_")
        || name.starts_with("xp_")
        || SYSTEM_FUNCTIONS.contains(&name.as_str())
        || parts
            .iter()
            .rev()
            .skip(1)
            .any(|ns| SYSTEM_NAMESPACES.contains(&ns.as_str()))
}

/// Everything rule 3 and rule 5 need, gathered in one AST walk.
#[derive(Default)]
struct ReferenceCollector {
    relations: Vec<Vec<String>>,
    /// alias -> underlying relation (last name part)
    table_aliases: HashMap<String, String>,
    /// CTE names and derived-table aliases; their columns are not checked individually.
    virtual_tables: HashSet<String>,
    /// Projection aliases and derived/CTE column lists.
    output_names: HashSet<String>,
    columns: Vec<String>,
    /// (qualifier parts, column), e.g. `(["public", "athletes"], "gpa")`.
    qualified_columns: Vec<(Vec<String>, String)>,
    system_objects: Vec<String>,
    data_modifying: bool,
    row_locking: bool,
    unsupported_source: bool,
}

impl ReferenceCollector {
    fn collect_projection(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                if select.into.is_some() {
                    self.data_modifying = true;
                }
                for item in &select.projection {
                    if let SelectItem::ExprWithAlias { alias, .. } = item {
                        self.output_names.insert(alias.value.to_lowercase());
                    }
                }
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.collect_projection(left);
                self.collect_projection(right);
            }
            SetExpr::Query(_) | SetExpr::Values(_) => {}
            _ => self.data_modifying = true,
        }
    }

    fn referenced_tables<'a>(&self, schema: &'a SchemaDescriptor) -> Vec<&'a TableSpec> {
        self.relations
            .iter()
            .filter_map(|parts| parts.split_last())
            .filter(|(_, prefix)| in_namespace(prefix, schema))
            .filter_map(|(name, _)| schema.table(name))
            .collect()
    }

    fn unresolved(&self, schema: &SchemaDescriptor) -> Option<RejectionReason> {
        let mut touches_system = false;
        for parts in &self.relations {
            if is_system_relation(parts) {
                touches_system = true;
                continue;
            }
            let (name, prefix) = match parts.split_last() {
                Some(split) => split,
                None => continue,
            };
            if prefix.is_empty() && self.virtual_tables.contains(name) {
                continue;
            }
            if !in_namespace(prefix, schema) || schema.table(name).is_none() {
                return Some(RejectionReason::UnknownTable {
                    name: safe_ident(&parts.join(".")),
                });
            }
        }
        if touches_system {
            // Columns of system relations are not in the descriptor; rule 5 rejects.
            return None;
        }

        let tables = self.referenced_tables(schema);
        let in_scope = |column: &str| {
            tables.iter().any(|t| t.column(column).is_some())
                || self.output_names.contains(column)
        };

        for column in &self.columns {
            if in_scope(column)
                || self.table_aliases.contains_key(column)
                || self.virtual_tables.contains(column)
            {
                continue;
            }
            return Some(self.unknown_column(column, schema));
        }

        for (qualifier, column) in &self.qualified_columns {
            let (name, prefix) = match qualifier.split_last() {
                Some(split) => split,
                None => continue,
            };
            let shown = qualifier.join(".");
            let target = if prefix.is_empty() {
                if self.virtual_tables.contains(name) {
                    continue;
                }
                self.table_aliases
                    .get(name)
                    .map(String::as_str)
                    .unwrap_or(name.as_str())
            } else if is_system_relation(qualifier) {
                continue;
            } else if in_namespace(prefix, schema) {
                name.as_str()
            } else {
                return Some(RejectionReason::UnknownTable {
                    name: safe_ident(&shown),
                });
            };
            if self.virtual_tables.contains(target) {
                continue;
            }
            let table = match schema.table(target) {
                Some(table) => table,
                None if is_system_relation(&[target.to_string()]) => continue,
                None => {
                    return Some(RejectionReason::UnknownTable {
                        name: safe_ident(&shown),
                    })
                }
            };
            if table.column(column).is_none() {
                return Some(self.unknown_column(&format!("{}.{}", shown, column), schema));
            }
        }
        None
    }

    fn unknown_column(&self, name: &str, schema: &SchemaDescriptor) -> RejectionReason {
        let bare = name.rsplit('.').next().unwrap_or(name);
        RejectionReason::UnknownColumn {
            name: safe_ident(name),
            suggestion: schema.suggest_column(bare).map(str::to_string),
        }
    }

    fn forbidden_access(&self) -> Option<RejectionReason> {
        if self.data_modifying {
            return Some(RejectionReason::DataModifying);
        }
        if self.row_locking {
            return Some(RejectionReason::RowLocking);
        }
        if let Some(parts) = self.relations.iter().find(|p| is_system_relation(p)) {
            return Some(RejectionReason::SystemAccess {
                object: safe_ident(&parts.join(".")),
            });
        }
        if let Some(object) = self.system_objects.first() {
            return Some(RejectionReason::SystemAccess {
                object: safe_ident(object),
            });
        }
        if self.unsupported_source {
            return Some(RejectionReason::UnsupportedSource);
        }
        None
    }
}

impl Visitor for ReferenceCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.virtual_tables.insert(cte.alias.name.value.to_lowercase());
                for column in &cte.alias.columns {
                    self.output_names.insert(column.value.to_lowercase());
                }
            }
        }
        if !query.locks.is_empty() {
            self.row_locking = true;
        }
        self.collect_projection(&query.body);
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        self.relations.push(lower_parts(relation));
        ControlFlow::Continue(())
    }

    fn pre_visit_table_factor(&mut self, table_factor: &TableFactor) -> ControlFlow<Self::Break> {
        match table_factor {
            TableFactor::Table { name, alias, args, .. } => {
                let parts = lower_parts(name);
                if args.is_some() {
                    // `FROM some_function(...)`
                    if is_system_function(&parts) {
                        self.system_objects.push(parts.join("."));
                    }
                    self.unsupported_source = true;
                }
                if let (Some(alias), Some(target)) = (alias, parts.last()) {
                    self.table_aliases
                        .insert(alias.name.value.to_lowercase(), target.clone());
                }
            }
            TableFactor::Derived { alias, .. } => {
                if let Some(alias) = alias {
                    self.virtual_tables.insert(alias.name.value.to_lowercase());
                    for column in &alias.columns {
                        self.output_names.insert(column.value.to_lowercase());
                    }
                }
            }
            TableFactor::NestedJoin { .. } => {}
            _ => self.unsupported_source = true,
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => self.columns.push(ident.value.to_lowercase()),
            Expr::CompoundIdentifier(parts) if parts.len() >= 2 => {
                let mut names: Vec<String> =
                    parts.iter().map(|ident| ident.value.to_lowercase()).collect();
                if let Some(column) = names.pop() {
                    self.qualified_columns.push((names, column));
                }
            }
            Expr::Function(function) => {
                let parts = lower_parts(&function.name);
                if is_system_function(&parts) {
                    self.system_objects.push(parts.join("."));
                }
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }
}
