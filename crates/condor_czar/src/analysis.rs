//! SELECT analysis: validate the statement, reject duplicate select-list
//! names, resolve the dominant database, and produce the per-chunk query
//! templates the task-message factory instantiates at submit time.
//!
//! The session stays constructable when analysis fails so error retrieval
//! keeps working through the handle-based API; submit then skips dispatch.

use std::collections::HashMap;

use sqlparser::ast::{Expr, SelectItem, SetExpr, Statement, TableFactor};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;

use condor_common::{ChunkSpec, DUMMY_CHUNK};

use crate::qmeta::Catalog;

/// Placeholder substituted with the chunk id at submit time.
pub const CHUNK_TAG: &str = "%CHUNK%";

/// Parser/analysis state for one SELECT query.
pub struct QuerySession {
    original: String,
    default_db: String,
    error: Option<String>,
    dominant_db: String,
    dominant_table: String,
    from_tables: Vec<(String, String)>,
    scan_rating: i32,
    chunked: bool,
    fragment_templates: Vec<String>,
    merge_stmt: Option<String>,
    chunk_specs: Vec<ChunkSpec>,
}

struct Analyzed {
    dominant_db: String,
    dominant_table: String,
    from_tables: Vec<(String, String)>,
    scan_rating: i32,
    chunked: bool,
    fragment_templates: Vec<String>,
    merge_stmt: Option<String>,
}

impl QuerySession {
    /// Analyze a SELECT statement. Errors are captured, not thrown.
    pub fn analyze(sql: &str, default_db: &str, catalog: &dyn Catalog) -> QuerySession {
        let mut session = QuerySession {
            original: sql.to_string(),
            default_db: default_db.to_string(),
            error: None,
            dominant_db: String::new(),
            dominant_table: String::new(),
            from_tables: Vec::new(),
            scan_rating: 0,
            chunked: false,
            fragment_templates: Vec::new(),
            merge_stmt: None,
            chunk_specs: Vec::new(),
        };
        match try_analyze(sql, default_db, catalog) {
            Ok(a) => {
                session.dominant_db = a.dominant_db;
                session.dominant_table = a.dominant_table;
                session.from_tables = a.from_tables;
                session.scan_rating = a.scan_rating;
                session.chunked = a.chunked;
                session.fragment_templates = a.fragment_templates;
                session.merge_stmt = a.merge_stmt;
            }
            Err(msg) => {
                tracing::warn!(error = %msg, "query analysis failed");
                session.error = Some(msg);
            }
        }
        session
    }

    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }

    /// Non-empty only when analysis failed.
    pub fn get_error(&self) -> String {
        self.error.clone().unwrap_or_default()
    }

    pub fn original(&self) -> &str {
        &self.original
    }

    pub fn default_db(&self) -> &str {
        &self.default_db
    }

    pub fn dominant_db(&self) -> &str {
        &self.dominant_db
    }

    pub fn dominant_table(&self) -> &str {
        &self.dominant_table
    }

    /// Tables named in FROM (and JOINs), with their databases resolved.
    pub fn from_tables(&self) -> &[(String, String)] {
        &self.from_tables
    }

    /// Tables (in the dominant db) a shard scan will read.
    pub fn scan_tables(&self) -> Vec<String> {
        self.from_tables
            .iter()
            .filter(|(db, _)| *db == self.dominant_db)
            .map(|(_, t)| t.clone())
            .collect()
    }

    pub fn scan_rating(&self) -> i32 {
        self.scan_rating
    }

    /// True when the dominant table is partitioned.
    pub fn has_chunks(&self) -> bool {
        self.chunked
    }

    pub fn merge_stmt(&self) -> Option<&str> {
        self.merge_stmt.as_deref()
    }

    /// Templated SQL, fragment chain order preserved.
    pub fn query_template(&self) -> String {
        self.fragment_templates.join(" /*SEPARATOR*/; ")
    }

    /// Attach a chunk. Non-chunked queries accept only the dummy chunk.
    pub fn add_chunk(&mut self, spec: ChunkSpec) {
        if self.chunked || spec.chunk_id == DUMMY_CHUNK {
            self.chunk_specs.push(spec);
        }
    }

    pub fn chunk_specs(&self) -> &[ChunkSpec] {
        &self.chunk_specs
    }

    /// Instantiate the fragment chain for one chunk.
    pub fn chunk_queries(&self, chunk_id: i32) -> Vec<String> {
        self.fragment_templates
            .iter()
            .map(|t| t.replace(CHUNK_TAG, &chunk_id.to_string()))
            .collect()
    }
}

fn try_analyze(sql: &str, default_db: &str, catalog: &dyn Catalog) -> Result<Analyzed, String> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql)
        .map_err(|e| format!("SQL parse error: {e}"))?;
    if statements.len() != 1 {
        return Err(format!(
            "expected exactly one statement, got {}",
            statements.len()
        ));
    }
    let Statement::Query(query) = &statements[0] else {
        return Err("not a SELECT statement".to_string());
    };
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err("unsupported query form".to_string());
    };

    check_duplicate_select_names(&select.projection)?;

    // FROM (and JOIN) tables, databases resolved against the default.
    let mut from_tables: Vec<(String, String)> = Vec::new();
    for twj in &select.from {
        collect_table(&twj.relation, default_db, &mut from_tables);
        for join in &twj.joins {
            collect_table(&join.relation, default_db, &mut from_tables);
        }
    }
    let (dominant_db, dominant_table) = from_tables
        .first()
        .cloned()
        .ok_or_else(|| "query has no FROM table".to_string())?;

    let chunked = catalog.is_partitioned(&dominant_db, &dominant_table);

    // Slowest table rating across the scan set.
    let scan_rating = from_tables
        .iter()
        .map(|(db, t)| catalog.scan_rating(db, t))
        .min()
        .unwrap_or(0);

    // Per-chunk template: partitioned tables are renamed to their chunked
    // physical form.
    let mut template = sql.trim().trim_end_matches(';').to_string();
    if chunked {
        for (db, table) in &from_tables {
            if catalog.is_partitioned(db, table) {
                let replacement = format!("{db}.{table}_{CHUNK_TAG}");
                template = replace_ident(&template, &format!("{db}.{table}"), &replacement);
                template = replace_ident(&template, table, &replacement);
            }
        }
    }

    // Post-merge ordering is applied on the merge table, not per shard.
    let merge_stmt = find_order_by(sql).map(|clause| format!("SELECT * FROM {{result}} {clause}"));

    Ok(Analyzed {
        dominant_db,
        dominant_table,
        from_tables,
        scan_rating,
        chunked,
        fragment_templates: vec![template],
        merge_stmt,
    })
}

/// Duplicate output names in the select list are rejected with the alias
/// and its 1-based positions.
fn check_duplicate_select_names(projection: &[SelectItem]) -> Result<(), String> {
    let mut positions: HashMap<String, Vec<usize>> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for (idx, item) in projection.iter().enumerate() {
        let name = match item {
            SelectItem::ExprWithAlias { alias, .. } => Some(alias.value.to_lowercase()),
            SelectItem::UnnamedExpr(Expr::Identifier(id)) => Some(id.value.to_lowercase()),
            SelectItem::UnnamedExpr(Expr::CompoundIdentifier(ids)) => {
                ids.last().map(|id| id.value.to_lowercase())
            }
            _ => None,
        };
        if let Some(name) = name {
            let entry = positions.entry(name.clone()).or_default();
            if entry.is_empty() {
                order.push(name);
            }
            entry.push(idx + 1);
        }
    }
    for name in order {
        let found = &positions[&name];
        if found.len() > 1 {
            let pos_list = found
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(" ");
            return Err(format!(
                "DUPLICATE_SELECT_EXPR: duplicate select expression {name} at positions {pos_list}"
            ));
        }
    }
    Ok(())
}

fn collect_table(factor: &TableFactor, default_db: &str, out: &mut Vec<(String, String)>) {
    if let TableFactor::Table { name, .. } = factor {
        let full = name.to_string();
        let (db, table) = match full.split_once('.') {
            Some((db, table)) => (db.to_string(), table.to_string()),
            None => (default_db.to_string(), full),
        };
        out.push((db, table));
    }
}

/// Replace standalone occurrences of an identifier (not part of a longer
/// identifier, and not already qualified).
fn replace_ident(sql: &str, target: &str, replacement: &str) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;
    while i < sql.len() {
        if sql[i..].starts_with(target) {
            let boundary = |c: u8| {
                let c = c as char;
                !c.is_alphanumeric() && c != '_' && c != '.'
            };
            let before_ok = i == 0 || boundary(bytes[i - 1]);
            let end = i + target.len();
            let after_ok = end >= sql.len() || {
                let c = bytes[end] as char;
                !c.is_alphanumeric() && c != '_'
            };
            if before_ok && after_ok {
                out.push_str(replacement);
                i = end;
                continue;
            }
        }
        let ch = sql[i..].chars().next().expect("in-bounds char");
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

/// Locate a top-level ORDER BY clause textually.
fn find_order_by(sql: &str) -> Option<String> {
    let lower = sql.to_lowercase();
    let idx = lower.rfind("order by")?;
    Some(sql[idx..].trim_end_matches(';').trim().to_string())
}
