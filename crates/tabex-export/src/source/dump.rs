//! SQL dump source
//!
//! The dump is held in memory as one document shared by every table's
//! adapter. Table definitions come from `CREATE TABLE` statements, rows from
//! `INSERT INTO <table> [(cols)] VALUES (...), (...);` statements naming the
//! table. Statement discovery is regex based and best-effort on arbitrary
//! dialects; value tuples go through the tokenizer, which has a strict,
//! tested quoting contract.
//!
//! Memory: a batch never holds more than `capacity` rows, but the document
//! itself is resident for the whole run and each table's adapter scans it
//! from the start.

use async_trait::async_trait;
use regex::Regex;
use std::path::Path;
use std::sync::{Arc, LazyLock};
use tracing::{debug, info};

use super::tokenizer::{scan_quoted, scan_tuple, statement_end, TupleScan};
use super::SourceAdapter;
use crate::error::{ExportError, Result};
use crate::model::RowBatch;
use crate::schema::{ColumnType, SchemaHints};

const IDENT: &str = r#"(?:[`"\[]?[\w$]+[`"\]]?\s*\.\s*)?[`"\[]?[\w$]+[`"\]]?"#;

#[allow(clippy::expect_used)]
static CREATE_TABLE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\bCREATE\s+(?:TEMPORARY\s+)?TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?({})\s*\(",
        IDENT
    ))
    .expect("Invalid CREATE TABLE regex")
});

#[allow(clippy::expect_used)]
static INSERT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?:INSERT|REPLACE)\s+(?:IGNORE\s+)?INTO\s+({})\s*(\([^)]*\))?\s*VALUES\b",
        IDENT
    ))
    .expect("Invalid INSERT regex")
});

/// Strip identifier quoting: `` `db`.`t` `` becomes `db.t`
pub fn normalize_identifier(raw: &str) -> String {
    raw.split('.')
        .map(|part| {
            part.trim()
                .trim_matches(|c| c == '`' || c == '"' || c == '[' || c == ']')
        })
        .collect::<Vec<_>>()
        .join(".")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredColumn {
    pub name: String,
    pub data_type: Option<ColumnType>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    pub name: String,
    pub columns: Vec<DeclaredColumn>,
}

struct InsertStatement {
    columns: Option<Vec<String>>,
    values_start: usize,
}

/// A parsed SQL dump
#[derive(Debug)]
pub struct DumpDocument {
    text: String,
    definitions: Vec<TableDefinition>,
}

impl DumpDocument {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ExportError::io(path, e))?;
        let document = Self::from_text(text);
        info!(
            path = %path.display(),
            bytes = document.text.len(),
            definitions = document.definitions.len(),
            "Loaded SQL dump"
        );
        Ok(document)
    }

    pub fn from_text(text: String) -> Self {
        let definitions = parse_definitions(&text);
        Self { text, definitions }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn definition(&self, table: &str) -> Option<&TableDefinition> {
        self.definitions.iter().find(|d| d.name == table)
    }

    /// Tables in `CREATE TABLE` order, then tables only named by `INSERT`s
    pub fn list_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = self.definitions.iter().map(|d| d.name.clone()).collect();

        let mut from = 0;
        while let Some(captures) = INSERT_REGEX.captures_at(&self.text, from) {
            let Some(whole) = captures.get(0) else { break };
            if let Some(name) = captures.get(1) {
                let name = normalize_identifier(name.as_str());
                if !tables.contains(&name) {
                    tables.push(name);
                }
            }
            from = statement_end(&self.text, whole.end());
        }

        tables
    }

    fn find_insert(&self, table: &str, mut from: usize) -> Option<InsertStatement> {
        while let Some(captures) = INSERT_REGEX.captures_at(&self.text, from) {
            let whole = captures.get(0)?;
            let name = captures.get(1).map(|m| normalize_identifier(m.as_str()));

            if name.as_deref() == Some(table) {
                let columns = captures.get(2).map(|list| {
                    let inner = list.as_str().trim_start_matches('(').trim_end_matches(')');
                    inner
                        .split(',')
                        .map(normalize_identifier)
                        .filter(|c| !c.is_empty())
                        .collect()
                });
                return Some(InsertStatement {
                    columns,
                    values_start: whole.end(),
                });
            }

            from = statement_end(&self.text, whole.end());
        }
        None
    }

    fn mentions(&self, table: &str) -> bool {
        self.definition(table).is_some() || self.find_insert(table, 0).is_some()
    }
}

fn parse_definitions(text: &str) -> Vec<TableDefinition> {
    let mut definitions = Vec::new();
    let mut from = 0;

    while let Some(captures) = CREATE_TABLE_REGEX.captures_at(text, from) {
        let Some(whole) = captures.get(0) else { break };
        let name = captures
            .get(1)
            .map(|m| normalize_identifier(m.as_str()))
            .unwrap_or_default();

        match balanced_body(text, whole.end()) {
            Some((body, end)) => {
                let columns = parse_columns(body);
                debug!(table = %name, columns = columns.len(), "Found table definition");
                if !definitions.iter().any(|d: &TableDefinition| d.name == name) {
                    definitions.push(TableDefinition { name, columns });
                }
                from = end;
            },
            None => break,
        }
    }

    definitions
}

/// Text between an already-consumed `(` at `start - 1` and its matching `)`
fn balanced_body(text: &str, start: usize) -> Option<(&str, usize)> {
    let bytes = text.as_bytes();
    let mut depth = 1usize;
    let mut i = start;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => {
                i = scan_quoted(text, i).ok()?.1;
                continue;
            },
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some((&text[start..i], i + 1));
                }
            },
            _ => {},
        }
        i += 1;
    }
    None
}

/// Split a definition body at top-level commas
fn split_top_level(body: &str) -> Vec<&str> {
    let bytes = body.as_bytes();
    let mut items = Vec::new();
    let mut depth = 0usize;
    let mut item_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => {
                if let Ok((_, after)) = scan_quoted(body, i) {
                    i = after;
                    continue;
                }
            },
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b',' if depth == 0 => {
                items.push(&body[item_start..i]);
                item_start = i + 1;
            },
            _ => {},
        }
        i += 1;
    }
    items.push(&body[item_start..]);
    items
}

fn parse_columns(body: &str) -> Vec<DeclaredColumn> {
    split_top_level(body)
        .into_iter()
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .filter(|item| !is_table_constraint(item))
        .filter_map(|item| {
            let (name, rest) = split_column_name(item)?;
            Some(DeclaredColumn {
                name,
                data_type: ColumnType::from_sql(rest),
            })
        })
        .collect()
}

/// Key, index, check and `LIKE` clauses of a definition body.
///
/// Decided by shape rather than the leading word alone, so columns named
/// `key`, `index` or `check` are still columns.
fn is_table_constraint(item: &str) -> bool {
    let upper = item.trim().to_ascii_uppercase();
    let split = upper
        .find(|c: char| c.is_whitespace() || c == '(')
        .unwrap_or(upper.len());
    let (first, rest) = (&upper[..split], upper[split..].trim_start());

    let next_word = rest
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default();
    let opens_list = rest.starts_with('(');
    let is_column_type = ColumnType::from_sql(rest).is_some();

    match first {
        "PRIMARY" | "FOREIGN" => next_word == "KEY",
        "CONSTRAINT" => !rest.is_empty() && !is_column_type,
        "CHECK" => opens_list,
        "UNIQUE" | "FULLTEXT" | "SPATIAL" => {
            opens_list || next_word == "KEY" || next_word == "INDEX"
        },
        "KEY" | "INDEX" => opens_list || (rest.contains('(') && !is_column_type),
        "EXCLUDE" => opens_list || next_word == "USING",
        "LIKE" => !rest.is_empty() && !is_column_type,
        _ => false,
    }
}

fn split_column_name(item: &str) -> Option<(String, &str)> {
    let (open, close) = match item.chars().next()? {
        '`' => ('`', '`'),
        '"' => ('"', '"'),
        '[' => ('[', ']'),
        _ => {
            let end = item.find(char::is_whitespace).unwrap_or(item.len());
            return Some((item[..end].to_string(), item[end..].trim()));
        },
    };
    let rest = &item[open.len_utf8()..];
    let end = rest.find(close)?;
    Some((rest[..end].to_string(), rest[end + close.len_utf8()..].trim()))
}

#[derive(Debug, Clone, Copy)]
enum ScanState {
    Searching { from: usize },
    InValues { pos: usize },
    Exhausted,
}

/// Streams one table's rows out of a shared dump document
pub struct DumpAdapter {
    document: Arc<DumpDocument>,
    table: String,
    state: ScanState,
    insert_columns: Option<Vec<String>>,
}

impl DumpAdapter {
    pub fn new(document: Arc<DumpDocument>, table: impl Into<String>) -> Self {
        Self {
            document,
            table: table.into(),
            state: ScanState::Exhausted,
            insert_columns: None,
        }
    }

    fn enter_statement(&mut self, statement: InsertStatement) -> Result<()> {
        if let Some(columns) = statement.columns {
            match &self.insert_columns {
                Some(existing) if *existing != columns => {
                    return Err(ExportError::adapter(format!(
                        "INSERT statements for '{}' use different column lists",
                        self.table
                    )))
                },
                Some(_) => {},
                None => self.insert_columns = Some(columns),
            }
        }
        self.state = ScanState::InValues {
            pos: statement.values_start,
        };
        Ok(())
    }
}

#[async_trait]
impl SourceAdapter for DumpAdapter {
    async fn open(&mut self) -> Result<()> {
        if !self.document.mentions(&self.table) {
            return Err(ExportError::adapter(format!(
                "table '{}' not found in dump",
                self.table
            )));
        }
        self.state = ScanState::Searching { from: 0 };
        self.insert_columns = None;
        Ok(())
    }

    async fn next_batch(&mut self, capacity: usize) -> Result<Option<RowBatch>> {
        let mut batch = RowBatch::with_capacity(capacity.min(4096));
        let document = Arc::clone(&self.document);
        let text = document.text();

        while batch.len() < capacity {
            match self.state {
                ScanState::Searching { from } => match document.find_insert(&self.table, from) {
                    Some(statement) => self.enter_statement(statement)?,
                    None => self.state = ScanState::Exhausted,
                },
                ScanState::InValues { pos } => match scan_tuple(text, pos)? {
                    TupleScan::Row { values, next } => {
                        batch.push(values);
                        self.state = ScanState::InValues { pos: next };
                    },
                    TupleScan::EndOfStatement { next } => {
                        self.state = ScanState::Searching { from: next };
                    },
                },
                ScanState::Exhausted => break,
            }
        }

        Ok((!batch.is_empty()).then_some(batch))
    }

    async fn close(&mut self) -> Result<()> {
        self.state = ScanState::Exhausted;
        Ok(())
    }

    fn schema_hints(&self) -> SchemaHints {
        let definition = self.document.definition(&self.table);

        match (&self.insert_columns, definition) {
            (Some(columns), Some(definition)) => SchemaHints::declared(
                columns.clone(),
                columns
                    .iter()
                    .map(|name| {
                        definition
                            .columns
                            .iter()
                            .find(|c| c.name.eq_ignore_ascii_case(name))
                            .and_then(|c| c.data_type)
                    })
                    .collect(),
            ),
            (Some(columns), None) => SchemaHints::with_names(columns.clone()).advisory(),
            (None, Some(definition)) => SchemaHints::declared(
                definition.columns.iter().map(|c| c.name.clone()).collect(),
                definition.columns.iter().map(|c| c.data_type).collect(),
            ),
            (None, None) => SchemaHints::default(),
        }
    }
}
