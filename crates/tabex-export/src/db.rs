//! Database collaborator for the cursor source
//!
//! The pipeline talks to a live database only through the [`Database`]
//! trait: list tables, count rows, run a bounded query. [`SqlxDatabase`]
//! implements it over a shared `sqlx` pool for PostgreSQL and SQLite.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use tracing::info;

use crate::config::DatabaseSettings;
use crate::error::{ExportError, Result};
use crate::model::{Row as ValueRow, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Dialect {
    /// Bind placeholder for the `n`th (1-based) parameter
    pub fn placeholder(&self, n: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", n),
            Dialect::Sqlite => "?".to_string(),
        }
    }
}

/// Rows returned by one bounded query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<ValueRow>,
}

#[async_trait]
pub trait Database: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// User tables, qualified with their schema when not the default one
    async fn list_tables(&self) -> Result<Vec<String>>;

    async fn count_rows(&self, table: &str) -> Result<u64>;

    async fn query_rows(&self, sql: &str, params: &[Value]) -> Result<RowSet>;
}

/// Quote a possibly schema-qualified identifier
pub fn quote_identifier(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

#[derive(Debug, Clone)]
pub enum SqlxDatabase {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl SqlxDatabase {
    /// Open a pool sized for `max_concurrency` units
    ///
    /// Any failure here is a run-level `Connection` error.
    pub async fn connect(settings: &DatabaseSettings, max_concurrency: usize) -> Result<Self> {
        let max_connections = settings.pool_size(max_concurrency);
        let url = settings.url.as_str();

        let database = if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            let pool = PgPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(settings.connect_timeout)
                .connect(url)
                .await
                .map_err(|e| ExportError::Connection(format!("postgres: {}", e)))?;
            SqlxDatabase::Postgres(pool)
        } else if url.starts_with("sqlite:") {
            let pool = SqlitePoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(settings.connect_timeout)
                .connect(url)
                .await
                .map_err(|e| ExportError::Connection(format!("sqlite: {}", e)))?;
            SqlxDatabase::Sqlite(pool)
        } else {
            return Err(ExportError::Config(
                "database url must start with postgres://, postgresql:// or sqlite:".to_string(),
            ));
        };

        info!(
            dialect = ?database.dialect(),
            max_connections,
            "Database connection pool created"
        );

        Ok(database)
    }

    pub fn from_sqlite_pool(pool: SqlitePool) -> Self {
        SqlxDatabase::Sqlite(pool)
    }

    pub fn from_pg_pool(pool: PgPool) -> Self {
        SqlxDatabase::Postgres(pool)
    }
}

macro_rules! bind_values {
    ($query:expr, $params:expr) => {{
        let mut query = $query;
        for param in $params {
            query = match param {
                Value::Null => query.bind(Option::<String>::None),
                Value::Bool(b) => query.bind(*b),
                Value::Int(i) => query.bind(*i),
                Value::Float(x) => query.bind(*x),
                Value::Decimal(d) => query.bind(d.to_string()),
                Value::Text(s) => query.bind(s.clone()),
                Value::Date(d) => query.bind(*d),
                Value::Timestamp(ts) => query.bind(*ts),
            };
        }
        query
    }};
}

#[async_trait]
impl Database for SqlxDatabase {
    fn dialect(&self) -> Dialect {
        match self {
            SqlxDatabase::Postgres(_) => Dialect::Postgres,
            SqlxDatabase::Sqlite(_) => Dialect::Sqlite,
        }
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        match self {
            SqlxDatabase::Postgres(pool) => {
                let rows: Vec<(String, String)> = sqlx::query_as(
                    "SELECT table_schema::text, table_name::text \
                     FROM information_schema.tables \
                     WHERE table_type = 'BASE TABLE' \
                       AND table_schema NOT IN ('pg_catalog', 'information_schema') \
                     ORDER BY table_schema, table_name",
                )
                .fetch_all(pool)
                .await?;

                Ok(rows
                    .into_iter()
                    .map(|(schema, table)| {
                        if schema == "public" {
                            table
                        } else {
                            format!("{}.{}", schema, table)
                        }
                    })
                    .collect())
            },
            SqlxDatabase::Sqlite(pool) => {
                let rows: Vec<(String,)> = sqlx::query_as(
                    "SELECT name FROM sqlite_master \
                     WHERE type = 'table' AND name NOT LIKE 'sqlite_%' \
                     ORDER BY name",
                )
                .fetch_all(pool)
                .await?;

                Ok(rows.into_iter().map(|(name,)| name).collect())
            },
        }
    }

    async fn count_rows(&self, table: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_identifier(table));
        let count: i64 = match self {
            SqlxDatabase::Postgres(pool) => sqlx::query_scalar(&sql).fetch_one(pool).await?,
            SqlxDatabase::Sqlite(pool) => sqlx::query_scalar(&sql).fetch_one(pool).await?,
        };
        Ok(count.max(0) as u64)
    }

    async fn query_rows(&self, sql: &str, params: &[Value]) -> Result<RowSet> {
        match self {
            SqlxDatabase::Postgres(pool) => {
                let rows = bind_values!(sqlx::query(sql), params)
                    .fetch_all(pool)
                    .await?;
                let columns = column_names(rows.first());
                let rows = rows
                    .iter()
                    .map(decode_pg_row)
                    .collect::<Result<Vec<_>>>()?;
                Ok(RowSet { columns, rows })
            },
            SqlxDatabase::Sqlite(pool) => {
                let rows = bind_values!(sqlx::query(sql), params)
                    .fetch_all(pool)
                    .await?;
                let columns = column_names(rows.first());
                let rows = rows
                    .iter()
                    .map(decode_sqlite_row)
                    .collect::<Result<Vec<_>>>()?;
                Ok(RowSet { columns, rows })
            },
        }
    }
}

fn column_names<R: Row>(row: Option<&R>) -> Vec<String> {
    row.map(|r| r.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default()
}

fn decode_pg_row(row: &PgRow) -> Result<ValueRow> {
    (0..row.len())
        .map(|idx| {
            let type_name = row.column(idx).type_info().name().to_string();
            decode_pg_value(row, idx, &type_name)
        })
        .collect()
}

fn lossy_text(bytes: Vec<u8>) -> String {
    String::from_utf8_lossy(&bytes).into_owned()
}

fn decode_pg_value(row: &PgRow, idx: usize, type_name: &str) -> Result<Value> {
    if row.try_get_raw(idx)?.is_null() {
        return Ok(Value::Null);
    }

    let value = match type_name {
        "BOOL" => Value::Bool(row.try_get(idx)?),
        "INT2" => Value::Int(row.try_get::<i16, _>(idx)?.into()),
        "INT4" => Value::Int(row.try_get::<i32, _>(idx)?.into()),
        "INT8" => Value::Int(row.try_get(idx)?),
        "FLOAT4" => Value::Float(row.try_get::<f32, _>(idx)?.into()),
        "FLOAT8" => Value::Float(row.try_get(idx)?),
        "NUMERIC" => Value::Text(row.try_get::<sqlx::types::BigDecimal, _>(idx)?.to_string()),
        "DATE" => Value::Date(row.try_get::<NaiveDate, _>(idx)?),
        "TIMESTAMP" => Value::Timestamp(row.try_get::<NaiveDateTime, _>(idx)?),
        "TIMESTAMPTZ" => Value::Timestamp(row.try_get::<DateTime<Utc>, _>(idx)?.naive_utc()),
        "TIME" => Value::Text(row.try_get::<NaiveTime, _>(idx)?.to_string()),
        "UUID" => Value::Text(row.try_get::<sqlx::types::Uuid, _>(idx)?.to_string()),
        "JSON" | "JSONB" => Value::Text(row.try_get::<sqlx::types::JsonValue, _>(idx)?.to_string()),
        "BYTEA" => Value::Text(lossy_text(row.try_get::<Vec<u8>, _>(idx)?)),
        _ => match row.try_get::<String, _>(idx) {
            Ok(s) => Value::Text(s),
            Err(_) => {
                return Err(ExportError::adapter(format!(
                    "unsupported column type {} in column {}",
                    type_name,
                    row.column(idx).name()
                )))
            },
        },
    };

    Ok(value)
}

fn decode_sqlite_row(row: &SqliteRow) -> Result<ValueRow> {
    (0..row.len())
        .map(|idx| decode_sqlite_value(row, idx))
        .collect()
}

fn decode_sqlite_value(row: &SqliteRow, idx: usize) -> Result<Value> {
    let storage = {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            return Ok(Value::Null);
        }
        raw.type_info().name().to_string()
    };

    let value = match storage.as_str() {
        "INTEGER" => Value::Int(row.try_get(idx)?),
        "REAL" => Value::Float(row.try_get(idx)?),
        "TEXT" => Value::Text(row.try_get(idx)?),
        "BLOB" => Value::Text(lossy_text(row.try_get::<Vec<u8>, _>(idx)?)),
        _ => {
            if let Ok(i) = row.try_get::<i64, _>(idx) {
                Value::Int(i)
            } else if let Ok(x) = row.try_get::<f64, _>(idx) {
                Value::Float(x)
            } else {
                Value::Text(row.try_get(idx)?)
            }
        },
    };

    Ok(value)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    async fn memory_db() -> SqlxDatabase {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT, score REAL)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO people (id, name, score) VALUES (1, 'ann', 1.5), (2, NULL, 3.0)")
            .execute(&pool)
            .await
            .unwrap();
        SqlxDatabase::from_sqlite_pool(pool)
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("users"), "\"users\"");
        assert_eq!(quote_identifier("sales.orders"), "\"sales\".\"orders\"");
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(Dialect::Postgres.placeholder(2), "$2");
        assert_eq!(Dialect::Sqlite.placeholder(2), "?");
    }

    #[tokio::test]
    async fn test_sqlite_catalog_and_count() {
        let db = memory_db().await;
        assert_eq!(db.list_tables().await.unwrap(), vec!["people"]);
        assert_eq!(db.count_rows("people").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sqlite_query_decodes_values() {
        let db = memory_db().await;
        let set = db
            .query_rows(
                "SELECT id, name, score FROM people WHERE id > ? ORDER BY id",
                &[Value::Int(0)],
            )
            .await
            .unwrap();

        assert_eq!(set.columns, vec!["id", "name", "score"]);
        assert_eq!(
            set.rows,
            vec![
                vec![Value::Int(1), Value::text("ann"), Value::Float(1.5)],
                vec![Value::Int(2), Value::Null, Value::Float(3.0)],
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_scheme_is_config_error() {
        let err = SqlxDatabase::connect(&DatabaseSettings::new("mysql://localhost/db"), 2)
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::Config(_)));
    }

    #[tokio::test]
    async fn test_missing_sqlite_file_is_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=ro", dir.path().join("absent.db").display());
        let err = SqlxDatabase::connect(&DatabaseSettings::new(url), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ExportError::Connection(_)));
    }
}
