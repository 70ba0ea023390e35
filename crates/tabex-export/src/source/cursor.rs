//! Live database source
//!
//! Pages through one table with bounded queries. With an order key the
//! adapter uses keyset paging (`WHERE key > last ORDER BY key LIMIT n`),
//! which stays fast and stable at any depth. Without one it falls back to
//! `ORDER BY 1 LIMIT n OFFSET k`: every page rescans the skipped rows, and
//! rows inserted or deleted concurrently can shift across page boundaries.
//!
//! Keyset paging skips every row that ties the last key of a page, so the
//! order key must be unique. `open` checks this and refuses duplicates.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::SourceAdapter;
use crate::db::{quote_identifier, Database};
use crate::error::{ExportError, Result};
use crate::model::{RowBatch, Value};
use crate::schema::SchemaHints;

pub struct CursorAdapter {
    database: Arc<dyn Database>,
    table: String,
    order_key: Option<String>,
    estimated_rows: Option<u64>,
    columns: Vec<String>,
    offset: u64,
    last_key: Option<Value>,
    exhausted: bool,
}

impl CursorAdapter {
    pub fn new(
        database: Arc<dyn Database>,
        table: impl Into<String>,
        order_key: Option<String>,
    ) -> Self {
        Self {
            database,
            table: table.into(),
            order_key,
            estimated_rows: None,
            columns: Vec::new(),
            offset: 0,
            last_key: None,
            exhausted: true,
        }
    }

    fn page_query(&self, capacity: usize) -> (String, Vec<Value>) {
        let table = quote_identifier(&self.table);

        match (&self.order_key, &self.last_key) {
            (Some(key), None) => (
                format!(
                    "SELECT * FROM {} ORDER BY {} LIMIT {}",
                    table,
                    quote_identifier(key),
                    capacity
                ),
                Vec::new(),
            ),
            (Some(key), Some(last)) => {
                let key = quote_identifier(key);
                (
                    format!(
                        "SELECT * FROM {} WHERE {} > {} ORDER BY {} LIMIT {}",
                        table,
                        key,
                        self.database.dialect().placeholder(1),
                        key,
                        capacity
                    ),
                    vec![last.clone()],
                )
            },
            (None, _) => (
                format!(
                    "SELECT * FROM {} ORDER BY 1 LIMIT {} OFFSET {}",
                    table, capacity, self.offset
                ),
                Vec::new(),
            ),
        }
    }

    async fn ensure_unique_key(&self, key: &str) -> Result<()> {
        let column = quote_identifier(key);
        let sql = format!(
            "SELECT COUNT({}), COUNT(DISTINCT {}) FROM {}",
            column,
            column,
            quote_identifier(&self.table)
        );
        let counts = self.database.query_rows(&sql, &[]).await?;

        let (keyed, distinct) = match counts.rows.first().map(Vec::as_slice) {
            Some([Value::Int(keyed), Value::Int(distinct)]) => (*keyed, *distinct),
            _ => {
                return Err(ExportError::adapter(format!(
                    "cannot count distinct values of order key '{}' in '{}'",
                    key, self.table
                )))
            },
        };
        if keyed != distinct {
            return Err(ExportError::adapter(format!(
                "order key '{}' of '{}' is not unique ({} values, {} distinct)",
                key, self.table, keyed, distinct
            )));
        }
        Ok(())
    }

    fn remember_last_key(&mut self, batch: &RowBatch) -> Result<()> {
        let Some(key) = &self.order_key else {
            return Ok(());
        };

        let index = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(key))
            .ok_or_else(|| {
                ExportError::adapter(format!(
                    "order key '{}' is not a column of '{}'",
                    key, self.table
                ))
            })?;

        match batch.rows().last().and_then(|row| row.get(index)) {
            Some(Value::Null) | None => Err(ExportError::adapter(format!(
                "order key '{}' of '{}' contains NULL",
                key, self.table
            ))),
            Some(value) => {
                self.last_key = Some(value.clone());
                Ok(())
            },
        }
    }
}

#[async_trait]
impl SourceAdapter for CursorAdapter {
    async fn open(&mut self) -> Result<()> {
        self.estimated_rows = Some(self.database.count_rows(&self.table).await?);
        self.offset = 0;
        self.last_key = None;
        self.exhausted = false;

        match &self.order_key {
            Some(key) => self.ensure_unique_key(key).await?,
            None => warn!(
                table = %self.table,
                "No order key; paging with LIMIT/OFFSET, which slows down on deep pages"
            ),
        }
        Ok(())
    }

    async fn next_batch(&mut self, capacity: usize) -> Result<Option<RowBatch>> {
        if self.exhausted {
            return Ok(None);
        }

        let (sql, params) = self.page_query(capacity);
        debug!(table = %self.table, sql = %sql, "Fetching page");
        let page = self.database.query_rows(&sql, &params).await?;

        if self.columns.is_empty() {
            self.columns = page.columns;
        }
        if page.rows.len() < capacity {
            self.exhausted = true;
        }
        if page.rows.is_empty() {
            return Ok(None);
        }

        let batch = RowBatch::new(page.rows);
        self.offset += batch.len() as u64;
        self.remember_last_key(&batch)?;
        Ok(Some(batch))
    }

    async fn close(&mut self) -> Result<()> {
        self.exhausted = true;
        Ok(())
    }

    fn estimated_rows(&self) -> Option<u64> {
        self.estimated_rows
    }

    fn schema_hints(&self) -> SchemaHints {
        if self.columns.is_empty() {
            SchemaHints::default()
        } else {
            SchemaHints::with_names(self.columns.clone())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::db::SqlxDatabase;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn database(rows: i64) -> Arc<dyn Database> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::query("CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE gaps (k INTEGER, v TEXT)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE ev (day INTEGER, n INTEGER)")
            .execute(&pool)
            .await
            .unwrap();
        for id in 1..=rows {
            sqlx::query("INSERT INTO items (id, label) VALUES (?, ?)")
                .bind(id)
                .bind(format!("item-{}", id))
                .execute(&pool)
                .await
                .unwrap();
        }
        Arc::new(SqlxDatabase::from_sqlite_pool(pool))
    }

    async fn drain(adapter: &mut CursorAdapter, capacity: usize) -> Vec<RowBatch> {
        let mut batches = Vec::new();
        while let Some(batch) = adapter.next_batch(capacity).await.unwrap() {
            assert!(batch.len() <= capacity);
            batches.push(batch);
        }
        batches
    }

    fn ids(batches: &[RowBatch]) -> Vec<Value> {
        batches
            .iter()
            .flat_map(|b| b.rows().iter().map(|r| r[0].clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_offset_paging() {
        let mut adapter = CursorAdapter::new(database(10).await, "items", None);
        adapter.open().await.unwrap();
        assert_eq!(adapter.estimated_rows(), Some(10));

        let batches = drain(&mut adapter, 3).await;
        let sizes: Vec<usize> = batches.iter().map(RowBatch::len).collect();
        assert_eq!(sizes, vec![3, 3, 3, 1]);
        assert_eq!(ids(&batches), (1..=10).map(Value::Int).collect::<Vec<_>>());
        assert_eq!(
            adapter.schema_hints().names,
            Some(vec!["id".to_string(), "label".to_string()])
        );
    }

    #[tokio::test]
    async fn test_keyset_paging() {
        let mut adapter =
            CursorAdapter::new(database(7).await, "items", Some("id".to_string()));
        adapter.open().await.unwrap();

        let batches = drain(&mut adapter, 3).await;
        let sizes: Vec<usize> = batches.iter().map(RowBatch::len).collect();
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(ids(&batches), (1..=7).map(Value::Int).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_exact_multiple_ends_with_empty_page() {
        let mut adapter = CursorAdapter::new(database(6).await, "items", None);
        adapter.open().await.unwrap();
        let batches = drain(&mut adapter, 3).await;
        assert_eq!(batches.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_table() {
        let mut adapter = CursorAdapter::new(database(0).await, "items", None);
        adapter.open().await.unwrap();
        assert_eq!(adapter.estimated_rows(), Some(0));
        assert!(adapter.next_batch(5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_table_fails_open() {
        let mut adapter = CursorAdapter::new(database(1).await, "nope", None);
        let err = adapter.open().await.unwrap_err();
        assert!(matches!(err, ExportError::Adapter { .. }));
    }

    #[tokio::test]
    async fn test_null_order_key_is_adapter_error() {
        let db = database(0).await;
        db.query_rows("INSERT INTO gaps (k, v) VALUES (NULL, 'x')", &[])
            .await
            .unwrap();

        let mut adapter = CursorAdapter::new(db, "gaps", Some("k".to_string()));
        adapter.open().await.unwrap();
        let err = adapter.next_batch(5).await.unwrap_err();
        assert!(matches!(err, ExportError::Adapter { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_order_key_fails_open() {
        let db = database(0).await;
        for (day, n) in [(1, 1), (1, 2), (2, 3), (2, 4), (2, 5), (3, 6)] {
            db.query_rows(
                "INSERT INTO ev (day, n) VALUES (?, ?)",
                &[Value::Int(day), Value::Int(n)],
            )
            .await
            .unwrap();
        }

        let mut keyed = CursorAdapter::new(db.clone(), "ev", Some("day".to_string()));
        let err = keyed.open().await.unwrap_err();
        assert!(matches!(err, ExportError::Adapter { .. }));
        assert!(err.to_string().contains("not unique"), "{}", err);

        // Without a key every row still comes back
        let mut offset = CursorAdapter::new(db, "ev", None);
        offset.open().await.unwrap();
        let total: usize = drain(&mut offset, 3).await.iter().map(RowBatch::len).sum();
        assert_eq!(total, 6);
    }
}
