//! Postgres catalog source
//!
//! Reads table and column metadata (with comments) from
//! `information_schema` for a fixed list of schemas.

use crate::catalog::{normalize_entries, CatalogSource, SchemaEntry};
use crate::error::{BiError, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::time::Duration;
use tracing::info;

const COLUMNS_QUERY: &str = r#"
    SELECT c.table_schema::text AS table_schema,
           c.table_name::text AS table_name,
           c.column_name::text AS column_name,
           c.data_type::text AS data_type,
           COALESCE(col_description(st.relid, c.ordinal_position::int), '') AS column_description,
           COALESCE(obj_description(st.relid, 'pg_class'), '') AS table_description
    FROM information_schema.columns c
    LEFT JOIN pg_catalog.pg_statio_all_tables st
      ON st.schemaname = c.table_schema AND st.relname = c.table_name
    WHERE c.table_schema = ANY($1)
    ORDER BY c.table_schema, c.table_name, c.ordinal_position
"#;

/// One row of the metadata query.
#[derive(Debug, Clone)]
struct ColumnRow {
    table_schema: String,
    table_name: String,
    column_name: String,
    data_type: String,
    column_description: String,
    table_description: String,
}

pub struct PostgresCatalogSource {
    pool: PgPool,
    schemas: Vec<String>,
}

impl PostgresCatalogSource {
    pub fn new(pool: PgPool, schemas: Vec<String>) -> Self {
        Self { pool, schemas }
    }

    pub async fn connect(database_url: &str, schemas: Vec<String>, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| BiError::CatalogUnavailable(format!("Failed to connect to metadata database: {}", e)))?;
        Ok(Self::new(pool, schemas))
    }
}

fn entries_from_rows(rows: Vec<ColumnRow>) -> Vec<SchemaEntry> {
    let mut entries: Vec<SchemaEntry> = Vec::new();
    let mut current_table: Option<String> = None;

    for row in rows {
        let table = format!("{}.{}", row.table_schema, row.table_name);
        if current_table.as_deref() != Some(table.as_str()) {
            entries.push(SchemaEntry::table(table.clone(), row.table_description.clone()));
            current_table = Some(table.clone());
        }
        entries.push(SchemaEntry::column(
            &table,
            &row.column_name,
            row.data_type,
            row.column_description,
        ));
    }
    entries
}

#[async_trait]
impl CatalogSource for PostgresCatalogSource {
    fn describe(&self) -> String {
        format!("postgres schemas [{}]", self.schemas.join(", "))
    }

    async fn load(&self) -> Result<Vec<SchemaEntry>> {
        let rows = sqlx::query(COLUMNS_QUERY)
            .bind(self.schemas.clone())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BiError::CatalogUnavailable(format!("Failed to load catalog columns: {}", e)))?;

        let decode = |e: sqlx::Error| BiError::CatalogUnavailable(format!("Unexpected catalog row: {}", e));
        let mut column_rows = Vec::with_capacity(rows.len());
        for row in rows {
            column_rows.push(ColumnRow {
                table_schema: row.try_get("table_schema").map_err(decode)?,
                table_name: row.try_get("table_name").map_err(decode)?,
                column_name: row.try_get("column_name").map_err(decode)?,
                data_type: row.try_get("data_type").map_err(decode)?,
                column_description: row.try_get("column_description").map_err(decode)?,
                table_description: row.try_get("table_description").map_err(decode)?,
            });
        }

        let entries = normalize_entries(entries_from_rows(column_rows))?;
        info!("Loaded {} catalog entries from {}", entries.len(), self.describe());
        Ok(entries)
    }
}
