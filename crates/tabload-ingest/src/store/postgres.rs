// Postgres storage backend

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Transaction};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{BatchSink, StoreError, StoreResult, TableCatalog};
use crate::schema::{FieldType, Identifier, PartitionRoute, PartitionSchema, TableNames};
use crate::types::{NormalizedRecord, Value};

/// Postgres caps bind parameters per statement at 65535
const MAX_BIND_PARAMS: usize = 65_535;

const TRUNCATE_TIMEOUT: &str = "1h";

/// Postgres-backed sink and table catalog
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await?;

        info!(max_connections, "Database connection pool created");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Rows per INSERT statement so a statement stays under the bind limit
    fn rows_per_statement(schema: &PartitionSchema) -> usize {
        (MAX_BIND_PARAMS / schema.fields().len().max(1)).max(1)
    }

    async fn insert_chunk(
        tx: &mut Transaction<'_, Postgres>,
        table: &Identifier,
        schema: &PartitionSchema,
        rows: &[NormalizedRecord],
    ) -> StoreResult<u64> {
        let columns = schema
            .fields()
            .iter()
            .map(|f| quote_column(&f.name))
            .collect::<Vec<_>>()
            .join(", ");

        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("INSERT INTO {} ({}) ", table.quoted(), columns));

        builder.push_values(rows, |mut b, row| {
            for field in schema.fields() {
                let value = row.get(&field.name);
                match field.field_type {
                    FieldType::String => {
                        b.push_bind(value.and_then(Value::as_text).map(str::to_owned));
                    }
                    FieldType::Integer => {
                        b.push_bind(value.and_then(Value::as_integer));
                    }
                    FieldType::Timestamp => {
                        b.push_bind(value.and_then(Value::as_timestamp));
                    }
                }
            }
        });

        builder.push(format!(
            " ON CONFLICT ({}) DO NOTHING",
            natural_key_columns(schema)
        ));

        let result = builder.build().execute(&mut **tx).await?;
        Ok(result.rows_affected())
    }
}

fn quote_column(name: &str) -> String {
    format!("\"{}\"", name)
}

fn natural_key_columns(schema: &PartitionSchema) -> String {
    schema
        .natural_key()
        .iter()
        .map(|k| quote_column(k))
        .collect::<Vec<_>>()
        .join(", ")
}

/// DDL for a staging table; the unique constraint is left unnamed so that
/// Postgres picks a fresh name after the previous staging table was renamed
fn staging_ddl(table: &Identifier, schema: &PartitionSchema) -> String {
    let columns = schema
        .fields()
        .iter()
        .map(|f| {
            let not_null = if schema.is_required(&f.name) {
                " NOT NULL"
            } else {
                ""
            };
            format!("{} {}{}", quote_column(&f.name), f.field_type.sql_type(), not_null)
        })
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "CREATE TABLE IF NOT EXISTS {} ({}, UNIQUE ({}))",
        table.quoted(),
        columns,
        natural_key_columns(schema)
    )
}

#[async_trait]
impl BatchSink for PgStore {
    async fn insert_batch(
        &self,
        table: &Identifier,
        schema: &PartitionSchema,
        rows: &[NormalizedRecord],
    ) -> StoreResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for chunk in rows.chunks(Self::rows_per_statement(schema)) {
            inserted += Self::insert_chunk(&mut tx, table, schema, chunk).await?;
        }
        tx.commit().await?;

        debug!(
            table = %table,
            batch_rows = rows.len(),
            inserted,
            "Inserted batch"
        );
        Ok(inserted)
    }
}

#[async_trait]
impl TableCatalog for PgStore {
    async fn ensure_staging(&self, route: &PartitionRoute) -> StoreResult<()> {
        sqlx::query(&staging_ddl(&route.tables.staging, &route.schema))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn truncate(&self, table: &Identifier) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!("SET LOCAL statement_timeout = '{}'", TRUNCATE_TIMEOUT))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("TRUNCATE TABLE {}", table.quoted()))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(table = %table, "Truncated table");
        Ok(())
    }

    async fn count_rows(&self, table: &Identifier) -> StoreResult<u64> {
        if !self.table_exists(table).await? {
            return Err(StoreError::TableMissing(table.to_string()));
        }
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table.quoted()))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn table_exists(&self, table: &Identifier) -> StoreResult<bool> {
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(table.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn rename_table(&self, from: &Identifier, to: &Identifier) -> StoreResult<()> {
        sqlx::query(&format!(
            "ALTER TABLE {} RENAME TO {}",
            from.quoted(),
            to.quoted()
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn drop_table(&self, table: &Identifier) -> StoreResult<()> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", table.quoted()))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn supports_atomic_swap(&self) -> bool {
        true
    }

    async fn swap_in(&self, tables: &TableNames) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let replaced: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(tables.production.as_str())
            .fetch_one(&mut *tx)
            .await?;

        if replaced {
            sqlx::query(&format!(
                "ALTER TABLE {} RENAME TO {}",
                tables.production.quoted(),
                tables.retired.quoted()
            ))
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(&format!(
            "ALTER TABLE {} RENAME TO {}",
            tables.staging.quoted(),
            tables.production.quoted()
        ))
        .execute(&mut *tx)
        .await?;

        if let Err(e) = tx.commit().await {
            warn!(production = %tables.production, error = %e, "Swap transaction failed to commit");
            return Err(e.into());
        }

        Ok(replaced)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::schema::FieldSpec;

    fn schema() -> PartitionSchema {
        PartitionSchema::new(
            vec![
                FieldSpec::new("LALVOTERID", FieldType::String),
                FieldSpec::new("Voters_Age", FieldType::Integer),
                FieldSpec::new("Voters_BirthDate", FieldType::Timestamp),
            ],
            vec!["LALVOTERID".into()],
        )
        .unwrap()
    }

    #[test]
    fn test_staging_ddl() {
        let table = Identifier::new("voter_ca_staging").unwrap();
        let ddl = staging_ddl(&table, &schema());
        assert_eq!(
            ddl,
            "CREATE TABLE IF NOT EXISTS \"voter_ca_staging\" (\"LALVOTERID\" TEXT NOT NULL, \
             \"Voters_Age\" BIGINT, \"Voters_BirthDate\" TIMESTAMPTZ, UNIQUE (\"LALVOTERID\"))"
        );
    }

    #[test]
    fn test_rows_per_statement_respects_bind_limit() {
        let rows = PgStore::rows_per_statement(&schema());
        assert_eq!(rows, 21_845);
        assert!(rows * schema().fields().len() <= MAX_BIND_PARAMS);
    }
}
