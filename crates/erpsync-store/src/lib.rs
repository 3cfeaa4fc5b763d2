//! Destination warehouse: transactional batch upserts, row deletes and
//! watermark lookups against Postgres.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use erpsync_core::{ensure_identifier, ColumnValue, ConfigError, ConflictAction, Row, TableContract, MAX_BATCH_ROWS};
use sqlx::postgres::PgPoolOptions;
use sqlx::query_builder::Separated;
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;
use tracing::{debug, error, warn};

pub const CRATE_NAME: &str = "erpsync-store";

/// Bind parameter ceiling of a single Postgres statement.
pub const MAX_BIND_PARAMS: usize = 65_535;

/// SQLSTATE raised when `statement_timeout` cancels a statement.
const QUERY_CANCELED: &str = "57014";

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("batch of {rows} rows for {table} exceeds the limit of {limit}")]
    BatchTooLarge {
        table: String,
        rows: usize,
        limit: usize,
    },
    #[error("row {index} for {table} has {actual} values, expected {expected}")]
    RowShape {
        table: String,
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error(transparent)]
    Identifier(#[from] ConfigError),
    #[error("database error on {table}: {source}")]
    Database {
        table: String,
        #[source]
        source: sqlx::Error,
    },
}

impl WriteError {
    fn database(table: &str) -> impl FnOnce(sqlx::Error) -> WriteError + '_ {
        move |source| WriteError::Database {
            table: table.to_string(),
            source,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            WriteError::Database {
                source: sqlx::Error::PoolTimedOut,
                ..
            } => true,
            WriteError::Database {
                source: sqlx::Error::Database(db),
                ..
            } => db.code().as_deref() == Some(QUERY_CANCELED),
            _ => false,
        }
    }
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Writes all rows in one transaction; returns rows the store reports as
    /// inserted or updated. Nothing is written when this fails.
    async fn write_batch(&self, contract: &TableContract, rows: &[Row]) -> Result<u64, WriteError>;

    async fn max_value(&self, table: &str, column: &str) -> Result<Option<i64>, WriteError>;

    async fn delete_by_row_id(
        &self,
        table: &str,
        row_id_column: &str,
        row_id: &str,
    ) -> Result<u64, WriteError>;
}

/// Rejects oversized or ragged batches before any SQL is built.
pub fn validate_batch(contract: &TableContract, rows: &[Row]) -> Result<(), WriteError> {
    ensure_identifier(&contract.table)?;
    for column in &contract.columns {
        ensure_identifier(column)?;
    }
    let limit = MAX_BATCH_ROWS.min(MAX_BIND_PARAMS / contract.columns.len().max(1));
    if rows.len() > limit {
        return Err(WriteError::BatchTooLarge {
            table: contract.table.clone(),
            rows: rows.len(),
            limit,
        });
    }
    for (index, row) in rows.iter().enumerate() {
        if row.len() != contract.columns.len() {
            return Err(WriteError::RowShape {
                table: contract.table.clone(),
                index,
                expected: contract.columns.len(),
                actual: row.len(),
            });
        }
    }
    Ok(())
}

fn quote_ident(name: &str) -> String {
    format!("\"{name}\"")
}

fn quoted_list<'s>(names: impl IntoIterator<Item = &'s String>) -> String {
    names
        .into_iter()
        .map(|n| quote_ident(n))
        .collect::<Vec<_>>()
        .join(", ")
}

fn push_column_value(b: &mut Separated<'_, '_, Postgres, &'static str>, value: &ColumnValue) {
    match value {
        ColumnValue::Text(v) => b.push_bind(v.clone()),
        ColumnValue::Int(v) => b.push_bind(*v),
        ColumnValue::Float(v) => b.push_bind(*v),
        ColumnValue::Flag(v) => b.push_bind(*v),
        ColumnValue::Date(v) => b.push_bind(*v),
        ColumnValue::Timestamp(v) => b.push_bind(*v),
    };
}

/// One multi-row `INSERT ... ON CONFLICT` statement for the batch.
pub fn build_upsert_query<'a>(contract: &TableContract, rows: &'a [Row]) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::<Postgres>::new("INSERT INTO ");
    qb.push(quote_ident(&contract.table));
    qb.push(" (");
    qb.push(quoted_list(&contract.columns));
    qb.push(") ");
    qb.push_values(rows.iter(), |mut b, row| {
        for value in row {
            push_column_value(&mut b, value);
        }
    });
    qb.push(" ON CONFLICT (");
    qb.push(quoted_list(&contract.key_columns));
    qb.push(")");

    let updates: Vec<String> = contract
        .update_columns()
        .map(|c| format!("{col} = EXCLUDED.{col}", col = quote_ident(c)))
        .collect();
    match contract.conflict {
        ConflictAction::Upsert if !updates.is_empty() => {
            qb.push(" DO UPDATE SET ");
            qb.push(updates.join(", "));
        }
        _ => {
            qb.push(" DO NOTHING");
        }
    }
    qb
}

#[derive(Debug, Clone)]
pub struct PgWarehouse {
    pool: PgPool,
    statement_timeout: Duration,
}

impl PgWarehouse {
    pub fn new(pool: PgPool, statement_timeout: Duration) -> Self {
        Self {
            pool,
            statement_timeout,
        }
    }

    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        statement_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .context("connecting to destination database")?;
        Ok(Self::new(pool, statement_timeout))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn set_timeout_sql(&self) -> String {
        format!(
            "SET LOCAL statement_timeout = {}",
            self.statement_timeout.as_millis().max(1)
        )
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn write_batch(&self, contract: &TableContract, rows: &[Row]) -> Result<u64, WriteError> {
        if rows.is_empty() {
            return Ok(0);
        }
        validate_batch(contract, rows)?;
        let table = contract.table.as_str();

        let mut tx = self.pool.begin().await.map_err(WriteError::database(table))?;
        sqlx::query(&self.set_timeout_sql())
            .execute(&mut *tx)
            .await
            .map_err(WriteError::database(table))?;

        let mut qb = build_upsert_query(contract, rows);
        match qb.build().execute(&mut *tx).await {
            Ok(done) => {
                if let Err(err) = tx.commit().await {
                    error!(table, rows = rows.len(), error = %err, "batch commit failed");
                    return Err(WriteError::Database {
                        table: table.to_string(),
                        source: err,
                    });
                }
                debug!(table, rows = rows.len(), affected = done.rows_affected(), "batch committed");
                Ok(done.rows_affected())
            }
            Err(err) => {
                error!(table, rows = rows.len(), error = %err, "batch write failed, rolling back");
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(table, error = %rollback_err, "rollback failed");
                }
                Err(WriteError::Database {
                    table: table.to_string(),
                    source: err,
                })
            }
        }
    }

    async fn max_value(&self, table: &str, column: &str) -> Result<Option<i64>, WriteError> {
        ensure_identifier(table)?;
        ensure_identifier(column)?;
        let sql = format!(
            "SELECT MAX({})::bigint FROM {}",
            quote_ident(column),
            quote_ident(table)
        );
        sqlx::query_scalar::<_, Option<i64>>(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(WriteError::database(table))
    }

    async fn delete_by_row_id(
        &self,
        table: &str,
        row_id_column: &str,
        row_id: &str,
    ) -> Result<u64, WriteError> {
        ensure_identifier(table)?;
        ensure_identifier(row_id_column)?;
        let sql = format!(
            "DELETE FROM {} WHERE {} = $1",
            quote_ident(table),
            quote_ident(row_id_column)
        );

        let mut tx = self.pool.begin().await.map_err(WriteError::database(table))?;
        sqlx::query(&self.set_timeout_sql())
            .execute(&mut *tx)
            .await
            .map_err(WriteError::database(table))?;
        let done = sqlx::query(&sql)
            .bind(row_id)
            .execute(&mut *tx)
            .await
            .map_err(WriteError::database(table))?;
        tx.commit().await.map_err(WriteError::database(table))?;
        Ok(done.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract(conflict: ConflictAction) -> TableContract {
        TableContract {
            table: "labordtl".into(),
            columns: vec!["laborhedseq".into(), "labordtlseq".into(), "jobnum".into(), "laborhrs".into()],
            key_columns: vec!["laborhedseq".into(), "labordtlseq".into()],
            conflict,
        }
    }

    fn row(seq: i64) -> Row {
        vec![
            ColumnValue::Int(1),
            ColumnValue::Int(seq),
            ColumnValue::Text(Some("J-1".into())),
            ColumnValue::Float(2.5),
        ]
    }

    #[test]
    fn upsert_updates_every_non_key_column() {
        let rows = vec![row(1), row(2)];
        let qb = build_upsert_query(&contract(ConflictAction::Upsert), &rows);
        assert_eq!(
            qb.sql(),
            "INSERT INTO \"labordtl\" (\"laborhedseq\", \"labordtlseq\", \"jobnum\", \"laborhrs\") \
             VALUES ($1, $2, $3, $4), ($5, $6, $7, $8) \
             ON CONFLICT (\"laborhedseq\", \"labordtlseq\") \
             DO UPDATE SET \"jobnum\" = EXCLUDED.\"jobnum\", \"laborhrs\" = EXCLUDED.\"laborhrs\""
        );
    }

    #[test]
    fn insert_ignore_does_nothing_on_conflict() {
        let rows = vec![row(1)];
        let qb = build_upsert_query(&contract(ConflictAction::InsertIgnore), &rows);
        assert!(qb.sql().ends_with("ON CONFLICT (\"laborhedseq\", \"labordtlseq\") DO NOTHING"));
        assert!(!qb.sql().contains("DO UPDATE"));
    }

    #[test]
    fn batch_ceiling_is_enforced() {
        let rows: Vec<Row> = (0..=MAX_BATCH_ROWS as i64).map(row).collect();
        let err = validate_batch(&contract(ConflictAction::Upsert), &rows).unwrap_err();
        assert!(matches!(err, WriteError::BatchTooLarge { rows: 501, limit: 500, .. }));
        assert!(validate_batch(&contract(ConflictAction::Upsert), &rows[..500]).is_ok());
    }

    #[test]
    fn wide_tables_get_a_lower_ceiling() {
        let wide = TableContract {
            table: "wide".into(),
            columns: (0..200).map(|i| format!("c{i}")).collect(),
            key_columns: vec!["c0".into()],
            conflict: ConflictAction::Upsert,
        };
        let rows: Vec<Row> = (0..400).map(|_| vec![ColumnValue::Int(0); 200]).collect();
        assert!(matches!(
            validate_batch(&wide, &rows),
            Err(WriteError::BatchTooLarge { limit: 327, .. })
        ));
    }

    #[test]
    fn ragged_rows_and_unsafe_names_are_rejected() {
        let mut rows = vec![row(1)];
        rows[0].pop();
        assert!(matches!(
            validate_batch(&contract(ConflictAction::Upsert), &rows),
            Err(WriteError::RowShape { index: 0, expected: 4, actual: 3, .. })
        ));

        let mut bad = contract(ConflictAction::Upsert);
        bad.table = "labordtl; drop table part".into();
        assert!(matches!(
            validate_batch(&bad, &[row(1)]),
            Err(WriteError::Identifier(_))
        ));
    }
}
