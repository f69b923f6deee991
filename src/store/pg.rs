//! Postgres row store over a caller-supplied sqlx transaction. All reads
//! and writes ride that transaction and commit or abort with it.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::error::StorageError;
use crate::store::row::{RowStore, ValueRow, WorksheetRow, MAX_VERSION};

/// Logical storage schema. `index` needs quoting: it is reserved in
/// Postgres.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS worksheets (
    id      UUID PRIMARY KEY,
    version INTEGER NOT NULL,
    name    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS worksheet_values (
    id           BIGSERIAL PRIMARY KEY,
    worksheet_id UUID NOT NULL,
    "index"      INTEGER NOT NULL,
    from_version INTEGER NOT NULL,
    to_version   INTEGER NOT NULL,
    value        TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS worksheet_values_lookup
    ON worksheet_values (worksheet_id, "index", from_version);
"#;

/// Creates the two tables if they do not exist.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StorageError> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

/// `RowStore` over a borrowed Postgres transaction.
pub struct PgRowStore<'a, 'c> {
    tx: &'a mut Transaction<'c, Postgres>,
}

impl<'a, 'c> PgRowStore<'a, 'c> {
    pub fn new(tx: &'a mut Transaction<'c, Postgres>) -> PgRowStore<'a, 'c> {
        PgRowStore { tx }
    }
}

#[async_trait(?Send)]
impl RowStore for PgRowStore<'_, '_> {
    async fn insert_worksheet(&mut self, row: &WorksheetRow) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO worksheets (id, version, name) VALUES ($1, $2, $3)")
            .bind(row.id)
            .bind(row.version)
            .bind(&row.name)
            .execute(&mut **self.tx)
            .await?;
        Ok(())
    }

    async fn find_worksheet(&mut self, id: Uuid) -> Result<Option<WorksheetRow>, StorageError> {
        let row = sqlx::query("SELECT id, version, name FROM worksheets WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut **self.tx)
            .await?;
        Ok(row.map(|r| WorksheetRow {
            id: r.get("id"),
            version: r.get("version"),
            name: r.get("name"),
        }))
    }

    async fn bump_version(&mut self, id: Uuid, from: i32, to: i32) -> Result<bool, StorageError> {
        let result = sqlx::query("UPDATE worksheets SET version = $3 WHERE id = $1 AND version = $2")
            .bind(id)
            .bind(from)
            .bind(to)
            .execute(&mut **self.tx)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_value(&mut self, row: &ValueRow) -> Result<(), StorageError> {
        sqlx::query(
            r#"INSERT INTO worksheet_values (worksheet_id, "index", from_version, to_version, value)
               VALUES ($1, $2, $3, $4, $5)"#,
        )
        .bind(row.worksheet_id)
        .bind(row.index)
        .bind(row.from_version)
        .bind(row.to_version)
        .bind(&row.value)
        .execute(&mut **self.tx)
        .await?;
        Ok(())
    }

    async fn close_interval(
        &mut self,
        worksheet_id: Uuid,
        index: i32,
        to_version: i32,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"UPDATE worksheet_values SET to_version = $3
               WHERE worksheet_id = $1 AND "index" = $2 AND to_version = $4"#,
        )
        .bind(worksheet_id)
        .bind(index)
        .bind(to_version)
        .bind(MAX_VERSION)
        .execute(&mut **self.tx)
        .await?;
        Ok(())
    }

    async fn values_at(
        &mut self,
        worksheet_id: Uuid,
        version: i32,
    ) -> Result<Vec<ValueRow>, StorageError> {
        let rows = sqlx::query(
            r#"SELECT worksheet_id, "index", from_version, to_version, value
               FROM worksheet_values
               WHERE worksheet_id = $1 AND from_version <= $2 AND to_version >= $2
               ORDER BY "index""#,
        )
        .bind(worksheet_id)
        .bind(version)
        .fetch_all(&mut **self.tx)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| ValueRow {
                worksheet_id: r.get("worksheet_id"),
                index: r.get("index"),
                from_version: r.get("from_version"),
                to_version: r.get("to_version"),
                value: r.get("value"),
            })
            .collect())
    }
}
