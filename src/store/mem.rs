//! In-memory row store. Backs the test suite and lets the runtime be
//! embedded without a database; semantics mirror the Postgres backend.

use uuid::Uuid;

use async_trait::async_trait;

use crate::error::StorageError;
use crate::store::row::{RowStore, ValueRow, WorksheetRow, MAX_VERSION};

#[derive(Debug, Default, Clone)]
pub struct MemStore {
    worksheets: Vec<WorksheetRow>,
    values: Vec<ValueRow>,
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore::default()
    }

    /// Worksheet rows ordered by id.
    pub fn worksheet_rows(&self) -> Vec<WorksheetRow> {
        let mut rows = self.worksheets.clone();
        rows.sort_by_key(|r| r.id);
        rows
    }

    /// Value rows ordered by (worksheet id, index, from_version).
    pub fn value_rows(&self) -> Vec<ValueRow> {
        let mut rows = self.values.clone();
        rows.sort_by_key(|r| (r.worksheet_id, r.index, r.from_version));
        rows
    }
}

#[async_trait(?Send)]
impl RowStore for MemStore {
    async fn insert_worksheet(&mut self, row: &WorksheetRow) -> Result<(), StorageError> {
        self.worksheets.push(row.clone());
        Ok(())
    }

    async fn find_worksheet(&mut self, id: Uuid) -> Result<Option<WorksheetRow>, StorageError> {
        Ok(self.worksheets.iter().find(|r| r.id == id).cloned())
    }

    async fn bump_version(&mut self, id: Uuid, from: i32, to: i32) -> Result<bool, StorageError> {
        for row in &mut self.worksheets {
            if row.id == id && row.version == from {
                row.version = to;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn insert_value(&mut self, row: &ValueRow) -> Result<(), StorageError> {
        self.values.push(row.clone());
        Ok(())
    }

    async fn close_interval(
        &mut self,
        worksheet_id: Uuid,
        index: i32,
        to_version: i32,
    ) -> Result<(), StorageError> {
        for row in &mut self.values {
            if row.worksheet_id == worksheet_id
                && row.index == index
                && row.to_version == MAX_VERSION
            {
                row.to_version = to_version;
            }
        }
        Ok(())
    }

    async fn values_at(
        &mut self,
        worksheet_id: Uuid,
        version: i32,
    ) -> Result<Vec<ValueRow>, StorageError> {
        let mut rows: Vec<ValueRow> = self
            .values
            .iter()
            .filter(|r| {
                r.worksheet_id == worksheet_id
                    && r.from_version <= version
                    && version <= r.to_version
            })
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.index);
        Ok(rows)
    }
}
