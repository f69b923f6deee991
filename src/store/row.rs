//! Row types and the narrow row-oriented interface the session writes
//! through. The core never sees a connection or SQL; a backend only has to
//! answer these seven calls inside the host's transaction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;

/// An open interval's `to_version`.
pub const MAX_VERSION: i32 = i32::MAX;

/// One row of the `worksheets` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorksheetRow {
    pub id: Uuid,
    pub version: i32,
    pub name: String,
}

/// One row of the `worksheet_values` table: a value interval
/// `[from_version, to_version]` for one field of one worksheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueRow {
    pub worksheet_id: Uuid,
    pub index: i32,
    pub from_version: i32,
    pub to_version: i32,
    pub value: String,
}

/// Row-oriented access to the two tables, scoped to one host transaction.
#[async_trait(?Send)]
pub trait RowStore {
    async fn insert_worksheet(&mut self, row: &WorksheetRow) -> Result<(), StorageError>;

    async fn find_worksheet(&mut self, id: Uuid) -> Result<Option<WorksheetRow>, StorageError>;

    /// Moves the version column from `from` to `to`; returns false when the
    /// row no longer carries `from` (the optimistic-concurrency token).
    async fn bump_version(&mut self, id: Uuid, from: i32, to: i32) -> Result<bool, StorageError>;

    async fn insert_value(&mut self, row: &ValueRow) -> Result<(), StorageError>;

    /// Closes the open interval for `(worksheet_id, index)` by setting its
    /// `to_version`.
    async fn close_interval(
        &mut self,
        worksheet_id: Uuid,
        index: i32,
        to_version: i32,
    ) -> Result<(), StorageError>;

    /// All value rows live at `version`:
    /// `from_version <= version <= to_version`.
    async fn values_at(
        &mut self,
        worksheet_id: Uuid,
        version: i32,
    ) -> Result<Vec<ValueRow>, StorageError>;
}

#[async_trait(?Send)]
impl<R: RowStore + ?Sized> RowStore for &mut R {
    async fn insert_worksheet(&mut self, row: &WorksheetRow) -> Result<(), StorageError> {
        (**self).insert_worksheet(row).await
    }

    async fn find_worksheet(&mut self, id: Uuid) -> Result<Option<WorksheetRow>, StorageError> {
        (**self).find_worksheet(id).await
    }

    async fn bump_version(&mut self, id: Uuid, from: i32, to: i32) -> Result<bool, StorageError> {
        (**self).bump_version(id, from, to).await
    }

    async fn insert_value(&mut self, row: &ValueRow) -> Result<(), StorageError> {
        (**self).insert_value(row).await
    }

    async fn close_interval(
        &mut self,
        worksheet_id: Uuid,
        index: i32,
        to_version: i32,
    ) -> Result<(), StorageError> {
        (**self).close_interval(worksheet_id, index, to_version).await
    }

    async fn values_at(
        &mut self,
        worksheet_id: Uuid,
        version: i32,
    ) -> Result<Vec<ValueRow>, StorageError> {
        (**self).values_at(worksheet_id, version).await
    }
}
