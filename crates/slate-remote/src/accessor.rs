//! Typed entity accessors
//!
//! One accessor per entity type, each call exactly one backend round trip.
//! Accessors never touch the query cache; callers handle that.

use crate::backend::{Backend, Filter, RemoteResult};
use crate::table::Table;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use slate_core::error::codes;
use slate_core::{Entity, RecordId, RemoteError, SlateResult};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

/// Decode a backend row into `T`
///
/// # Errors
/// `RemoteError` with the `decode` code when the row does not match `T`
pub fn decode_row<T: DeserializeOwned>(table: Table, row: Value) -> RemoteResult<T> {
    serde_json::from_value(row)
        .map_err(|e| RemoteError::new(codes::DECODE, format!("{table}: {e}")))
}

/// Encode `value` as a backend row
///
/// # Errors
/// `RemoteError` with the `decode` code when `value` cannot be represented as JSON
pub fn encode_row<T: Serialize>(table: Table, value: &T) -> RemoteResult<Value> {
    serde_json::to_value(value)
        .map_err(|e| RemoteError::new(codes::DECODE, format!("{table}: {e}")))
}

/// Remote accessor for one entity collection
pub struct RemoteAccessor<E> {
    backend: Arc<dyn Backend>,
    table: Table,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> RemoteAccessor<E> {
    /// Accessor for `E`'s table
    #[must_use]
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            table: Table::for_kind(E::KIND),
            _entity: PhantomData,
        }
    }

    /// Backing table
    #[inline]
    #[must_use]
    pub fn table(&self) -> Table {
        self.table
    }

    /// Every record, in server order
    ///
    /// # Errors
    /// `RemoteOperationFailed` on any backend or decode failure
    pub async fn list(&self) -> SlateResult<Vec<E>> {
        debug!(table = %self.table, "list");
        let rows = self.backend.select(self.table, &Filter::all()).await?;
        let records = rows
            .into_iter()
            .map(|row| decode_row(self.table, row))
            .collect::<RemoteResult<Vec<E>>>()?;
        Ok(records)
    }

    /// One record by id
    ///
    /// # Errors
    /// `RemoteOperationFailed` with a not-found code when absent
    pub async fn get(&self, id: &RecordId) -> SlateResult<E> {
        let filter = Filter::all().eq("id", id.as_str()).limit(1);
        let row = self
            .backend
            .select(self.table, &filter)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::new(codes::NO_ROWS, format!("{} {id} not found", E::KIND)))?;
        Ok(decode_row(self.table, row)?)
    }

    /// Create a record; the server assigns its id
    ///
    /// # Errors
    /// `RemoteOperationFailed` on any backend or decode failure
    pub async fn create(&self, draft: &E::Draft) -> SlateResult<E> {
        debug!(table = %self.table, "create");
        let mut row = encode_row(self.table, &E::from_draft(RecordId::placeholder(), draft))?;
        if let Some(fields) = row.as_object_mut() {
            fields.remove("id");
        }
        let stored = self.backend.insert(self.table, row).await?;
        Ok(decode_row(self.table, stored)?)
    }

    /// Apply `patch` to the record with `id`
    ///
    /// # Errors
    /// `RemoteOperationFailed` on any backend or decode failure
    pub async fn update(&self, id: &RecordId, patch: &E::Patch) -> SlateResult<E> {
        debug!(table = %self.table, %id, "update");
        let patch = encode_row(self.table, patch)?;
        let stored = self.backend.update(self.table, id, patch).await?;
        Ok(decode_row(self.table, stored)?)
    }

    /// Overwrite every field of the stored record with `record`
    ///
    /// # Errors
    /// `RemoteOperationFailed` on any backend or decode failure
    pub async fn restore(&self, record: &E) -> SlateResult<E> {
        debug!(table = %self.table, id = %record.id(), "restore");
        let row = encode_row(self.table, record)?;
        let stored = self.backend.update(self.table, record.id(), row).await?;
        Ok(decode_row(self.table, stored)?)
    }

    /// Delete the record with `id`
    ///
    /// # Errors
    /// `RemoteOperationFailed` on any backend failure
    pub async fn delete(&self, id: &RecordId) -> SlateResult<()> {
        debug!(table = %self.table, %id, "delete");
        self.backend.delete(self.table, id).await?;
        Ok(())
    }
}

impl<E> Clone for RemoteAccessor<E> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            table: self.table,
            _entity: PhantomData,
        }
    }
}

impl<E> fmt::Debug for RemoteAccessor<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteAccessor").field("table", &self.table).finish()
    }
}
