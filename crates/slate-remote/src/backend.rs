//! Backend collaborator contract
//!
//! The hosted backend is consumed only through this trait: table-style CRUD
//! over JSON rows, named RPC calls and edge-function invocation. Every call is
//! one round trip; implementations never retry.

use crate::table::Table;
use serde_json::Value;
use slate_core::{RecordId, RemoteError};
use std::fmt;

/// Result of a backend call
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Row selection for [`Backend::select`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    eq: Vec<(String, Value)>,
    order_desc: Option<String>,
    limit: Option<usize>,
}

impl Filter {
    /// Select every row
    #[inline]
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Require `column == value`
    #[must_use]
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.eq.push((column.into(), value.into()));
        self
    }

    /// Order by `column`, newest first
    #[must_use]
    pub fn order_desc(mut self, column: impl Into<String>) -> Self {
        self.order_desc = Some(column.into());
        self
    }

    /// Return at most `limit` rows
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Equality conditions
    #[must_use]
    pub fn conditions(&self) -> &[(String, Value)] {
        &self.eq
    }

    /// Whether `row` satisfies every equality condition
    #[must_use]
    pub fn matches(&self, row: &Value) -> bool {
        self.eq
            .iter()
            .all(|(column, expected)| row.get(column) == Some(expected))
    }

    /// Apply ordering and limit to already matched rows
    #[must_use]
    pub fn finish(&self, mut rows: Vec<Value>) -> Vec<Value> {
        if let Some(column) = &self.order_desc {
            rows.sort_by(|a, b| compare(b.get(column), a.get(column)));
        }
        if let Some(limit) = self.limit {
            rows.truncate(limit);
        }
        rows
    }
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(Value::String(a)), Some(Value::String(b))) => a.cmp(b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        _ => Ordering::Equal,
    }
}

/// Table-style backend
#[async_trait::async_trait]
pub trait Backend: Send + Sync + fmt::Debug {
    /// Rows of `table` matching `filter`
    async fn select(&self, table: Table, filter: &Filter) -> RemoteResult<Vec<Value>>;

    /// Insert one row; the backend assigns the id and returns the stored row
    async fn insert(&self, table: Table, row: Value) -> RemoteResult<Value>;

    /// Merge `patch` into the row with `id`, returning the stored row
    async fn update(&self, table: Table, id: &RecordId, patch: Value) -> RemoteResult<Value>;

    /// Delete the row with `id`
    async fn delete(&self, table: Table, id: &RecordId) -> RemoteResult<()>;

    /// Insert or replace by id
    async fn upsert(&self, table: Table, row: Value) -> RemoteResult<Value>;

    /// Call a stored procedure
    async fn rpc(&self, name: &str, args: Value) -> RemoteResult<Value>;

    /// Invoke an edge function
    async fn invoke(&self, function: &str, payload: Value) -> RemoteResult<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_matches_all_conditions() {
        let filter = Filter::all().eq("user_id", "u1").eq("day_of_week", 2);
        assert!(filter.matches(&json!({"user_id": "u1", "day_of_week": 2})));
        assert!(!filter.matches(&json!({"user_id": "u1", "day_of_week": 3})));
        assert!(!filter.matches(&json!({"day_of_week": 2})));
    }

    #[test]
    fn finish_orders_and_limits() {
        let rows = vec![
            json!({"at": "2024-01-01"}),
            json!({"at": "2024-03-01"}),
            json!({"at": "2024-02-01"}),
        ];
        let out = Filter::all().order_desc("at").limit(2).finish(rows);
        assert_eq!(out, vec![json!({"at": "2024-03-01"}), json!({"at": "2024-02-01"})]);
    }
}
