//! In-process backend
//!
//! Behaves like the hosted table service closely enough to drive the sync
//! layer in tests and the simulator: server-assigned UUID ids, rows kept in
//! insertion order, a points RPC guarded by a non-negative check constraint,
//! and a realtime change feed. Failures can be injected per call, on every
//! n-th write, or by going offline.

use crate::backend::{Backend, Filter, RemoteResult};
use crate::profile::AdjustPointsArgs;
use crate::table::Table;
use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use slate_core::error::codes;
use slate_core::{RecordId, RemoteError, UserId};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Name of the balance-adjusting stored procedure
pub const ADJUST_POINTS_RPC: &str = "adjust_points";

/// Request body rejected by the backend
const INVALID_BODY: &str = "PGRST102";

const CHANGE_CAPACITY: usize = 256;

/// Kind of row change on the realtime feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

/// Realtime notification of a row change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Table that changed
    pub table: Table,
    /// What happened to the row
    pub kind: ChangeKind,
    /// Row id
    pub record_id: RecordId,
    /// Owning user (`user_id` column, or the id itself for profiles)
    pub user_id: Option<UserId>,
}

/// Backend call kinds, for call accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Row reads
    Select,
    /// Inserts
    Insert,
    /// Updates
    Update,
    /// Deletes
    Delete,
    /// Upserts
    Upsert,
    /// Stored procedure calls
    Rpc,
    /// Edge function calls
    Invoke,
}

impl Operation {
    fn is_write(self) -> bool {
        !matches!(self, Operation::Select)
    }
}

struct State {
    tables: RwLock<HashMap<Table, IndexMap<String, Value>>>,
    injected: Mutex<VecDeque<RemoteError>>,
    fail_writes_every: AtomicU64,
    writes: AtomicU64,
    offline: AtomicBool,
    latency: Mutex<Duration>,
    calls: DashMap<Operation, u64>,
    table_calls: DashMap<Table, u64>,
    invocations: Mutex<Vec<(String, Value)>>,
    changes: broadcast::Sender<ChangeEvent>,
}

/// Shared in-memory backend; clones see the same data
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<State>,
}

impl MemoryBackend {
    /// Empty backend with no latency
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            state: Arc::new(State {
                tables: RwLock::new(HashMap::new()),
                injected: Mutex::new(VecDeque::new()),
                fail_writes_every: AtomicU64::new(0),
                writes: AtomicU64::new(0),
                offline: AtomicBool::new(false),
                latency: Mutex::new(Duration::ZERO),
                calls: DashMap::new(),
                table_calls: DashMap::new(),
                invocations: Mutex::new(Vec::new()),
                changes,
            }),
        }
    }

    /// With simulated round-trip latency
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    /// Change simulated latency
    pub fn set_latency(&self, latency: Duration) {
        *self.state.latency.lock() = latency;
    }

    /// Make every call fail with a network error while `offline`
    pub fn set_offline(&self, offline: bool) {
        self.state.offline.store(offline, Ordering::SeqCst);
    }

    /// Whether the backend is simulating an outage
    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.state.offline.load(Ordering::SeqCst)
    }

    /// Fail the next call with `error`; queued errors are used in order
    pub fn fail_next(&self, error: RemoteError) {
        self.state.injected.lock().push_back(error);
    }

    /// Fail every `n`-th write counted from this call; `0` disables
    pub fn fail_writes_every(&self, n: u64) {
        self.state.writes.store(0, Ordering::SeqCst);
        self.state.fail_writes_every.store(n, Ordering::SeqCst);
    }

    /// Calls made of one kind
    #[must_use]
    pub fn calls(&self, operation: Operation) -> u64 {
        self.state.calls.get(&operation).map_or(0, |count| *count)
    }

    /// Table calls made against `table`
    #[must_use]
    pub fn table_calls(&self, table: Table) -> u64 {
        self.state.table_calls.get(&table).map_or(0, |count| *count)
    }

    /// Calls of every kind
    #[must_use]
    pub fn total_calls(&self) -> u64 {
        self.state.calls.iter().map(|entry| *entry.value()).sum()
    }

    /// Zero the call counters
    pub fn reset_calls(&self) {
        self.state.calls.clear();
        self.state.table_calls.clear();
    }

    /// Payloads passed to edge function `function`, oldest first
    #[must_use]
    pub fn invocations(&self, function: &str) -> Vec<Value> {
        self.state
            .invocations
            .lock()
            .iter()
            .filter(|(name, _)| name == function)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Current rows of `table` in insertion order
    #[must_use]
    pub fn rows(&self, table: Table) -> Vec<Value> {
        self.state
            .tables
            .read()
            .get(&table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// One row by id
    #[must_use]
    pub fn row(&self, table: Table, id: &str) -> Option<Value> {
        self.state.tables.read().get(&table)?.get(id).cloned()
    }

    /// Store a row directly, bypassing failure injection and the change feed
    ///
    /// # Errors
    /// The row is not an object or its id is taken
    pub fn seed(&self, table: Table, row: Value) -> RemoteResult<Value> {
        self.store_new(table, row)
    }

    /// Subscribe to the realtime change feed
    #[must_use]
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.state.changes.subscribe()
    }

    async fn gate(&self, operation: Operation, table: Option<Table>) -> RemoteResult<()> {
        *self.state.calls.entry(operation).or_insert(0) += 1;
        if let Some(table) = table {
            *self.state.table_calls.entry(table).or_insert(0) += 1;
        }

        let latency = *self.state.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.is_offline() {
            return Err(RemoteError::network("backend unreachable"));
        }
        if let Some(error) = self.state.injected.lock().pop_front() {
            debug!(?operation, %error, "injected failure");
            return Err(error);
        }
        if operation.is_write() {
            let every = self.state.fail_writes_every.load(Ordering::SeqCst);
            let n = self.state.writes.fetch_add(1, Ordering::SeqCst) + 1;
            if every > 0 && n % every == 0 {
                debug!(?operation, write = n, "simulated write failure");
                return Err(RemoteError::network(format!("simulated failure on write {n}")));
            }
        }
        Ok(())
    }

    fn emit(&self, table: Table, kind: ChangeKind, row: &Value) {
        let Some(id) = row.get("id").and_then(Value::as_str) else {
            return;
        };
        let user_id = match table {
            Table::Profiles => Some(UserId::new(id)),
            _ => row.get("user_id").and_then(Value::as_str).map(UserId::new),
        };
        // No subscribers is fine
        let _ = self.state.changes.send(ChangeEvent {
            table,
            kind,
            record_id: RecordId::new(id),
            user_id,
        });
    }

    fn store_new(&self, table: Table, row: Value) -> RemoteResult<Value> {
        let Value::Object(mut fields) = row else {
            return Err(RemoteError::new(INVALID_BODY, format!("{table}: row must be a JSON object")));
        };
        let id = match fields.get("id").and_then(Value::as_str) {
            Some(id) if !RecordId::new(id).is_placeholder() => id.to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        fields.insert("id".into(), Value::String(id.clone()));
        let row = Value::Object(fields);

        let mut tables = self.state.tables.write();
        let rows = tables.entry(table).or_default();
        if rows.contains_key(&id) {
            return Err(RemoteError::new(
                codes::UNIQUE_VIOLATION,
                format!("duplicate key value violates unique constraint \"{table}_pkey\""),
            ));
        }
        rows.insert(id, row.clone());
        Ok(row)
    }

    fn adjust_points(&self, args: Value) -> RemoteResult<Value> {
        let args: AdjustPointsArgs = serde_json::from_value(args)
            .map_err(|e| RemoteError::new(INVALID_BODY, format!("{ADJUST_POINTS_RPC}: {e}")))?;

        let row = {
            let mut tables = self.state.tables.write();
            let profile = tables
                .entry(Table::Profiles)
                .or_default()
                .get_mut(args.user_id.as_str())
                .ok_or_else(|| RemoteError::new(codes::NO_ROWS, format!("no profile for {}", args.user_id)))?;

            let points = field(profile, "points") + args.points_delta;
            let dom_points = field(profile, "dom_points") + args.dom_points_delta;
            let overdrawn = (points < 0 && args.points_delta < 0) || (dom_points < 0 && args.dom_points_delta < 0);
            if overdrawn && !args.allow_negative {
                return Err(RemoteError::new(
                    codes::CHECK_VIOLATION,
                    "new row for relation \"profiles\" violates check constraint \"points_non_negative\"",
                ));
            }
            if let Some(fields) = profile.as_object_mut() {
                fields.insert("points".into(), json!(points));
                fields.insert("dom_points".into(), json!(dom_points));
            }
            profile.clone()
        };

        trace!(user = %args.user_id, "points adjusted");
        self.emit(Table::Profiles, ChangeKind::Update, &row);
        Ok(json!({
            "points": field(&row, "points"),
            "dom_points": field(&row, "dom_points"),
        }))
    }
}

fn field(row: &Value, name: &str) -> i64 {
    row.get(name).and_then(Value::as_i64).unwrap_or(0)
}

fn merge(target: &mut Value, patch: Map<String, Value>) {
    if let Some(fields) = target.as_object_mut() {
        for (key, value) in patch {
            if key != "id" {
                fields.insert(key, value);
            }
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("offline", &self.is_offline())
            .field("calls", &self.total_calls())
            .finish()
    }
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    async fn select(&self, table: Table, filter: &Filter) -> RemoteResult<Vec<Value>> {
        self.gate(Operation::Select, Some(table)).await?;
        let rows: Vec<Value> = self
            .state
            .tables
            .read()
            .get(&table)
            .map(|rows| rows.values().filter(|row| filter.matches(row)).cloned().collect())
            .unwrap_or_default();
        Ok(filter.finish(rows))
    }

    async fn insert(&self, table: Table, row: Value) -> RemoteResult<Value> {
        self.gate(Operation::Insert, Some(table)).await?;
        let row = self.store_new(table, row)?;
        self.emit(table, ChangeKind::Insert, &row);
        Ok(row)
    }

    async fn update(&self, table: Table, id: &RecordId, patch: Value) -> RemoteResult<Value> {
        self.gate(Operation::Update, Some(table)).await?;
        let Value::Object(patch) = patch else {
            return Err(RemoteError::new(INVALID_BODY, format!("{table}: patch must be a JSON object")));
        };

        let row = {
            let mut tables = self.state.tables.write();
            let row = tables
                .get_mut(&table)
                .and_then(|rows| rows.get_mut(id.as_str()))
                .ok_or_else(|| RemoteError::new(codes::NO_ROWS, format!("{table}: no row with id {id}")))?;
            merge(row, patch);
            row.clone()
        };

        self.emit(table, ChangeKind::Update, &row);
        Ok(row)
    }

    async fn delete(&self, table: Table, id: &RecordId) -> RemoteResult<()> {
        self.gate(Operation::Delete, Some(table)).await?;
        let removed = self
            .state
            .tables
            .write()
            .get_mut(&table)
            .and_then(|rows| rows.shift_remove(id.as_str()));
        if let Some(row) = removed {
            self.emit(table, ChangeKind::Delete, &row);
        }
        Ok(())
    }

    async fn upsert(&self, table: Table, row: Value) -> RemoteResult<Value> {
        self.gate(Operation::Upsert, Some(table)).await?;
        let Some(id) = row.get("id").and_then(Value::as_str).map(str::to_string) else {
            let row = self.store_new(table, row)?;
            self.emit(table, ChangeKind::Insert, &row);
            return Ok(row);
        };

        let existed = {
            let mut tables = self.state.tables.write();
            tables.entry(table).or_default().insert(id, row.clone()).is_some()
        };
        let kind = if existed { ChangeKind::Update } else { ChangeKind::Insert };
        self.emit(table, kind, &row);
        Ok(row)
    }

    async fn rpc(&self, name: &str, args: Value) -> RemoteResult<Value> {
        self.gate(Operation::Rpc, None).await?;
        match name {
            ADJUST_POINTS_RPC => self.adjust_points(args),
            other => Err(RemoteError::new(
                codes::NOT_FOUND,
                format!("function {other} does not exist"),
            )),
        }
    }

    async fn invoke(&self, function: &str, payload: Value) -> RemoteResult<Value> {
        self.gate(Operation::Invoke, None).await?;
        self.state
            .invocations
            .lock()
            .push((function.to_string(), payload));
        Ok(json!({ "success": true }))
    }
}
