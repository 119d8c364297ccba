//! In-process source and sheet collaborators.
//!
//! Used for local dry runs and throughout the test suite. [`MemorySheet`]
//! behaves like the WeCom smart-sheet upsert endpoint: rows are matched on the
//! natural key field, absent fields are left untouched and replays with the
//! same key are idempotent. Failures can be queued to exercise retry paths.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::connectors::trait_::{
    KeysetFilter, ReadRequest, RowAck, RowWrite, SheetWriter, SourceReader, SyncError, WriteOp,
};
use crate::models::Row;
use crate::models::value::{compare_values, is_blank, values_equal};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn column<'a>(row: &'a Row, name: &str) -> &'a Value {
    row.get(name).unwrap_or(&Value::Null)
}

fn passes(row: &Row, filter: &KeysetFilter) -> bool {
    match filter {
        KeysetFilter::After { column: c, value } => {
            compare_values(column(row, c), value) == Ordering::Greater
        }
        KeysetFilter::AfterTie {
            column: c,
            value,
            tie_column,
            tie_value,
        } => match compare_values(column(row, c), value) {
            Ordering::Greater => true,
            Ordering::Equal => compare_values(column(row, tie_column), tie_value) == Ordering::Greater,
            Ordering::Less => false,
        },
    }
}

/// Source tables held in memory.
#[derive(Default)]
pub struct MemorySource {
    tables: Mutex<HashMap<String, Vec<Row>>>,
    read_failures: Mutex<VecDeque<SyncError>>,
    reads: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, table: impl Into<String>, rows: Vec<Row>) -> Self {
        lock(&self.tables).insert(table.into(), rows);
        self
    }

    /// Replace the contents of a table.
    pub fn set_rows(&self, table: &str, rows: Vec<Row>) {
        lock(&self.tables).insert(table.to_string(), rows);
    }

    pub fn push_rows(&self, table: &str, rows: impl IntoIterator<Item = Row>) {
        lock(&self.tables)
            .entry(table.to_string())
            .or_default()
            .extend(rows);
    }

    /// Fail the next read call with `error`. Queued failures are consumed in order.
    pub fn push_read_failure(&self, error: SyncError) {
        lock(&self.read_failures).push_back(error);
    }

    /// Number of `read_rows` calls served so far, failures included.
    pub fn read_calls(&self) -> usize {
        self.reads.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait]
impl SourceReader for MemorySource {
    async fn list_tables(&self) -> Result<Vec<String>, SyncError> {
        let mut names: Vec<String> = lock(&self.tables).keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn count_rows(&self, table: &str) -> Result<u64, SyncError> {
        lock(&self.tables)
            .get(table)
            .map(|rows| rows.len() as u64)
            .ok_or_else(|| SyncError::permanent(format!("table '{table}' does not exist")))
    }

    async fn read_rows(&self, table: &str, request: &ReadRequest) -> Result<Vec<Row>, SyncError> {
        self.reads.fetch_add(1, AtomicOrdering::SeqCst);
        if let Some(error) = lock(&self.read_failures).pop_front() {
            return Err(error);
        }

        let tables = lock(&self.tables);
        let rows = tables
            .get(table)
            .ok_or_else(|| SyncError::permanent(format!("table '{table}' does not exist")))?;

        let mut selected: Vec<Row> = rows
            .iter()
            .filter(|row| request.filter.as_ref().is_none_or(|f| passes(row, f)))
            .cloned()
            .collect();

        selected.sort_by(|a, b| {
            request
                .order_by
                .iter()
                .map(|c| compare_values(column(a, c), column(b, c)))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
        selected.truncate(request.limit);
        Ok(selected)
    }
}

/// Failure injected into the next [`MemorySheet::upsert`] call.
#[derive(Debug, Clone)]
pub enum WriteFailure {
    /// Fail without touching the sheet.
    BeforeApply(SyncError),
    /// Apply the rows, then report failure as if the acknowledgement was lost.
    AfterApply(SyncError),
}

/// Smart sheets held in memory.
#[derive(Default)]
pub struct MemorySheet {
    sheets: Mutex<HashMap<String, Vec<Row>>>,
    write_failures: Mutex<VecDeque<WriteFailure>>,
    reject: Mutex<Option<(String, Value)>>,
    write_delay: Mutex<Option<Duration>>,
    upserts: AtomicUsize,
}

impl MemorySheet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate a sheet with existing rows.
    pub fn seed(&self, sheet_id: &str, rows: Vec<Row>) {
        lock(&self.sheets).insert(sheet_id.to_string(), rows);
    }

    /// Snapshot of the rows currently in a sheet.
    pub fn rows(&self, sheet_id: &str) -> Vec<Row> {
        lock(&self.sheets).get(sheet_id).cloned().unwrap_or_default()
    }

    pub fn push_write_failure(&self, failure: WriteFailure) {
        lock(&self.write_failures).push_back(failure);
    }

    /// Reject, per row, every write whose `field` equals `value`.
    pub fn reject_rows_where(&self, field: impl Into<String>, value: Value) {
        *lock(&self.reject) = Some((field.into(), value));
    }

    /// Delay every upsert call, keeping runs in flight for concurrency checks.
    pub fn set_write_delay(&self, delay: Duration) {
        *lock(&self.write_delay) = Some(delay);
    }

    /// Number of upsert calls received so far, failures included.
    pub fn upsert_calls(&self) -> usize {
        self.upserts.load(AtomicOrdering::SeqCst)
    }

    fn apply(&self, sheet_id: &str, writes: &[RowWrite], key_field: &str) -> Vec<RowAck> {
        let reject = lock(&self.reject).clone();
        let mut sheets = lock(&self.sheets);
        let sheet = sheets.entry(sheet_id.to_string()).or_default();

        writes
            .iter()
            .map(|write| {
                if let Some((field, value)) = &reject
                    && write.fields.get(field).is_some_and(|v| values_equal(v, value))
                {
                    return RowAck::Rejected {
                        reason: format!("field '{field}' rejected by target"),
                    };
                }

                match write.op {
                    WriteOp::Insert => {
                        sheet.push(write.fields.clone());
                        RowAck::Accepted
                    }
                    WriteOp::Upsert => {
                        let Some(key) = write.fields.get(key_field).filter(|k| !is_blank(k)) else {
                            return RowAck::Rejected {
                                reason: format!("natural key '{key_field}' is missing"),
                            };
                        };
                        match sheet
                            .iter_mut()
                            .find(|row| row.get(key_field).is_some_and(|v| values_equal(v, key)))
                        {
                            Some(existing) => {
                                for (field, value) in &write.fields {
                                    existing.insert(field.clone(), value.clone());
                                }
                            }
                            None => sheet.push(write.fields.clone()),
                        }
                        RowAck::Accepted
                    }
                }
            })
            .collect()
    }
}

#[async_trait]
impl SheetWriter for MemorySheet {
    async fn find_by_keys(
        &self,
        sheet_id: &str,
        key_field: &str,
        keys: &[Value],
    ) -> Result<Vec<Row>, SyncError> {
        let sheets = lock(&self.sheets);
        let Some(rows) = sheets.get(sheet_id) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .iter()
            .filter(|row| {
                row.get(key_field)
                    .is_some_and(|v| keys.iter().any(|k| values_equal(v, k)))
            })
            .cloned()
            .collect())
    }

    async fn upsert(
        &self,
        sheet_id: &str,
        rows: &[RowWrite],
        key_field: &str,
    ) -> Result<Vec<RowAck>, SyncError> {
        self.upserts.fetch_add(1, AtomicOrdering::SeqCst);

        let delay = *lock(&self.write_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = lock(&self.write_failures).pop_front();
        match failure {
            Some(WriteFailure::BeforeApply(error)) => Err(error),
            Some(WriteFailure::AfterApply(error)) => {
                self.apply(sheet_id, rows, key_field);
                Err(error)
            }
            None => Ok(self.apply(sheet_id, rows, key_field)),
        }
    }
}
