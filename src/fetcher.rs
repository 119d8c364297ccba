//! # Batch Fetcher
//!
//! Produces the ordered batches of one run for each sync mode:
//!
//! - `full`: keyset scan of the whole table by the key column. The position
//!   exists only in memory; a crash restarts from the beginning.
//! - `incremental`: rows after the `(incremental_field, key_column)` high-water
//!   mark, ordered by both, so rows sharing a boundary value are neither
//!   skipped nor replayed.
//! - `paged`: fixed-size keyset pages by the key column with a persisted
//!   `{page, total_pages, last_key}` cursor.
//!
//! The fetcher's position only moves when the executor commits a written batch.

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connectors::{KeysetFilter, ReadRequest, SourceReader, SyncError};
use crate::cursor::{Cursor, PendingCursor};
use crate::models::{JobStatus, Row, SyncJob, SyncMode};

/// Where a run starts, derived from the stored cursor.
#[derive(Debug, Clone, PartialEq)]
pub enum StartPlan {
    /// Start from the beginning. `reset` asks for the stored cursor to be cleared.
    Fresh { reset: bool },
    /// Continue from the stored cursor.
    Resume(Cursor),
}

impl StartPlan {
    pub fn cursor(&self) -> Option<&Cursor> {
        match self {
            StartPlan::Resume(cursor) => Some(cursor),
            StartPlan::Fresh { .. } => None,
        }
    }
}

/// Decide the starting point of a run.
///
/// Paged jobs with resume disabled restart after a failed run, but a run cut
/// short by `max_records_per_sync` is always continued.
pub fn plan_start(job: &SyncJob, stored: Option<Cursor>) -> StartPlan {
    match (job.sync.mode, stored) {
        (_, None) => StartPlan::Fresh { reset: false },
        (SyncMode::Full, Some(_)) => StartPlan::Fresh { reset: true },
        (SyncMode::Incremental, Some(cursor @ Cursor::Incremental { .. })) => {
            StartPlan::Resume(cursor)
        }
        (SyncMode::Paged, Some(Cursor::Page { exhausted: true, .. })) => {
            StartPlan::Fresh { reset: false }
        }
        (SyncMode::Paged, Some(cursor @ Cursor::Page { .. })) => {
            if !job.sync.enable_resume && job.status == JobStatus::Failed {
                StartPlan::Fresh { reset: true }
            } else {
                StartPlan::Resume(cursor)
            }
        }
        (mode, Some(_)) => {
            warn!(job_id = %job.id, %mode, "stored cursor does not match sync mode; starting over");
            StartPlan::Fresh { reset: true }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Position {
    Keyset {
        last_key: Option<Value>,
        page: u64,
        total_pages: Option<u64>,
    },
    Mark {
        value: Option<Value>,
        tie_key: Option<Value>,
    },
}

/// Fetcher position after a batch, applied by [`BatchFetcher::commit`].
#[derive(Debug, Clone, PartialEq)]
pub struct FetchStep {
    position: Position,
    rows: u64,
    exhausted: bool,
}

/// One batch of source rows in fetch order.
#[derive(Debug)]
pub struct Batch {
    pub rows: Vec<Row>,
    /// Cursor to persist once the batch is written.
    pub pending: PendingCursor,
    pub step: FetchStep,
}

/// Stateful reader of one run's batches.
pub struct BatchFetcher {
    job_id: Uuid,
    mode: SyncMode,
    table: String,
    key_column: String,
    incremental_field: String,
    page_size: usize,
    max_records: Option<u64>,
    position: Position,
    fetched: u64,
    finished: bool,
}

impl BatchFetcher {
    pub fn new(job: &SyncJob, plan: &StartPlan) -> Self {
        let position = match (job.sync.mode, plan.cursor()) {
            (SyncMode::Incremental, Some(Cursor::Incremental { value, tie_key })) => {
                Position::Mark {
                    value: Some(value.clone()),
                    tie_key: tie_key.clone(),
                }
            }
            (SyncMode::Incremental, _) => Position::Mark {
                value: None,
                tie_key: None,
            },
            (
                _,
                Some(Cursor::Page {
                    page,
                    total_pages,
                    last_key,
                    ..
                }),
            ) => Position::Keyset {
                last_key: last_key.clone(),
                page: *page,
                total_pages: *total_pages,
            },
            _ => Position::Keyset {
                last_key: None,
                page: 0,
                total_pages: None,
            },
        };

        let max_records = match job.sync.mode {
            SyncMode::Full => None,
            _ => job.sync.max_records_per_sync,
        };

        Self {
            job_id: job.id,
            mode: job.sync.mode,
            table: job.mapping.source_table.clone(),
            key_column: job.mapping.key_column.clone(),
            incremental_field: job.sync.incremental_field.clone().unwrap_or_default(),
            page_size: job.page_size(),
            max_records,
            position,
            fetched: 0,
            finished: false,
        }
    }

    /// Rows committed so far in this run.
    pub fn fetched(&self) -> u64 {
        self.fetched
    }

    /// Read the batch after the committed position. `None` ends the run.
    ///
    /// Calling again without committing re-reads the same batch.
    pub async fn next_batch(&mut self, source: &dyn SourceReader) -> Result<Option<Batch>, SyncError> {
        if self.finished {
            return Ok(None);
        }

        let limit = match self.max_records {
            Some(max) => {
                let remaining = max.saturating_sub(self.fetched);
                if remaining == 0 {
                    debug!(job_id = %self.job_id, max, "record limit reached for this run");
                    self.finished = true;
                    return Ok(None);
                }
                self.page_size.min(usize::try_from(remaining).unwrap_or(usize::MAX))
            }
            None => self.page_size,
        };

        if self.mode == SyncMode::Paged
            && let Position::Keyset {
                total_pages: total @ None,
                ..
            } = &mut self.position
        {
            let count = source.count_rows(&self.table).await?;
            *total = Some(count.div_ceil(self.page_size as u64));
        }

        let request = self.request(limit);
        let rows = source.read_rows(&self.table, &request).await?;
        let exhausted = rows.len() < limit;

        if rows.is_empty() {
            return Ok(self.closing_batch());
        }

        let position = self.advance_position(&rows)?;
        let pending = PendingCursor::new(self.job_id, self.cursor_for(&position, exhausted));
        debug!(
            job_id = %self.job_id,
            rows = rows.len(),
            exhausted,
            "fetched source batch"
        );

        Ok(Some(Batch {
            step: FetchStep {
                position,
                rows: rows.len() as u64,
                exhausted,
            },
            pending,
            rows,
        }))
    }

    /// Move to the position after a written batch.
    pub fn commit(&mut self, step: FetchStep) {
        self.position = step.position;
        self.fetched += step.rows;
        if step.exhausted {
            self.finished = true;
        }
    }

    fn request(&self, limit: usize) -> ReadRequest {
        match &self.position {
            Position::Keyset { last_key, .. } => ReadRequest {
                order_by: vec![self.key_column.clone()],
                filter: last_key.as_ref().map(|key| KeysetFilter::After {
                    column: self.key_column.clone(),
                    value: key.clone(),
                }),
                limit,
            },
            Position::Mark { value, tie_key } => ReadRequest {
                order_by: vec![self.incremental_field.clone(), self.key_column.clone()],
                filter: value.as_ref().map(|value| match tie_key {
                    Some(tie) => KeysetFilter::AfterTie {
                        column: self.incremental_field.clone(),
                        value: value.clone(),
                        tie_column: self.key_column.clone(),
                        tie_value: tie.clone(),
                    },
                    None => KeysetFilter::After {
                        column: self.incremental_field.clone(),
                        value: value.clone(),
                    },
                }),
                limit,
            },
        }
    }

    fn advance_position(&self, rows: &[Row]) -> Result<Position, SyncError> {
        let Some(last) = rows.last() else {
            return Ok(self.position.clone());
        };
        let key = last
            .get(&self.key_column)
            .filter(|k| !k.is_null())
            .cloned()
            .ok_or_else(|| {
                SyncError::permanent(format!(
                    "key column '{}' is missing from source rows",
                    self.key_column
                ))
            })?;

        Ok(match &self.position {
            Position::Keyset {
                page, total_pages, ..
            } => Position::Keyset {
                last_key: Some(key),
                page: page + 1,
                total_pages: *total_pages,
            },
            Position::Mark { .. } => Position::Mark {
                value: Some(
                    last.get(&self.incremental_field)
                        .cloned()
                        .unwrap_or(Value::Null),
                ),
                tie_key: Some(key),
            },
        })
    }

    fn cursor_for(&self, position: &Position, exhausted: bool) -> Option<Cursor> {
        match (self.mode, position) {
            (SyncMode::Full, _) => None,
            (
                SyncMode::Paged,
                Position::Keyset {
                    last_key,
                    page,
                    total_pages,
                },
            ) => Some(Cursor::Page {
                page: *page,
                total_pages: *total_pages,
                last_key: last_key.clone(),
                exhausted,
            }),
            (_, Position::Mark { value: Some(value), tie_key }) => {
                Some(Cursor::incremental(value.clone(), tie_key.clone()))
            }
            _ => None,
        }
    }

    /// An empty read. A paged pass in progress records that it is complete so
    /// the next run starts a new pass; otherwise the run simply ends.
    fn closing_batch(&mut self) -> Option<Batch> {
        let in_progress = matches!(
            &self.position,
            Position::Keyset { last_key: Some(_), .. }
        );
        if self.mode != SyncMode::Paged || !in_progress {
            self.finished = true;
            return None;
        }
        let position = self.position.clone();
        Some(Batch {
            rows: Vec::new(),
            pending: PendingCursor::new(self.job_id, self.cursor_for(&position, true)),
            step: FetchStep {
                position,
                rows: 0,
                exhausted: true,
            },
        })
    }
}
