//! # Cursors
//!
//! Progress markers owned by one job, their string encoding, and the
//! [`CursorStore`] that persists them.
//!
//! A cursor only moves through a [`CursorAdvance`], which can only be obtained
//! by confirming a [`PendingCursor`] with the [`WriteReceipt`] of the batch it
//! describes. Persisting progress for rows that were never written is therefore
//! not expressible.

use std::cmp::Ordering;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::connectors::RowAck;
use crate::error::StoreError;
use crate::repositories::JobStore;

const MAX_ENCODED_LEN: usize = 4096;

/// Errors produced while decoding or advancing a cursor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CursorError {
    #[error("cursor cannot be empty")]
    Empty,
    #[error("cursor is too long")]
    TooLong,
    #[error("cursor contains invalid characters")]
    InvalidCharacters,
    #[error("cursor is not valid base64")]
    InvalidBase64,
    #[error("cursor contains invalid UTF-8 data")]
    InvalidUtf8,
    #[error("cursor contains invalid JSON structure: {0}")]
    InvalidJson(String),
    #[error("cursor for job {job_id} would move backwards")]
    Regression { job_id: Uuid },
}

/// Last acknowledged position of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Cursor {
    /// High-water mark of the incremental field. `tie_key` is the key column of
    /// the last row written at that value, so rows sharing the boundary value
    /// are neither skipped nor replayed.
    Incremental {
        value: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tie_key: Option<Value>,
    },
    /// Keyset position of a paged run. `page` counts pages already written in
    /// the current pass.
    Page {
        page: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_pages: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_key: Option<Value>,
        #[serde(default)]
        exhausted: bool,
    },
}

impl Cursor {
    /// Encode as URL-safe base64 of the cursor JSON.
    pub fn encode(&self) -> Result<String, CursorError> {
        let json = serde_json::to_string(self).map_err(|e| CursorError::InvalidJson(e.to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(json.as_bytes()))
    }

    /// Decode a string produced by [`Cursor::encode`].
    pub fn decode(encoded: &str) -> Result<Self, CursorError> {
        if encoded.is_empty() {
            return Err(CursorError::Empty);
        }
        if encoded.len() > MAX_ENCODED_LEN {
            return Err(CursorError::TooLong);
        }
        if !encoded
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CursorError::InvalidCharacters);
        }

        let decoded = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| CursorError::InvalidBase64)?;
        let json = String::from_utf8(decoded).map_err(|_| CursorError::InvalidUtf8)?;

        serde_json::from_str(&json).map_err(|e| CursorError::InvalidJson(e.to_string()))
    }

    pub fn incremental(value: Value, tie_key: Option<Value>) -> Self {
        Cursor::Incremental { value, tie_key }
    }
}

/// Order two incremental cursors by value, then tie key, using `order` for
/// both. `None` when they are not both incremental.
pub fn compare_positions(
    order: impl Fn(&Value, &Value) -> Ordering,
    a: &Cursor,
    b: &Cursor,
) -> Option<Ordering> {
    match (a, b) {
        (
            Cursor::Incremental {
                value: va,
                tie_key: ta,
            },
            Cursor::Incremental {
                value: vb,
                tie_key: tb,
            },
        ) => Some(order(va, vb).then_with(|| match (ta, tb) {
            (Some(x), Some(y)) => order(x, y),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })),
        _ => None,
    }
}

/// Proof that the target acknowledged a batch write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    accepted: usize,
    rejected: usize,
}

impl WriteReceipt {
    /// Only built from the acks returned by a completed upsert call.
    pub(crate) fn from_acks(acks: &[RowAck]) -> Self {
        let accepted = acks.iter().filter(|a| a.is_accepted()).count();
        Self {
            accepted,
            rejected: acks.len() - accepted,
        }
    }

    /// Receipt for a batch in which nothing needed writing.
    pub(crate) fn empty() -> Self {
        Self {
            accepted: 0,
            rejected: 0,
        }
    }

    pub fn accepted(&self) -> usize {
        self.accepted
    }

    pub fn rejected(&self) -> usize {
        self.rejected
    }
}

/// Position a fetched batch would move the cursor to once written.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCursor {
    job_id: Uuid,
    next: Option<Cursor>,
}

impl PendingCursor {
    pub(crate) fn new(job_id: Uuid, next: Option<Cursor>) -> Self {
        Self { job_id, next }
    }

    pub fn next(&self) -> Option<&Cursor> {
        self.next.as_ref()
    }

    /// Exchange the pending position for an advance token.
    pub fn confirm(self, _receipt: &WriteReceipt) -> CursorAdvance {
        CursorAdvance {
            job_id: self.job_id,
            next: self.next,
        }
    }
}

/// Token permitting the cursor store to persist a new position.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorAdvance {
    job_id: Uuid,
    next: Option<Cursor>,
}

impl CursorAdvance {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn cursor(&self) -> Option<&Cursor> {
        self.next.as_ref()
    }
}

/// Reads and advances job cursors on top of the job store.
#[derive(Clone)]
pub struct CursorStore {
    store: Arc<dyn JobStore>,
}

impl CursorStore {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self, job_id: Uuid) -> Result<Option<Cursor>, StoreError> {
        self.store.load_cursor(job_id).await
    }

    /// Persist an acknowledged position. Incremental cursors never move
    /// backwards under `order`, which must be the ordering the source reads in.
    pub async fn advance(
        &self,
        order: impl Fn(&Value, &Value) -> Ordering,
        advance: CursorAdvance,
    ) -> Result<(), StoreError> {
        let Some(next) = advance.next else {
            return Ok(());
        };

        if let Some(previous) = self.store.load_cursor(advance.job_id).await?
            && compare_positions(order, &next, &previous) == Some(Ordering::Less)
        {
            return Err(CursorError::Regression {
                job_id: advance.job_id,
            }
            .into());
        }

        self.store.save_cursor(advance.job_id, &next).await
    }

    /// Forget the position so the next run starts from the beginning.
    pub async fn reset(&self, job_id: Uuid) -> Result<(), StoreError> {
        self.store.clear_cursor(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::value::{compare_stored, compare_values};
    use serde_json::json;

    #[test]
    fn test_cursor_round_trips_exactly() {
        let cursors = [
            Cursor::incremental(json!("2025-01-01T00:00:00Z"), Some(json!(42))),
            Cursor::incremental(json!(1234567890123u64), None),
            Cursor::Page {
                page: 3,
                total_pages: Some(10),
                last_key: Some(json!("k-300")),
                exhausted: false,
            },
        ];
        for cursor in cursors {
            let encoded = cursor.encode().unwrap();
            let decoded = Cursor::decode(&encoded).unwrap();
            assert_eq!(decoded, cursor);
            assert_eq!(decoded.encode().unwrap(), encoded);
        }
    }

    #[test]
    fn test_empty_cursor() {
        assert_eq!(Cursor::decode(""), Err(CursorError::Empty));
    }

    #[test]
    fn test_cursor_too_long() {
        assert_eq!(Cursor::decode(&"a".repeat(5000)), Err(CursorError::TooLong));
    }

    #[test]
    fn test_cursor_invalid_characters() {
        assert_eq!(
            Cursor::decode("cursor@#$%"),
            Err(CursorError::InvalidCharacters)
        );
    }

    #[test]
    fn test_cursor_invalid_utf8() {
        let encoded = URL_SAFE_NO_PAD.encode([0xff, 0xfe]);
        assert_eq!(Cursor::decode(&encoded), Err(CursorError::InvalidUtf8));
    }

    #[test]
    fn test_cursor_invalid_json() {
        let encoded = URL_SAFE_NO_PAD.encode(b"invalid json");
        assert!(matches!(
            Cursor::decode(&encoded),
            Err(CursorError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_positions_follow_the_given_order() {
        let a = Cursor::incremental(json!("9"), None);
        let b = Cursor::incremental(json!("10"), None);
        assert_eq!(
            compare_positions(compare_values, &a, &b),
            Some(Ordering::Less)
        );
        assert_eq!(
            compare_positions(compare_stored, &a, &b),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn test_tie_key_breaks_equal_values() {
        let a = Cursor::incremental(json!("2025-01-01T00:00:00Z"), Some(json!(5)));
        let b = Cursor::incremental(json!("2025-01-01 00:00:00"), Some(json!(7)));
        assert_eq!(
            compare_positions(compare_values, &a, &b),
            Some(Ordering::Less)
        );
    }

    #[test]
    fn test_page_and_incremental_cursors_are_not_ordered() {
        let a = Cursor::incremental(json!(1), None);
        let b = Cursor::Page {
            page: 1,
            total_pages: None,
            last_key: None,
            exhausted: false,
        };
        assert_eq!(compare_positions(compare_values, &a, &b), None);
    }

    #[test]
    fn test_confirm_carries_position() {
        let job_id = Uuid::new_v4();
        let pending = PendingCursor::new(job_id, Some(Cursor::incremental(json!(1), None)));
        let advance = pending.confirm(&WriteReceipt::empty());
        assert_eq!(advance.job_id(), job_id);
        assert_eq!(advance.cursor(), Some(&Cursor::incremental(json!(1), None)));
    }
}
