//! Connectors module
//!
//! Contracts for the collaborators the sync engine talks to, and their
//! implementations:
//! - `SourceReader` for the relational source (`SqlSource`, `MemorySource`)
//! - `SheetWriter` for the WeCom smart sheet (`MemorySheet`)
//! - `Notifier` for run outcomes (`WebhookNotifier`, `NoopNotifier`)

pub mod memory;
pub mod sql_source;
pub mod trait_;
pub mod webhook_notifier;

pub use memory::{MemorySheet, MemorySource, WriteFailure};
pub use sql_source::SqlSource;
pub use trait_::{
    ConnectorError, KeysetFilter, NoopNotifier, Notifier, ReadRequest, RowAck, RowWrite,
    RunOutcome, SheetWriter, SourceReader, SyncError, SyncErrorKind, WriteOp,
};
pub use webhook_notifier::WebhookNotifier;
