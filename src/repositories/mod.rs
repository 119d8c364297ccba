//! # Repository Layer
//!
//! Persistence of job definitions, cursors and execution history behind the
//! [`JobStore`] contract, with its SeaORM implementation.

pub mod job_store;

pub use job_store::{JobRunState, JobStore, SeaOrmJobStore};
