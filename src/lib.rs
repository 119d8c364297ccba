//! # sheetsync
//!
//! Sync job execution engine for WeCom smart sheets: cron scheduling, batch
//! fetching with resumable cursors, field mapping, conflict resolution and
//! execution history, plus a thin HTTP surface.

pub mod config;
pub mod conflict;
pub mod connectors;
pub mod cron;
pub mod cursor;
pub mod db;
pub mod error;
pub mod fetcher;
pub mod field_resolver;
pub mod handlers;
pub mod models;
pub mod repositories;
pub mod run_lock;
pub mod scheduler;
pub mod server;
pub mod sync_executor;
pub mod telemetry;
pub use migration;
