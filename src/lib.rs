//! # batchflow
//!
//! Idempotent batch-job workflows. Triggers (schedule, queue, storage event)
//! deliver work units; each run claims the unit's key in an idempotency store,
//! runs an executor with fixed-interval retries, and notifies an operator when
//! retries run out.
//!
//! Postgres (sqlx, pgmq) backs the store, run archive and queues when a
//! database is configured; in-memory implementations are used otherwise.

pub mod archive;
pub mod config;
pub mod db;
pub mod definition;
pub mod engine;
pub mod error;
pub mod executor;
pub mod key;
pub mod model;
pub mod notify;
pub mod store;
pub mod telemetry;
pub mod trigger;
