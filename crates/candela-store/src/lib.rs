//! Partitioned candle storage for candela.
//!
//! This crate provides the single write path shared by the live batch
//! processor and the reconciliation engine:
//!
//! - [`CandleStore`] - The storage trait: idempotent upsert plus range queries
//! - [`PgStore`] - Postgres implementation over a monthly-partitioned table
//! - [`MemoryStore`] - In-memory implementation for tests and dry runs
//! - [`resolve`] - The pure conflict-resolution decision function

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod memory;
mod pg;
mod resolve;
mod schema;
mod store;

pub use memory::{FailureRecord, MemoryStore};
pub use pg::PgStore;
pub use resolve::{resolve, RejectReason, Resolution};
pub use schema::{month_partitions, partition_name, PartitionSpec};
pub use store::{CandleStore, RejectedCandle, StoreError, UpsertOutcome};
