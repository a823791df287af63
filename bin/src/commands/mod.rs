//! CLI command implementations.

pub(crate) mod backfill;
pub(crate) mod collect;
pub(crate) mod maintain;
