//! Cached subtree asset counts.
//!
//! [`aggregate`] recomputes every count from scratch in one pass; the
//! `incremental` functions keep the cached column correct as memberships
//! change, one batch at a time.

pub mod aggregate;
pub(crate) mod incremental;

pub use aggregate::{aggregate, SubtreeTotals};
pub use incremental::Propagation;
