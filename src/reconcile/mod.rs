//! Full recomputation of cached counts, plus the machinery that decides when
//! it runs: an on-demand coalescing queue and an optional fixed schedule.

mod job;
mod queue;

pub(crate) use job::reconcile;
pub use job::{CountDrift, FindingSeverity, ReconcileFinding, ReconcileMode, ReconcileReport};
pub use queue::{PeriodicReconcile, QueueStats, ReconcileQueue};
pub(crate) use queue::ReconcileRunner;
