//! Node tree with cached aggregate asset counts.
//!
//! Assets belong to nodes of a per-tenant hierarchy (many-to-many). Every node
//! caches the number of *distinct* assets anywhere in its subtree. The cache
//! is kept current incrementally on each membership change, recomputed in
//! bulk by reconciliation, and structural edits (child creation, reassignment)
//! are serialized per hierarchy by [`TreeLock`].
//!
//! ```no_run
//! use nodetree::{AssetTree, TreeOptions};
//!
//! # fn main() -> nodetree::Result<()> {
//! let tree = AssetTree::open_in_memory(TreeOptions::default())?;
//! let (org, root) = tree.create_hierarchy("Default")?;
//! let web = tree.create_child_node(root.id, Some("web"))?;
//! let host = tree.create_asset(org.id, "host-1", &[web.id])?;
//! assert_eq!(tree.subtree_asset_count(root.id)?, 1);
//! tree.detach_assets(web.id, &[host.id])?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod counts;
mod engine;
pub mod events;
pub mod key;
pub mod lock;
pub mod logging;
mod reassign;
pub mod reconcile;
pub mod storage;
pub mod types;

pub use config::{ConfigError, TreeOptions};
pub use engine::{AssetTree, MembershipOutcome};
pub use events::{ChannelObserver, MembershipChange, MembershipNotice, MembershipObserver, NoticePhase};
pub use key::{AncestorOrder, NodeKey};
pub use lock::{LockSnapshot, TreeLease, TreeLock};
pub use reassign::ReassignReport;
pub use reconcile::{CountDrift, FindingSeverity, ReconcileFinding, ReconcileMode, ReconcileReport};
pub use types::{Asset, AssetId, Hierarchy, HierarchyId, MembershipOp, Node, NodeId, Result, TreeError};
