#![forbid(unsafe_code)]

//! Identifier newtypes and the crate-wide error type.

use std::fmt;

use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::key::NodeKey;

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                $name(value)
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.0))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                i64::column_result(value).map($name)
            }
        }
    };
}

row_id!(
    /// Identifier of a hierarchy (one tenant's independent tree).
    HierarchyId
);
row_id!(
    /// Identifier of a node row.
    NodeId
);
row_id!(
    /// Identifier of an asset row.
    AssetId
);

/// Errors surfaced by the engine.
#[derive(thiserror::Error, Debug)]
pub enum TreeError {
    /// SQLite failure.
    #[error("store: {0}")]
    Store(#[from] rusqlite::Error),
    /// Membership rows changed between snapshot and delete; safe to retry.
    #[error("concurrency conflict: expected {expected} membership rows, deleted {actual}")]
    Conflict {
        /// Rows present in the snapshot.
        expected: usize,
        /// Rows the delete actually removed.
        actual: usize,
    },
    /// Two nodes in one hierarchy tried to take the same key.
    #[error("key collision in hierarchy {hierarchy}: {key}")]
    KeyCollision {
        /// Hierarchy that owns the key.
        hierarchy: HierarchyId,
        /// Colliding key.
        key: NodeKey,
    },
    /// The tree lock was not granted within the configured timeout.
    #[error("tree lock for hierarchy {0} not acquired within timeout")]
    LockTimeout(HierarchyId),
    /// A materialized path key failed to parse.
    #[error("invalid node key: {0:?}")]
    InvalidKey(String),
    /// A sibling with the same value already exists.
    #[error("a sibling named {value:?} already exists under {parent}")]
    DuplicateSibling {
        /// Parent node key.
        parent: NodeKey,
        /// Rejected value.
        value: String,
    },
    /// Node still has children or directly attached assets.
    #[error("node {0} still has children or assets")]
    NodeNotEmpty(NodeKey),
    /// Invalid argument.
    #[error("invalid argument: {0}")]
    Invalid(String),
    /// Referenced row does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// Persisted structure violates a tree invariant.
    #[error("corruption: {0}")]
    Corruption(String),
}

impl TreeError {
    /// Returns true when the caller may simply retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TreeError::Conflict { .. } | TreeError::LockTimeout(_))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TreeError>;

/// Kind of membership change.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipOp {
    /// Asset attached to node.
    Add,
    /// Asset detached from node.
    Remove,
}

impl MembershipOp {
    pub(crate) fn sign(self) -> i64 {
        match self {
            MembershipOp::Add => 1,
            MembershipOp::Remove => -1,
        }
    }
}

impl fmt::Display for MembershipOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MembershipOp::Add => f.write_str("add"),
            MembershipOp::Remove => f.write_str("remove"),
        }
    }
}

/// A hierarchy row.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Hierarchy {
    /// Row id.
    pub id: HierarchyId,
    /// Display name, also the root node's value.
    pub name: String,
}

/// A node row.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Node {
    /// Row id.
    pub id: NodeId,
    /// Owning hierarchy.
    pub hierarchy_id: HierarchyId,
    /// Materialized path key.
    pub key: NodeKey,
    /// Display label.
    pub value: String,
    /// `/`-joined labels from the root down to this node.
    pub full_value: String,
    /// Cached count of distinct assets in this node's subtree.
    pub assets_amount: i64,
}

impl Node {
    /// Returns true for a hierarchy root.
    pub fn is_root(&self) -> bool {
        self.key.is_root()
    }
}

/// An asset row.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Asset {
    /// Row id.
    pub id: AssetId,
    /// Owning hierarchy.
    pub hierarchy_id: HierarchyId,
    /// Display name.
    pub name: String,
}
