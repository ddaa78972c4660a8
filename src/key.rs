#![forbid(unsafe_code)]

//! Materialized path keys.
//!
//! A key such as `1:3:2` encodes a node's position as the sequence of integer
//! segments from the hierarchy root. Everything here is pure: parent and
//! ancestor derivation, subtree membership tests and child key allocation.
//! Allocation is only race-free when callers hold the hierarchy's
//! [`TreeLock`](crate::lock::TreeLock) lease.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::types::{Result, TreeError};

const SEPARATOR: char = ':';

/// Direction of [`NodeKey::ancestors`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AncestorOrder {
    /// Nearest first: the node (if included), its parent, ..., the root.
    SelfToRoot,
    /// Root first, ending with the node itself (if included).
    RootToSelf,
}

/// A validated, canonical materialized path key.
///
/// Equality, hashing and ordering use the integer segments, so `1:2` sorts
/// before `1:2:1`, which sorts before `1:10`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeKey {
    raw: String,
    segments: SmallVec<[u64; 8]>,
}

impl NodeKey {
    /// Parses a key, rejecting empty keys and non-numeric segments.
    pub fn parse(input: &str) -> Result<Self> {
        if input.is_empty() {
            return Err(TreeError::InvalidKey(input.to_string()));
        }
        let mut segments = SmallVec::new();
        for part in input.split(SEPARATOR) {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(TreeError::InvalidKey(input.to_string()));
            }
            let seg = part
                .parse::<u64>()
                .map_err(|_| TreeError::InvalidKey(input.to_string()))?;
            segments.push(seg);
        }
        Ok(Self::from_segments(segments))
    }

    /// Builds a single-segment root key.
    pub fn root(segment: u64) -> Self {
        let mut segments = SmallVec::new();
        segments.push(segment);
        Self::from_segments(segments)
    }

    fn from_segments(segments: SmallVec<[u64; 8]>) -> Self {
        let mut raw = String::with_capacity(segments.len() * 3);
        for (idx, seg) in segments.iter().enumerate() {
            if idx > 0 {
                raw.push(SEPARATOR);
            }
            raw.push_str(&seg.to_string());
        }
        Self { raw, segments }
    }

    /// Canonical string form.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Integer segments from the root down.
    pub fn segments(&self) -> &[u64] {
        &self.segments
    }

    /// Number of segments; roots have depth 1.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Returns true for single-segment keys.
    pub fn is_root(&self) -> bool {
        self.segments.len() == 1
    }

    /// Last segment (the position among siblings).
    pub fn last_segment(&self) -> u64 {
        self.segments.last().copied().unwrap_or_default()
    }

    /// Key of the child with the given last segment.
    pub fn child(&self, segment: u64) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment);
        Self::from_segments(segments)
    }

    /// Strips the last segment; `None` for a root.
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        let segments: SmallVec<[u64; 8]> =
            self.segments[..self.segments.len() - 1].iter().copied().collect();
        Some(Self::from_segments(segments))
    }

    /// The root key of this key's hierarchy.
    pub fn root_key(&self) -> Self {
        Self::root(self.segments[0])
    }

    /// Every key obtained by repeatedly taking the parent.
    pub fn ancestors(&self, include_self: bool, order: AncestorOrder) -> Vec<NodeKey> {
        let mut out = Vec::with_capacity(self.depth());
        if include_self {
            out.push(self.clone());
        }
        let mut current = self.parent();
        while let Some(key) = current {
            current = key.parent();
            out.push(key);
        }
        if order == AncestorOrder::RootToSelf {
            out.reverse();
        }
        out
    }

    /// True iff `self == ancestor` or `self` lies in `ancestor`'s subtree.
    pub fn is_descendant_or_self(&self, ancestor: &NodeKey) -> bool {
        self.segments.starts_with(&ancestor.segments)
    }

    /// True iff `self` lies strictly below `ancestor`.
    pub fn is_strict_descendant_of(&self, ancestor: &NodeKey) -> bool {
        self.segments.len() > ancestor.segments.len() && self.is_descendant_or_self(ancestor)
    }

    /// Half-open string range `[key:, key;)` holding exactly the strict
    /// descendants, so subtree filters can use the `(hierarchy_id, key)` index.
    pub(crate) fn descendant_bounds(&self) -> (String, String) {
        (format!("{}:", self.raw), format!("{};", self.raw))
    }
}

/// Allocates the next child key under `parent`.
///
/// Only direct children of `parent` in `existing` are considered; the result
/// is `parent:(max last segment + 1)`, or `parent:1` when there are none.
pub fn next_child_key<'a, I>(parent: &NodeKey, existing: I) -> NodeKey
where
    I: IntoIterator<Item = &'a NodeKey>,
{
    let max = existing
        .into_iter()
        .filter(|key| key.depth() == parent.depth() + 1 && key.is_descendant_or_self(parent))
        .map(NodeKey::last_segment)
        .max();
    parent.child(max.map_or(1, |m| m + 1))
}

/// Allocates a root key unused by any existing root.
pub fn next_root_key<'a, I>(existing_roots: I) -> NodeKey
where
    I: IntoIterator<Item = &'a NodeKey>,
{
    let max = existing_roots
        .into_iter()
        .filter(|key| key.is_root())
        .map(NodeKey::last_segment)
        .max();
    NodeKey::root(max.map_or(1, |m| m + 1))
}

/// Drops every key that is a proper ancestor of another key in the set.
pub fn collapse_to_deepest<I>(keys: I) -> BTreeSet<NodeKey>
where
    I: IntoIterator<Item = NodeKey>,
{
    let keys: BTreeSet<NodeKey> = keys.into_iter().collect();
    let mut covered = BTreeSet::new();
    for key in &keys {
        covered.extend(key.ancestors(false, AncestorOrder::SelfToRoot));
    }
    keys.into_iter().filter(|key| !covered.contains(key)).collect()
}

/// Drops every key that lies inside another key's subtree.
pub fn collapse_to_topmost<I>(keys: I) -> Vec<NodeKey>
where
    I: IntoIterator<Item = NodeKey>,
{
    let sorted: BTreeSet<NodeKey> = keys.into_iter().collect();
    let mut out: Vec<NodeKey> = Vec::with_capacity(sorted.len());
    for key in sorted {
        match out.last() {
            Some(base) if key.is_descendant_or_self(base) => continue,
            _ => out.push(key),
        }
    }
    out
}

impl PartialEq for NodeKey {
    fn eq(&self, other: &Self) -> bool {
        self.segments == other.segments
    }
}

impl Eq for NodeKey {}

impl Hash for NodeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.segments.hash(state);
    }
}

impl PartialOrd for NodeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.segments.cmp(&other.segments)
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKey({})", self.raw)
    }
}

impl FromStr for NodeKey {
    type Err = TreeError;

    fn from_str(s: &str) -> Result<Self> {
        NodeKey::parse(s)
    }
}

impl TryFrom<String> for NodeKey {
    type Error = TreeError;

    fn try_from(value: String) -> Result<Self> {
        NodeKey::parse(&value)
    }
}

impl From<NodeKey> for String {
    fn from(key: NodeKey) -> Self {
        key.raw
    }
}

impl ToSql for NodeKey {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.raw.as_str()))
    }
}

impl FromSql for NodeKey {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        NodeKey::parse(text).map_err(|err| FromSqlError::Other(Box::new(err)))
    }
}
