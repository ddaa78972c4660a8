use std::time::Instant;

use rusqlite::Connection;
use rustc_hash::FxHashSet;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::counts::{aggregate, incremental};
use crate::key::NodeKey;
use crate::storage;
use crate::types::{AssetId, HierarchyId, Node, Result};

const MAX_FINDINGS: usize = 32;

/// Whether a reconciliation pass may write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileMode {
    /// Overwrite wrong counts and attach orphans to the root.
    Repair,
    /// Report only.
    CheckOnly,
}

/// Severity of a [`ReconcileFinding`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingSeverity {
    /// Something was noticed and fixed.
    Warning,
    /// A structural problem the job does not fix.
    Error,
}

/// A structural observation made while reconciling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ReconcileFinding {
    /// How bad it is.
    pub severity: FindingSeverity,
    /// Human-readable description.
    pub message: String,
}

impl ReconcileFinding {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: FindingSeverity::Warning,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: FindingSeverity::Error,
            message: message.into(),
        }
    }
}

/// A node whose cached count disagreed with the recomputed one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CountDrift {
    /// Node key.
    pub key: NodeKey,
    /// Value found in the cache.
    pub cached: i64,
    /// Value recomputed from memberships.
    pub computed: i64,
}

/// Outcome of one reconciliation pass.
#[derive(Clone, Debug, Serialize)]
pub struct ReconcileReport {
    /// Hierarchy examined.
    pub hierarchy: HierarchyId,
    /// Mode the pass ran in.
    pub mode: ReconcileMode,
    /// True when nothing was wrong.
    pub clean: bool,
    /// Nodes examined.
    pub nodes_checked: usize,
    /// Assets in the hierarchy.
    pub assets_checked: usize,
    /// Count disagreements (corrected in repair mode).
    pub drift: Vec<CountDrift>,
    /// Assets found without any membership (attached to the root in repair
    /// mode).
    pub orphans: Vec<AssetId>,
    /// Structural findings, capped.
    pub findings: Vec<ReconcileFinding>,
    /// Wall-clock time of the pass.
    pub elapsed_ms: u64,
}

/// Recomputes every count of `hierarchy` and, in repair mode, writes back the
/// ones that drifted. The caller holds the tree lock and, for repair, a write
/// transaction.
pub(crate) fn reconcile(
    conn: &Connection,
    hierarchy: HierarchyId,
    mode: ReconcileMode,
) -> Result<ReconcileReport> {
    let started = Instant::now();
    let mut findings = Vec::new();

    let nodes = storage::list_nodes(conn, hierarchy)?;
    let roots: Vec<&Node> = nodes.iter().filter(|n| n.is_root()).collect();
    let root = match roots.as_slice() {
        [root] => Some(*root),
        [] => {
            error!(hierarchy = %hierarchy, "tree.reconcile.missing_root");
            push_finding(&mut findings, ReconcileFinding::error("hierarchy has no root node"));
            None
        }
        many => {
            error!(hierarchy = %hierarchy, roots = many.len(), "tree.reconcile.multiple_roots");
            push_finding(
                &mut findings,
                ReconcileFinding::error(format!("hierarchy has {} root nodes", many.len())),
            );
            None
        }
    };

    let keys: FxHashSet<&NodeKey> = nodes.iter().map(|n| &n.key).collect();
    for node in &nodes {
        if let Some(parent) = node.key.parent() {
            if !keys.contains(&parent) {
                error!(hierarchy = %hierarchy, key = %node.key, "tree.reconcile.missing_parent");
                push_finding(
                    &mut findings,
                    ReconcileFinding::error(format!("node {} has no parent {parent}", node.key)),
                );
            }
        }
    }

    let orphans = storage::orphan_assets(conn, hierarchy, None)?;
    if !orphans.is_empty() {
        error!(hierarchy = %hierarchy, orphans = orphans.len(), "tree.reconcile.orphans");
        match (mode, root) {
            (ReconcileMode::Repair, Some(root)) => {
                incremental::add_to_node(conn, root, &orphans, false)?;
                push_finding(
                    &mut findings,
                    ReconcileFinding::warning(format!(
                        "attached {} orphan assets to root {}",
                        orphans.len(),
                        root.key
                    )),
                );
            }
            _ => push_finding(
                &mut findings,
                ReconcileFinding::error(format!("{} assets have no node", orphans.len())),
            ),
        }
    }

    let pairs = storage::keyed_pairs(conn, hierarchy, None)?;
    let totals = aggregate(nodes.iter().map(|n| n.key.clone()), pairs, false);

    let mut drift = Vec::new();
    for node in &nodes {
        let computed = totals.count(&node.key).unwrap_or(0) as i64;
        if node.assets_amount != computed {
            warn!(
                hierarchy = %hierarchy,
                key = %node.key,
                cached = node.assets_amount,
                computed,
                "tree.reconcile.drift"
            );
            if mode == ReconcileMode::Repair {
                storage::set_assets_amount(conn, node.id, computed)?;
            }
            drift.push(CountDrift {
                key: node.key.clone(),
                cached: node.assets_amount,
                computed,
            });
        }
    }

    if mode == ReconcileMode::Repair {
        storage::clear_reconcile_pending(conn, hierarchy)?;
    }

    let assets_checked = storage::count_assets(conn, hierarchy)?;
    let clean = drift.is_empty() && orphans.is_empty() && findings.is_empty();
    let elapsed_ms = started.elapsed().as_millis() as u64;
    info!(
        hierarchy = %hierarchy,
        mode = ?mode,
        nodes = nodes.len(),
        drift = drift.len(),
        orphans = orphans.len(),
        elapsed_ms,
        "tree.reconcile.complete"
    );
    Ok(ReconcileReport {
        hierarchy,
        mode,
        clean,
        nodes_checked: nodes.len(),
        assets_checked,
        drift,
        orphans,
        findings,
        elapsed_ms,
    })
}

fn push_finding(findings: &mut Vec<ReconcileFinding>, finding: ReconcileFinding) {
    if findings.len() < MAX_FINDINGS {
        findings.push(finding);
    }
}
