//! Membership change notifications.
//!
//! Observers are invoked synchronously on the mutating thread and never while
//! the store connection is held, so they may call back into the engine.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::types::{AssetId, HierarchyId, NodeId};

/// One asset together with the nodes it gains or loses.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MembershipChange {
    /// Asset whose memberships change.
    pub asset_id: AssetId,
    /// Nodes affected for this asset.
    pub node_ids: Vec<NodeId>,
}

/// Receives membership change notifications.
///
/// `before_remove` sees the rows about to be deleted; `after_remove` and
/// `after_add` see the rows that actually changed once the transaction has
/// committed.
pub trait MembershipObserver: Send + Sync {
    /// Rows are about to be removed.
    fn before_remove(&self, _hierarchy: HierarchyId, _changes: &[MembershipChange]) {}
    /// Rows were removed.
    fn after_remove(&self, _hierarchy: HierarchyId, _changes: &[MembershipChange]) {}
    /// Rows were added.
    fn after_add(&self, _hierarchy: HierarchyId, _changes: &[MembershipChange]) {}
}

/// Which callback produced a [`MembershipNotice`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticePhase {
    /// [`MembershipObserver::before_remove`].
    BeforeRemove,
    /// [`MembershipObserver::after_remove`].
    AfterRemove,
    /// [`MembershipObserver::after_add`].
    AfterAdd,
}

/// Owned copy of one notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MembershipNotice {
    /// Callback that fired.
    pub phase: NoticePhase,
    /// Hierarchy the rows belong to.
    pub hierarchy: HierarchyId,
    /// Affected rows grouped by asset.
    pub changes: Vec<MembershipChange>,
}

/// Observer that forwards every notification over a channel.
pub struct ChannelObserver {
    tx: Mutex<Sender<MembershipNotice>>,
}

impl ChannelObserver {
    /// Creates the observer and the receiving end.
    pub fn channel() -> (Self, Receiver<MembershipNotice>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx: Mutex::new(tx) }, rx)
    }

    fn send(&self, phase: NoticePhase, hierarchy: HierarchyId, changes: &[MembershipChange]) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.lock().send(MembershipNotice {
            phase,
            hierarchy,
            changes: changes.to_vec(),
        });
    }
}

impl MembershipObserver for ChannelObserver {
    fn before_remove(&self, hierarchy: HierarchyId, changes: &[MembershipChange]) {
        self.send(NoticePhase::BeforeRemove, hierarchy, changes);
    }

    fn after_remove(&self, hierarchy: HierarchyId, changes: &[MembershipChange]) {
        self.send(NoticePhase::AfterRemove, hierarchy, changes);
    }

    fn after_add(&self, hierarchy: HierarchyId, changes: &[MembershipChange]) {
        self.send(NoticePhase::AfterAdd, hierarchy, changes);
    }
}

/// Registered observers.
#[derive(Default)]
pub(crate) struct Observers {
    list: RwLock<Vec<Arc<dyn MembershipObserver>>>,
}

impl Observers {
    pub(crate) fn subscribe(&self, observer: Arc<dyn MembershipObserver>) {
        self.list.write().push(observer);
    }

    // Clone the list so a callback may subscribe without deadlocking.
    fn current(&self) -> Vec<Arc<dyn MembershipObserver>> {
        self.list.read().clone()
    }

    pub(crate) fn before_remove(&self, hierarchy: HierarchyId, changes: &[MembershipChange]) {
        if changes.is_empty() {
            return;
        }
        for observer in self.current() {
            observer.before_remove(hierarchy, changes);
        }
    }

    pub(crate) fn after_remove(&self, hierarchy: HierarchyId, changes: &[MembershipChange]) {
        if changes.is_empty() {
            return;
        }
        for observer in self.current() {
            observer.after_remove(hierarchy, changes);
        }
    }

    pub(crate) fn after_add(&self, hierarchy: HierarchyId, changes: &[MembershipChange]) {
        if changes.is_empty() {
            return;
        }
        for observer in self.current() {
            observer.after_add(hierarchy, changes);
        }
    }
}

/// Groups `(asset, node)` rows by asset, keeping first-seen asset order.
pub(crate) fn group_by_asset<I>(rows: I) -> Vec<MembershipChange>
where
    I: IntoIterator<Item = (AssetId, NodeId)>,
{
    let mut out: Vec<MembershipChange> = Vec::new();
    for (asset, node) in rows {
        match out.iter_mut().find(|c| c.asset_id == asset) {
            Some(change) => change.node_ids.push(node),
            None => out.push(MembershipChange {
                asset_id: asset,
                node_ids: vec![node],
            }),
        }
    }
    out
}
