//! Pending task tracking
//!
//! Remembers actions that were emitted but whose effect is not yet visible
//! in the catalog, so the planner never issues the same change twice.
//! Reconciliation against each new snapshot is the only way tasks leave the
//! tracker; the executor never reports back directly.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shardline_core::{Action, ActionKind, NodeId, TableId, TabletId};
use tracing::{debug, warn};

use crate::snapshot::ClusterSnapshot;

/// An issued action awaiting confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTask {
    pub tablet_id: TabletId,
    pub table_id: TableId,
    pub kind: ActionKind,
    pub target_node: NodeId,
    pub new_leader: Option<NodeId>,
    /// Pass number the task was recorded in
    pub issued_pass: u64,
    pub issued_at: DateTime<Utc>,
}

impl PendingTask {
    pub fn from_action(action: &Action, pass: u64) -> Self {
        Self {
            tablet_id: action.tablet_id.clone(),
            table_id: action.table_id.clone(),
            kind: action.kind,
            target_node: action.target_node.clone(),
            new_leader: action.new_leader.clone(),
            issued_pass: pass,
            issued_at: Utc::now(),
        }
    }
}

/// Outcome of reconciling the tracker against a snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    /// Tasks whose effect is visible in the snapshot
    pub completed: usize,
    /// Tasks whose tablet or node no longer exists
    pub stale: usize,
    /// Tasks that stayed invisible for too many passes
    pub expired: usize,
    /// Catalog-reported tasks newly adopted
    pub adopted: usize,
    /// Tasks still in flight after reconciliation
    pub remaining: usize,
}

enum Disposition {
    Pending,
    Completed,
    Stale,
    Expired,
}

/// Tracker shared by every balancer of one cluster
pub type SharedTracker = Arc<Mutex<PendingTaskTracker>>;

/// In-flight tasks keyed by tablet and kind
#[derive(Debug, Default)]
pub struct PendingTaskTracker {
    tasks: BTreeMap<(TabletId, ActionKind), PendingTask>,
}

impl PendingTaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `tablet` has an outstanding task of exactly `kind`
    pub fn has_pending(&self, tablet: &str, kind: ActionKind) -> bool {
        self.tasks.contains_key(&(tablet.to_string(), kind))
    }

    pub fn pending(&self, tablet: &str, kind: ActionKind) -> Option<&PendingTask> {
        self.tasks.get(&(tablet.to_string(), kind))
    }

    /// Whether `tablet` has any outstanding task
    pub fn has_any(&self, tablet: &str) -> bool {
        ActionKind::ALL.iter().any(|k| self.has_pending(tablet, *k))
    }

    /// Whether any outstanding task on `tablet` conflicts with a new `kind` task
    pub fn has_conflicting(&self, tablet: &str, kind: ActionKind) -> bool {
        ActionKind::ALL
            .iter()
            .any(|other| kind.conflicts_with(*other) && self.has_pending(tablet, *other))
    }

    /// Record a committed task; returns false if one of the same kind is outstanding
    pub fn record(&mut self, task: PendingTask) -> bool {
        let key = (task.tablet_id.clone(), task.kind);
        if self.tasks.contains_key(&key) {
            warn!(
                tablet_id = %task.tablet_id,
                kind = %task.kind,
                "Duplicate pending task ignored"
            );
            return false;
        }
        self.tasks.insert(key, task);
        true
    }

    /// Drop a task that will never be dispatched
    pub fn forget(&mut self, tablet: &str, kind: ActionKind) -> Option<PendingTask> {
        self.tasks.remove(&(tablet.to_string(), kind))
    }

    /// Outstanding tasks of `kind`
    pub fn in_flight(&self, kind: ActionKind) -> usize {
        self.tasks.values().filter(|t| t.kind == kind).count()
    }

    pub fn tasks(&self) -> impl Iterator<Item = &PendingTask> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Drop tasks that completed, went stale or expired, then adopt the
    /// catalog's own in-flight tasks
    pub fn reconcile(
        &mut self,
        snapshot: &ClusterSnapshot,
        current_pass: u64,
        max_pending_passes: u64,
    ) -> ReconcileStats {
        let tablets = snapshot.tablet_index();
        let mut stats = ReconcileStats::default();

        self.tasks.retain(|_, task| {
            let disposition = match tablets.get(task.tablet_id.as_str()) {
                None => Disposition::Stale,
                Some(tablet) => {
                    let target = snapshot.node(&task.target_node);
                    let reflected = match task.kind {
                        ActionKind::AddReplica => tablet.has_replica(&task.target_node),
                        ActionKind::RemoveReplica => !tablet.has_replica(&task.target_node),
                        ActionKind::StepDownLeader => {
                            tablet.leader.as_deref() != Some(task.target_node.as_str())
                        }
                    };
                    let target_gone = match task.kind {
                        ActionKind::AddReplica => !target.map(|n| n.is_live).unwrap_or(false),
                        ActionKind::RemoveReplica => target.is_none(),
                        ActionKind::StepDownLeader => task
                            .new_leader
                            .as_deref()
                            .map(|n| !tablet.has_replica(n))
                            .unwrap_or(false),
                    };
                    if reflected {
                        Disposition::Completed
                    } else if target_gone {
                        Disposition::Stale
                    } else if current_pass.saturating_sub(task.issued_pass) >= max_pending_passes {
                        Disposition::Expired
                    } else {
                        Disposition::Pending
                    }
                }
            };

            match disposition {
                Disposition::Pending => true,
                Disposition::Completed => {
                    stats.completed += 1;
                    false
                }
                Disposition::Stale => {
                    debug!(tablet_id = %task.tablet_id, kind = %task.kind, "Dropping stale task");
                    stats.stale += 1;
                    false
                }
                Disposition::Expired => {
                    warn!(
                        tablet_id = %task.tablet_id,
                        kind = %task.kind,
                        issued_pass = task.issued_pass,
                        "Pending task never took effect, expiring"
                    );
                    stats.expired += 1;
                    false
                }
            }
        });

        for action in &snapshot.catalog_pending {
            let key = (action.tablet_id.clone(), action.kind);
            if !self.tasks.contains_key(&key) && tablets.contains_key(action.tablet_id.as_str()) {
                self.tasks
                    .insert(key, PendingTask::from_action(action, current_pass));
                stats.adopted += 1;
            }
        }

        stats.remaining = self.tasks.len();
        stats
    }
}
