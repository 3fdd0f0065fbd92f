//! Cluster-wide load state
//!
//! Per-node replica and leader counts, the decommission sets, and the
//! remaining concurrency budget for one pass. Tables are analyzed one after
//! another against this state, and every committed action is recorded here
//! so the next table sees the updated load.

use std::collections::{BTreeMap, BTreeSet};

use shardline_core::{Action, ActionKind, CloudInfo, NodeDescriptor, NodeId, TabletDescriptor};
use tracing::debug;

use crate::config::BalancerOptions;
use crate::pending::PendingTaskTracker;

/// Load of one node as seen by the current pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLoad {
    pub id: NodeId,
    pub cloud_info: CloudInfo,
    pub placement_uuid: String,
    pub is_live: bool,
    pub replicas: usize,
    pub leaders: usize,
    reported_replicas: usize,
    reported_leaders: usize,
}

/// Remaining actions of each kind this pass may still commit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Budget {
    adds: usize,
    removals: usize,
    leader_moves: usize,
}

impl Budget {
    fn get(&self, kind: ActionKind) -> usize {
        match kind {
            ActionKind::AddReplica => self.adds,
            ActionKind::RemoveReplica => self.removals,
            ActionKind::StepDownLeader => self.leader_moves,
        }
    }

    fn slot(&mut self, kind: ActionKind) -> &mut usize {
        match kind {
            ActionKind::AddReplica => &mut self.adds,
            ActionKind::RemoveReplica => &mut self.removals,
            ActionKind::StepDownLeader => &mut self.leader_moves,
        }
    }
}

#[derive(Debug, Default)]
pub struct GlobalLoadState {
    nodes: BTreeMap<NodeId, NodeLoad>,
    blacklist: BTreeSet<NodeId>,
    leader_blacklist: BTreeSet<NodeId>,
    budget: Budget,
}

impl GlobalLoadState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the node table with zeroed counters
    pub fn refresh(&mut self, nodes: &[NodeDescriptor]) {
        self.nodes = nodes
            .iter()
            .map(|n| {
                (
                    n.id.clone(),
                    NodeLoad {
                        id: n.id.clone(),
                        cloud_info: n.cloud_info.clone(),
                        placement_uuid: n.placement_uuid.clone(),
                        is_live: n.is_live,
                        replicas: 0,
                        leaders: 0,
                        reported_replicas: n.reported_replicas,
                        reported_leaders: n.reported_leaders,
                    },
                )
            })
            .collect();
        debug!(nodes = self.nodes.len(), "Refreshed global load state");
    }

    /// Install the replica drain set, replacing the previous one
    pub fn set_blacklist(&mut self, blacklist: BTreeSet<NodeId>) {
        self.blacklist = blacklist;
    }

    /// Install the leadership drain set, replacing the previous one
    pub fn set_leader_blacklist(&mut self, leader_blacklist: BTreeSet<NodeId>) {
        self.leader_blacklist = leader_blacklist;
    }

    /// Count the replicas and leader of an existing tablet
    pub fn seed_tablet(&mut self, tablet: &TabletDescriptor) {
        for replica in &tablet.replicas {
            self.record_replica_add(replica);
        }
        if let Some(leader) = &tablet.leader {
            if let Some(load) = self.nodes.get_mut(leader) {
                load.leaders += 1;
            }
        }
    }

    /// Reset the per-kind budget to the caps minus what is already in flight
    pub fn set_budget(&mut self, options: &BalancerOptions, tracker: &PendingTaskTracker) {
        self.budget = Budget {
            adds: options
                .max_concurrent_adds
                .saturating_sub(tracker.in_flight(ActionKind::AddReplica)),
            removals: options
                .max_concurrent_removals
                .saturating_sub(tracker.in_flight(ActionKind::RemoveReplica)),
            leader_moves: options
                .max_concurrent_leader_moves
                .saturating_sub(tracker.in_flight(ActionKind::StepDownLeader)),
        };
    }

    pub fn has_budget(&self, kind: ActionKind) -> bool {
        self.remaining(kind) > 0
    }

    pub fn remaining(&self, kind: ActionKind) -> usize {
        self.budget.get(kind)
    }

    /// Take one unit of budget for `kind`; false when exhausted
    pub fn consume(&mut self, kind: ActionKind) -> bool {
        let slot = self.budget.slot(kind);
        if *slot == 0 {
            return false;
        }
        *slot -= 1;
        true
    }

    /// True once no kind has budget left
    pub fn is_exhausted(&self) -> bool {
        ActionKind::ALL.iter().all(|k| !self.has_budget(*k))
    }

    pub fn record_replica_add(&mut self, node: &str) {
        if let Some(load) = self.nodes.get_mut(node) {
            load.replicas += 1;
        }
    }

    pub fn record_replica_remove(&mut self, node: &str) {
        if let Some(load) = self.nodes.get_mut(node) {
            load.replicas = load.replicas.saturating_sub(1);
        }
    }

    pub fn record_leader_change(&mut self, from: Option<&str>, to: &str) {
        if let Some(from) = from {
            if let Some(load) = self.nodes.get_mut(from) {
                load.leaders = load.leaders.saturating_sub(1);
            }
        }
        if let Some(load) = self.nodes.get_mut(to) {
            load.leaders += 1;
        }
    }

    /// Apply a committed or in-flight change to the counters
    pub fn record_change(&mut self, kind: ActionKind, target: &str, new_leader: Option<&str>) {
        match kind {
            ActionKind::AddReplica => self.record_replica_add(target),
            ActionKind::RemoveReplica => {
                self.record_replica_remove(target);
                // Removing a leader hands leadership to the nominee.
                if let Some(new_leader) = new_leader {
                    self.record_leader_change(Some(target), new_leader);
                }
            }
            ActionKind::StepDownLeader => {
                if let Some(new_leader) = new_leader {
                    self.record_leader_change(Some(target), new_leader);
                }
            }
        }
    }

    pub fn record_action(&mut self, action: &Action) {
        self.record_change(action.kind, &action.target_node, action.new_leader.as_deref());
    }

    pub fn node(&self, id: &str) -> Option<&NodeLoad> {
        self.nodes.get(id)
    }

    /// Nodes in id order
    pub fn nodes(&self) -> impl Iterator<Item = &NodeLoad> {
        self.nodes.values()
    }

    pub fn replica_count(&self, node: &str) -> usize {
        self.nodes.get(node).map(|n| n.replicas).unwrap_or(0)
    }

    pub fn leader_count(&self, node: &str) -> usize {
        self.nodes.get(node).map(|n| n.leaders).unwrap_or(0)
    }

    pub fn is_live(&self, node: &str) -> bool {
        self.nodes.get(node).map(|n| n.is_live).unwrap_or(false)
    }

    pub fn is_blacklisted(&self, node: &str) -> bool {
        self.blacklist.contains(node)
    }

    pub fn is_leader_blacklisted(&self, node: &str) -> bool {
        self.leader_blacklist.contains(node)
    }

    /// Nodes whose self-reported replica count disagrees with the snapshot
    pub fn replica_drift(&self) -> Vec<(NodeId, usize, usize)> {
        self.nodes
            .values()
            .filter(|n| n.is_live && n.reported_replicas != 0 && n.reported_replicas != n.replicas)
            .map(|n| (n.id.clone(), n.reported_replicas, n.replicas))
            .collect()
    }

    /// Nodes whose self-reported leader count disagrees with the snapshot
    pub fn leader_drift(&self) -> Vec<(NodeId, usize, usize)> {
        self.nodes
            .values()
            .filter(|n| n.is_live && n.reported_leaders != 0 && n.reported_leaders != n.leaders)
            .map(|n| (n.id.clone(), n.reported_leaders, n.leaders))
            .collect()
    }
}
