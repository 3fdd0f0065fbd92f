//! Per-table load state
//!
//! Builds one table's view of its tablets and proposes the next action that
//! moves the table toward its placement. Problems are handled in a fixed
//! priority order and a table only works on its most urgent category in a
//! given pass:
//! 1. drain replicas off blacklisted nodes
//! 2. add replicas to under-replicated tablets
//! 3. remove replicas from over-replicated tablets
//! 4. fix zone placement
//! 5. even out replica load across nodes
//! 6. move leaders (blacklist, affinity, then leader counts)

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use shardline_core::{
    Action, ActionKind, CloudInfo, NodeId, ReplicaType, TableDescriptor, TabletDescriptor,
    TabletId,
};
use tracing::debug;

use crate::config::BalancerOptions;
use crate::global_state::{GlobalLoadState, NodeLoad};
use crate::pending::PendingTaskTracker;
use crate::placement::{PlacementConstraint, PlacementError};

/// Balancing categories, most urgent first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    DrainBlacklisted,
    UnderReplicated,
    OverReplicated,
    PlacementMismatch,
    ReplicaLoad,
    Leaders,
}

impl Category {
    pub const PRIORITY: [Category; 6] = [
        Category::DrainBlacklisted,
        Category::UnderReplicated,
        Category::OverReplicated,
        Category::PlacementMismatch,
        Category::ReplicaLoad,
        Category::Leaders,
    ];
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DrainBlacklisted => write!(f, "drain_blacklisted"),
            Self::UnderReplicated => write!(f, "under_replicated"),
            Self::OverReplicated => write!(f, "over_replicated"),
            Self::PlacementMismatch => write!(f, "placement_mismatch"),
            Self::ReplicaLoad => write!(f, "replica_load"),
            Self::Leaders => write!(f, "leaders"),
        }
    }
}

/// Why a table was left out of a pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableSkipReason {
    /// Placement could not be resolved
    Placement(PlacementError),
    /// Table has not reached its expected tablet count yet
    AwaitingTablets { expected: usize, actual: usize },
    /// A tablet has no live replica and nothing in flight to repair it
    NoViableReplicas { tablet_id: TabletId },
}

impl TableSkipReason {
    /// Whether the skip needs operator attention
    pub fn is_flagged(&self) -> bool {
        !matches!(self, Self::AwaitingTablets { .. })
    }
}

impl fmt::Display for TableSkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Placement(e) => write!(f, "{}", e),
            Self::AwaitingTablets { expected, actual } => {
                write!(f, "awaiting tablets: {} of {} created", actual, expected)
            }
            Self::NoViableReplicas { tablet_id } => {
                write!(f, "tablet {} has no live replicas", tablet_id)
            }
        }
    }
}

/// Tablet as projected for this pass: snapshot plus in-flight changes
#[derive(Debug, Clone)]
struct TabletView {
    id: TabletId,
    replicas: BTreeSet<NodeId>,
    leader: Option<NodeId>,
    /// Replica being added; it cannot lead until the add lands
    joining: Option<NodeId>,
    split_in_progress: bool,
    /// No live replica right now; a pending task is expected to fix it
    frozen: bool,
}

impl TabletView {
    /// Replicas that may be nominated as leader
    fn voters(&self) -> impl Iterator<Item = &NodeId> {
        self.replicas
            .iter()
            .filter(move |r| self.joining.as_ref() != Some(*r))
    }
}

enum Proposal {
    Ready(Action),
    /// Work exists but no budget is left for it
    BudgetBlocked,
    Nothing,
}

pub struct PerTableLoadState<'a> {
    table: &'a TableDescriptor,
    constraint: &'a PlacementConstraint,
    options: &'a BalancerOptions,
    /// Sorted by tablet id
    tablets: Vec<TabletView>,
    /// Leaders of this table per node
    table_leaders: BTreeMap<NodeId, usize>,
    adds_allowed: bool,
    category: Option<Category>,
}

impl<'a> PerTableLoadState<'a> {
    /// Build the table view from its tablets and the in-flight tasks
    pub fn new(
        table: &'a TableDescriptor,
        tablets: &[TabletDescriptor],
        constraint: &'a PlacementConstraint,
        options: &'a BalancerOptions,
        global: &GlobalLoadState,
        tracker: &PendingTaskTracker,
    ) -> Result<Self, TableSkipReason> {
        if !options.allow_limit_starting_tablets {
            if let Some(expected) = table.expected_tablet_count {
                if tablets.len() < expected {
                    return Err(TableSkipReason::AwaitingTablets {
                        expected,
                        actual: tablets.len(),
                    });
                }
            }
        }

        // Unknown nodes are kept so their replicas can be removed.
        let in_scope = |node: &str| {
            global
                .node(node)
                .map(|n| n.placement_uuid == constraint.placement_uuid)
                .unwrap_or(true)
        };

        let mut views = Vec::with_capacity(tablets.len());
        let mut table_leaders: BTreeMap<NodeId, usize> = BTreeMap::new();

        for tablet in tablets {
            let frozen = !tablet.replicas.iter().any(|r| global.is_live(r));
            if frozen && !tracker.has_any(&tablet.id) {
                return Err(TableSkipReason::NoViableReplicas {
                    tablet_id: tablet.id.clone(),
                });
            }

            let mut replicas: BTreeSet<NodeId> = tablet
                .replicas
                .iter()
                .filter(|r| in_scope(r.as_str()))
                .cloned()
                .collect();
            let mut joining = None;
            if let Some(task) = tracker.pending(&tablet.id, ActionKind::AddReplica) {
                if in_scope(task.target_node.as_str()) && replicas.insert(task.target_node.clone()) {
                    joining = Some(task.target_node.clone());
                }
            }
            if let Some(task) = tracker.pending(&tablet.id, ActionKind::RemoveReplica) {
                replicas.remove(&task.target_node);
            }

            let mut leader = tablet.leader.clone().filter(|l| replicas.contains(l));
            if let Some(task) = tracker.pending(&tablet.id, ActionKind::StepDownLeader) {
                if let Some(new_leader) = task.new_leader.as_ref().filter(|n| replicas.contains(*n)) {
                    leader = Some(new_leader.clone());
                }
            }
            if let Some(l) = &leader {
                *table_leaders.entry(l.clone()).or_default() += 1;
            }

            views.push(TabletView {
                id: tablet.id.clone(),
                replicas,
                leader,
                joining,
                split_in_progress: tablet.split_in_progress,
                frozen,
            });
        }
        views.sort_by(|a, b| a.id.cmp(&b.id));

        let has_over_replicated = views
            .iter()
            .any(|t| t.replicas.len() > constraint.num_replicas);
        let adds_allowed = options.allow_limit_over_replicated_tablets || !has_over_replicated;

        Ok(Self {
            table,
            constraint,
            options,
            tablets: views,
            table_leaders,
            adds_allowed,
            category: None,
        })
    }

    pub fn table_id(&self) -> &str {
        &self.table.id
    }

    /// Category this table committed to in the current pass
    pub fn category(&self) -> Option<Category> {
        self.category
    }

    /// Propose the next action, or None when the table is done for this pass
    pub fn next_action(
        &mut self,
        global: &GlobalLoadState,
        tracker: &PendingTaskTracker,
    ) -> Option<Action> {
        let order: Vec<Category> = match self.category {
            Some(category) => vec![category],
            None => Category::PRIORITY.to_vec(),
        };

        for category in order {
            match self.propose(category, global, tracker) {
                Proposal::Ready(action) => {
                    self.category = Some(category);
                    return Some(action);
                }
                Proposal::BudgetBlocked => {
                    debug!(
                        table_id = %self.table.id,
                        category = %category,
                        "Budget exhausted for table"
                    );
                    self.category = Some(category);
                    return None;
                }
                Proposal::Nothing => {}
            }
        }
        None
    }

    /// Fold a committed action into the table view
    pub fn apply(&mut self, action: &Action) {
        let Ok(idx) = self
            .tablets
            .binary_search_by(|t| t.id.as_str().cmp(action.tablet_id.as_str()))
        else {
            return;
        };
        let tablet = &mut self.tablets[idx];

        match action.kind {
            ActionKind::AddReplica => {
                tablet.replicas.insert(action.target_node.clone());
                tablet.joining = Some(action.target_node.clone());
            }
            ActionKind::RemoveReplica => {
                tablet.replicas.remove(&action.target_node);
                if tablet.leader.as_deref() == Some(action.target_node.as_str()) {
                    decrement(&mut self.table_leaders, &action.target_node);
                    if let Some(new_leader) = &action.new_leader {
                        *self.table_leaders.entry(new_leader.clone()).or_default() += 1;
                    }
                    tablet.leader = action.new_leader.clone();
                }
            }
            ActionKind::StepDownLeader => {
                if let Some(new_leader) = &action.new_leader {
                    if let Some(old) = tablet.leader.take() {
                        decrement(&mut self.table_leaders, &old);
                    }
                    *self.table_leaders.entry(new_leader.clone()).or_default() += 1;
                    tablet.leader = Some(new_leader.clone());
                }
            }
        }
    }

    fn propose(
        &self,
        category: Category,
        global: &GlobalLoadState,
        tracker: &PendingTaskTracker,
    ) -> Proposal {
        match category {
            Category::DrainBlacklisted => self.scan(global, |t| self.drain(global, tracker, t)),
            Category::UnderReplicated => {
                self.scan(global, |t| self.repair_under_replicated(global, tracker, t))
            }
            Category::OverReplicated => {
                self.scan(global, |t| self.trim_over_replicated(global, tracker, t))
            }
            Category::PlacementMismatch => {
                self.scan(global, |t| self.fix_placement(global, tracker, t))
            }
            Category::ReplicaLoad => self.balance_replica_load(global, tracker),
            Category::Leaders => self.balance_leaders(global, tracker),
        }
    }

    /// Return the first proposal within budget
    fn scan<F>(&self, global: &GlobalLoadState, mut propose: F) -> Proposal
    where
        F: FnMut(&TabletView) -> Option<Action>,
    {
        let mut blocked = false;
        for tablet in &self.tablets {
            if let Some(action) = propose(tablet) {
                if global.has_budget(action.kind) {
                    return Proposal::Ready(action);
                }
                blocked = true;
            }
        }
        if blocked {
            Proposal::BudgetBlocked
        } else {
            Proposal::Nothing
        }
    }

    // =========================================================================
    // REPLICA CATEGORIES
    // =========================================================================

    fn drain(
        &self,
        global: &GlobalLoadState,
        tracker: &PendingTaskTracker,
        tablet: &TabletView,
    ) -> Option<Action> {
        if self.replica_change_blocked(tablet, tracker) {
            return None;
        }
        let drained = tablet
            .replicas
            .iter()
            .filter(|r| global.is_blacklisted(r))
            .min_by_key(|r| (Reverse(global.replica_count(r)), (*r).clone()))?;

        let healthy = tablet
            .replicas
            .iter()
            .filter(|r| is_healthy(global, r))
            .count();
        if healthy >= self.constraint.num_replicas {
            return Some(self.removal(global, tablet, drained));
        }

        // Not enough replicas elsewhere yet: copy first, remove later.
        if !self.adds_allowed {
            return None;
        }
        let target = self.choose_add_target(global, tablet)?;
        Some(Action::add_replica(&self.table.id, &tablet.id, &target))
    }

    fn repair_under_replicated(
        &self,
        global: &GlobalLoadState,
        tracker: &PendingTaskTracker,
        tablet: &TabletView,
    ) -> Option<Action> {
        if !self.adds_allowed || self.replica_change_blocked(tablet, tracker) {
            return None;
        }
        let live = tablet
            .replicas
            .iter()
            .filter(|r| global.is_live(r))
            .count();
        if live >= self.constraint.num_replicas {
            return None;
        }
        let target = self.choose_add_target(global, tablet)?;
        Some(Action::add_replica(&self.table.id, &tablet.id, &target))
    }

    fn trim_over_replicated(
        &self,
        global: &GlobalLoadState,
        tracker: &PendingTaskTracker,
        tablet: &TabletView,
    ) -> Option<Action> {
        if self.replica_change_blocked(tablet, tracker)
            || tablet.replicas.len() <= self.constraint.num_replicas
        {
            return None;
        }
        let victim = self.choose_removal(global, tablet)?;
        Some(self.removal(global, tablet, &victim))
    }

    fn fix_placement(
        &self,
        global: &GlobalLoadState,
        tracker: &PendingTaskTracker,
        tablet: &TabletView,
    ) -> Option<Action> {
        if !self.constraint.is_zone_constrained()
            || !self.adds_allowed
            || self.replica_change_blocked(tablet, tracker)
            || tablet.replicas.len() != self.constraint.num_replicas
        {
            return None;
        }

        let counts = self.zone_counts(global, tablet, None);
        let misplaced = tablet.replicas.iter().any(|r| {
            is_healthy(global, r)
                && !global
                    .node(r)
                    .map(|n| self.constraint.allows(&n.cloud_info))
                    .unwrap_or(false)
        });
        let out_of_bounds = self
            .constraint
            .zones
            .iter()
            .zip(&counts)
            .any(|(zone, count)| *count < zone.min_replicas || *count > zone.max_replicas);
        if !misplaced && !out_of_bounds {
            return None;
        }

        // The surplus replica is trimmed once the tablet is over-replicated.
        let target = self.choose_add_target(global, tablet)?;
        Some(Action::add_replica(&self.table.id, &tablet.id, &target))
    }

    /// Move a replica from the most loaded node to the least loaded one
    ///
    /// The move starts as an add; the source replica goes away through the
    /// over-replication path, which removes from the most loaded node.
    fn balance_replica_load(&self, global: &GlobalLoadState, tracker: &PendingTaskTracker) -> Proposal {
        if !self.adds_allowed {
            return Proposal::Nothing;
        }

        let mut targets: Vec<&NodeLoad> = global
            .nodes()
            .filter(|n| self.is_eligible_target(global, n))
            .collect();
        targets.sort_by_key(|n| (n.replicas, n.id.clone()));

        let mut sources: Vec<&NodeId> = self
            .tablets
            .iter()
            .flat_map(|t| t.replicas.iter())
            .filter(|r| is_healthy(global, r))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        sources.sort_by_key(|n| (Reverse(global.replica_count(n)), (*n).clone()));

        for source in sources {
            let source_load = global.replica_count(source);
            for target in &targets {
                if source_load <= target.replicas + 1 {
                    break;
                }
                if &target.id == source {
                    continue;
                }
                let movable = self.tablets.iter().find(|t| {
                    !self.replica_change_blocked(t, tracker)
                        && t.replicas.len() == self.constraint.num_replicas
                        && t.replicas.contains(source)
                        && !t.replicas.contains(&target.id)
                        && self.move_keeps_placement(global, t, source, &target.id)
                });
                if let Some(tablet) = movable {
                    if !global.has_budget(ActionKind::AddReplica) {
                        return Proposal::BudgetBlocked;
                    }
                    debug!(
                        tablet_id = %tablet.id,
                        from = %source,
                        to = %target.id,
                        "Moving replica to even out load"
                    );
                    return Proposal::Ready(Action::add_replica(
                        &self.table.id,
                        &tablet.id,
                        &target.id,
                    ));
                }
            }
        }
        Proposal::Nothing
    }

    // =========================================================================
    // LEADERS
    // =========================================================================

    fn balance_leaders(&self, global: &GlobalLoadState, tracker: &PendingTaskTracker) -> Proposal {
        if self.options.replica_type == ReplicaType::ReadOnly {
            return Proposal::Nothing;
        }

        // Leaders on drained nodes or outside the preferred zones first.
        let violations = self.scan(global, |tablet| {
            if tracker.has_pending(&tablet.id, ActionKind::StepDownLeader) {
                return None;
            }
            let leader = tablet.leader.as_ref()?;
            let best = self.best_leader_rank(global, tablet, None)?;
            if can_lead(global, leader) && self.leader_rank(global, leader) <= best {
                return None;
            }
            let candidate = self.choose_leader(global, tablet, leader)?;
            Some(Action::step_down(&self.table.id, &tablet.id, leader, &candidate))
        });
        if !matches!(violations, Proposal::Nothing) {
            return violations;
        }

        self.scan(global, |tablet| {
            if tracker.has_pending(&tablet.id, ActionKind::StepDownLeader) {
                return None;
            }
            let leader = tablet.leader.as_ref()?;
            let best = self.best_leader_rank(global, tablet, None)?;
            if !can_lead(global, leader) || self.leader_rank(global, leader) != best {
                return None;
            }
            let candidate = tablet
                .voters()
                .filter(|r| {
                    *r != leader && can_lead(global, r) && self.leader_rank(global, r) == best
                })
                .min_by_key(|r| {
                    (
                        self.table_leader_count(r),
                        global.leader_count(r),
                        (*r).clone(),
                    )
                })?;
            if self.table_leader_count(leader) < self.table_leader_count(candidate) + 2 {
                return None;
            }
            Some(Action::step_down(&self.table.id, &tablet.id, leader, candidate))
        })
    }

    // =========================================================================
    // SELECTION HELPERS
    // =========================================================================

    fn replica_change_blocked(&self, tablet: &TabletView, tracker: &PendingTaskTracker) -> bool {
        tablet.frozen
            || tablet.split_in_progress
            || tracker.has_conflicting(&tablet.id, ActionKind::AddReplica)
    }

    fn is_eligible_target(&self, global: &GlobalLoadState, node: &NodeLoad) -> bool {
        node.is_live
            && node.placement_uuid == self.constraint.placement_uuid
            && !global.is_blacklisted(&node.id)
            && self.constraint.allows(&node.cloud_info)
    }

    /// Healthy replicas per constrained zone, optionally ignoring one node
    fn zone_counts(
        &self,
        global: &GlobalLoadState,
        tablet: &TabletView,
        exclude: Option<&str>,
    ) -> Vec<usize> {
        let mut counts = vec![0; self.constraint.zones.len()];
        for replica in &tablet.replicas {
            if Some(replica.as_str()) == exclude || !is_healthy(global, replica) {
                continue;
            }
            if let Some(idx) = global
                .node(replica)
                .and_then(|n| self.constraint.zone_index(&n.cloud_info))
            {
                counts[idx] += 1;
            }
        }
        counts
    }

    /// Healthy replicas per exact location, optionally ignoring one node
    fn location_counts<'g>(
        &self,
        global: &'g GlobalLoadState,
        tablet: &TabletView,
        exclude: Option<&str>,
    ) -> HashMap<&'g CloudInfo, usize> {
        let mut counts = HashMap::new();
        for replica in &tablet.replicas {
            if Some(replica.as_str()) == exclude || !is_healthy(global, replica) {
                continue;
            }
            if let Some(node) = global.node(replica) {
                *counts.entry(&node.cloud_info).or_default() += 1;
            }
        }
        counts
    }

    /// Where a new replica of `tablet` should go
    ///
    /// Zones below their minimum come first, then zones below their maximum.
    /// Without zone constraints, the least populated location wins. Within
    /// the chosen zones the node with the fewest replicas cluster-wide is
    /// picked, lowest id on ties.
    fn choose_add_target(&self, global: &GlobalLoadState, tablet: &TabletView) -> Option<NodeId> {
        let candidates: Vec<&NodeLoad> = global
            .nodes()
            .filter(|n| self.is_eligible_target(global, n) && !tablet.replicas.contains(&n.id))
            .collect();

        let preferred: Vec<&NodeLoad> = if self.constraint.is_zone_constrained() {
            let counts = self.zone_counts(global, tablet, None);
            let zone_of = |n: &NodeLoad| self.constraint.zone_index(&n.cloud_info);
            let deficit: Vec<&NodeLoad> = candidates
                .iter()
                .copied()
                .filter(|n| {
                    zone_of(*n)
                        .map(|i| counts[i] < self.constraint.zones[i].min_replicas)
                        .unwrap_or(false)
                })
                .collect();
            if !deficit.is_empty() {
                deficit
            } else {
                candidates
                    .into_iter()
                    .filter(|n| {
                        zone_of(*n)
                            .map(|i| counts[i] < self.constraint.zones[i].max_replicas)
                            .unwrap_or(false)
                    })
                    .collect()
            }
        } else {
            let counts = self.location_counts(global, tablet, None);
            let occupancy = |n: &NodeLoad| counts.get(&n.cloud_info).copied().unwrap_or(0);
            let least = candidates.iter().map(|n| occupancy(*n)).min()?;
            candidates
                .into_iter()
                .filter(|n| occupancy(*n) == least)
                .collect()
        };

        preferred
            .into_iter()
            .min_by(|a, b| (a.replicas, &a.id).cmp(&(b.replicas, &b.id)))
            .map(|n| n.id.clone())
    }

    /// Which replica of an over-replicated tablet to remove
    ///
    /// Dead nodes first, then blacklisted nodes, then replicas outside the
    /// placement. Healthy replicas are taken from the most crowded zone (or
    /// location, for tables without zone constraints) so the spread never
    /// narrows, and only then from the node with the most replicas
    /// cluster-wide, lowest id on ties. A healthy replica is never removed
    /// from a zone at its minimum.
    fn choose_removal(&self, global: &GlobalLoadState, tablet: &TabletView) -> Option<NodeId> {
        let constrained = self.constraint.is_zone_constrained();
        let zone_counts = self.zone_counts(global, tablet, None);
        let location_counts = self.location_counts(global, tablet, None);

        tablet
            .replicas
            .iter()
            .filter_map(|replica| {
                let live = global.is_live(replica);
                let blacklisted = global.is_blacklisted(replica);
                let node = global.node(replica);
                let zone = node.and_then(|n| self.constraint.zone_index(&n.cloud_info));
                let allowed = !constrained || zone.is_some();

                // Replicas sharing this replica's zone beyond what the placement needs
                let crowding = if constrained {
                    zone.map(|i| zone_counts[i].saturating_sub(self.constraint.zones[i].min_replicas))
                        .unwrap_or(usize::MAX)
                } else {
                    node.and_then(|n| location_counts.get(&n.cloud_info).copied())
                        .unwrap_or(usize::MAX)
                };
                if live && !blacklisted && allowed && constrained && crowding == 0 {
                    return None;
                }
                let key = (
                    live,
                    !blacklisted,
                    allowed,
                    Reverse(crowding),
                    Reverse(global.replica_count(replica)),
                    replica.clone(),
                );
                Some(key)
            })
            .min()
            .map(|key| key.5)
    }

    /// Whether moving `tablet`'s replica from `source` to `target` keeps
    /// the placement valid and the zone spread no worse
    fn move_keeps_placement(
        &self,
        global: &GlobalLoadState,
        tablet: &TabletView,
        source: &str,
        target: &str,
    ) -> bool {
        let (Some(source_node), Some(target_node)) = (global.node(source), global.node(target))
        else {
            return false;
        };

        if self.constraint.is_zone_constrained() {
            let mut counts = self.zone_counts(global, tablet, Some(source));
            let Some(idx) = self.constraint.zone_index(&target_node.cloud_info) else {
                return false;
            };
            counts[idx] += 1;
            self.constraint
                .zones
                .iter()
                .zip(&counts)
                .all(|(zone, count)| *count >= zone.min_replicas && *count <= zone.max_replicas)
        } else {
            let counts = self.location_counts(global, tablet, Some(source));
            let at = |ci: &CloudInfo| counts.get(ci).copied().unwrap_or(0);
            at(&target_node.cloud_info) <= at(&source_node.cloud_info)
        }
    }

    /// Remove `node`, handing leadership off first if it leads the tablet
    fn removal(&self, global: &GlobalLoadState, tablet: &TabletView, node: &str) -> Action {
        let new_leader = if tablet.leader.as_deref() == Some(node) {
            self.choose_leader(global, tablet, node)
        } else {
            None
        };
        Action::remove_replica(&self.table.id, &tablet.id, node, new_leader)
    }

    fn leader_rank(&self, global: &GlobalLoadState, node: &str) -> usize {
        global
            .node(node)
            .and_then(|n| self.constraint.affinity_rank(&n.cloud_info))
            .unwrap_or(usize::MAX)
    }

    /// Best affinity level among replicas that may lead
    fn best_leader_rank(
        &self,
        global: &GlobalLoadState,
        tablet: &TabletView,
        exclude: Option<&str>,
    ) -> Option<usize> {
        tablet
            .voters()
            .filter(|r| Some(r.as_str()) != exclude && can_lead(global, r))
            .map(|r| self.leader_rank(global, r))
            .min()
    }

    /// Best new leader other than `exclude`: most preferred affinity level,
    /// then fewest leaders cluster-wide, lowest id on ties
    fn choose_leader(
        &self,
        global: &GlobalLoadState,
        tablet: &TabletView,
        exclude: &str,
    ) -> Option<NodeId> {
        let best = self.best_leader_rank(global, tablet, Some(exclude))?;
        tablet
            .voters()
            .filter(|r| {
                r.as_str() != exclude && can_lead(global, r) && self.leader_rank(global, r) == best
            })
            .min_by_key(|r| (global.leader_count(r), (*r).clone()))
            .cloned()
    }

    fn table_leader_count(&self, node: &str) -> usize {
        self.table_leaders.get(node).copied().unwrap_or(0)
    }
}

fn is_healthy(global: &GlobalLoadState, node: &str) -> bool {
    global.is_live(node) && !global.is_blacklisted(node)
}

fn can_lead(global: &GlobalLoadState, node: &str) -> bool {
    is_healthy(global, node) && !global.is_leader_blacklisted(node)
}

fn decrement(counts: &mut BTreeMap<NodeId, usize>, node: &str) {
    if let Some(count) = counts.get_mut(node) {
        *count = count.saturating_sub(1);
    }
}
