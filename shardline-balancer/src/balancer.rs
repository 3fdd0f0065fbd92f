//! Balancer control loop
//!
//! One pass walks `Init -> Refresh -> PerTableAnalyze ... -> Emit -> Idle`:
//! validate the options, fetch a snapshot, reconcile in-flight tasks,
//! rebuild the cluster-wide load, then let every table propose actions in
//! table id order until the concurrency budget runs out. The pass never
//! touches the cluster itself; it returns the committed actions.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::MutexGuard;
use shardline_core::{Action, ActionKind, TableDescriptor, TableId, TabletDescriptor};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, instrument, warn};
use uuid::Uuid;

use crate::config::{BalancerOptions, ConfigError};
use crate::global_state::GlobalLoadState;
use crate::pending::{PendingTask, PendingTaskTracker, ReconcileStats, SharedTracker};
use crate::placement::{PlacementConstraint, PlacementError, PlacementResolver};
use crate::snapshot::{ClusterSnapshot, SnapshotError};
use crate::source::ClusterDataSource;
use crate::table_state::{PerTableLoadState, TableSkipReason};

/// Errors that abort a whole pass
#[derive(Error, Debug)]
pub enum BalancerError {
    #[error("Invalid balancer options: {0}")]
    Config(#[from] ConfigError),

    #[error("Refresh failed: {0}")]
    Snapshot(#[from] SnapshotError),
}

pub type Result<T> = std::result::Result<T, BalancerError>;

/// Where a pass currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassPhase {
    Init,
    Refresh,
    PerTableAnalyze,
    Emit,
    Idle,
}

/// Outcome of one pass
#[derive(Debug, Clone)]
pub struct PassReport {
    pub pass_id: Uuid,
    pub pass_number: u64,
    pub started_at: DateTime<Utc>,
    /// Committed actions in commit order
    pub actions: Vec<Action>,
    /// Tables left out of this pass and why
    pub skipped_tables: Vec<(TableId, TableSkipReason)>,
    pub reconcile: ReconcileStats,
    /// Pass stopped early on cancellation
    pub cancelled: bool,
}

impl PassReport {
    fn new(pass_number: u64) -> Self {
        Self {
            pass_id: Uuid::new_v4(),
            pass_number,
            started_at: Utc::now(),
            actions: Vec::new(),
            skipped_tables: Vec::new(),
            reconcile: ReconcileStats::default(),
            cancelled: false,
        }
    }

    pub fn count(&self, kind: ActionKind) -> usize {
        self.actions.iter().filter(|a| a.kind == kind).count()
    }

    /// Nothing to do and nothing skipped
    pub fn is_balanced(&self) -> bool {
        self.actions.is_empty() && self.skipped_tables.is_empty() && !self.cancelled
    }

    pub fn summary(&self) -> String {
        format!(
            "pass {}: {} adds, {} removals, {} leader moves, {} tables skipped, {} tasks in flight",
            self.pass_number,
            self.count(ActionKind::AddReplica),
            self.count(ActionKind::RemoveReplica),
            self.count(ActionKind::StepDownLeader),
            self.skipped_tables.len(),
            self.reconcile.remaining,
        )
    }
}

impl fmt::Display for PassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.summary())?;
        for action in &self.actions {
            writeln!(f, "  {}", action)?;
        }
        for (table, reason) in &self.skipped_tables {
            writeln!(f, "  skipped {}: {}", table, reason)?;
        }
        Ok(())
    }
}

/// Balancer for one set of options (one replica type and placement)
///
/// Balancers working the same cluster must share one tracker so that a
/// live pass and a read replica pass never change the same tablet at once.
pub struct Balancer<S: ClusterDataSource + ?Sized> {
    source: Arc<S>,
    options: BalancerOptions,
    tracker: SharedTracker,
    phase: PassPhase,
    pass_number: u64,
}

impl<S: ClusterDataSource + ?Sized> Balancer<S> {
    pub fn new(source: Arc<S>, options: BalancerOptions) -> Self {
        Self::with_tracker(source, options, SharedTracker::default())
    }

    /// Balancer recording into a tracker shared with other balancers
    pub fn with_tracker(source: Arc<S>, options: BalancerOptions, tracker: SharedTracker) -> Self {
        Self {
            source,
            options,
            tracker,
            phase: PassPhase::Idle,
            pass_number: 0,
        }
    }

    pub fn options(&self) -> &BalancerOptions {
        &self.options
    }

    pub fn tracker(&self) -> MutexGuard<'_, PendingTaskTracker> {
        self.tracker.lock()
    }

    pub fn phase(&self) -> PassPhase {
        self.phase
    }

    /// Passes planned so far
    pub fn pass_number(&self) -> u64 {
        self.pass_number
    }

    /// Run one full pass against the data source
    #[instrument(skip_all, fields(replica_type = %self.options.replica_type, placement = %self.options.placement_uuid))]
    pub async fn run_pass(&mut self, cancel: &CancellationToken) -> Result<PassReport> {
        self.phase = PassPhase::Init;
        if let Err(e) = self.options.validate() {
            self.phase = PassPhase::Idle;
            return Err(e.into());
        }

        self.phase = PassPhase::Refresh;
        let snapshot = match ClusterSnapshot::load(self.source.as_ref()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Aborting pass, cluster snapshot unavailable");
                self.phase = PassPhase::Idle;
                return Err(e.into());
            }
        };

        Ok(self.plan(&snapshot, cancel))
    }

    /// Plan one pass over an already fetched snapshot
    pub fn plan(&mut self, snapshot: &ClusterSnapshot, cancel: &CancellationToken) -> PassReport {
        self.pass_number += 1;
        let mut report = PassReport::new(self.pass_number);
        let span = info_span!("pass", pass_id = %report.pass_id, pass = self.pass_number);
        let _enter = span.enter();

        let shared = self.tracker.clone();
        let mut tracker = shared.lock();

        self.phase = PassPhase::Refresh;
        report.reconcile = tracker.reconcile(
            snapshot,
            self.pass_number,
            self.options.max_pending_passes,
        );
        debug!(
            completed = report.reconcile.completed,
            stale = report.reconcile.stale,
            expired = report.reconcile.expired,
            adopted = report.reconcile.adopted,
            in_flight = report.reconcile.remaining,
            "Reconciled pending tasks"
        );
        let mut global = self.build_global_state(snapshot, &tracker);

        self.phase = PassPhase::PerTableAnalyze;
        let resolver =
            PlacementResolver::new(snapshot.replication_info.clone(), snapshot.tablespaces.clone());
        for table in &snapshot.tables {
            if cancel.is_cancelled() {
                info!("Pass cancelled");
                report.cancelled = true;
                break;
            }
            if global.is_exhausted() {
                debug!("Concurrency budget exhausted, ending pass early");
                break;
            }

            let constraint = match resolver.resolve(table, &self.options) {
                Ok(constraint) => constraint,
                // Tables without a placement for this read replica pass are not ours.
                Err(PlacementError::NoReadReplicaPlacement { .. }) => continue,
                Err(e) => {
                    warn!(table_id = %table.id, error = %e, "Skipping table");
                    report
                        .skipped_tables
                        .push((table.id.clone(), TableSkipReason::Placement(e)));
                    continue;
                }
            };
            self.analyze_table(
                table,
                snapshot.tablets_of(&table.id),
                &constraint,
                &mut global,
                &mut tracker,
                &mut report,
            );
        }

        self.phase = PassPhase::Emit;
        info!(summary = %report.summary(), "Pass complete");
        self.phase = PassPhase::Idle;
        report
    }

    /// Drop tracking for actions that were planned but never dispatched
    pub fn forget_actions(&mut self, actions: &[Action]) {
        let mut tracker = self.tracker.lock();
        for action in actions {
            tracker.forget(&action.tablet_id, action.kind);
        }
    }

    fn build_global_state(
        &self,
        snapshot: &ClusterSnapshot,
        tracker: &PendingTaskTracker,
    ) -> GlobalLoadState {
        let mut global = GlobalLoadState::new();
        global.refresh(&snapshot.nodes);
        global.set_blacklist(snapshot.blacklists.blacklist.clone());
        global.set_leader_blacklist(snapshot.blacklists.leader_blacklist.clone());
        for tablet in snapshot.tablets.values().flatten() {
            global.seed_tablet(tablet);
        }
        // In-flight work counts as if it already happened.
        for task in tracker.tasks() {
            global.record_change(task.kind, &task.target_node, task.new_leader.as_deref());
        }
        global.set_budget(&self.options, tracker);

        for (node, reported, derived) in global.replica_drift() {
            debug!(node = %node, reported, derived, "Node replica count differs from catalog");
        }
        for (node, reported, derived) in global.leader_drift() {
            debug!(node = %node, reported, derived, "Node leader count differs from catalog");
        }
        global
    }

    #[instrument(skip_all, fields(table_id = %table.id))]
    fn analyze_table(
        &self,
        table: &TableDescriptor,
        tablets: &[TabletDescriptor],
        constraint: &PlacementConstraint,
        global: &mut GlobalLoadState,
        tracker: &mut PendingTaskTracker,
        report: &mut PassReport,
    ) {
        let mut state = match PerTableLoadState::new(
            table,
            tablets,
            constraint,
            &self.options,
            global,
            tracker,
        ) {
            Ok(state) => state,
            Err(reason) => {
                if reason.is_flagged() {
                    warn!(reason = %reason, "Skipping inconsistent table");
                } else {
                    debug!(reason = %reason, "Skipping table");
                }
                report.skipped_tables.push((table.id.clone(), reason));
                return;
            }
        };

        while let Some(action) = state.next_action(global, tracker) {
            if !global.consume(action.kind) {
                break;
            }
            global.record_action(&action);
            tracker.record(PendingTask::from_action(&action, self.pass_number));
            state.apply(&action);
            debug!(action = %action, "Committed action");
            report.actions.push(action);
        }

        if let Some(category) = state.category() {
            debug!(category = %category, "Table analyzed");
        }
    }
}
