//! Cluster data source
//!
//! The balancer reads nodes, tables and tablets and sends actions through the
//! `ClusterDataSource` capability only. `InMemoryCluster` implements it over
//! a JSON-loadable cluster state and applies actions directly, which is what
//! the CLI simulation and the tests run against.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use shardline_core::{
    Action, ActionKind, Blacklists, NodeDescriptor, NodeId, ReplicationInfo, TableDescriptor,
    TablespaceId, TabletDescriptor,
};
use tracing::{debug, instrument};

pub type SourceResult<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

// =============================================================================
// TRAITS FOR DEPENDENCY INJECTION
// =============================================================================

/// Access to the catalog, the node registry and the action RPC layer
#[async_trait::async_trait]
pub trait ClusterDataSource: Send + Sync {
    async fn list_nodes(&self) -> SourceResult<Vec<NodeDescriptor>>;

    async fn list_tables(&self) -> SourceResult<Vec<TableDescriptor>>;

    async fn list_tablets(&self, table_id: &str) -> SourceResult<Vec<TabletDescriptor>>;

    /// Dispatch one action to the nodes involved
    async fn send_action(&self, action: &Action) -> SourceResult<()>;

    /// Cluster-wide default replication configuration
    async fn cluster_replication_info(&self) -> SourceResult<ReplicationInfo>;

    async fn blacklists(&self) -> SourceResult<Blacklists> {
        Ok(Blacklists::default())
    }

    async fn list_tablespaces(&self) -> SourceResult<HashMap<TablespaceId, ReplicationInfo>> {
        Ok(HashMap::new())
    }

    /// Tasks the catalog already tracks as in flight
    async fn list_pending_tasks(&self) -> SourceResult<Vec<Action>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InMemoryError {
    #[error("Node listing unavailable")]
    NodesUnavailable,

    #[error("Unknown tablet: {0}")]
    UnknownTablet(String),

    #[error("Node {0} rejected the action")]
    Rejected(String),

    #[error("Failed to load cluster state: {0}")]
    Load(String),
}

/// Serializable state of an in-memory cluster
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterState {
    pub nodes: Vec<NodeDescriptor>,
    pub tables: Vec<TableDescriptor>,
    pub tablets: Vec<TabletDescriptor>,
    pub replication_info: ReplicationInfo,
    pub tablespaces: BTreeMap<TablespaceId, ReplicationInfo>,
    pub blacklists: Blacklists,
    pub pending_tasks: Vec<Action>,
}

/// Cluster held in memory; actions are applied as soon as they are sent
pub struct InMemoryCluster {
    state: RwLock<ClusterState>,
    sent: RwLock<Vec<Action>>,
    apply_actions: AtomicBool,
    nodes_unavailable: AtomicBool,
    rejecting_nodes: RwLock<HashSet<NodeId>>,
}

impl InMemoryCluster {
    pub fn new(state: ClusterState) -> Self {
        Self {
            state: RwLock::new(state),
            sent: RwLock::new(Vec::new()),
            apply_actions: AtomicBool::new(true),
            nodes_unavailable: AtomicBool::new(false),
            rejecting_nodes: RwLock::new(HashSet::new()),
        }
    }

    /// Load a cluster state from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, InMemoryError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| InMemoryError::Load(e.to_string()))?;
        let state: ClusterState =
            serde_json::from_str(&raw).map_err(|e| InMemoryError::Load(e.to_string()))?;
        Ok(Self::new(state))
    }

    /// Copy of the current state
    pub fn state(&self) -> ClusterState {
        self.state.read().clone()
    }

    pub fn update<F: FnOnce(&mut ClusterState)>(&self, f: F) {
        f(&mut self.state.write());
    }

    /// Every action received so far, in order
    pub fn sent_actions(&self) -> Vec<Action> {
        self.sent.read().clone()
    }

    /// When disabled, sent actions are recorded but never take effect
    pub fn set_apply_actions(&self, apply: bool) {
        self.apply_actions.store(apply, Ordering::SeqCst);
    }

    /// Make `list_nodes` fail, as when the registry cannot be reached
    pub fn set_nodes_unavailable(&self, unavailable: bool) {
        self.nodes_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail every action targeting `node`
    pub fn reject_actions_for(&self, node: &str) {
        self.rejecting_nodes.write().insert(node.to_string());
    }

    pub fn tablet(&self, tablet_id: &str) -> Option<TabletDescriptor> {
        self.state
            .read()
            .tablets
            .iter()
            .find(|t| t.id == tablet_id)
            .cloned()
    }

    /// Replicas hosted on `node` across all tablets
    pub fn replicas_on(&self, node: &str) -> usize {
        self.state
            .read()
            .tablets
            .iter()
            .filter(|t| t.has_replica(node))
            .count()
    }

    /// Tablets led by `node`
    pub fn leaders_on(&self, node: &str) -> usize {
        self.state
            .read()
            .tablets
            .iter()
            .filter(|t| t.leader.as_deref() == Some(node))
            .count()
    }

    fn apply(state: &mut ClusterState, action: &Action) -> Result<(), InMemoryError> {
        let tablet = state
            .tablets
            .iter_mut()
            .find(|t| t.id == action.tablet_id)
            .ok_or_else(|| InMemoryError::UnknownTablet(action.tablet_id.clone()))?;

        match action.kind {
            ActionKind::AddReplica => {
                if !tablet.has_replica(&action.target_node) {
                    tablet.replicas.push(action.target_node.clone());
                }
            }
            ActionKind::RemoveReplica => {
                tablet.replicas.retain(|r| r != &action.target_node);
                if tablet.leader.as_deref() == Some(action.target_node.as_str()) {
                    // A fresh election picks the nominee if it is still a member.
                    tablet.leader = action
                        .new_leader
                        .clone()
                        .filter(|n| tablet.replicas.contains(n))
                        .or_else(|| tablet.replicas.iter().min().cloned());
                }
            }
            ActionKind::StepDownLeader => {
                if let Some(new_leader) = &action.new_leader {
                    if tablet.has_replica(new_leader) {
                        tablet.leader = Some(new_leader.clone());
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClusterDataSource for InMemoryCluster {
    async fn list_nodes(&self) -> SourceResult<Vec<NodeDescriptor>> {
        if self.nodes_unavailable.load(Ordering::SeqCst) {
            return Err(Box::new(InMemoryError::NodesUnavailable));
        }
        Ok(self.state.read().nodes.clone())
    }

    async fn list_tables(&self) -> SourceResult<Vec<TableDescriptor>> {
        Ok(self.state.read().tables.clone())
    }

    async fn list_tablets(&self, table_id: &str) -> SourceResult<Vec<TabletDescriptor>> {
        Ok(self
            .state
            .read()
            .tablets
            .iter()
            .filter(|t| t.table_id == table_id)
            .cloned()
            .collect())
    }

    #[instrument(skip(self, action), fields(action = %action))]
    async fn send_action(&self, action: &Action) -> SourceResult<()> {
        if self.rejecting_nodes.read().contains(&action.target_node) {
            return Err(Box::new(InMemoryError::Rejected(action.target_node.clone())));
        }
        self.sent.write().push(action.clone());
        if self.apply_actions.load(Ordering::SeqCst) {
            Self::apply(&mut self.state.write(), action)?;
            debug!("Applied action");
        }
        Ok(())
    }

    async fn cluster_replication_info(&self) -> SourceResult<ReplicationInfo> {
        Ok(self.state.read().replication_info.clone())
    }

    async fn blacklists(&self) -> SourceResult<Blacklists> {
        Ok(self.state.read().blacklists.clone())
    }

    async fn list_tablespaces(&self) -> SourceResult<HashMap<TablespaceId, ReplicationInfo>> {
        Ok(self
            .state
            .read()
            .tablespaces
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn list_pending_tasks(&self) -> SourceResult<Vec<Action>> {
        Ok(self.state.read().pending_tasks.clone())
    }
}
