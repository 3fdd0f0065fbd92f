//! Cluster model
//!
//! Descriptors for nodes, tables and tablets as reported by the catalog, plus
//! the replication configuration attached to the cluster, a table, or a
//! tablespace. The balancer only ever reads these; changes happen through
//! emitted actions and come back in the next snapshot.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::cloud::CloudInfo;
use crate::error::{Result, ShardlineError};

pub type NodeId = String;
pub type TableId = String;
pub type TabletId = String;
pub type TablespaceId = String;

/// Which replicas a balancing pass looks at
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicaType {
    /// Voting replicas of the primary placement
    #[default]
    Live,
    /// Observer replicas of a read-replica placement
    ReadOnly,
}

impl std::fmt::Display for ReplicaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "LIVE"),
            Self::ReadOnly => write!(f, "READ_ONLY"),
        }
    }
}

/// A storage node as reported by the node registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: NodeId,
    pub cloud_info: CloudInfo,
    /// Placement (cluster) this node belongs to; empty for the default live placement
    #[serde(default)]
    pub placement_uuid: String,
    #[serde(default = "default_true")]
    pub is_live: bool,
    /// Replica count last reported by the node itself
    #[serde(default)]
    pub reported_replicas: usize,
    /// Leader count last reported by the node itself
    #[serde(default)]
    pub reported_leaders: usize,
}

fn default_true() -> bool {
    true
}

/// One placement block: a location and the minimum replicas it must hold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementBlock {
    pub cloud_info: CloudInfo,
    pub min_num_replicas: usize,
}

/// Replica placement for one placement uuid
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementInfo {
    pub num_replicas: usize,
    #[serde(default)]
    pub placement_uuid: String,
    #[serde(default)]
    pub placement_blocks: Vec<PlacementBlock>,
}

impl PlacementInfo {
    /// Placement with no zone constraints
    pub fn with_replicas(num_replicas: usize) -> Self {
        Self {
            num_replicas,
            ..Default::default()
        }
    }

    /// Sum of the per-block minimums
    pub fn required_replicas(&self) -> usize {
        self.placement_blocks.iter().map(|b| b.min_num_replicas).sum()
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_replicas == 0 {
            return Err(ShardlineError::InvalidReplicationFactor(self.num_replicas));
        }
        let required = self.required_replicas();
        if required > self.num_replicas {
            return Err(ShardlineError::PlacementOverCommitted {
                required,
                num_replicas: self.num_replicas,
            });
        }
        let mut seen = HashSet::new();
        for block in &self.placement_blocks {
            if !seen.insert(&block.cloud_info) {
                return Err(ShardlineError::DuplicatePlacementBlock(
                    block.cloud_info.to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Full replication configuration of a cluster, table or tablespace
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationInfo {
    pub live_replicas: PlacementInfo,
    #[serde(default)]
    pub read_replicas: Vec<PlacementInfo>,
    /// Preferred leader zones, highest priority first
    #[serde(default)]
    pub affinitized_leaders: Vec<BTreeSet<CloudInfo>>,
}

impl ReplicationInfo {
    pub fn with_replicas(num_replicas: usize) -> Self {
        Self {
            live_replicas: PlacementInfo::with_replicas(num_replicas),
            ..Default::default()
        }
    }

    pub fn read_replica(&self, placement_uuid: &str) -> Option<&PlacementInfo> {
        self.read_replicas
            .iter()
            .find(|p| p.placement_uuid == placement_uuid)
    }
}

/// A table as listed by the catalog
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDescriptor {
    pub id: TableId,
    #[serde(default)]
    pub name: String,
    /// Number of tablets the table is created with; `None` when unknown
    #[serde(default)]
    pub expected_tablet_count: Option<usize>,
    /// Table-level replication override of the cluster default
    #[serde(default)]
    pub replication_info: Option<ReplicationInfo>,
    /// Tablespace whose placement overrides both table and cluster settings
    #[serde(default)]
    pub tablespace_id: Option<TablespaceId>,
}

/// A tablet as listed by the catalog
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletDescriptor {
    pub id: TabletId,
    pub table_id: TableId,
    pub replicas: Vec<NodeId>,
    #[serde(default)]
    pub leader: Option<NodeId>,
    /// Set while the tablet is being split into children
    #[serde(default)]
    pub split_in_progress: bool,
}

impl TabletDescriptor {
    pub fn has_replica(&self, node: &str) -> bool {
        self.replicas.iter().any(|r| r == node)
    }
}

/// Decommission sets installed by cluster administration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blacklists {
    /// Nodes whose replicas must be drained
    #[serde(default)]
    pub blacklist: BTreeSet<NodeId>,
    /// Nodes that must not lead any tablet
    #[serde(default)]
    pub leader_blacklist: BTreeSet<NodeId>,
}
