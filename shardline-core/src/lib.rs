//! Shardline Core Library
//!
//! Cluster model shared by the Shardline balancer:
//! - Node locations (`cloud.region.zone`) with wildcard matching
//! - Node, table and tablet descriptors as reported by the catalog
//! - Replication configuration (placement blocks, read replicas, leader affinity)
//! - Actions emitted by the balancer
//! - Common error handling

pub mod action;
pub mod cloud;
pub mod error;
pub mod model;

pub use action::{Action, ActionKind};
pub use cloud::CloudInfo;
pub use error::{Result, ShardlineError};
pub use model::{
    Blacklists, NodeDescriptor, NodeId, PlacementBlock, PlacementInfo, ReplicaType,
    ReplicationInfo, TableDescriptor, TableId, TabletDescriptor, TabletId, TablespaceId,
};
