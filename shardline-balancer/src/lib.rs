//! Shardline Balancer Library
//!
//! Cluster load balancer for Shardline tablets. Each pass reads a snapshot
//! of the cluster and decides, table by table, which replica additions,
//! removals and leader moves bring the cluster toward:
//! - the replication factor of every tablet
//! - the zone placement of every table or tablespace
//! - empty blacklisted nodes
//! - leaders on preferred zones with even leader counts
//!
//! The balancer only decides. Actions go out through the
//! [`ClusterDataSource`] capability, dispatched by the [`ActionExecutor`].

pub mod balancer;
pub mod config;
pub mod executor;
pub mod global_state;
pub mod pending;
pub mod placement;
pub mod service;
pub mod snapshot;
pub mod source;
pub mod table_state;

// Re-export main types
pub use balancer::{Balancer, BalancerError, PassPhase, PassReport};
pub use config::{BalancerConfig, BalancerOptions, ConfigError};
pub use executor::{
    ActionExecutor, ExecutionResult, ExecutorConfig, ExecutorError, ProgressStatus,
    ProgressUpdate, TaskResult,
};
pub use global_state::{GlobalLoadState, NodeLoad};
pub use pending::{PendingTask, PendingTaskTracker, ReconcileStats, SharedTracker};
pub use placement::{
    PlacementConstraint, PlacementError, PlacementResolver, PlacementSource, ZoneConstraint,
};
pub use service::{BalancerService, PassTrigger};
pub use snapshot::{ClusterSnapshot, SnapshotError};
pub use source::{ClusterDataSource, ClusterState, InMemoryCluster, InMemoryError, SourceResult};
pub use table_state::{Category, PerTableLoadState, TableSkipReason};
