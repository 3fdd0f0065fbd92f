//! Error types for Shardline
//!
//! Provides the error type for cluster model parsing and validation.

use thiserror::Error;

/// Result type alias for Shardline model operations
pub type Result<T> = std::result::Result<T, ShardlineError>;

/// Unified error type for the Shardline cluster model
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShardlineError {
    // ===== Location Errors =====
    #[error("Invalid cloud info '{0}': expected cloud.region.zone")]
    InvalidCloudInfo(String),

    // ===== Placement Errors =====
    #[error("Invalid replication factor: {0}")]
    InvalidReplicationFactor(usize),

    #[error("Placement minimums exceed replication factor: {required} > {num_replicas}")]
    PlacementOverCommitted { required: usize, num_replicas: usize },

    #[error("Duplicate placement block: {0}")]
    DuplicatePlacementBlock(String),
}
