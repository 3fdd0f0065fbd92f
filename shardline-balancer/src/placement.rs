//! Placement resolution
//!
//! Turns a table's replication configuration into the concrete constraints a
//! balancing pass enforces: replication factor, per-zone replica bounds and
//! the ordered leader affinity sets.
//!
//! Configuration layers, highest precedence first:
//! - the table's tablespace
//! - the table's own replication override
//! - the cluster-wide default

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use shardline_core::{
    CloudInfo, PlacementInfo, ReplicaType, ReplicationInfo, ShardlineError, TableDescriptor,
    TablespaceId,
};
use thiserror::Error;
use tracing::debug;

use crate::config::BalancerOptions;

/// Placement resolution errors; each one only affects its own table
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlacementError {
    #[error("Table {table}: unknown tablespace {tablespace}")]
    UnknownTablespace {
        table: String,
        tablespace: TablespaceId,
    },

    #[error("Table {table}: no read replica placement {placement_uuid}")]
    NoReadReplicaPlacement {
        table: String,
        placement_uuid: String,
    },

    #[error("Table {table}: live placement {configured} does not match pass placement {requested}")]
    PlacementMismatch {
        table: String,
        configured: String,
        requested: String,
    },

    #[error("Table {table}: invalid placement: {source}")]
    Invalid {
        table: String,
        source: ShardlineError,
    },
}

pub type Result<T> = std::result::Result<T, PlacementError>;

/// Which configuration layer a constraint was resolved from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementSource {
    ClusterDefault,
    TableOverride,
    Tablespace(TablespaceId),
}

impl fmt::Display for PlacementSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClusterDefault => write!(f, "cluster default"),
            Self::TableOverride => write!(f, "table override"),
            Self::Tablespace(id) => write!(f, "tablespace {}", id),
        }
    }
}

/// Replica bounds for one placement block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneConstraint {
    pub cloud_info: CloudInfo,
    pub min_replicas: usize,
    pub max_replicas: usize,
}

/// Resolved placement rule for one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementConstraint {
    /// Replication factor
    pub num_replicas: usize,
    pub placement_uuid: String,
    /// Empty when the placement has no blocks; any zone is then acceptable
    pub zones: Vec<ZoneConstraint>,
    /// Preferred leader zones, highest priority first
    pub affinitized_leaders: Vec<BTreeSet<CloudInfo>>,
    pub source: PlacementSource,
}

impl PlacementConstraint {
    /// Build bounds from a placement: `max = min + (num_replicas - sum(min))`
    fn from_placement(
        placement: &PlacementInfo,
        placement_uuid: &str,
        affinitized_leaders: Vec<BTreeSet<CloudInfo>>,
        source: PlacementSource,
    ) -> Self {
        let slack = placement
            .num_replicas
            .saturating_sub(placement.required_replicas());
        let zones = placement
            .placement_blocks
            .iter()
            .map(|block| ZoneConstraint {
                cloud_info: block.cloud_info.clone(),
                min_replicas: block.min_num_replicas,
                max_replicas: block.min_num_replicas + slack,
            })
            .collect();

        Self {
            num_replicas: placement.num_replicas,
            placement_uuid: placement_uuid.to_string(),
            zones,
            affinitized_leaders,
            source,
        }
    }

    pub fn is_zone_constrained(&self) -> bool {
        !self.zones.is_empty()
    }

    /// Index of the first zone constraint covering `cloud_info`
    pub fn zone_index(&self, cloud_info: &CloudInfo) -> Option<usize> {
        self.zones
            .iter()
            .position(|z| z.cloud_info.contains(cloud_info))
    }

    /// Whether a replica may live at `cloud_info`
    pub fn allows(&self, cloud_info: &CloudInfo) -> bool {
        !self.is_zone_constrained() || self.zone_index(cloud_info).is_some()
    }

    /// Affinity level of a location; lower is more preferred
    ///
    /// Without configured affinity every location is at level 0. With
    /// affinity, locations outside every set have no level.
    pub fn affinity_rank(&self, cloud_info: &CloudInfo) -> Option<usize> {
        if self.affinitized_leaders.is_empty() {
            return Some(0);
        }
        self.affinitized_leaders
            .iter()
            .position(|set| set.iter().any(|zone| zone.contains(cloud_info)))
    }
}

/// Resolves per-table placement constraints from the configuration layers
#[derive(Debug, Clone, Default)]
pub struct PlacementResolver {
    default: ReplicationInfo,
    tablespaces: HashMap<TablespaceId, ReplicationInfo>,
}

impl PlacementResolver {
    pub fn new(default: ReplicationInfo, tablespaces: HashMap<TablespaceId, ReplicationInfo>) -> Self {
        Self {
            default,
            tablespaces,
        }
    }

    /// Resolve the constraint `table` is balanced against under `options`
    pub fn resolve(
        &self,
        table: &TableDescriptor,
        options: &BalancerOptions,
    ) -> Result<PlacementConstraint> {
        let (info, source) = self.replication_info_for(table)?;

        let constraint = match options.replica_type {
            ReplicaType::Live => {
                let live = &info.live_replicas;
                if !options.placement_uuid.is_empty()
                    && !live.placement_uuid.is_empty()
                    && live.placement_uuid != options.placement_uuid
                {
                    return Err(PlacementError::PlacementMismatch {
                        table: table.id.clone(),
                        configured: live.placement_uuid.clone(),
                        requested: options.placement_uuid.clone(),
                    });
                }
                validate(table, live)?;
                // A pass without its own uuid balances whatever the live placement names.
                let placement_uuid = if options.placement_uuid.is_empty() {
                    &live.placement_uuid
                } else {
                    &options.placement_uuid
                };
                PlacementConstraint::from_placement(
                    live,
                    placement_uuid,
                    info.affinitized_leaders.clone(),
                    source,
                )
            }
            ReplicaType::ReadOnly => {
                let read = info.read_replica(&options.placement_uuid).ok_or_else(|| {
                    PlacementError::NoReadReplicaPlacement {
                        table: table.id.clone(),
                        placement_uuid: options.placement_uuid.clone(),
                    }
                })?;
                validate(table, read)?;
                // Read replicas never lead.
                PlacementConstraint::from_placement(read, &options.placement_uuid, Vec::new(), source)
            }
        };

        debug!(
            table_id = %table.id,
            source = %constraint.source,
            num_replicas = constraint.num_replicas,
            zones = constraint.zones.len(),
            "Resolved placement"
        );

        Ok(constraint)
    }

    fn replication_info_for<'a>(
        &'a self,
        table: &'a TableDescriptor,
    ) -> Result<(&'a ReplicationInfo, PlacementSource)> {
        if let Some(tablespace) = &table.tablespace_id {
            let info = self.tablespaces.get(tablespace).ok_or_else(|| {
                PlacementError::UnknownTablespace {
                    table: table.id.clone(),
                    tablespace: tablespace.clone(),
                }
            })?;
            return Ok((info, PlacementSource::Tablespace(tablespace.clone())));
        }
        if let Some(info) = &table.replication_info {
            return Ok((info, PlacementSource::TableOverride));
        }
        Ok((&self.default, PlacementSource::ClusterDefault))
    }
}

fn validate(table: &TableDescriptor, placement: &PlacementInfo) -> Result<()> {
    placement.validate().map_err(|source| PlacementError::Invalid {
        table: table.id.clone(),
        source,
    })
}
