//! Per-pass cluster snapshot
//!
//! Everything a pass reads from the data source, fetched up front. A failure
//! to fetch any part aborts the pass; nothing is safe to plan without a
//! current view of the nodes.

use std::collections::{BTreeMap, HashMap};

use shardline_core::{
    Action, Blacklists, NodeDescriptor, ReplicationInfo, TableDescriptor, TableId,
    TablespaceId, TabletDescriptor,
};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::source::ClusterDataSource;

/// Snapshot errors
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Failed to list nodes: {0}")]
    Nodes(String),

    #[error("Failed to list tables: {0}")]
    Tables(String),

    #[error("Failed to list tablets of {table}: {reason}")]
    Tablets { table: TableId, reason: String },

    #[error("Failed to read cluster configuration: {0}")]
    Config(String),
}

/// Catalog state for one pass
#[derive(Debug, Clone, Default)]
pub struct ClusterSnapshot {
    pub nodes: Vec<NodeDescriptor>,
    /// Sorted by table id
    pub tables: Vec<TableDescriptor>,
    /// Tablets per table, sorted by tablet id
    pub tablets: BTreeMap<TableId, Vec<TabletDescriptor>>,
    pub blacklists: Blacklists,
    pub replication_info: ReplicationInfo,
    pub tablespaces: HashMap<TablespaceId, ReplicationInfo>,
    /// Tasks the catalog reports as in flight
    pub catalog_pending: Vec<Action>,
}

impl ClusterSnapshot {
    /// Fetch a full snapshot from `source`
    #[instrument(skip(source))]
    pub async fn load<S: ClusterDataSource + ?Sized>(source: &S) -> Result<Self, SnapshotError> {
        let mut nodes = source
            .list_nodes()
            .await
            .map_err(|e| SnapshotError::Nodes(e.to_string()))?;
        nodes.sort_by(|a, b| a.id.cmp(&b.id));

        let mut tables = source
            .list_tables()
            .await
            .map_err(|e| SnapshotError::Tables(e.to_string()))?;
        tables.sort_by(|a, b| a.id.cmp(&b.id));

        let mut tablets = BTreeMap::new();
        for table in &tables {
            let mut table_tablets =
                source
                    .list_tablets(&table.id)
                    .await
                    .map_err(|e| SnapshotError::Tablets {
                        table: table.id.clone(),
                        reason: e.to_string(),
                    })?;
            table_tablets.sort_by(|a, b| a.id.cmp(&b.id));
            tablets.insert(table.id.clone(), table_tablets);
        }

        let blacklists = source
            .blacklists()
            .await
            .map_err(|e| SnapshotError::Config(e.to_string()))?;
        let replication_info = source
            .cluster_replication_info()
            .await
            .map_err(|e| SnapshotError::Config(e.to_string()))?;
        let tablespaces = source
            .list_tablespaces()
            .await
            .map_err(|e| SnapshotError::Config(e.to_string()))?;
        let catalog_pending = source
            .list_pending_tasks()
            .await
            .map_err(|e| SnapshotError::Config(e.to_string()))?;

        debug!(
            nodes = nodes.len(),
            tables = tables.len(),
            "Loaded cluster snapshot"
        );

        Ok(Self {
            nodes,
            tables,
            tablets,
            blacklists,
            replication_info,
            tablespaces,
            catalog_pending,
        })
    }

    pub fn node(&self, id: &str) -> Option<&NodeDescriptor> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn tablets_of(&self, table_id: &str) -> &[TabletDescriptor] {
        self.tablets
            .get(table_id)
            .map(|t| t.as_slice())
            .unwrap_or(&[])
    }

    /// All tablets keyed by tablet id
    pub fn tablet_index(&self) -> HashMap<&str, &TabletDescriptor> {
        self.tablets
            .values()
            .flatten()
            .map(|t| (t.id.as_str(), t))
            .collect()
    }
}
