//! Shared fixtures for balancer integration tests

#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use shardline_balancer::{
    Balancer, BalancerOptions, ClusterDataSource, ClusterState, InMemoryCluster, PassReport,
};
use shardline_core::{
    CloudInfo, NodeDescriptor, PlacementBlock, PlacementInfo, ReplicationInfo, TableDescriptor,
    TabletDescriptor,
};
use tokio_util::sync::CancellationToken;

pub fn zone(z: &str) -> CloudInfo {
    CloudInfo::new("aws", "us-west", z)
}

pub fn node(id: &str, z: &str) -> NodeDescriptor {
    NodeDescriptor {
        id: id.to_string(),
        cloud_info: zone(z),
        placement_uuid: String::new(),
        is_live: true,
        reported_replicas: 0,
        reported_leaders: 0,
    }
}

pub fn dead_node(id: &str, z: &str) -> NodeDescriptor {
    NodeDescriptor {
        is_live: false,
        ..node(id, z)
    }
}

pub fn read_node(id: &str, z: &str, placement_uuid: &str) -> NodeDescriptor {
    NodeDescriptor {
        placement_uuid: placement_uuid.to_string(),
        ..node(id, z)
    }
}

pub fn table(id: &str) -> TableDescriptor {
    TableDescriptor {
        id: id.to_string(),
        name: id.to_string(),
        ..Default::default()
    }
}

pub fn tablet(id: &str, table_id: &str, replicas: &[&str], leader: Option<&str>) -> TabletDescriptor {
    TabletDescriptor {
        id: id.to_string(),
        table_id: table_id.to_string(),
        replicas: replicas.iter().map(|s| s.to_string()).collect(),
        leader: leader.map(|s| s.to_string()),
        split_in_progress: false,
    }
}

/// `num_replicas` replicas with at least one in each of `zones`
pub fn zoned(num_replicas: usize, zones: &[&str]) -> ReplicationInfo {
    ReplicationInfo {
        live_replicas: PlacementInfo {
            num_replicas,
            placement_uuid: String::new(),
            placement_blocks: zones
                .iter()
                .map(|z| PlacementBlock {
                    cloud_info: zone(z),
                    min_num_replicas: 1,
                })
                .collect(),
        },
        ..Default::default()
    }
}

pub fn affinity(levels: &[&[&str]]) -> Vec<BTreeSet<CloudInfo>> {
    levels
        .iter()
        .map(|level| level.iter().map(|z| zone(z)).collect())
        .collect()
}

pub fn options(adds: usize, removals: usize, leader_moves: usize) -> BalancerOptions {
    BalancerOptions {
        max_concurrent_adds: adds,
        max_concurrent_removals: removals,
        max_concurrent_leader_moves: leader_moves,
        ..Default::default()
    }
}

pub fn cluster(state: ClusterState) -> Arc<InMemoryCluster> {
    Arc::new(InMemoryCluster::new(state))
}

/// Run one pass and send every committed action to the cluster, the way the
/// executor would once dispatch completes
pub async fn simulate(balancer: &mut Balancer<InMemoryCluster>, source: &InMemoryCluster) -> PassReport {
    let report = balancer
        .run_pass(&CancellationToken::new())
        .await
        .expect("pass failed");
    for action in &report.actions {
        source.send_action(action).await.expect("send failed");
    }
    report
}

/// Total missing live replicas across all tablets
pub fn deficit(source: &InMemoryCluster, num_replicas: usize) -> usize {
    let state = source.state();
    state
        .tablets
        .iter()
        .map(|t| {
            let live = t
                .replicas
                .iter()
                .filter(|r| state.nodes.iter().any(|n| &n.id == *r && n.is_live))
                .count();
            num_replicas.saturating_sub(live)
        })
        .sum()
}
