//! Multi-pass balancing scenarios against the in-memory cluster
//!
//! Run with: cargo test --test scenarios

mod common;

use std::collections::HashSet;

use common::*;
use shardline_balancer::{
    Balancer, BalancerConfig, BalancerError, BalancerOptions, BalancerService, ClusterState,
    InMemoryCluster, PlacementError, SnapshotError, TableSkipReason,
};
use shardline_core::{
    Action, ActionKind, NodeDescriptor, PlacementInfo, ReplicationInfo, TableDescriptor,
};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_zone_mismatch_adds_then_removes() {
    let source = cluster(ClusterState {
        nodes: vec![node("n1", "z1"), node("n2", "z1"), node("n3", "z2"), node("n4", "z3")],
        tables: vec![table("t1")],
        tablets: vec![tablet("a", "t1", &["n1", "n2", "n3"], Some("n1"))],
        replication_info: zoned(3, &["z1", "z2", "z3"]),
        ..Default::default()
    });
    let mut balancer = Balancer::new(source.clone(), BalancerOptions::default());

    let first = simulate(&mut balancer, &source).await;
    assert_eq!(first.actions, vec![Action::add_replica("t1", "a", "n4")]);

    let second = simulate(&mut balancer, &source).await;
    assert_eq!(
        second.actions,
        vec![Action::remove_replica("t1", "a", "n1", Some("n2".to_string()))]
    );
    assert_eq!(second.reconcile.completed, 1);

    let third = simulate(&mut balancer, &source).await;
    assert!(third.is_balanced(), "{}", third);

    let tablet = source.tablet("a").unwrap();
    assert_eq!(tablet.replicas, vec!["n2", "n3", "n4"]);
    assert_eq!(tablet.leader.as_deref(), Some("n2"));
}

#[tokio::test]
async fn test_blacklisted_node_drains_at_removal_cap() {
    let leaders = ["n1", "n2", "n3", "n1", "n2"];
    let mut state = ClusterState {
        nodes: vec![node("N", "z1"), node("n1", "z1"), node("n2", "z2"), node("n3", "z3")],
        tables: vec![table("t1")],
        tablets: (0..5)
            .map(|i| {
                tablet(
                    &format!("b{}", i),
                    "t1",
                    &["N", "n1", "n2", "n3"],
                    Some(leaders[i]),
                )
            })
            .collect(),
        replication_info: ReplicationInfo::with_replicas(3),
        ..Default::default()
    };
    state.blacklists.blacklist.insert("N".to_string());
    let source = cluster(state);
    let mut balancer = Balancer::new(source.clone(), options(1, 2, 2));

    let mut remaining = Vec::new();
    for _ in 0..3 {
        let report = simulate(&mut balancer, &source).await;
        assert!(report.count(ActionKind::RemoveReplica) <= 2);
        assert!(report
            .actions
            .iter()
            .all(|a| a.kind == ActionKind::RemoveReplica && a.target_node == "N"));
        remaining.push(source.replicas_on("N"));
    }
    assert_eq!(remaining, vec![3, 1, 0]);

    let done = simulate(&mut balancer, &source).await;
    assert!(done.is_balanced(), "{}", done);
}

#[tokio::test]
async fn test_leader_blacklist_moves_to_affinity_zone() {
    let mut replication_info = ReplicationInfo::with_replicas(3);
    replication_info.affinitized_leaders = affinity(&[&["z2"]]);
    let mut state = ClusterState {
        nodes: vec![node("L", "z1"), node("R1", "z2"), node("R2", "z3")],
        tables: vec![table("t1")],
        tablets: vec![tablet("T", "t1", &["L", "R1", "R2"], Some("L"))],
        replication_info,
        ..Default::default()
    };
    state.blacklists.leader_blacklist.insert("L".to_string());
    let source = cluster(state);
    let mut balancer = Balancer::new(source.clone(), BalancerOptions::default());

    let report = simulate(&mut balancer, &source).await;
    assert_eq!(report.actions, vec![Action::step_down("t1", "T", "L", "R1")]);
    assert_eq!(source.leaders_on("L"), 0);
    // Leader blacklisting keeps the replica.
    assert_eq!(source.replicas_on("L"), 1);
}

#[tokio::test]
async fn test_multi_level_affinity() {
    let mut replication_info = ReplicationInfo::with_replicas(3);
    replication_info.affinitized_leaders = affinity(&[&["z3"], &["z2"]]);
    let state = ClusterState {
        nodes: vec![node("L", "z1"), node("R1", "z2"), node("R2", "z3")],
        tables: vec![table("t1")],
        tablets: vec![tablet("T", "t1", &["L", "R1", "R2"], Some("L"))],
        replication_info,
        ..Default::default()
    };

    let source = cluster(state.clone());
    let mut balancer = Balancer::new(source.clone(), BalancerOptions::default());
    let report = simulate(&mut balancer, &source).await;
    assert_eq!(report.actions, vec![Action::step_down("t1", "T", "L", "R2")]);

    // With the first level unavailable the second one is preferred.
    let mut state = state;
    state.nodes[2].is_live = false;
    let source = cluster(state);
    let mut balancer = Balancer::new(source.clone(), BalancerOptions::default());
    let report = simulate(&mut balancer, &source).await;
    assert_eq!(report.actions, vec![Action::step_down("t1", "T", "L", "R1")]);
}

#[tokio::test]
async fn test_starting_table_left_alone() {
    let state = ClusterState {
        nodes: vec![node("n1", "z1"), node("n2", "z2"), node("n3", "z3")],
        tables: vec![TableDescriptor {
            expected_tablet_count: Some(4),
            ..table("t1")
        }],
        tablets: vec![
            tablet("a", "t1", &["n1"], Some("n1")),
            tablet("b", "t1", &["n1"], Some("n1")),
        ],
        replication_info: ReplicationInfo::with_replicas(3),
        ..Default::default()
    };

    let source = cluster(state.clone());
    let mut balancer = Balancer::new(
        source.clone(),
        BalancerOptions {
            allow_limit_starting_tablets: false,
            ..options(5, 5, 5)
        },
    );
    let report = simulate(&mut balancer, &source).await;
    assert!(report.actions.is_empty());
    assert_eq!(
        report.skipped_tables,
        vec![(
            "t1".to_string(),
            TableSkipReason::AwaitingTablets {
                expected: 4,
                actual: 2
            }
        )]
    );

    let source = cluster(state);
    let mut balancer = Balancer::new(source.clone(), options(5, 5, 5));
    let report = simulate(&mut balancer, &source).await;
    assert_eq!(report.count(ActionKind::AddReplica), 2);
}

#[tokio::test]
async fn test_under_replicated_table_converges() {
    let state = ClusterState {
        nodes: vec![
            node("n1", "z1"),
            node("n2", "z1"),
            node("n3", "z2"),
            node("n4", "z2"),
            node("n5", "z3"),
            node("n6", "z3"),
        ],
        tables: vec![table("t1")],
        tablets: (0..8)
            .map(|i| {
                let home = if i % 2 == 0 { "n1" } else { "n2" };
                tablet(&format!("tablet-{}", i), "t1", &[home], Some(home))
            })
            .collect(),
        replication_info: zoned(3, &["z1", "z2", "z3"]),
        ..Default::default()
    };
    let source = cluster(state);
    let mut balancer = Balancer::new(source.clone(), options(2, 2, 2));

    let mut before = deficit(&source, 3);
    assert_eq!(before, 16);
    let mut passes = 0;
    while before > 0 {
        simulate(&mut balancer, &source).await;
        let after = deficit(&source, 3);
        assert!(after < before, "deficit went from {} to {}", before, after);
        before = after;
        passes += 1;
        assert!(passes <= 8);
    }

    let mut balanced = false;
    for _ in 0..60 {
        if simulate(&mut balancer, &source).await.is_balanced() {
            balanced = true;
            break;
        }
        assert_eq!(deficit(&source, 3), 0);
    }
    assert!(balanced);

    let state = source.state();
    for t in &state.tablets {
        let zones: HashSet<_> = t
            .replicas
            .iter()
            .filter_map(|r| state.nodes.iter().find(|n| &n.id == r))
            .map(|n| n.cloud_info.zone.clone())
            .collect();
        assert_eq!(t.replicas.len(), 3);
        assert_eq!(zones.len(), 3);
    }
    for n in &state.nodes {
        assert_eq!(source.replicas_on(&n.id), 4, "node {}", n.id);
    }
}

#[tokio::test]
async fn test_dead_replica_replaced_then_removed() {
    let source = cluster(ClusterState {
        nodes: vec![
            dead_node("n1", "z1"),
            node("n2", "z1"),
            node("n3", "z1"),
            node("n4", "z1"),
        ],
        tables: vec![table("t1")],
        tablets: vec![tablet("a", "t1", &["n1", "n2", "n3"], Some("n2"))],
        replication_info: ReplicationInfo::with_replicas(3),
        ..Default::default()
    });
    let mut balancer = Balancer::new(source.clone(), BalancerOptions::default());

    let first = simulate(&mut balancer, &source).await;
    assert_eq!(first.actions, vec![Action::add_replica("t1", "a", "n4")]);
    let second = simulate(&mut balancer, &source).await;
    assert_eq!(
        second.actions,
        vec![Action::remove_replica("t1", "a", "n1", None)]
    );
}

#[tokio::test]
async fn test_no_duplicate_actions_while_in_flight() {
    let source = cluster(ClusterState {
        nodes: vec![node("n1", "z1"), node("n2", "z1"), node("n3", "z1"), node("n4", "z1")],
        tables: vec![table("t1")],
        tablets: vec![
            tablet("a", "t1", &["n1"], Some("n1")),
            tablet("b", "t1", &["n1"], Some("n1")),
            tablet("c", "t1", &["n1"], Some("n1")),
        ],
        replication_info: ReplicationInfo::with_replicas(3),
        ..Default::default()
    });
    source.set_apply_actions(false);
    let mut balancer = Balancer::new(source.clone(), options(10, 10, 10));

    let mut seen = HashSet::new();
    for _ in 0..5 {
        let report = simulate(&mut balancer, &source).await;
        for action in report.actions {
            assert!(
                seen.insert((action.tablet_id.clone(), action.kind)),
                "duplicate {}",
                action
            );
        }
    }
    assert_eq!(seen.len(), 3);
    assert_eq!(balancer.tracker().len(), 3);
}

#[tokio::test]
async fn test_refresh_failure_aborts_then_recovers() {
    let source = cluster(ClusterState {
        nodes: vec![node("n1", "z1"), node("n2", "z2"), node("n3", "z3")],
        tables: vec![table("t1")],
        tablets: vec![tablet("a", "t1", &["n1"], Some("n1"))],
        replication_info: ReplicationInfo::with_replicas(3),
        ..Default::default()
    });
    let mut balancer = Balancer::new(source.clone(), BalancerOptions::default());

    source.set_nodes_unavailable(true);
    let result = balancer.run_pass(&CancellationToken::new()).await;
    assert!(matches!(
        result,
        Err(BalancerError::Snapshot(SnapshotError::Nodes(_)))
    ));

    source.set_nodes_unavailable(false);
    let report = simulate(&mut balancer, &source).await;
    assert_eq!(report.count(ActionKind::AddReplica), 1);
}

#[tokio::test]
async fn test_unknown_tablespace_isolated() {
    let mut tablespaces = std::collections::BTreeMap::new();
    tablespaces.insert("two".to_string(), ReplicationInfo::with_replicas(2));
    let source = cluster(ClusterState {
        nodes: vec![node("n1", "z1"), node("n2", "z2"), node("n3", "z3")],
        tables: vec![
            TableDescriptor {
                tablespace_id: Some("missing".to_string()),
                ..table("t1")
            },
            TableDescriptor {
                tablespace_id: Some("two".to_string()),
                ..table("t2")
            },
            table("t3"),
        ],
        tablets: vec![
            tablet("a", "t1", &["n1"], Some("n1")),
            tablet("b", "t2", &["n1", "n2", "n3"], Some("n2")),
            tablet("c", "t3", &["n1"], Some("n1")),
        ],
        replication_info: ReplicationInfo::with_replicas(3),
        tablespaces,
        ..Default::default()
    });
    let mut balancer = Balancer::new(source.clone(), options(5, 5, 5));

    let report = simulate(&mut balancer, &source).await;
    assert_eq!(report.skipped_tables.len(), 1);
    assert_eq!(report.skipped_tables[0].0, "t1");
    assert!(matches!(
        report.skipped_tables[0].1,
        TableSkipReason::Placement(PlacementError::UnknownTablespace { .. })
    ));

    // The tablespace wins over the cluster default for t2.
    assert!(report
        .actions
        .iter()
        .any(|a| a.tablet_id == "b" && a.kind == ActionKind::RemoveReplica));
    assert!(report
        .actions
        .iter()
        .any(|a| a.tablet_id == "c" && a.kind == ActionKind::AddReplica));
    assert!(report.actions.iter().all(|a| a.tablet_id != "a"));
}

#[tokio::test]
async fn test_tablet_without_live_replicas_flagged() {
    let source = cluster(ClusterState {
        nodes: vec![
            node("n1", "z1"),
            node("n2", "z2"),
            node("n3", "z3"),
            dead_node("d1", "z1"),
            dead_node("d2", "z2"),
        ],
        tables: vec![table("t1"), table("t2")],
        tablets: vec![
            tablet("x", "t1", &["d1", "d2"], None),
            tablet("y", "t2", &["n1"], Some("n1")),
        ],
        replication_info: ReplicationInfo::with_replicas(3),
        ..Default::default()
    });
    let mut balancer = Balancer::new(source.clone(), BalancerOptions::default());

    let report = simulate(&mut balancer, &source).await;
    assert_eq!(
        report.skipped_tables,
        vec![(
            "t1".to_string(),
            TableSkipReason::NoViableReplicas {
                tablet_id: "x".to_string()
            }
        )]
    );
    assert!(report.skipped_tables[0].1.is_flagged());
    assert_eq!(report.actions, vec![Action::add_replica("t2", "y", "n2")]);
}

#[tokio::test]
async fn test_split_in_progress_not_touched() {
    let mut splitting = tablet("a", "t1", &["n1"], Some("n1"));
    splitting.split_in_progress = true;
    let source = cluster(ClusterState {
        nodes: vec![node("n1", "z1"), node("n2", "z2"), node("n3", "z3")],
        tables: vec![table("t1")],
        tablets: vec![splitting, tablet("b", "t1", &["n1"], Some("n1"))],
        replication_info: ReplicationInfo::with_replicas(3),
        ..Default::default()
    });
    let mut balancer = Balancer::new(source.clone(), options(5, 5, 5));

    let report = simulate(&mut balancer, &source).await;
    assert!(!report.actions.is_empty());
    assert!(report.actions.iter().all(|a| a.tablet_id == "b"));
}

#[tokio::test]
async fn test_read_replica_pass() {
    let mut replication_info = ReplicationInfo::with_replicas(3);
    replication_info.read_replicas = vec![PlacementInfo {
        num_replicas: 1,
        placement_uuid: "rr".to_string(),
        placement_blocks: Vec::new(),
    }];
    let source = cluster(ClusterState {
        nodes: vec![
            node("n1", "z1"),
            node("n2", "z2"),
            node("n3", "z3"),
            read_node("r1", "z1", "rr"),
            read_node("r2", "z2", "rr"),
        ],
        tables: vec![table("t1")],
        tablets: vec![
            tablet("a", "t1", &["n1", "n2", "n3"], Some("n1")),
            tablet("b", "t1", &["n1", "n2", "n3"], Some("n2")),
            tablet("c", "t1", &["n1", "n2", "n3"], Some("n3")),
        ],
        replication_info,
        ..Default::default()
    });

    let mut live = Balancer::new(source.clone(), options(5, 5, 5));
    assert!(simulate(&mut live, &source).await.is_balanced());

    let mut read = Balancer::new(
        source.clone(),
        BalancerOptions {
            max_concurrent_adds: 5,
            ..BalancerOptions::read_only("rr")
        },
    );
    let report = simulate(&mut read, &source).await;
    assert_eq!(
        report.actions,
        vec![
            Action::add_replica("t1", "a", "r1"),
            Action::add_replica("t1", "b", "r2"),
            Action::add_replica("t1", "c", "r1"),
        ]
    );

    assert!(simulate(&mut read, &source).await.is_balanced());
    // Read replicas are invisible to the live pass.
    assert!(simulate(&mut live, &source).await.is_balanced());
    assert_eq!(source.leaders_on("r1") + source.leaders_on("r2"), 0);
}

/// Distinct zones holding a live replica of `tablet_id`
fn zones_of(source: &InMemoryCluster, tablet_id: &str) -> usize {
    let state = source.state();
    let Some(tablet) = state.tablets.iter().find(|t| t.id == tablet_id) else {
        return 0;
    };
    tablet
        .replicas
        .iter()
        .filter_map(|r| state.nodes.iter().find(|n| &n.id == r && n.is_live))
        .map(|n| n.cloud_info.zone.clone())
        .collect::<HashSet<_>>()
        .len()
}

#[tokio::test]
async fn test_load_moves_keep_zone_spread() {
    // n2 carries an extra single-replica table, so it is the busiest node
    // while also being the only node in z2.
    let mut single = table("t2");
    single.replication_info = Some(ReplicationInfo::with_replicas(1));
    let source = cluster(ClusterState {
        nodes: vec![node("n1", "z1"), node("n2", "z2"), node("n3", "z3"), node("n4", "z1")],
        tables: vec![table("t1"), single],
        tablets: vec![
            tablet("a", "t1", &["n1", "n2", "n3"], Some("n1")),
            tablet("b", "t1", &["n1", "n2", "n3"], Some("n2")),
            tablet("c", "t1", &["n1", "n2", "n3"], Some("n3")),
            tablet("x", "t2", &["n2"], Some("n2")),
        ],
        replication_info: ReplicationInfo::with_replicas(3),
        ..Default::default()
    });
    let mut balancer = Balancer::new(source.clone(), options(2, 2, 2));

    let mut balanced = false;
    for _ in 0..10 {
        let report = simulate(&mut balancer, &source).await;
        for tablet_id in ["a", "b", "c"] {
            assert_eq!(zones_of(&source, tablet_id), 3, "{} lost a zone after {}", tablet_id, report);
        }
        if report.is_balanced() {
            balanced = true;
            break;
        }
    }
    assert!(balanced);
    assert!(source.replicas_on("n4") > 0);
    assert!(source.replicas_on("n2") < 4);
}

#[tokio::test]
async fn test_live_pass_uses_live_placement_uuid() {
    let live_node = |id: &str, z: &str| NodeDescriptor {
        placement_uuid: "live-a".to_string(),
        ..node(id, z)
    };
    let mut replication_info = ReplicationInfo::with_replicas(3);
    replication_info.live_replicas.placement_uuid = "live-a".to_string();
    let source = cluster(ClusterState {
        nodes: vec![live_node("n1", "z1"), live_node("n2", "z2"), live_node("n3", "z3")],
        tables: vec![table("t1")],
        tablets: vec![tablet("a", "t1", &["n1"], Some("n1"))],
        replication_info,
        ..Default::default()
    });
    let mut balancer = Balancer::new(source.clone(), BalancerOptions::default());

    let first = simulate(&mut balancer, &source).await;
    assert_eq!(first.actions, vec![Action::add_replica("t1", "a", "n2")]);
    assert!(!first.is_balanced());

    let second = simulate(&mut balancer, &source).await;
    assert_eq!(second.actions, vec![Action::add_replica("t1", "a", "n3")]);
    assert!(simulate(&mut balancer, &source).await.is_balanced());
}

#[tokio::test]
async fn test_live_and_read_passes_take_turns_on_a_tablet() {
    let mut replication_info = ReplicationInfo::with_replicas(3);
    replication_info.read_replicas = vec![PlacementInfo {
        num_replicas: 1,
        placement_uuid: "rr".to_string(),
        placement_blocks: Vec::new(),
    }];
    let source = cluster(ClusterState {
        nodes: vec![
            node("n1", "z1"),
            node("n2", "z2"),
            node("n3", "z3"),
            read_node("r1", "z1", "rr"),
        ],
        tables: vec![table("t1")],
        tablets: vec![tablet("a", "t1", &["n1", "n2"], Some("n1"))],
        replication_info,
        ..Default::default()
    });
    let config = BalancerConfig {
        passes: vec![
            BalancerOptions::default(),
            BalancerOptions {
                max_concurrent_adds: 5,
                ..BalancerOptions::read_only("rr")
            },
        ],
        ..Default::default()
    };
    let mut service = BalancerService::new(source.clone(), config).unwrap();

    let first: Vec<Action> = service
        .run_cycle()
        .await
        .into_iter()
        .flat_map(|r| r.actions)
        .collect();
    assert_eq!(first, vec![Action::add_replica("t1", "a", "n3")]);
    service.wait_for_dispatch().await;

    let second: Vec<Action> = service
        .run_cycle()
        .await
        .into_iter()
        .flat_map(|r| r.actions)
        .collect();
    assert_eq!(second, vec![Action::add_replica("t1", "a", "r1")]);
    service.wait_for_dispatch().await;

    assert_eq!(
        source.tablet("a").unwrap().replicas,
        vec!["n1", "n2", "n3", "r1"]
    );
}
