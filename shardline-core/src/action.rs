//! Balancer actions
//!
//! The balancer never changes tablets itself. It emits actions that an
//! executor turns into RPCs against the nodes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{NodeId, TableId, TabletId};

/// Kind of a balancer action
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    AddReplica,
    RemoveReplica,
    StepDownLeader,
}

impl ActionKind {
    pub const ALL: [ActionKind; 3] = [
        ActionKind::AddReplica,
        ActionKind::RemoveReplica,
        ActionKind::StepDownLeader,
    ];

    /// Replica additions and removals change the Raft config and may not overlap
    pub fn changes_config(self) -> bool {
        matches!(self, ActionKind::AddReplica | ActionKind::RemoveReplica)
    }

    /// Whether a pending task of kind `other` blocks a new task of this kind
    pub fn conflicts_with(self, other: ActionKind) -> bool {
        if self.changes_config() {
            other.changes_config()
        } else {
            other == self
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AddReplica => write!(f, "add_replica"),
            Self::RemoveReplica => write!(f, "remove_replica"),
            Self::StepDownLeader => write!(f, "step_down_leader"),
        }
    }
}

/// One proposed change to a tablet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub tablet_id: TabletId,
    pub table_id: TableId,
    pub kind: ActionKind,
    /// Node gaining a replica, losing a replica, or giving up leadership
    pub target_node: NodeId,
    /// Node that should take over leadership, when the action moves it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_leader: Option<NodeId>,
}

impl Action {
    pub fn add_replica(table_id: &str, tablet_id: &str, node: &str) -> Self {
        Self {
            tablet_id: tablet_id.to_string(),
            table_id: table_id.to_string(),
            kind: ActionKind::AddReplica,
            target_node: node.to_string(),
            new_leader: None,
        }
    }

    pub fn remove_replica(
        table_id: &str,
        tablet_id: &str,
        node: &str,
        new_leader: Option<NodeId>,
    ) -> Self {
        Self {
            tablet_id: tablet_id.to_string(),
            table_id: table_id.to_string(),
            kind: ActionKind::RemoveReplica,
            target_node: node.to_string(),
            new_leader,
        }
    }

    pub fn step_down(table_id: &str, tablet_id: &str, leader: &str, new_leader: &str) -> Self {
        Self {
            tablet_id: tablet_id.to_string(),
            table_id: table_id.to_string(),
            kind: ActionKind::StepDownLeader,
            target_node: leader.to_string(),
            new_leader: Some(new_leader.to_string()),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}, {}", self.kind, self.tablet_id, self.target_node)?;
        if let Some(leader) = &self.new_leader {
            write!(f, " -> {}", leader)?;
        }
        write!(f, ")")
    }
}
