//! Node model: a worker's self-reported presence.
//!
//! The first heartbeat creates the row; every subsequent heartbeat
//! refreshes `last_heartbeat_at`. A node that stops reporting is
//! marked Offline by the coordinator's health sweep.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Node liveness as reported and as judged by the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum NodeStatus {
    /// Heartbeating and its runtime passed the health check.
    #[default]
    Up,
    /// Heartbeating but its runtime failed the health check.
    Down,
    /// Stopped heartbeating; judged dead by the sweep.
    Offline,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Up => "UP",
            NodeStatus::Down => "DOWN",
            NodeStatus::Offline => "OFFLINE",
        };
        f.write_str(s)
    }
}

/// A worker (or coordinator) process known to the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub memory_used: u64,
    #[serde(default)]
    pub status: NodeStatus,
    /// The node's exclusive queue (`x-<id>`), empty for coordinators.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub queue: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Tasks currently assigned to this node.
    #[serde(default)]
    pub task_count: u32,
}
