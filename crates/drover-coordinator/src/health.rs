//! Node health sweep.
//!
//! A node that has not heartbeat within [`OFFLINE_AFTER`] is marked
//! Offline and its in-flight tasks are returned to the `pending`
//! queue so another node can pick them up, unless their job has
//! already reached a terminal state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use drover_broker::Broker;
use drover_core::queue::QUEUE_PENDING;
use drover_core::{HEARTBEAT_PERIOD, Node, NodeStatus, TaskState};
use drover_datastore::{Datastore, DatastoreError};

/// A node is judged dead after missing three heartbeats.
pub(crate) const OFFLINE_AFTER: Duration = Duration::new(HEARTBEAT_PERIOD.as_secs() * 3, 0);

/// Nodes listed by `/nodes` must have reported within this window.
pub(crate) const ACTIVE_WINDOW: Duration = Duration::new(HEARTBEAT_PERIOD.as_secs() * 5, 0);

/// Spawn the background sweep, one pass per heartbeat period.
pub(crate) fn start_sweeper(
    ds: Arc<dyn Datastore>,
    broker: Arc<dyn Broker>,
    stop: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(HEARTBEAT_PERIOD) => {
                    if let Err(err) = sweep(&ds, &broker).await {
                        error!(error = %err, "node health sweep failed");
                    }
                }
                _ = stop.cancelled() => return,
            }
        }
    });
}

async fn sweep(ds: &Arc<dyn Datastore>, broker: &Arc<dyn Broker>) -> crate::error::Result<()> {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(OFFLINE_AFTER)
            .unwrap_or_else(|_| chrono::Duration::seconds(90));

    for node in ds.get_nodes().await? {
        if node.status == NodeStatus::Offline || node.last_heartbeat_at > cutoff {
            continue;
        }
        warn!(
            node_id = %node.id,
            last_heartbeat_at = %node.last_heartbeat_at,
            "node went offline"
        );
        let offline = Node {
            status: NodeStatus::Offline,
            ..node.clone()
        };
        ds.upsert_node(&offline).await?;
        requeue_node_tasks(ds, broker, &node.id).await?;
    }
    Ok(())
}

/// Push an offline node's Scheduled/Running tasks back to `pending`
/// (fresh dispatch, node assignment cleared).
async fn requeue_node_tasks(
    ds: &Arc<dyn Datastore>,
    broker: &Arc<dyn Broker>,
    node_id: &str,
) -> crate::error::Result<()> {
    for task in ds.get_node_active_tasks(node_id).await? {
        let job = ds.get_job(&task.job_id).await?;
        if !job.state.is_active() {
            continue;
        }
        let updated = match ds
            .update_task(
                &task.id,
                Box::new(|t| {
                    if !matches!(t.state, TaskState::Scheduled | TaskState::Running) {
                        return Err(DatastoreError::Conflict("task moved on".into()));
                    }
                    t.state = TaskState::Pending;
                    t.node_id = String::new();
                    t.started_at = None;
                    t.scheduled_at = None;
                    Ok(())
                }),
            )
            .await
        {
            Ok(updated) => updated,
            Err(DatastoreError::Conflict(_)) => continue,
            Err(err) => return Err(err.into()),
        };
        info!(task_id = %updated.id, node_id = %node_id, "requeueing task from offline node");
        broker.publish_task(QUEUE_PENDING, &updated).await?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
