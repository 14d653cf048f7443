//! Worker heartbeats.
//!
//! At a fixed period the worker publishes a [`Node`] record carrying
//! CPU/memory usage, its exclusive queue name, its version, and a
//! status derived from the runtime's health check. The coordinator
//! upserts these into the datastore; a node that stops reporting is
//! marked Offline by the coordinator's sweep.

use std::time::Duration;

use sysinfo::System;
use tracing::{debug, error};

use drover_broker::Broker;
use drover_core::queue::exclusive_queue;
use drover_core::{HEARTBEAT_PERIOD, Node, NodeStatus};
use drover_runtime::Runtime;

use crate::Worker;

/// Budget for the runtime health probe inside one heartbeat.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawn the heartbeat loop. It fires immediately (so the node shows
/// up right after start) and then every [`HEARTBEAT_PERIOD`], until
/// the worker's stop token is cancelled.
pub(crate) fn start(worker: Worker) {
    tokio::spawn(async move {
        let mut sys = System::new();
        let stop = worker.inner().stop.clone();
        loop {
            beat(&worker, &mut sys).await;
            tokio::select! {
                _ = tokio::time::sleep(HEARTBEAT_PERIOD) => {}
                _ = stop.cancelled() => {
                    debug!(worker_id = %worker.inner().id, "heartbeat loop stopped");
                    return;
                }
            }
        }
    });
}

async fn beat(worker: &Worker, sys: &mut System) {
    let inner = worker.inner();

    sys.refresh_cpu_usage();
    sys.refresh_memory();
    let cpu_percent = sys.global_cpu_info().cpu_usage() as f64;
    let memory_used = sys.used_memory();

    let status = match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, inner.runtime.health_check())
        .await
    {
        Ok(Ok(())) => NodeStatus::Up,
        Ok(Err(err)) => {
            error!(worker_id = %inner.id, error = %err, "runtime failed health check");
            NodeStatus::Down
        }
        Err(_) => {
            error!(worker_id = %inner.id, "runtime health check timed out");
            NodeStatus::Down
        }
    };

    let node = Node {
        id: inner.id.clone(),
        hostname: System::host_name().unwrap_or_default(),
        started_at: inner.started_at,
        last_heartbeat_at: chrono::Utc::now(),
        cpu_percent,
        memory_used,
        status,
        queue: exclusive_queue(&inner.id),
        version: drover_core::version().to_string(),
        task_count: inner.active.len() as u32,
    };

    debug!(
        worker_id = %inner.id,
        cpu_percent = cpu_percent,
        status = %status,
        "publishing heartbeat"
    );
    if let Err(err) = inner.broker.publish_heartbeat(&node).await {
        error!(worker_id = %inner.id, error = %err, "error publishing heartbeat");
    }
}
