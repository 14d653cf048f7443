//! Heartbeat handler: upserts node liveness reports.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use drover_core::Node;
use drover_datastore::Datastore;

use crate::error::Result;
use crate::middleware::NodeHandler;

/// The first heartbeat creates the node row; every later one
/// refreshes it (including bringing an Offline node back Up).
pub(crate) struct HeartbeatHandler {
    pub ds: Arc<dyn Datastore>,
}

#[async_trait]
impl NodeHandler for HeartbeatHandler {
    async fn call(&self, node: &mut Node) -> Result<()> {
        debug!(
            node_id = %node.id,
            status = %node.status,
            cpu_percent = node.cpu_percent,
            "heartbeat"
        );
        self.ds.upsert_node(node).await?;
        Ok(())
    }
}
