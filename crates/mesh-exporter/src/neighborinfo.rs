//! Neighbor report handling (`NEIGHBORINFO_APP`)

use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::metrics::{Attributes, Gauge, MetricSink};
use crate::packet::NeighborInfo;
use crate::resolver::{DisplayNames, NodeResolver, UNKNOWN};

/// Emits one SNR gauge per reported neighbor link
///
/// `meshtastic_neighbor_info_last_rx_time` is catalogued but not emitted.
#[derive(Clone)]
pub struct NeighborInfoEmitter {
    resolver: NodeResolver,
    sink: Arc<dyn MetricSink>,
}

impl NeighborInfoEmitter {
    /// Create an emitter
    pub fn new(resolver: NodeResolver, sink: Arc<dyn MetricSink>) -> Self {
        Self { resolver, sink }
    }

    /// Handle one neighbor report
    ///
    /// `source` is the packet's originating node, used when the report does
    /// not name its own node id. `names` are that node's resolved names.
    pub async fn emit(
        &self,
        packet_id: u32,
        source: u32,
        names: &DisplayNames,
        info: &NeighborInfo,
    ) -> Result<()> {
        debug!(
            packet_id,
            source,
            neighbors = info.neighbors.len(),
            "Received NeighborInfo"
        );

        let reporter = info.node_id.filter(|id| *id != 0).unwrap_or(source);

        for neighbor in &info.neighbors {
            let (neighbor_id, neighbor_names) = match neighbor.node_id.filter(|id| *id != 0) {
                Some(id) => (id.to_string(), self.resolver.names(id).await?),
                None => (UNKNOWN.to_string(), DisplayNames::unknown()),
            };

            let attrs = Attributes::new()
                .with("source", reporter)
                .with("source_long_name", &names.long_name)
                .with("source_short_name", &names.short_name)
                .with("neighbor_source", neighbor_id)
                .with("neighbor_source_long_name", neighbor_names.long_name)
                .with("neighbor_source_short_name", neighbor_names.short_name);

            self.sink.set(Gauge::NeighborSnr, neighbor.snr, &attrs)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for NeighborInfoEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NeighborInfoEmitter")
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}
