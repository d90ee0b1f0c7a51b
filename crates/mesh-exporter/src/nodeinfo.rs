//! Identity packet handling (`NODEINFO_APP`)
//!
//! An identity packet is always accepted: it refreshes the sender's stored
//! metadata and sets the last-heard gauge, whether or not the node was
//! known before.

use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::metrics::{Attributes, Gauge, MetricSink};
use crate::packet::User;
use crate::resolver::{NodeMetadata, NodeResolver, UNKNOWN};

/// Source of wall-clock time as fractional Unix seconds
pub type Clock = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Current wall-clock time as fractional Unix seconds
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Persists identities and emits the last-heard gauge
#[derive(Clone)]
pub struct NodeInfoEmitter {
    resolver: NodeResolver,
    sink: Arc<dyn MetricSink>,
    clock: Clock,
}

impl NodeInfoEmitter {
    /// Create an emitter using the system clock
    pub fn new(resolver: NodeResolver, sink: Arc<dyn MetricSink>) -> Self {
        Self::with_clock(resolver, sink, Arc::new(unix_now))
    }

    /// Create an emitter with an explicit clock
    pub fn with_clock(resolver: NodeResolver, sink: Arc<dyn MetricSink>, clock: Clock) -> Self {
        Self {
            resolver,
            sink,
            clock,
        }
    }

    /// Handle one identity payload from `source`
    pub async fn emit(&self, packet_id: u32, source: u32, user: &User) -> Result<()> {
        debug!(packet_id, source, user = ?user, "Received NodeInfo");

        let metadata = NodeMetadata::from(user);
        if source != 0 {
            self.resolver.save(source, &metadata).await?;
        }

        let attrs = Attributes::new()
            .with("source", source)
            .with("user", user.id.as_deref().unwrap_or(UNKNOWN))
            .with("source_long_name", &metadata.long_name)
            .with("source_short_name", &metadata.short_name)
            .with("is_licensed", metadata.is_licensed);

        self.sink.set(Gauge::NodeInfoLastHeard, (self.clock)(), &attrs)
    }
}

impl std::fmt::Debug for NodeInfoEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeInfoEmitter")
            .field("resolver", &self.resolver)
            .finish_non_exhaustive()
    }
}
