//! Meshtastic packet dispatch and telemetry-to-metrics pipeline
//!
//! This crate turns a stream of decoded Meshtastic mesh packets into
//! metrics. It drops flood duplicates, remembers node identities announced
//! on the mesh, and exports telemetry and neighbor-link gauges labelled with
//! human-readable node names.
//!
//! # Architecture
//!
//! The pipeline is built from four layers:
//!
//! 1. **Ingestion** - [`PacketSource`] implementations feed an [`ExporterService`]
//! 2. **Dispatch** - [`PacketDispatcher`] filters, counts and routes by port
//! 3. **Emitters** - identity, telemetry and neighbor handlers produce observations
//! 4. **Sinks** - a [`MetricSink`] records observations ([`PrometheusSink`])
//!
//! Dedup markers and node metadata live in an [`ExpiringStore`], either
//! in-process ([`MemoryStore`]) or in Redis (`redis` feature) so several
//! exporters can share one view of the mesh.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use mesh_exporter::{
//!     open_store, ExporterConfig, ExporterService, JsonLinesSource, PacketDispatcher,
//!     PrometheusSink,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ExporterConfig::from_env()?;
//!     let store = open_store(&config.store).await?;
//!     let sink = Arc::new(PrometheusSink::new());
//!     let dispatcher = PacketDispatcher::new(store, sink.clone(), &config);
//!
//!     let source = JsonLinesSource::new(tokio::io::BufReader::new(tokio::io::stdin()));
//!     let (service, _handle) = ExporterService::new(source, dispatcher);
//!     service.run().await?;
//!
//!     print!("{}", sink.render()?);
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `redis` - Redis-backed [`ExpiringStore`]
//!
//! # Packet Flow
//!
//! 1. Encrypted packets and packets without an id are dropped
//! 2. [`DedupFilter`] drops repeat sightings within the flood window
//! 3. `meshtastic_mesh_packets_total` is incremented
//! 4. `NODEINFO_APP` packets update the [`NodeResolver`]
//! 5. Other ports are exported only once the source node is known

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Core modules
pub mod config;
pub mod error;
pub mod store;

// Packet model and state
pub mod dedup;
pub mod packet;
pub mod resolver;

// Metrics
pub mod metrics;
pub mod neighborinfo;
pub mod nodeinfo;
pub mod telemetry;

// Pipeline
pub mod dispatcher;
pub mod ingest;

// Testing utilities
pub mod test_utils;

pub use config::{
    DedupConfig, ExporterConfig, ExporterConfigBuilder, LoggingConfig, MetadataConfig,
    StoreConfig,
};
pub use error::{ExporterError, Result};
pub use store::{open_store, ExpiringStore, MemoryStore};

#[cfg(feature = "redis")]
pub use store::RedisStore;

pub use dedup::{DedupFilter, DedupStats};
pub use packet::{MeshPacket, Payload, PortNum, BROADCAST_ADDR};
pub use resolver::{parse_node_db, DisplayNames, NodeField, NodeMetadata, NodeResolver, UNKNOWN};

pub use metrics::{Attributes, Counter, Gauge, MetricSink, PrometheusSink};
pub use neighborinfo::NeighborInfoEmitter;
pub use nodeinfo::NodeInfoEmitter;
pub use telemetry::TelemetryEmitter;

pub use dispatcher::{DispatcherStats, ErrorReporter, Outcome, PacketContext, PacketDispatcher};
pub use ingest::{
    ChannelSource, ExporterHandle, ExporterService, JsonLinesSource, PacketSource, ServiceStats,
};

pub use config::{DEFAULT_CACHE_MAX_ENTRIES, DEFAULT_FLOOD_EXPIRE_SECS, DEFAULT_NODE_METADATA_TTL_SECS};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
