//! Packet classification and dispatch
//!
//! Every packet goes through the same steps:
//!
//! 1. Encrypted packets and packets without an id are dropped
//! 2. Repeat sightings of a packet id are dropped by the [`DedupFilter`]
//! 3. The originating node is resolved (`decoded.source`, else `from`)
//! 4. The packet counter is incremented, labelled with resolved names
//! 5. Identity packets are always handled; every other port requires the
//!    source node's identity to be known first
//! 6. The port-specific emitter runs
//!
//! [`PacketDispatcher::handle_packet`] reports failures to its caller.
//! [`PacketDispatcher::on_packet`] is the ingestion entry point: it logs,
//! counts and reports failures and never propagates them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::ExporterConfig;
use crate::dedup::DedupFilter;
use crate::error::{ExporterError, Result};
use crate::metrics::{Attributes, Counter, MetricSink};
use crate::neighborinfo::NeighborInfoEmitter;
use crate::nodeinfo::{Clock, NodeInfoEmitter};
use crate::packet::{MeshPacket, Payload, PortNum};
use crate::resolver::{NodeResolver, UNKNOWN};
use crate::store::ExpiringStore;
use crate::telemetry::TelemetryEmitter;

/// What happened to a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Dropped: payload still encrypted
    RejectedEncrypted,
    /// Dropped: no packet id
    RejectedMissingId,
    /// Dropped: already seen within the flood window
    Duplicate,
    /// Counted, but the source node's identity is unknown
    Suppressed,
    /// Counted and handled by its port's emitter (if any)
    Processed,
}

/// Packet details attached to error reports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketContext {
    /// Packet id
    pub packet_id: Option<u32>,
    /// Immediate sender
    pub from: Option<u32>,
    /// Port name
    pub portnum: Option<String>,
    /// Full packet (`Debug` form), or the raw input if it did not decode
    pub packet: String,
}

impl PacketContext {
    /// Capture context from a packet
    pub fn from_packet(packet: &MeshPacket) -> Self {
        Self {
            packet_id: packet.id,
            from: Some(packet.from),
            portnum: packet.portnum().map(|p| p.as_str().to_string()),
            packet: format!("{:?}", packet),
        }
    }

    /// Capture context from input that did not decode
    pub fn from_raw(raw: &str) -> Self {
        Self {
            packet: raw.to_string(),
            ..Self::default()
        }
    }
}

/// Collaborator notified of every per-packet failure
pub trait ErrorReporter: Send + Sync {
    /// Report one failure
    fn report(&self, error: &ExporterError, context: &PacketContext);
}

/// Dispatcher statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Packets handed to the dispatcher
    pub received: u64,
    /// Dropped as encrypted
    pub rejected_encrypted: u64,
    /// Dropped for lacking an id
    pub rejected_missing_id: u64,
    /// Dropped as duplicates
    pub duplicates: u64,
    /// Counted but suppressed for an unknown source
    pub suppressed: u64,
    /// Fully processed
    pub processed: u64,
    /// Failures (decode, malformed payload, store, metrics)
    pub errors: u64,
}

#[derive(Debug, Default)]
struct AtomicStats {
    received: AtomicU64,
    rejected_encrypted: AtomicU64,
    rejected_missing_id: AtomicU64,
    duplicates: AtomicU64,
    suppressed: AtomicU64,
    processed: AtomicU64,
    errors: AtomicU64,
}

impl AtomicStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatcherStats {
        DispatcherStats {
            received: self.received.load(Ordering::Relaxed),
            rejected_encrypted: self.rejected_encrypted.load(Ordering::Relaxed),
            rejected_missing_id: self.rejected_missing_id.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Routes packets through dedup, resolution and the port emitters
#[derive(Clone)]
pub struct PacketDispatcher {
    dedup: DedupFilter,
    resolver: NodeResolver,
    sink: Arc<dyn MetricSink>,
    nodeinfo: NodeInfoEmitter,
    telemetry: TelemetryEmitter,
    neighborinfo: NeighborInfoEmitter,
    reporter: Option<Arc<dyn ErrorReporter>>,
    stats: Arc<AtomicStats>,
}

impl PacketDispatcher {
    /// Create a dispatcher over a shared store, configured from `config`
    pub fn new(
        store: Arc<dyn ExpiringStore>,
        sink: Arc<dyn MetricSink>,
        config: &ExporterConfig,
    ) -> Self {
        Self::from_parts(
            DedupFilter::from_config(store.clone(), &config.dedup),
            NodeResolver::from_config(store, &config.metadata),
            sink,
        )
    }

    /// Create a dispatcher from already-built components
    pub fn from_parts(dedup: DedupFilter, resolver: NodeResolver, sink: Arc<dyn MetricSink>) -> Self {
        Self {
            nodeinfo: NodeInfoEmitter::new(resolver.clone(), sink.clone()),
            telemetry: TelemetryEmitter::new(sink.clone()),
            neighborinfo: NeighborInfoEmitter::new(resolver.clone(), sink.clone()),
            dedup,
            resolver,
            sink,
            reporter: None,
            stats: Arc::new(AtomicStats::default()),
        }
    }

    /// Forward failures to `reporter`
    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Use `clock` for the last-heard timestamp
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.nodeinfo = NodeInfoEmitter::with_clock(self.resolver.clone(), self.sink.clone(), clock);
        self
    }

    /// Process one packet, returning failures to the caller
    pub async fn handle_packet(&self, packet: &MeshPacket) -> Result<Outcome> {
        AtomicStats::bump(&self.stats.received);

        if packet.encrypted {
            info!(packet_id = ?packet.id, "Skipping encrypted packet");
            AtomicStats::bump(&self.stats.rejected_encrypted);
            return Ok(Outcome::RejectedEncrypted);
        }

        let Some(packet_id) = packet.id else {
            debug!(from = packet.from, "Skipping packet without id");
            AtomicStats::bump(&self.stats.rejected_missing_id);
            return Ok(Outcome::RejectedMissingId);
        };

        if !self.dedup.is_new_packet(packet_id).await? {
            info!(packet_id, "Skipping duplicate packet");
            AtomicStats::bump(&self.stats.duplicates);
            return Ok(Outcome::Duplicate);
        }

        let decoded = packet
            .decoded
            .as_ref()
            .ok_or_else(|| ExporterError::MalformedPacket {
                packet_id,
                reason: "packet has no decoded payload".to_string(),
            })?;

        let source = packet.source();
        self.count_packet(packet, source, &decoded.portnum).await?;

        if decoded.portnum == PortNum::NodeInfo {
            let Payload::NodeInfo(user) = &decoded.payload else {
                return Err(payload_error(packet_id, &decoded.portnum, &decoded.payload));
            };
            self.nodeinfo.emit(packet_id, source, user).await?;
            AtomicStats::bump(&self.stats.processed);
            return Ok(Outcome::Processed);
        }

        let names = self.resolver.names(source).await?;
        if !names.is_known() {
            info!(
                packet_id,
                source,
                portnum = %decoded.portnum,
                "Skipping packet from node with unknown identity"
            );
            AtomicStats::bump(&self.stats.suppressed);
            return Ok(Outcome::Suppressed);
        }

        match (&decoded.portnum, &decoded.payload) {
            (PortNum::Telemetry, Payload::Telemetry(telemetry)) => {
                self.telemetry.emit(packet_id, source, &names, telemetry)?;
            }
            (PortNum::NeighborInfo, Payload::NeighborInfo(info)) => {
                self.neighborinfo
                    .emit(packet_id, source, &names, info)
                    .await?;
            }
            (PortNum::Telemetry | PortNum::NeighborInfo, payload) => {
                return Err(payload_error(packet_id, &decoded.portnum, payload));
            }
            _ => {}
        }

        AtomicStats::bump(&self.stats.processed);
        Ok(Outcome::Processed)
    }

    /// Process one packet, isolating any failure
    ///
    /// Returns `None` if processing failed; the failure has been logged,
    /// counted and forwarded to the error reporter.
    pub async fn on_packet(&self, packet: &MeshPacket) -> Option<Outcome> {
        match self.handle_packet(packet).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                self.record_error(&e, &PacketContext::from_packet(packet));
                None
            }
        }
    }

    /// Decode one JSON packet and process it, isolating any failure
    pub async fn on_json(&self, text: &str) -> Option<Outcome> {
        match MeshPacket::from_json(text) {
            Ok(packet) => self.on_packet(&packet).await,
            Err(e) => {
                self.record_error(&e, &PacketContext::from_raw(text));
                None
            }
        }
    }

    /// Snapshot of the dispatcher statistics
    pub fn stats(&self) -> DispatcherStats {
        self.stats.snapshot()
    }

    /// The flood dedup filter
    pub fn dedup(&self) -> &DedupFilter {
        &self.dedup
    }

    /// The node resolver
    pub fn resolver(&self) -> &NodeResolver {
        &self.resolver
    }

    async fn count_packet(&self, packet: &MeshPacket, source: u32, portnum: &PortNum) -> Result<()> {
        let source_names = self.resolver.names(source).await?;
        let from_names = self.resolver.names(packet.from).await?;
        let to_names = self.resolver.names(packet.to).await?;

        let or_unknown = |v: Option<String>| v.unwrap_or_else(|| UNKNOWN.to_string());

        let attrs = Attributes::new()
            .with("source", source)
            .with("source_long_name", source_names.long_name)
            .with("source_short_name", source_names.short_name)
            .with("from", packet.from)
            .with("from_long_name", from_names.long_name)
            .with("from_short_name", from_names.short_name)
            .with("to", packet.to)
            .with("to_long_name", to_names.long_name)
            .with("to_short_name", to_names.short_name)
            .with("channel", packet.channel.unwrap_or(0))
            .with("type", portnum)
            .with("hop_limit", or_unknown(packet.hop_limit.map(|v| v.to_string())))
            .with("want_ack", or_unknown(packet.want_ack.map(|v| v.to_string())))
            .with("delayed", or_unknown(packet.delayed.clone()))
            .with("via_mqtt", or_unknown(packet.via_mqtt.map(|v| v.to_string())));

        self.sink.add(Counter::MeshPackets, 1.0, &attrs)
    }

    fn record_error(&self, e: &ExporterError, context: &PacketContext) {
        AtomicStats::bump(&self.stats.errors);
        error!(
            packet_id = ?context.packet_id,
            from = ?context.from,
            portnum = ?context.portnum,
            code = e.error_code(),
            error = %e,
            packet = %context.packet,
            "Failed to process packet"
        );
        if let Some(reporter) = &self.reporter {
            reporter.report(e, context);
        }
    }
}

impl std::fmt::Debug for PacketDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketDispatcher")
            .field("dedup", &self.dedup)
            .field("resolver", &self.resolver)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn payload_error(packet_id: u32, portnum: &PortNum, payload: &Payload) -> ExporterError {
    let reason = match payload {
        Payload::Malformed { reason } => reason.clone(),
        _ => format!("{} packet carries a mismatched payload", portnum),
    };
    ExporterError::MalformedPacket { packet_id, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Gauge;
    use crate::test_utils::{fixtures, TestFixture};

    #[tokio::test]
    async fn test_counter_attribute_order() {
        let fx = TestFixture::new();
        fx.learn_node(123456789, "mocked", "mocked").await.unwrap();

        let outcome = fx.dispatcher.on_json(fixtures::TELEMETRY_PACKET).await;
        assert_eq!(outcome, Some(Outcome::Processed));

        let adds = fx.sink.counter_adds(Counter::MeshPackets);
        assert_eq!(adds.len(), 1);
        let (value, attrs) = &adds[0];
        assert_eq!(*value, 1.0);
        assert_eq!(
            attrs.keys(),
            vec![
                "source",
                "source_long_name",
                "source_short_name",
                "from",
                "from_long_name",
                "from_short_name",
                "to",
                "to_long_name",
                "to_short_name",
                "channel",
                "type",
                "hop_limit",
                "want_ack",
                "delayed",
                "via_mqtt"
            ]
        );
        assert_eq!(attrs.get("source_long_name"), Some("mocked"));
        assert_eq!(attrs.get("to_long_name"), Some(UNKNOWN));
        assert_eq!(attrs.get("type"), Some("TELEMETRY_APP"));
        assert_eq!(attrs.get("hop_limit"), Some("3"));
        assert_eq!(attrs.get("channel"), Some("0"));
        assert_eq!(attrs.get("want_ack"), Some(UNKNOWN));
    }

    #[tokio::test]
    async fn test_missing_decoded_is_malformed() {
        let fx = TestFixture::new();
        let packet = MeshPacket::from_json(r#"{"id": 4, "from": 1, "to": 2}"#).unwrap();
        let err = fx.dispatcher.handle_packet(&packet).await.unwrap_err();
        assert_eq!(err.error_code(), "MALFORMED_PACKET");
        assert!(fx.sink.counter_adds(Counter::MeshPackets).is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_counted_then_rejected() {
        let fx = TestFixture::new();
        fx.learn_node(1, "Base", "BS").await.unwrap();
        let packet = MeshPacket::from_json(
            r#"{"id": 8, "from": 1, "to": 2, "decoded": {"portnum": "TELEMETRY_APP"}}"#,
        )
        .unwrap();

        assert_eq!(fx.dispatcher.on_packet(&packet).await, None);
        assert_eq!(fx.sink.counter_adds(Counter::MeshPackets).len(), 1);
        assert_eq!(fx.sink.gauge_count(), 0);
        assert_eq!(fx.dispatcher.stats().errors, 1);
        assert_eq!(fx.reporter.reports().len(), 1);
        assert_eq!(fx.reporter.reports()[0].0, "MALFORMED_PACKET");
    }

    #[tokio::test]
    async fn test_malformed_payload_from_unknown_source_is_suppressed() {
        let fx = TestFixture::new();
        let packet = MeshPacket::from_json(
            r#"{"id": 8, "from": 1, "to": 2, "decoded": {"portnum": "TELEMETRY_APP"}}"#,
        )
        .unwrap();
        assert_eq!(
            fx.dispatcher.on_packet(&packet).await,
            Some(Outcome::Suppressed)
        );
    }

    #[tokio::test]
    async fn test_unrecognized_port_counted_only() {
        let fx = TestFixture::new();
        fx.learn_node(1, "Base", "BS").await.unwrap();
        let outcome = fx
            .dispatcher
            .on_json(r#"{"id": 11, "from": 1, "to": 4294967295, "channel": 2, "decoded": {"portnum": "TEXT_MESSAGE_APP", "payload": "aGk="}}"#)
            .await;

        assert_eq!(outcome, Some(Outcome::Processed));
        let adds = fx.sink.counter_adds(Counter::MeshPackets);
        assert_eq!(adds[0].1.get("type"), Some("TEXT_MESSAGE_APP"));
        assert_eq!(adds[0].1.get("channel"), Some("2"));
        assert_eq!(adds[0].1.get("to"), Some("4294967295"));
        assert_eq!(fx.sink.gauge_count(), 0);
    }

    #[tokio::test]
    async fn test_relayed_packet_uses_decoded_source() {
        let fx = TestFixture::new();
        fx.learn_node(20, "Origin", "OR").await.unwrap();
        fx.dispatcher
            .on_json(r#"{"id": 12, "from": 10, "to": 4294967295, "decoded": {"portnum": "TELEMETRY_APP", "source": 20, "telemetry": {"deviceMetrics": {"voltage": 3.7}}}}"#)
            .await;

        let adds = fx.sink.counter_adds(Counter::MeshPackets);
        assert_eq!(adds[0].1.get("source"), Some("20"));
        assert_eq!(adds[0].1.get("from"), Some("10"));
        assert_eq!(adds[0].1.get("source_long_name"), Some("Origin"));
        let sets = fx.sink.gauge_sets(Gauge::DeviceVoltage);
        assert_eq!(sets[0].1.get("source"), Some("20"));
    }

    #[tokio::test]
    async fn test_store_failure_isolated() {
        let fx = TestFixture::with_failing_store();
        let outcome = fx.dispatcher.on_json(fixtures::TELEMETRY_PACKET).await;

        assert_eq!(outcome, None);
        let stats = fx.dispatcher.stats();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(fx.reporter.reports()[0].0, "STORE_UNAVAILABLE");
        assert_eq!(
            fx.reporter.reports()[0].1.packet_id,
            Some(3259852062)
        );
    }

    #[tokio::test]
    async fn test_error_report_carries_full_packet() {
        let fx = TestFixture::with_failing_store();
        fx.dispatcher.on_json(fixtures::TELEMETRY_PACKET).await;

        let (_, context) = &fx.reporter.reports()[0];
        assert_eq!(context.from, Some(123456789));
        assert_eq!(context.portnum.as_deref(), Some("TELEMETRY_APP"));
        assert!(context.packet.contains("3259852062"));
        assert!(context.packet.contains("battery_level"));

        fx.dispatcher.on_json("{not json").await;
        assert_eq!(fx.reporter.reports()[1].1.packet, "{not json");
    }

    #[tokio::test]
    async fn test_on_json_decode_failure() {
        let fx = TestFixture::new();
        assert_eq!(fx.dispatcher.on_json("{not json").await, None);
        let stats = fx.dispatcher.stats();
        assert_eq!(stats.received, 0);
        assert_eq!(stats.errors, 1);
        assert_eq!(fx.reporter.reports()[0].0, "DECODE");
    }

    #[tokio::test]
    async fn test_stats_track_outcomes() {
        let fx = TestFixture::new();
        fx.learn_node(123456789, "mocked", "mocked").await.unwrap();

        fx.dispatcher.on_json(fixtures::TELEMETRY_PACKET).await;
        fx.dispatcher.on_json(fixtures::TELEMETRY_PACKET).await;
        fx.dispatcher
            .on_json(r#"{"id": 1, "from": 2, "to": 3, "encrypted": "AAEC"}"#)
            .await;
        fx.dispatcher
            .on_json(r#"{"from": 2, "to": 3, "decoded": {"portnum": "TEXT_MESSAGE_APP"}}"#)
            .await;
        fx.dispatcher
            .on_json(r#"{"id": 77, "from": 999, "to": 3, "decoded": {"portnum": "TEXT_MESSAGE_APP"}}"#)
            .await;

        assert_eq!(
            fx.dispatcher.stats(),
            DispatcherStats {
                received: 5,
                rejected_encrypted: 1,
                rejected_missing_id: 1,
                duplicates: 1,
                suppressed: 1,
                processed: 1,
                errors: 0,
            }
        );
    }
}
