//! Test doubles and fixtures
//!
//! [`RecordingSink`] captures every metric observation in order so tests
//! can assert on exact values and attribute lists. [`TestFixture`] wires a
//! dispatcher over an in-memory store with a fixed clock.
//!
//! # Example
//!
//! ```rust,ignore
//! use mesh_exporter::test_utils::{fixtures, TestFixture};
//!
//! let fx = TestFixture::new();
//! fx.learn_node(123456789, "mocked", "mocked").await?;
//! fx.dispatcher.on_json(fixtures::TELEMETRY_PACKET).await;
//! assert_eq!(fx.sink.gauge_count(), 4);
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ExporterConfig;
use crate::dispatcher::{ErrorReporter, PacketContext, PacketDispatcher};
use crate::error::{ExporterError, Result};
use crate::metrics::{Attributes, Counter, Gauge, MetricSink};
use crate::resolver::{NodeMetadata, NodeResolver};
use crate::store::{ExpiringStore, MemoryStore};

/// Timestamp returned by the fixture clock
pub const FIXED_NOW: f64 = 1_732_550_036.25;

/// Packets captured from a live mesh
pub mod fixtures {
    /// Device metrics from node 123456789
    pub const TELEMETRY_PACKET: &str = r#"{"from": 123456789, "to": 987654321, "decoded": {"portnum": "TELEMETRY_APP", "telemetry": {"time": 1732550036, "deviceMetrics": {"batteryLevel": 101, "voltage": 4.122, "channelUtilization": 0.0, "airUtilTx": 0.15486111, "uptimeSeconds": 2027}}}, "id": 3259852062, "rxTime": 1732550036, "hopLimit": 3, "priority": "BACKGROUND", "fromId": null, "toId": "^all"}"#;

    /// Identity of node 123456789
    pub const NODEINFO_PACKET: &str = r#"{"from": 123456789, "to": 987654321, "decoded": {"portnum": "NODEINFO_APP", "user": {"id": "!1fc44444", "longName": "namename", "shortName": "name", "macaddr": "CDIuwbaC", "hwModel": "TBEAM", "isLicensed": true}}, "id": 662811674, "rxTime": 1732550036, "hopLimit": 3, "fromId": "!075bcd15", "toId": "^all"}"#;

    /// Neighbor report from node 123456789 listing five neighbors
    pub const NEIGHBORINFO_PACKET: &str = r#"{"from": 123456789, "to": 987654321, "decoded": {"portnum": "NEIGHBORINFO_APP", "neighborinfo": {"nodeId": 123456789, "lastSentById": 123456789, "nodeBroadcastIntervalSecs": 3600, "neighbors": [{"nodeId": 123456711, "snr": 3.5}, {"nodeId": 123456722, "snr": 6.5}, {"nodeId": 123456733, "snr": -11.5}, {"nodeId": 123456744, "snr": 6.25}, {"nodeId": 123456755, "snr": 6.75}]}}, "id": 3117092156, "rxTime": 1702513724, "rxSnr": -10.0, "hopLimit": 2, "rxRssi": -119, "fromId": "!b6ffffac", "toId": "^all"}"#;

    /// Environment telemetry exercising unit conversions
    pub const ENVIRONMENT_PACKET: &str = r#"{"from": 123456789, "to": 4294967295, "decoded": {"portnum": "TELEMETRY_APP", "telemetry": {"time": 1732550100, "environmentMetrics": {"temperature": 21.5, "relativeHumidity": 48.0, "barometricPressure": 1000, "gasResistance": 5000000, "current": 120}}}, "id": 1100220033, "hopLimit": 3, "wantAck": false, "viaMqtt": true}"#;

    /// Packet still carrying its encrypted payload
    pub const ENCRYPTED_PACKET: &str = r#"{"from": 123456789, "to": 4294967295, "id": 2200330044, "channel": 8, "encrypted": "q83vEjRWeJA=", "hopLimit": 3}"#;
}

/// One observation recorded by [`RecordingSink`]
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// Counter increment
    Add(Counter, f64, Attributes),
    /// Gauge set
    Set(Gauge, f64, Attributes),
}

/// Metric sink that records every observation
#[derive(Debug, Default)]
pub struct RecordingSink {
    observations: Mutex<Vec<Observation>>,
}

impl RecordingSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// All observations, in order
    pub fn observations(&self) -> Vec<Observation> {
        self.observations.lock().clone()
    }

    /// Increments of one counter
    pub fn counter_adds(&self, counter: Counter) -> Vec<(f64, Attributes)> {
        self.observations
            .lock()
            .iter()
            .filter_map(|o| match o {
                Observation::Add(c, v, a) if *c == counter => Some((*v, a.clone())),
                _ => None,
            })
            .collect()
    }

    /// Sets of one gauge
    pub fn gauge_sets(&self, gauge: Gauge) -> Vec<(f64, Attributes)> {
        self.observations
            .lock()
            .iter()
            .filter_map(|o| match o {
                Observation::Set(g, v, a) if *g == gauge => Some((*v, a.clone())),
                _ => None,
            })
            .collect()
    }

    /// Values set on one gauge
    pub fn gauge_values(&self, gauge: Gauge) -> Vec<f64> {
        self.gauge_sets(gauge).into_iter().map(|(v, _)| v).collect()
    }

    /// Total gauge sets across all gauges
    pub fn gauge_count(&self) -> usize {
        self.observations
            .lock()
            .iter()
            .filter(|o| matches!(o, Observation::Set(..)))
            .count()
    }

    /// Total counter increments across all counters
    pub fn counter_count(&self) -> usize {
        self.observations
            .lock()
            .iter()
            .filter(|o| matches!(o, Observation::Add(..)))
            .count()
    }

    /// Forget everything recorded so far
    pub fn clear(&self) {
        self.observations.lock().clear();
    }
}

impl MetricSink for RecordingSink {
    fn add(&self, counter: Counter, value: f64, attrs: &Attributes) -> Result<()> {
        self.observations
            .lock()
            .push(Observation::Add(counter, value, attrs.clone()));
        Ok(())
    }

    fn set(&self, gauge: Gauge, value: f64, attrs: &Attributes) -> Result<()> {
        self.observations
            .lock()
            .push(Observation::Set(gauge, value, attrs.clone()));
        Ok(())
    }
}

/// Store whose every operation fails as unreachable
#[derive(Debug, Default)]
pub struct FailingStore;

#[async_trait]
impl ExpiringStore for FailingStore {
    async fn set_if_absent(&self, _key: &str, _ttl: Duration) -> Result<bool> {
        Err(ExporterError::StoreUnavailable("store offline".to_string()))
    }

    async fn hash_get(&self, _key: &str, _field: &str) -> Result<Option<Vec<u8>>> {
        Err(ExporterError::StoreUnavailable("store offline".to_string()))
    }

    async fn hash_set(&self, _key: &str, _fields: &[(&str, String)], _ttl: Duration) -> Result<()> {
        Err(ExporterError::StoreUnavailable("store offline".to_string()))
    }

    fn backend(&self) -> &str {
        "failing"
    }
}

/// Error reporter that keeps every report
#[derive(Debug, Default)]
pub struct CollectingReporter {
    reports: Mutex<Vec<(&'static str, PacketContext)>>,
}

impl CollectingReporter {
    /// Create an empty reporter
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports so far as (error code, context)
    pub fn reports(&self) -> Vec<(&'static str, PacketContext)> {
        self.reports.lock().clone()
    }
}

impl ErrorReporter for CollectingReporter {
    fn report(&self, error: &ExporterError, context: &PacketContext) {
        self.reports
            .lock()
            .push((error.error_code(), context.clone()));
    }
}

/// Dispatcher wired to an in-memory store and recording doubles
pub struct TestFixture {
    /// Shared store
    pub store: Arc<dyn ExpiringStore>,
    /// Resolver over `store`
    pub resolver: NodeResolver,
    /// Recorded metrics
    pub sink: Arc<RecordingSink>,
    /// Recorded failures
    pub reporter: Arc<CollectingReporter>,
    /// Dispatcher under test
    pub dispatcher: PacketDispatcher,
}

impl TestFixture {
    /// Fixture with default configuration
    pub fn new() -> Self {
        Self::with_config(&ExporterConfig::default())
    }

    /// Fixture with the given configuration (store settings are ignored)
    pub fn with_config(config: &ExporterConfig) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), config)
    }

    /// Fixture whose store is unreachable
    pub fn with_failing_store() -> Self {
        Self::with_store(Arc::new(FailingStore), &ExporterConfig::default())
    }

    /// Fixture over an arbitrary store
    pub fn with_store(store: Arc<dyn ExpiringStore>, config: &ExporterConfig) -> Self {
        let sink = Arc::new(RecordingSink::new());
        let reporter = Arc::new(CollectingReporter::new());
        let dispatcher = PacketDispatcher::new(store.clone(), sink.clone(), config)
            .with_error_reporter(reporter.clone())
            .with_clock(Arc::new(|| FIXED_NOW));
        Self {
            resolver: NodeResolver::from_config(store.clone(), &config.metadata),
            store,
            sink,
            reporter,
            dispatcher,
        }
    }

    /// Store an identity for `node_id` as if its NodeInfo had been heard
    pub async fn learn_node(&self, node_id: u32, long_name: &str, short_name: &str) -> Result<()> {
        self.resolver
            .save(
                node_id,
                &NodeMetadata::new(long_name, short_name, "TBEAM", false),
            )
            .await
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}
