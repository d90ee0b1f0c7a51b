//! Integration tests for the mesh exporter pipeline
//!
//! These tests drive the public API end to end:
//! - Flood deduplication and its expiry window
//! - Identity learning and the unknown-source gate
//! - Telemetry and neighbor gauges with exact values and labels
//! - Rejection of encrypted and id-less packets before any store access
//! - Prometheus rendering and the ingestion service

use async_trait::async_trait;
use mesh_exporter::test_utils::{fixtures, TestFixture, FIXED_NOW};
use mesh_exporter::{
    parse_node_db, ChannelSource, Counter, ExpiringStore, ExporterConfig, ExporterConfigBuilder,
    DEFAULT_CACHE_MAX_ENTRIES,
    ExporterService, Gauge, JsonLinesSource, MemoryStore, MeshPacket, MetricSink, NodeField,
    Outcome, PacketDispatcher, PrometheusSink, Result, UNKNOWN,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Mock Infrastructure
// ============================================================================

/// Memory store that counts every call
#[derive(Default)]
struct CountingStore {
    inner: MemoryStore,
    set_if_absent_calls: AtomicUsize,
    hash_get_calls: AtomicUsize,
    hash_set_calls: AtomicUsize,
}

impl CountingStore {
    fn calls(&self) -> (usize, usize, usize) {
        (
            self.set_if_absent_calls.load(Ordering::SeqCst),
            self.hash_get_calls.load(Ordering::SeqCst),
            self.hash_set_calls.load(Ordering::SeqCst),
        )
    }
}

#[async_trait]
impl ExpiringStore for CountingStore {
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.set_if_absent_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.set_if_absent(key, ttl).await
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        self.hash_get_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.hash_get(key, field).await
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)], ttl: Duration) -> Result<()> {
        self.hash_set_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.hash_set(key, fields, ttl).await
    }

    fn backend(&self) -> &str {
        "counting"
    }
}

fn counting_fixture() -> (TestFixture, Arc<CountingStore>) {
    let store = Arc::new(CountingStore::default());
    let fx = TestFixture::with_store(store.clone(), &ExporterConfig::default());
    (fx, store)
}

fn packet(json: &str) -> MeshPacket {
    MeshPacket::from_json(json).unwrap()
}

// ============================================================================
// Deduplication
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_duplicate_within_window_has_no_effect() {
    let (fx, store) = counting_fixture();
    let nodeinfo = packet(fixtures::NODEINFO_PACKET);

    assert_eq!(
        fx.dispatcher.on_packet(&nodeinfo).await,
        Some(Outcome::Processed)
    );
    let observations = fx.sink.observations().len();
    let (_, _, writes) = store.calls();

    tokio::time::advance(Duration::from_secs(599)).await;
    assert_eq!(
        fx.dispatcher.on_packet(&nodeinfo).await,
        Some(Outcome::Duplicate)
    );
    assert_eq!(fx.sink.observations().len(), observations);
    assert_eq!(store.calls().2, writes);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(
        fx.dispatcher.on_packet(&nodeinfo).await,
        Some(Outcome::Processed)
    );
    assert_eq!(fx.sink.gauge_sets(Gauge::NodeInfoLastHeard).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_configured_flood_window() {
    let config = ExporterConfig::from_lookup(|key| match key {
        "FLOOD_EXPIRE_TIME" => Some("30".to_string()),
        _ => None,
    })
    .unwrap();
    let fx = TestFixture::with_config(&config);

    assert!(fx.dispatcher.on_json(fixtures::NODEINFO_PACKET).await.is_some());
    assert_eq!(
        fx.dispatcher.on_json(fixtures::NODEINFO_PACKET).await,
        Some(Outcome::Duplicate)
    );

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(
        fx.dispatcher.on_json(fixtures::NODEINFO_PACKET).await,
        Some(Outcome::Processed)
    );
}

// ============================================================================
// Rejection before the filter
// ============================================================================

#[tokio::test]
async fn test_encrypted_packet_never_reaches_store() {
    let (fx, store) = counting_fixture();

    let outcome = fx.dispatcher.on_json(fixtures::ENCRYPTED_PACKET).await;
    assert_eq!(outcome, Some(Outcome::RejectedEncrypted));
    assert_eq!(store.calls(), (0, 0, 0));
    assert!(fx.sink.observations().is_empty());
}

#[tokio::test]
async fn test_packet_without_id_never_reaches_store() {
    let (fx, store) = counting_fixture();

    let outcome = fx
        .dispatcher
        .on_json(r#"{"from": 123456789, "to": 987654321, "decoded": {"portnum": "TELEMETRY_APP", "telemetry": {"deviceMetrics": {"voltage": 4.0}}}}"#)
        .await;
    assert_eq!(outcome, Some(Outcome::RejectedMissingId));
    assert_eq!(store.calls(), (0, 0, 0));
    assert!(fx.sink.observations().is_empty());
}

// ============================================================================
// Identity handling
// ============================================================================

#[tokio::test]
async fn test_nodeinfo_from_unknown_node() {
    let fx = TestFixture::new();
    assert!(!fx.resolver.is_known(123456789).await.unwrap());

    fx.dispatcher.on_json(fixtures::NODEINFO_PACKET).await;

    assert_eq!(
        fx.resolver.get(123456789, NodeField::LongName).await.unwrap(),
        "namename"
    );
    assert_eq!(
        fx.resolver.get(123456789, NodeField::ShortName).await.unwrap(),
        "name"
    );
    assert_eq!(
        fx.resolver.get(123456789, NodeField::HwModel).await.unwrap(),
        "TBEAM"
    );
    assert_eq!(
        fx.resolver.get(123456789, NodeField::IsLicensed).await.unwrap(),
        "true"
    );

    let sets = fx.sink.gauge_sets(Gauge::NodeInfoLastHeard);
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].0, FIXED_NOW);
    assert_eq!(
        sets[0].1.values(),
        vec!["123456789", "!1fc44444", "namename", "name", "true"]
    );
    assert_eq!(fx.sink.counter_adds(Counter::MeshPackets).len(), 1);
}

#[tokio::test]
async fn test_nodeinfo_from_known_node_overwrites() {
    let fx = TestFixture::new();
    fx.learn_node(123456789, "oldname", "old").await.unwrap();

    fx.dispatcher.on_json(fixtures::NODEINFO_PACKET).await;

    let names = fx.resolver.names(123456789).await.unwrap();
    assert_eq!(names.long_name, "namename");
    assert_eq!(names.short_name, "name");
    assert_eq!(fx.sink.gauge_sets(Gauge::NodeInfoLastHeard).len(), 1);
}

#[tokio::test]
async fn test_unknown_source_is_counted_but_not_exported() {
    let fx = TestFixture::new();

    assert_eq!(
        fx.dispatcher.on_json(fixtures::TELEMETRY_PACKET).await,
        Some(Outcome::Suppressed)
    );
    assert_eq!(
        fx.dispatcher.on_json(fixtures::NEIGHBORINFO_PACKET).await,
        Some(Outcome::Suppressed)
    );

    assert_eq!(fx.sink.counter_count(), 2);
    assert_eq!(fx.sink.gauge_count(), 0);
    let adds = fx.sink.counter_adds(Counter::MeshPackets);
    assert_eq!(adds[0].1.get("source_long_name"), Some(UNKNOWN));
}

#[tokio::test]
async fn test_identity_unlocks_telemetry() {
    let fx = TestFixture::new();

    fx.dispatcher.on_json(fixtures::NODEINFO_PACKET).await;
    fx.dispatcher.on_json(fixtures::TELEMETRY_PACKET).await;

    let sets = fx.sink.gauge_sets(Gauge::DeviceBatteryLevel);
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].1.get("source_long_name"), Some("namename"));
    assert_eq!(sets[0].1.get("source_short_name"), Some("name"));
}

#[tokio::test]
async fn test_identity_survives_busy_mesh() {
    let fx = TestFixture::new();
    fx.dispatcher.on_json(fixtures::NODEINFO_PACKET).await;

    // More distinct packet ids than the store holds entries
    for id in 0..=DEFAULT_CACHE_MAX_ENTRIES as u32 {
        let chatter = format!(
            r#"{{"id": {}, "from": 555, "to": 4294967295, "decoded": {{"portnum": "TEXT_MESSAGE_APP"}}}}"#,
            10_000_000 + id
        );
        assert_eq!(fx.dispatcher.on_json(&chatter).await, Some(Outcome::Suppressed));
    }

    assert!(fx.resolver.is_known(123456789).await.unwrap());
    assert_eq!(
        fx.dispatcher.on_json(fixtures::TELEMETRY_PACKET).await,
        Some(Outcome::Processed)
    );
    assert_eq!(fx.sink.gauge_sets(Gauge::DeviceBatteryLevel).len(), 1);
}

// ============================================================================
// Telemetry
// ============================================================================

#[tokio::test]
async fn test_device_metrics_telemetry() {
    let fx = TestFixture::new();
    fx.learn_node(123456789, "mocked", "mocked").await.unwrap();

    let outcome = fx.dispatcher.on_json(fixtures::TELEMETRY_PACKET).await;
    assert_eq!(outcome, Some(Outcome::Processed));

    let expected = [
        (Gauge::DeviceBatteryLevel, 101.0),
        (Gauge::DeviceVoltage, 4.122),
        (Gauge::DeviceChannelUtilization, 0.0),
        (Gauge::DeviceAirUtilTx, 0.15486111),
    ];
    for (gauge, value) in expected {
        let sets = fx.sink.gauge_sets(gauge);
        assert_eq!(sets.len(), 1, "{} set once", gauge.name());
        assert_eq!(sets[0].0, value);
        assert_eq!(
            sets[0].1.keys(),
            vec!["source", "source_long_name", "source_short_name"]
        );
        assert_eq!(sets[0].1.values(), vec!["123456789", "mocked", "mocked"]);
    }
    assert_eq!(fx.sink.gauge_count(), 4);
    assert_eq!(fx.sink.counter_adds(Counter::MeshPackets).len(), 1);
}

#[tokio::test]
async fn test_environment_unit_conversions() {
    let fx = TestFixture::new();
    fx.learn_node(123456789, "Base", "BS").await.unwrap();

    fx.dispatcher.on_json(fixtures::ENVIRONMENT_PACKET).await;

    assert_eq!(fx.sink.gauge_values(Gauge::EnvBarometricPressure), vec![100000.0]);
    assert_eq!(fx.sink.gauge_values(Gauge::EnvGasResistance), vec![5.0]);
    assert_eq!(fx.sink.gauge_values(Gauge::EnvCurrent), vec![0.12]);
    assert_eq!(fx.sink.gauge_values(Gauge::EnvTemperature), vec![21.5]);
    assert_eq!(fx.sink.gauge_values(Gauge::EnvRelativeHumidity), vec![48.0]);
    assert!(fx.sink.gauge_sets(Gauge::EnvVoltage).is_empty());

    let adds = fx.sink.counter_adds(Counter::MeshPackets);
    assert_eq!(adds[0].1.get("want_ack"), Some("false"));
    assert_eq!(adds[0].1.get("via_mqtt"), Some("true"));
    assert_eq!(adds[0].1.get("delayed"), Some(UNKNOWN));
}

#[tokio::test]
async fn test_power_metrics_snake_case() {
    let fx = TestFixture::new();
    fx.learn_node(42, "Solar", "SL").await.unwrap();

    fx.dispatcher
        .on_json(r#"{"id": 5005, "from": 42, "to": 4294967295, "decoded": {"portnum": 67, "telemetry": {"powerMetrics": {"ch1_voltage": 13.2, "ch1_current": 450, "ch3_current": 10}}}}"#)
        .await;

    assert_eq!(fx.sink.gauge_values(Gauge::PowerCh1Voltage), vec![13.2]);
    assert_eq!(fx.sink.gauge_values(Gauge::PowerCh1Current), vec![0.45]);
    assert_eq!(fx.sink.gauge_values(Gauge::PowerCh3Current), vec![0.01]);
    assert!(fx.sink.gauge_sets(Gauge::PowerCh2Voltage).is_empty());
}

// ============================================================================
// Neighbor reports
// ============================================================================

#[tokio::test]
async fn test_neighborinfo_five_neighbors() {
    let fx = TestFixture::new();
    fx.learn_node(123456789, "Base", "BS").await.unwrap();
    fx.learn_node(123456722, "Relay", "RL").await.unwrap();
    fx.learn_node(123456755, "Hill", "HL").await.unwrap();

    let outcome = fx.dispatcher.on_json(fixtures::NEIGHBORINFO_PACKET).await;
    assert_eq!(outcome, Some(Outcome::Processed));

    let sets = fx.sink.gauge_sets(Gauge::NeighborSnr);
    assert_eq!(sets.len(), 5);

    let expected = [
        ("123456711", 3.5, UNKNOWN, UNKNOWN),
        ("123456722", 6.5, "Relay", "RL"),
        ("123456733", -11.5, UNKNOWN, UNKNOWN),
        ("123456744", 6.25, UNKNOWN, UNKNOWN),
        ("123456755", 6.75, "Hill", "HL"),
    ];
    for ((value, attrs), (id, snr, long, short)) in sets.iter().zip(expected) {
        assert_eq!(*value, snr);
        assert_eq!(attrs.get("source"), Some("123456789"));
        assert_eq!(attrs.get("source_long_name"), Some("Base"));
        assert_eq!(attrs.get("neighbor_source"), Some(id));
        assert_eq!(attrs.get("neighbor_source_long_name"), Some(long));
        assert_eq!(attrs.get("neighbor_source_short_name"), Some(short));
    }
    assert!(fx.sink.gauge_sets(Gauge::NeighborLastRxTime).is_empty());
}

// ============================================================================
// NodeDB import
// ============================================================================

#[tokio::test]
async fn test_node_db_import_unlocks_telemetry() {
    let fx = TestFixture::new();
    let nodes = parse_node_db(
        r#"[{"num": 123456789, "user": {"id": "!075bcd15", "longName": "Imported", "shortName": "IM", "hwModel": "RAK4631"}}]"#,
    )
    .unwrap();
    assert_eq!(fx.resolver.import_node_db(nodes).await.unwrap(), 1);

    fx.dispatcher.on_json(fixtures::TELEMETRY_PACKET).await;
    let sets = fx.sink.gauge_sets(Gauge::DeviceVoltage);
    assert_eq!(sets[0].1.get("source_long_name"), Some("Imported"));
}

// ============================================================================
// Prometheus and ingestion
// ============================================================================

#[tokio::test]
async fn test_prometheus_pipeline() {
    let config = ExporterConfigBuilder::new().memory_store(1000).build();
    let store: Arc<dyn ExpiringStore> = Arc::new(MemoryStore::with_capacity(1000));
    let sink = Arc::new(PrometheusSink::new());
    let dispatcher = PacketDispatcher::new(store, sink.clone(), &config);

    let input = [
        fixtures::NODEINFO_PACKET,
        fixtures::TELEMETRY_PACKET,
        fixtures::NEIGHBORINFO_PACKET,
        fixtures::TELEMETRY_PACKET,
    ]
    .join("\n");
    let (service, _handle) =
        ExporterService::new(JsonLinesSource::new(input.as_bytes()), dispatcher);
    let stats = service.run().await.unwrap();
    assert_eq!(stats.dispatcher.processed, 3);
    assert_eq!(stats.dispatcher.duplicates, 1);

    let text = sink.render().unwrap();
    assert!(text.contains("# TYPE meshtastic_mesh_packets_total counter"));
    assert!(text.contains("meshtastic_telemetry_device_voltage_volts{source=\"123456789\",source_long_name=\"namename\",source_short_name=\"name\"} 4.122"));
    assert!(text.contains("neighbor_source=\"123456733\""));
    assert!(text.contains("meshtastic_node_info_last_heard_timestamp_seconds"));
}

#[tokio::test]
async fn test_channel_source_pipeline() {
    let fx = TestFixture::new();
    let (tx, source) = ChannelSource::channel(16);
    let (service, handle) = ExporterService::new(source, fx.dispatcher.clone());
    let task = tokio::spawn(service.run());

    for json in [
        fixtures::NODEINFO_PACKET,
        fixtures::TELEMETRY_PACKET,
        fixtures::ENCRYPTED_PACKET,
    ] {
        tx.send(packet(json)).await.unwrap();
    }
    drop(tx);

    let stats = task.await.unwrap().unwrap();
    assert_eq!(stats.dispatcher.received, 3);
    assert_eq!(stats.dispatcher.processed, 2);
    assert_eq!(stats.dispatcher.rejected_encrypted, 1);
    assert_eq!(fx.sink.gauge_count(), 5);
    drop(handle);
}

#[tokio::test]
async fn test_metric_sink_is_object_safe() {
    let sinks: Vec<Arc<dyn MetricSink>> = vec![
        Arc::new(PrometheusSink::new()),
        Arc::new(mesh_exporter::test_utils::RecordingSink::new()),
    ];
    let attrs = mesh_exporter::Attributes::new().with("source", 1);
    for sink in sinks {
        sink.set(Gauge::EnvTemperature, 1.0, &attrs).unwrap();
    }
}
