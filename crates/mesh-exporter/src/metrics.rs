//! Metric catalogue and sinks
//!
//! Every metric the exporter can produce is a variant of [`Counter`] or
//! [`Gauge`], so names are spelled exactly once. Emitters hand observations
//! to a [`MetricSink`] together with an ordered [`Attributes`] list; the
//! sink decides how they are recorded.
//!
//! [`PrometheusSink`] records into a per-instance `prometheus::Registry`,
//! creating one labelled vector per metric the first time it is used. The
//! label keys of that first call become fixed for the metric.

use parking_lot::Mutex;
use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use tracing::debug;

use crate::error::{ExporterError, Result};

/// Counter metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    /// Every accepted, non-duplicate packet
    MeshPackets,
}

impl Counter {
    /// All counters
    pub const ALL: [Counter; 1] = [Counter::MeshPackets];

    /// Exported metric name
    pub const fn name(&self) -> &'static str {
        match self {
            Counter::MeshPackets => "meshtastic_mesh_packets_total",
        }
    }

    /// Help text
    pub const fn help(&self) -> &'static str {
        match self {
            Counter::MeshPackets => "Mesh packets received, after flood deduplication",
        }
    }
}

/// Gauge metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gauge {
    /// Unix time a node's identity packet was last heard
    NodeInfoLastHeard,
    /// Link SNR reported by a neighbor report
    NeighborSnr,
    /// Last reception time reported by a neighbor report (never emitted)
    NeighborLastRxTime,

    #[allow(missing_docs)]
    DeviceBatteryLevel,
    #[allow(missing_docs)]
    DeviceVoltage,
    #[allow(missing_docs)]
    DeviceChannelUtilization,
    #[allow(missing_docs)]
    DeviceAirUtilTx,

    #[allow(missing_docs)]
    EnvTemperature,
    #[allow(missing_docs)]
    EnvRelativeHumidity,
    #[allow(missing_docs)]
    EnvBarometricPressure,
    #[allow(missing_docs)]
    EnvGasResistance,
    #[allow(missing_docs)]
    EnvVoltage,
    #[allow(missing_docs)]
    EnvCurrent,

    #[allow(missing_docs)]
    PowerCh1Voltage,
    #[allow(missing_docs)]
    PowerCh1Current,
    #[allow(missing_docs)]
    PowerCh2Voltage,
    #[allow(missing_docs)]
    PowerCh2Current,
    #[allow(missing_docs)]
    PowerCh3Voltage,
    #[allow(missing_docs)]
    PowerCh3Current,

    #[allow(missing_docs)]
    AirQualityPm10Standard,
    #[allow(missing_docs)]
    AirQualityPm25Standard,
    #[allow(missing_docs)]
    AirQualityPm100Standard,
    #[allow(missing_docs)]
    AirQualityPm10Environmental,
    #[allow(missing_docs)]
    AirQualityPm25Environmental,
    #[allow(missing_docs)]
    AirQualityPm100Environmental,
    #[allow(missing_docs)]
    AirQualityParticles03um,
    #[allow(missing_docs)]
    AirQualityParticles05um,
    #[allow(missing_docs)]
    AirQualityParticles10um,
    #[allow(missing_docs)]
    AirQualityParticles25um,
    #[allow(missing_docs)]
    AirQualityParticles50um,
    #[allow(missing_docs)]
    AirQualityParticles100um,
}

impl Gauge {
    /// All gauges
    pub const ALL: [Gauge; 31] = [
        Gauge::NodeInfoLastHeard,
        Gauge::NeighborSnr,
        Gauge::NeighborLastRxTime,
        Gauge::DeviceBatteryLevel,
        Gauge::DeviceVoltage,
        Gauge::DeviceChannelUtilization,
        Gauge::DeviceAirUtilTx,
        Gauge::EnvTemperature,
        Gauge::EnvRelativeHumidity,
        Gauge::EnvBarometricPressure,
        Gauge::EnvGasResistance,
        Gauge::EnvVoltage,
        Gauge::EnvCurrent,
        Gauge::PowerCh1Voltage,
        Gauge::PowerCh1Current,
        Gauge::PowerCh2Voltage,
        Gauge::PowerCh2Current,
        Gauge::PowerCh3Voltage,
        Gauge::PowerCh3Current,
        Gauge::AirQualityPm10Standard,
        Gauge::AirQualityPm25Standard,
        Gauge::AirQualityPm100Standard,
        Gauge::AirQualityPm10Environmental,
        Gauge::AirQualityPm25Environmental,
        Gauge::AirQualityPm100Environmental,
        Gauge::AirQualityParticles03um,
        Gauge::AirQualityParticles05um,
        Gauge::AirQualityParticles10um,
        Gauge::AirQualityParticles25um,
        Gauge::AirQualityParticles50um,
        Gauge::AirQualityParticles100um,
    ];

    /// Exported metric name
    pub const fn name(&self) -> &'static str {
        match self {
            Gauge::NodeInfoLastHeard => "meshtastic_node_info_last_heard_timestamp_seconds",
            Gauge::NeighborSnr => "meshtastic_neighbor_info_snr_decibels",
            Gauge::NeighborLastRxTime => "meshtastic_neighbor_info_last_rx_time",
            Gauge::DeviceBatteryLevel => "meshtastic_telemetry_device_battery_level_percent",
            Gauge::DeviceVoltage => "meshtastic_telemetry_device_voltage_volts",
            Gauge::DeviceChannelUtilization => {
                "meshtastic_telemetry_device_channel_utilization_percent"
            }
            Gauge::DeviceAirUtilTx => "meshtastic_telemetry_device_air_util_tx_percent",
            Gauge::EnvTemperature => "meshtastic_telemetry_env_temperature_celsius",
            Gauge::EnvRelativeHumidity => "meshtastic_telemetry_env_relative_humidity_percent",
            Gauge::EnvBarometricPressure => "meshtastic_telemetry_env_barometric_pressure_pascal",
            Gauge::EnvGasResistance => "meshtastic_telemetry_env_gas_resistance_ohms",
            Gauge::EnvVoltage => "meshtastic_telemetry_env_voltage_volts",
            Gauge::EnvCurrent => "meshtastic_telemetry_env_current_amperes",
            Gauge::PowerCh1Voltage => "meshtastic_telemetry_power_ch1_voltage_volts",
            Gauge::PowerCh1Current => "meshtastic_telemetry_power_ch1_current_amperes",
            Gauge::PowerCh2Voltage => "meshtastic_telemetry_power_ch2_voltage_volts",
            Gauge::PowerCh2Current => "meshtastic_telemetry_power_ch2_current_amperes",
            Gauge::PowerCh3Voltage => "meshtastic_telemetry_power_ch3_voltage_volts",
            Gauge::PowerCh3Current => "meshtastic_telemetry_power_ch3_current_amperes",
            Gauge::AirQualityPm10Standard => "meshtastic_telemetry_air_quality_pm10_standard",
            Gauge::AirQualityPm25Standard => "meshtastic_telemetry_air_quality_pm25_standard",
            Gauge::AirQualityPm100Standard => "meshtastic_telemetry_air_quality_pm100_standard",
            Gauge::AirQualityPm10Environmental => {
                "meshtastic_telemetry_air_quality_pm10_environmental"
            }
            Gauge::AirQualityPm25Environmental => {
                "meshtastic_telemetry_air_quality_pm25_environmental"
            }
            Gauge::AirQualityPm100Environmental => {
                "meshtastic_telemetry_air_quality_pm100_environmental"
            }
            Gauge::AirQualityParticles03um => "meshtastic_telemetry_air_quality_particles_03um",
            Gauge::AirQualityParticles05um => "meshtastic_telemetry_air_quality_particles_05um",
            Gauge::AirQualityParticles10um => "meshtastic_telemetry_air_quality_particles_10um",
            Gauge::AirQualityParticles25um => "meshtastic_telemetry_air_quality_particles_25um",
            Gauge::AirQualityParticles50um => "meshtastic_telemetry_air_quality_particles_50um",
            Gauge::AirQualityParticles100um => "meshtastic_telemetry_air_quality_particles_100um",
        }
    }

    /// Help text
    pub const fn help(&self) -> &'static str {
        match self {
            Gauge::NodeInfoLastHeard => "Unix time the node's identity was last heard",
            Gauge::NeighborSnr => "SNR of a neighbor link as reported by the source node",
            Gauge::NeighborLastRxTime => "Last reception time of a neighbor",
            Gauge::DeviceBatteryLevel => "Battery level (101 means externally powered)",
            Gauge::DeviceVoltage => "Battery voltage",
            Gauge::DeviceChannelUtilization => "Channel utilization",
            Gauge::DeviceAirUtilTx => "Transmit airtime utilization",
            Gauge::EnvTemperature => "Temperature",
            Gauge::EnvRelativeHumidity => "Relative humidity",
            Gauge::EnvBarometricPressure => "Barometric pressure",
            Gauge::EnvGasResistance => "Gas resistance",
            Gauge::EnvVoltage => "Environment sensor voltage",
            Gauge::EnvCurrent => "Environment sensor current",
            Gauge::PowerCh1Voltage => "Power monitor channel 1 voltage",
            Gauge::PowerCh1Current => "Power monitor channel 1 current",
            Gauge::PowerCh2Voltage => "Power monitor channel 2 voltage",
            Gauge::PowerCh2Current => "Power monitor channel 2 current",
            Gauge::PowerCh3Voltage => "Power monitor channel 3 voltage",
            Gauge::PowerCh3Current => "Power monitor channel 3 current",
            Gauge::AirQualityPm10Standard => "PM1.0 concentration (standard)",
            Gauge::AirQualityPm25Standard => "PM2.5 concentration (standard)",
            Gauge::AirQualityPm100Standard => "PM10.0 concentration (standard)",
            Gauge::AirQualityPm10Environmental => "PM1.0 concentration (environmental)",
            Gauge::AirQualityPm25Environmental => "PM2.5 concentration (environmental)",
            Gauge::AirQualityPm100Environmental => "PM10.0 concentration (environmental)",
            Gauge::AirQualityParticles03um => "Particles >= 0.3um",
            Gauge::AirQualityParticles05um => "Particles >= 0.5um",
            Gauge::AirQualityParticles10um => "Particles >= 1.0um",
            Gauge::AirQualityParticles25um => "Particles >= 2.5um",
            Gauge::AirQualityParticles50um => "Particles >= 5.0um",
            Gauge::AirQualityParticles100um => "Particles >= 10.0um",
        }
    }
}

/// Ordered key/value labels attached to an observation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes(Vec<(&'static str, String)>);

impl Attributes {
    /// Create an empty attribute list
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an attribute (builder style)
    pub fn with(mut self, key: &'static str, value: impl ToString) -> Self {
        self.push(key, value);
        self
    }

    /// Append an attribute
    pub fn push(&mut self, key: &'static str, value: impl ToString) {
        self.0.push((key, value.to_string()));
    }

    /// Look up a value by key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Keys, in order
    pub fn keys(&self) -> Vec<&'static str> {
        self.0.iter().map(|(k, _)| *k).collect()
    }

    /// Values, in key order
    pub fn values(&self) -> Vec<&str> {
        self.0.iter().map(|(_, v)| v.as_str()).collect()
    }

    /// Iterate over key/value pairs
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        self.0.iter().map(|(k, v)| (*k, v.as_str()))
    }

    /// Number of attributes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if there are no attributes
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Destination for metric observations
pub trait MetricSink: Send + Sync {
    /// Increment a counter
    fn add(&self, counter: Counter, value: f64, attrs: &Attributes) -> Result<()>;

    /// Set a gauge
    fn set(&self, gauge: Gauge, value: f64, attrs: &Attributes) -> Result<()>;
}

// ============================================================================
// Prometheus sink
// ============================================================================

struct Registered<V> {
    vec: V,
    keys: Vec<&'static str>,
}

impl<V> Registered<V> {
    fn check_keys(&self, name: &str, attrs: &Attributes) -> Result<()> {
        let keys = attrs.keys();
        if keys == self.keys {
            Ok(())
        } else {
            Err(ExporterError::Metrics(format!(
                "{} registered with labels {:?}, got {:?}",
                name, self.keys, keys
            )))
        }
    }
}

/// Sink recording into a private Prometheus registry
pub struct PrometheusSink {
    registry: Registry,
    counters: Mutex<HashMap<Counter, Registered<CounterVec>>>,
    gauges: Mutex<HashMap<Gauge, Registered<GaugeVec>>>,
}

impl PrometheusSink {
    /// Create a sink with a fresh registry
    pub fn new() -> Self {
        Self::with_registry(Registry::new())
    }

    /// Create a sink recording into an existing registry
    pub fn with_registry(registry: Registry) -> Self {
        Self {
            registry,
            counters: Mutex::new(HashMap::new()),
            gauges: Mutex::new(HashMap::new()),
        }
    }

    /// Underlying registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render the text exposition format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ExporterError::Metrics(e.to_string()))
    }
}

impl Default for PrometheusSink {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSink for PrometheusSink {
    fn add(&self, counter: Counter, value: f64, attrs: &Attributes) -> Result<()> {
        if value < 0.0 {
            return Err(ExporterError::Metrics(format!(
                "{} cannot decrease (got {})",
                counter.name(),
                value
            )));
        }

        let mut counters = self.counters.lock();
        let registered = match counters.entry(counter) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let keys = attrs.keys();
                let vec = CounterVec::new(Opts::new(counter.name(), counter.help()), &keys)?;
                self.registry.register(Box::new(vec.clone()))?;
                debug!(metric = counter.name(), labels = ?keys, "Registered counter");
                entry.insert(Registered { vec, keys })
            }
        };
        registered.check_keys(counter.name(), attrs)?;
        registered
            .vec
            .get_metric_with_label_values(&attrs.values())?
            .inc_by(value);
        Ok(())
    }

    fn set(&self, gauge: Gauge, value: f64, attrs: &Attributes) -> Result<()> {
        let mut gauges = self.gauges.lock();
        let registered = match gauges.entry(gauge) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let keys = attrs.keys();
                let vec = GaugeVec::new(Opts::new(gauge.name(), gauge.help()), &keys)?;
                self.registry.register(Box::new(vec.clone()))?;
                debug!(metric = gauge.name(), labels = ?keys, "Registered gauge");
                entry.insert(Registered { vec, keys })
            }
        };
        registered.check_keys(gauge.name(), attrs)?;
        registered
            .vec
            .get_metric_with_label_values(&attrs.values())?
            .set(value);
        Ok(())
    }
}

impl std::fmt::Debug for PrometheusSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusSink")
            .field("counters", &self.counters.lock().len())
            .field("gauges", &self.gauges.lock().len())
            .finish()
    }
}
