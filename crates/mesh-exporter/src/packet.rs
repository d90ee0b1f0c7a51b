//! Decoded Meshtastic packets
//!
//! Packets reach the exporter already decoded by a Meshtastic client library
//! into the protobuf JSON mapping (camelCase keys, enum names as strings,
//! encrypted bytes as base64). This module turns that generic shape into a
//! typed [`MeshPacket`] whose payload is a [`Payload`] variant chosen by the
//! port tag, so handlers match on variants instead of probing for keys.
//!
//! A recognized port whose payload is missing or has the wrong shape decodes
//! to [`Payload::Malformed`] rather than failing outright: the packet still
//! counts as received, and the handler for that port reports the problem.

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::str::FromStr;

use crate::error::{ExporterError, Result};

/// Destination address used for broadcast packets
pub const BROADCAST_ADDR: u32 = 0xFFFF_FFFF;

/// Known Meshtastic port numbers and their enum names (portnums.proto)
const PORT_NAMES: &[(u32, &str)] = &[
    (0, "UNKNOWN_APP"),
    (1, "TEXT_MESSAGE_APP"),
    (2, "REMOTE_HARDWARE_APP"),
    (3, "POSITION_APP"),
    (4, "NODEINFO_APP"),
    (5, "ROUTING_APP"),
    (6, "ADMIN_APP"),
    (7, "TEXT_MESSAGE_COMPRESSED_APP"),
    (8, "WAYPOINT_APP"),
    (9, "AUDIO_APP"),
    (10, "DETECTION_SENSOR_APP"),
    (32, "REPLY_APP"),
    (33, "IP_TUNNEL_APP"),
    (34, "PAXCOUNTER_APP"),
    (64, "SERIAL_APP"),
    (65, "STORE_FORWARD_APP"),
    (66, "RANGE_TEST_APP"),
    (67, "TELEMETRY_APP"),
    (68, "ZPS_APP"),
    (69, "SIMULATOR_APP"),
    (70, "TRACEROUTE_APP"),
    (71, "NEIGHBORINFO_APP"),
    (72, "ATAK_PLUGIN"),
    (73, "MAP_REPORT_APP"),
    (256, "PRIVATE_APP"),
    (257, "ATAK_FORWARDER"),
];

/// Application port tag of a decoded packet
///
/// Only the ports the exporter acts on get their own variant; every other
/// tag is kept verbatim so it can still label the packet counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PortNum {
    /// Node identity announcement (`NODEINFO_APP`, 4)
    NodeInfo,
    /// Telemetry report (`TELEMETRY_APP`, 67)
    Telemetry,
    /// Neighbor link report (`NEIGHBORINFO_APP`, 71)
    NeighborInfo,
    /// Any other port, by enum name (or decimal number if unnamed)
    Other(String),
}

impl PortNum {
    /// Enum name used for the packet counter's `type` attribute
    pub fn as_str(&self) -> &str {
        match self {
            PortNum::NodeInfo => "NODEINFO_APP",
            PortNum::Telemetry => "TELEMETRY_APP",
            PortNum::NeighborInfo => "NEIGHBORINFO_APP",
            PortNum::Other(name) => name,
        }
    }

    /// Parse a port from its enum name
    pub fn from_name(name: &str) -> Self {
        match name {
            "NODEINFO_APP" => PortNum::NodeInfo,
            "TELEMETRY_APP" => PortNum::Telemetry,
            "NEIGHBORINFO_APP" => PortNum::NeighborInfo,
            other => PortNum::Other(other.to_string()),
        }
    }

    /// Parse a port from its numeric value
    pub fn from_number(value: u32) -> Self {
        match PORT_NAMES.iter().find(|(num, _)| *num == value) {
            Some((_, name)) => Self::from_name(name),
            None => PortNum::Other(value.to_string()),
        }
    }
}

impl std::fmt::Display for PortNum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Payload types
// ============================================================================

/// Node identity (`decoded.user` on `NODEINFO_APP`)
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct User {
    /// External user id, e.g. `!1fc44444`
    #[serde(deserialize_with = "opt_scalar_string")]
    pub id: Option<String>,
    /// Long display name
    #[serde(deserialize_with = "opt_scalar_string")]
    pub long_name: Option<String>,
    /// Short display name
    #[serde(deserialize_with = "opt_scalar_string")]
    pub short_name: Option<String>,
    /// Hardware model enum name
    #[serde(deserialize_with = "opt_scalar_string")]
    pub hw_model: Option<String>,
    /// Licensed amateur radio operator
    pub is_licensed: Option<bool>,
}

/// Device health metrics
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceMetrics {
    /// Battery level in percent (101 = externally powered)
    pub battery_level: Option<f64>,
    /// Battery voltage in volts
    pub voltage: Option<f64>,
    /// Channel utilization in percent
    pub channel_utilization: Option<f64>,
    /// Transmit airtime utilization in percent
    pub air_util_tx: Option<f64>,
    /// Uptime in seconds
    pub uptime_seconds: Option<u64>,
}

/// Environment sensor metrics
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentMetrics {
    /// Temperature in °C
    pub temperature: Option<f64>,
    /// Relative humidity in percent
    pub relative_humidity: Option<f64>,
    /// Barometric pressure in hPa
    pub barometric_pressure: Option<f64>,
    /// Gas resistance as reported by the sensor
    pub gas_resistance: Option<f64>,
    /// Voltage in volts
    pub voltage: Option<f64>,
    /// Current in mA
    pub current: Option<f64>,
}

/// Air quality sensor metrics
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AirQualityMetrics {
    #[allow(missing_docs)]
    #[serde(alias = "pm10_standard")]
    pub pm10_standard: Option<f64>,
    #[allow(missing_docs)]
    #[serde(alias = "pm25_standard")]
    pub pm25_standard: Option<f64>,
    #[allow(missing_docs)]
    #[serde(alias = "pm100_standard")]
    pub pm100_standard: Option<f64>,
    #[allow(missing_docs)]
    #[serde(alias = "pm10_environmental")]
    pub pm10_environmental: Option<f64>,
    #[allow(missing_docs)]
    #[serde(alias = "pm25_environmental")]
    pub pm25_environmental: Option<f64>,
    #[allow(missing_docs)]
    #[serde(alias = "pm100_environmental")]
    pub pm100_environmental: Option<f64>,
    #[allow(missing_docs)]
    #[serde(alias = "particles_03um")]
    pub particles_03um: Option<f64>,
    #[allow(missing_docs)]
    #[serde(alias = "particles_05um")]
    pub particles_05um: Option<f64>,
    #[allow(missing_docs)]
    #[serde(alias = "particles_10um")]
    pub particles_10um: Option<f64>,
    #[allow(missing_docs)]
    #[serde(alias = "particles_25um")]
    pub particles_25um: Option<f64>,
    #[allow(missing_docs)]
    #[serde(alias = "particles_50um")]
    pub particles_50um: Option<f64>,
    #[allow(missing_docs)]
    #[serde(alias = "particles_100um")]
    pub particles_100um: Option<f64>,
}

/// Power monitor metrics (three channels)
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerMetrics {
    /// Channel 1 voltage in volts
    #[serde(alias = "ch1_voltage")]
    pub ch1_voltage: Option<f64>,
    /// Channel 1 current in mA
    #[serde(alias = "ch1_current")]
    pub ch1_current: Option<f64>,
    /// Channel 2 voltage in volts
    #[serde(alias = "ch2_voltage")]
    pub ch2_voltage: Option<f64>,
    /// Channel 2 current in mA
    #[serde(alias = "ch2_current")]
    pub ch2_current: Option<f64>,
    /// Channel 3 voltage in volts
    #[serde(alias = "ch3_voltage")]
    pub ch3_voltage: Option<f64>,
    /// Channel 3 current in mA
    #[serde(alias = "ch3_current")]
    pub ch3_current: Option<f64>,
}

/// Telemetry report (`decoded.telemetry` on `TELEMETRY_APP`)
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    /// Sender timestamp (Unix seconds)
    pub time: Option<u64>,
    /// Device health family
    pub device_metrics: Option<DeviceMetrics>,
    /// Environment sensor family
    pub environment_metrics: Option<EnvironmentMetrics>,
    /// Air quality family
    pub air_quality_metrics: Option<AirQualityMetrics>,
    /// Power monitor family
    pub power_metrics: Option<PowerMetrics>,
}

/// One sampled metric family of a telemetry report
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TelemetryFamily<'a> {
    /// Device health
    Device(&'a DeviceMetrics),
    /// Environment sensors
    Environment(&'a EnvironmentMetrics),
    /// Air quality sensors
    AirQuality(&'a AirQualityMetrics),
    /// Power monitor
    Power(&'a PowerMetrics),
}

impl Telemetry {
    /// Families to export from this report, in processing order
    ///
    /// Device metrics preempt everything else: when present they are the only
    /// family returned. Otherwise environment, air quality and power are each
    /// included if present.
    pub fn reported_families(&self) -> Vec<TelemetryFamily<'_>> {
        if let Some(device) = &self.device_metrics {
            return vec![TelemetryFamily::Device(device)];
        }

        let mut families = Vec::new();
        if let Some(env) = &self.environment_metrics {
            families.push(TelemetryFamily::Environment(env));
        }
        if let Some(air) = &self.air_quality_metrics {
            families.push(TelemetryFamily::AirQuality(air));
        }
        if let Some(power) = &self.power_metrics {
            families.push(TelemetryFamily::Power(power));
        }
        families
    }
}

/// One entry of a neighbor report
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Neighbor {
    /// Neighbor node id
    pub node_id: Option<u32>,
    /// Link SNR in dB (omitted by the JSON mapping when zero)
    #[serde(default)]
    pub snr: f64,
    /// Last reception time as reported by the sender
    pub rx_time: Option<u64>,
}

/// Neighbor report (`decoded.neighborinfo` on `NEIGHBORINFO_APP`)
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NeighborInfo {
    /// Reporting node id
    pub node_id: Option<u32>,
    /// Node that last forwarded this report
    pub last_sent_by_id: Option<u32>,
    /// Broadcast interval of the reporting node
    pub node_broadcast_interval_secs: Option<u32>,
    /// Neighbor entries (omitted by the JSON mapping when empty)
    #[serde(default)]
    pub neighbors: Vec<Neighbor>,
}

/// Type-specific payload of a decoded packet
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Identity announcement
    NodeInfo(User),
    /// Telemetry report
    Telemetry(Telemetry),
    /// Neighbor report
    NeighborInfo(NeighborInfo),
    /// Port the exporter does not inspect
    Other,
    /// Recognized port with a missing or unreadable payload
    Malformed {
        /// What was wrong
        reason: String,
    },
}

/// Decoded (plaintext) part of a packet
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    /// Application port tag
    pub portnum: PortNum,
    /// Original author when the packet was relayed (0 = unset)
    pub source: Option<u32>,
    /// Port-specific payload
    pub payload: Payload,
}

/// A received mesh packet
#[derive(Debug, Clone, PartialEq)]
pub struct MeshPacket {
    /// Per-origination packet id, reused on rebroadcast
    pub id: Option<u32>,
    /// Immediate sender node id
    pub from: u32,
    /// Destination node id ([`BROADCAST_ADDR`] for broadcast)
    pub to: u32,
    /// Channel index
    pub channel: Option<u32>,
    /// Remaining hops
    pub hop_limit: Option<u32>,
    /// Sender requested an acknowledgement
    pub want_ack: Option<bool>,
    /// Delayed-delivery marker, as sent
    pub delayed: Option<String>,
    /// Packet crossed an MQTT gateway
    pub via_mqtt: Option<bool>,
    /// Payload is still encrypted
    pub encrypted: bool,
    /// Plaintext part, absent for encrypted packets
    pub decoded: Option<Decoded>,
}

impl MeshPacket {
    /// Decode a packet from its JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(&value)
    }

    /// Decode a packet from a parsed JSON value
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| ExporterError::Decode("packet is not a JSON object".to_string()))?;

        let id = opt_u32(obj, "id")?;
        let from = opt_u32(obj, "from")?
            .ok_or_else(|| ExporterError::Decode("packet has no `from` field".to_string()))?;
        let to = opt_u32(obj, "to")?
            .ok_or_else(|| ExporterError::Decode("packet has no `to` field".to_string()))?;

        let decoded = match obj.get("decoded") {
            Some(Value::Object(decoded)) => Some(decode_inner(decoded)?),
            Some(Value::Null) | None => None,
            Some(_) => {
                return Err(ExporterError::Decode(
                    "`decoded` is not a JSON object".to_string(),
                ))
            }
        };

        Ok(MeshPacket {
            id,
            from,
            to,
            channel: opt_u32(obj, "channel")?,
            hop_limit: opt_u32(obj, "hopLimit")?,
            want_ack: obj.get("wantAck").and_then(Value::as_bool),
            delayed: obj.get("delayed").and_then(scalar_to_string),
            via_mqtt: obj.get("viaMqtt").and_then(Value::as_bool),
            encrypted: is_encrypted(obj.get("encrypted")),
            decoded,
        })
    }

    /// The node that originated this packet
    ///
    /// `decoded.source` when present and non-zero, otherwise `from`.
    pub fn source(&self) -> u32 {
        self.decoded
            .as_ref()
            .and_then(|d| d.source)
            .filter(|source| *source != 0)
            .unwrap_or(self.from)
    }

    /// Port tag, if the packet was decoded
    pub fn portnum(&self) -> Option<&PortNum> {
        self.decoded.as_ref().map(|d| &d.portnum)
    }

    /// Check if this is a broadcast packet
    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST_ADDR
    }
}

impl FromStr for MeshPacket {
    type Err = ExporterError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_json(s)
    }
}

fn decode_inner(obj: &Map<String, Value>) -> Result<Decoded> {
    let portnum = match obj.get("portnum") {
        Some(Value::String(name)) => PortNum::from_name(name),
        Some(Value::Number(n)) => match n.as_u64().and_then(|n| u32::try_from(n).ok()) {
            Some(num) => PortNum::from_number(num),
            None => return Err(ExporterError::Decode(format!("invalid portnum {}", n))),
        },
        // The JSON mapping omits enum zero values
        None | Some(Value::Null) => PortNum::from_number(0),
        Some(other) => return Err(ExporterError::Decode(format!("invalid portnum {}", other))),
    };

    let payload = match &portnum {
        PortNum::NodeInfo => typed_payload(obj, "user", Payload::NodeInfo),
        PortNum::Telemetry => typed_payload(obj, "telemetry", Payload::Telemetry),
        PortNum::NeighborInfo => typed_payload(obj, "neighborinfo", Payload::NeighborInfo),
        PortNum::Other(_) => Payload::Other,
    };

    Ok(Decoded {
        portnum,
        source: opt_u32(obj, "source")?,
        payload,
    })
}

fn typed_payload<T, F>(obj: &Map<String, Value>, key: &str, wrap: F) -> Payload
where
    T: for<'de> Deserialize<'de>,
    F: FnOnce(T) -> Payload,
{
    match obj.get(key) {
        None | Some(Value::Null) => Payload::Malformed {
            reason: format!("missing `{}` payload", key),
        },
        Some(value) => match T::deserialize(value) {
            Ok(typed) => wrap(typed),
            Err(e) => Payload::Malformed {
                reason: format!("invalid `{}` payload: {}", key, e),
            },
        },
    }
}

/// Read an unsigned 32-bit field given as a JSON number or decimal string
fn opt_u32(obj: &Map<String, Value>, key: &str) -> Result<Option<u32>> {
    let parsed = match obj.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Some(Value::String(s)) => s.trim().parse::<u32>().ok(),
        Some(_) => None,
    };
    parsed
        .map(Some)
        .ok_or_else(|| ExporterError::Decode(format!("`{}` is not an unsigned 32-bit integer", key)))
}

/// The JSON mapping renders encrypted bytes as base64; some clients use a flag
fn is_encrypted(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(s)) => !s.is_empty(),
        _ => false,
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn opt_scalar_string<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(scalar_to_string))
}
