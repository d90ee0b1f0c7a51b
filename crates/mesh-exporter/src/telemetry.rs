//! Telemetry packet handling (`TELEMETRY_APP`)
//!
//! Each present field of a telemetry report sets one gauge labelled with
//! the reporting node. Units are normalised on the way out: pressure from
//! hPa to Pa, gas resistance scaled down by 10^6, currents from mA to A.

use std::sync::Arc;
use tracing::{debug, info};

use crate::error::Result;
use crate::metrics::{Attributes, Gauge, MetricSink};
use crate::packet::{
    AirQualityMetrics, DeviceMetrics, EnvironmentMetrics, PowerMetrics, Telemetry,
    TelemetryFamily,
};
use crate::resolver::DisplayNames;

const HPA_TO_PA: f64 = 100.0;
const GAS_RESISTANCE_SCALE: f64 = 1_000_000.0;
const MA_TO_A: f64 = 0.001;

/// Emits telemetry gauges
#[derive(Clone)]
pub struct TelemetryEmitter {
    sink: Arc<dyn MetricSink>,
}

impl TelemetryEmitter {
    /// Create an emitter writing to `sink`
    pub fn new(sink: Arc<dyn MetricSink>) -> Self {
        Self { sink }
    }

    /// Handle one telemetry report from `source`
    ///
    /// When device metrics are present they are the only family exported
    /// from this report; see [`Telemetry::reported_families`].
    // TODO: revisit the device-metrics early return once it is settled
    // whether combined reports should export every family.
    pub fn emit(
        &self,
        packet_id: u32,
        source: u32,
        names: &DisplayNames,
        telemetry: &Telemetry,
    ) -> Result<()> {
        debug!(packet_id, source, telemetry = ?telemetry, "Received Telemetry");

        let attrs = Attributes::new()
            .with("source", source)
            .with("source_long_name", &names.long_name)
            .with("source_short_name", &names.short_name);

        for family in telemetry.reported_families() {
            match family {
                TelemetryFamily::Device(m) => {
                    info!(packet_id, "Device metrics telemetry");
                    self.device(m, &attrs)?;
                }
                TelemetryFamily::Environment(m) => {
                    info!(packet_id, "Environment metrics telemetry");
                    self.environment(m, &attrs)?;
                }
                TelemetryFamily::AirQuality(m) => {
                    info!(packet_id, "Air quality metrics telemetry");
                    self.air_quality(m, &attrs)?;
                }
                TelemetryFamily::Power(m) => {
                    info!(packet_id, "Power metrics telemetry");
                    self.power(m, &attrs)?;
                }
            }
        }
        Ok(())
    }

    fn device(&self, m: &DeviceMetrics, attrs: &Attributes) -> Result<()> {
        self.set(Gauge::DeviceBatteryLevel, m.battery_level, attrs)?;
        self.set(Gauge::DeviceVoltage, m.voltage, attrs)?;
        self.set(Gauge::DeviceChannelUtilization, m.channel_utilization, attrs)?;
        self.set(Gauge::DeviceAirUtilTx, m.air_util_tx, attrs)
    }

    fn environment(&self, m: &EnvironmentMetrics, attrs: &Attributes) -> Result<()> {
        self.set(Gauge::EnvTemperature, m.temperature, attrs)?;
        self.set(Gauge::EnvRelativeHumidity, m.relative_humidity, attrs)?;
        self.set(
            Gauge::EnvBarometricPressure,
            m.barometric_pressure.map(|v| v * HPA_TO_PA),
            attrs,
        )?;
        self.set(
            Gauge::EnvGasResistance,
            m.gas_resistance.map(|v| v / GAS_RESISTANCE_SCALE),
            attrs,
        )?;
        self.set(Gauge::EnvVoltage, m.voltage, attrs)?;
        self.set(Gauge::EnvCurrent, m.current.map(|v| v * MA_TO_A), attrs)
    }

    fn air_quality(&self, m: &AirQualityMetrics, attrs: &Attributes) -> Result<()> {
        let fields = [
            (Gauge::AirQualityPm10Standard, m.pm10_standard),
            (Gauge::AirQualityPm25Standard, m.pm25_standard),
            (Gauge::AirQualityPm100Standard, m.pm100_standard),
            (Gauge::AirQualityPm10Environmental, m.pm10_environmental),
            (Gauge::AirQualityPm25Environmental, m.pm25_environmental),
            (Gauge::AirQualityPm100Environmental, m.pm100_environmental),
            (Gauge::AirQualityParticles03um, m.particles_03um),
            (Gauge::AirQualityParticles05um, m.particles_05um),
            (Gauge::AirQualityParticles10um, m.particles_10um),
            (Gauge::AirQualityParticles25um, m.particles_25um),
            (Gauge::AirQualityParticles50um, m.particles_50um),
            (Gauge::AirQualityParticles100um, m.particles_100um),
        ];
        for (gauge, value) in fields {
            self.set(gauge, value, attrs)?;
        }
        Ok(())
    }

    fn power(&self, m: &PowerMetrics, attrs: &Attributes) -> Result<()> {
        let current = |v: Option<f64>| v.map(|v| v * MA_TO_A);
        self.set(Gauge::PowerCh1Voltage, m.ch1_voltage, attrs)?;
        self.set(Gauge::PowerCh1Current, current(m.ch1_current), attrs)?;
        self.set(Gauge::PowerCh2Voltage, m.ch2_voltage, attrs)?;
        self.set(Gauge::PowerCh2Current, current(m.ch2_current), attrs)?;
        self.set(Gauge::PowerCh3Voltage, m.ch3_voltage, attrs)?;
        self.set(Gauge::PowerCh3Current, current(m.ch3_current), attrs)
    }

    fn set(&self, gauge: Gauge, value: Option<f64>, attrs: &Attributes) -> Result<()> {
        match value {
            Some(value) => self.sink.set(gauge, value, attrs),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for TelemetryEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryEmitter").finish_non_exhaustive()
    }
}
