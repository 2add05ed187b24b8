use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One telemetry tick for one vehicle. Absent fields are absent, not zero;
/// presence is checked once here, never re-checked downstream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Unix seconds.
    pub timestamp: f64,
    /// Raw fuel-level sensor reading, percent of tank.
    pub fuel_level_pct: Option<f64>,
    /// Engine load, 0-100%.
    pub engine_load_pct: Option<f64>,
    /// Altitude change over the interval, meters.
    pub altitude_delta_m: Option<f64>,
    /// Vehicle speed, mph.
    pub speed_mph: Option<f64>,
    /// Ambient temperature, Fahrenheit.
    pub ambient_temp_f: Option<f64>,
    /// Cumulative ECU fuel counter; unit (liters vs gallons) is classified
    /// by magnitude, never declared by the sender.
    pub ecu_fuel_counter: Option<f64>,
    /// ECU-reported instantaneous economy, MPG.
    pub ecu_instant_mpg: Option<f64>,
    /// Distance covered over the interval, miles.
    pub distance_delta_mi: Option<f64>,
}

impl TelemetrySample {
    pub fn is_moving(&self) -> bool {
        self.speed_mph.map(|s| s > 0.5).unwrap_or(false)
    }

    /// Field-level validation, run once at ingestion. An out-of-range value
    /// rejects the whole sample; the filter keeps its last state.
    pub fn validate(&self) -> Result<(), SampleError> {
        if !self.timestamp.is_finite() || self.timestamp < 0.0 {
            return Err(SampleError::NonFinite { field: "timestamp" });
        }
        for (field, value) in [
            ("fuel_level_pct", self.fuel_level_pct),
            ("engine_load_pct", self.engine_load_pct),
            ("altitude_delta_m", self.altitude_delta_m),
            ("speed_mph", self.speed_mph),
            ("ambient_temp_f", self.ambient_temp_f),
            ("ecu_fuel_counter", self.ecu_fuel_counter),
            ("ecu_instant_mpg", self.ecu_instant_mpg),
            ("distance_delta_mi", self.distance_delta_mi),
        ] {
            if let Some(v) = value {
                if !v.is_finite() {
                    return Err(SampleError::NonFinite { field });
                }
            }
        }
        if let Some(pct) = self.fuel_level_pct {
            if !(0.0..=100.0).contains(&pct) {
                return Err(SampleError::OutOfRange {
                    field: "fuel_level_pct",
                    value: pct,
                    min: 0.0,
                    max: 100.0,
                });
            }
        }
        if let Some(load) = self.engine_load_pct {
            if !(0.0..=100.0).contains(&load) {
                return Err(SampleError::OutOfRange {
                    field: "engine_load_pct",
                    value: load,
                    min: 0.0,
                    max: 100.0,
                });
            }
        }
        if let Some(speed) = self.speed_mph {
            if speed < 0.0 {
                return Err(SampleError::OutOfRange {
                    field: "speed_mph",
                    value: speed,
                    min: 0.0,
                    max: f64::INFINITY,
                });
            }
        }
        if let Some(dist) = self.distance_delta_mi {
            if dist < 0.0 {
                return Err(SampleError::OutOfRange {
                    field: "distance_delta_mi",
                    value: dist,
                    min: 0.0,
                    max: f64::INFINITY,
                });
            }
        }
        Ok(())
    }
}

/// Why a sample was dropped. None of these are fatal; the vehicle's state
/// is untouched and the next well-formed sample proceeds normally.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SampleError {
    #[error("field {field} is NaN or infinite")]
    NonFinite { field: &'static str },

    #[error("field {field} value {value} outside [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    /// The recursive estimate depends on ordering; a duplicate or
    /// out-of-order timestamp would silently corrupt state and covariance.
    #[error("sample at {timestamp} not after last accepted {last_timestamp}")]
    OutOfOrder { timestamp: f64, last_timestamp: f64 },
}
