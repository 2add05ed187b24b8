// config.rs — Process-wide estimator configuration
//
// One immutable value, built once at startup and shared (Arc) into every
// vehicle's processing task. Nothing here mutates at runtime; the replay
// binary overrides individual fields before construction for A/B tuning.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Liters per US gallon. Unit classification and conversion both hang off
/// this constant; it is a contract, not a tunable.
pub const LITERS_PER_GALLON: f64 = 3.78541;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EstimatorConfig {
    // ── EKF construction ──
    pub initial_level_var: f64,
    pub initial_rate_var: f64,
    pub q_level: f64,
    pub q_rate: f64,
    pub base_measurement_noise: f64,
    /// Blend weight toward the freshly computed model rate in predict.
    pub rate_blend_alpha: f64,

    // ── Consumption model (%/min) ──
    pub baseline_rate: f64,
    pub load_factor: f64,
    pub altitude_factor: f64,
    pub idle_rate: f64,
    /// Set false for vehicle classes with no calibrated coefficients.
    pub model_calibrated: bool,

    // ── Adaptive noise / bias detection ──
    pub bias_window: usize,
    pub bias_trigger_magnitude: f64,
    pub bias_fault_magnitude: f64,
    pub bias_fault_window: usize,

    // ── Physical corrections ──
    pub temp_reference_f: f64,
    pub temp_coefficient_per_f: f64,
    pub biodiesel_blend_pct: f64,

    // ── Unit normalization ──
    pub liters_magnitude_threshold: f64,
    /// Fraction of the threshold treated as the ambiguity band.
    pub unit_ambiguity_band: f64,

    // ── ECU cross-validation ──
    pub ecu_warning_deviation: f64,
    pub ecu_critical_deviation: f64,
    /// Plausible cumulative-counter consumption rate band (gal/min).
    pub ecu_min_rate_gpm: f64,
    pub ecu_max_rate_gpm: f64,

    // ── Tank geometry ──
    /// Fleet default; feeds the SNR gate, theft volume threshold, and all
    /// percent-to-gallon conversions.
    pub tank_capacity_gal: f64,
    /// Per-vehicle capacity overrides, keyed by vehicle id.
    #[serde(default)]
    pub tank_capacity_overrides_gal: HashMap<String, f64>,

    // ── MPG engine ──
    pub sensor_noise_fraction: f64,
    pub snr_floor: f64,
    pub min_fuel_sample_gal: f64,
    pub low_snr_min_fuel_sample_gal: f64,
    pub min_mpg: f64,
    pub max_mpg: f64,
    pub mpg_ewma_alpha: f64,
    pub ecu_mpg_trust_delta: f64,

    // ── Event classification ──
    pub refuel_threshold_pct: f64,
    pub refuel_merge_window_secs: f64,
    pub refuel_dedup_secs: f64,
    pub refuel_dedup_pct: f64,
    pub theft_speed_gate_mph: f64,
    pub theft_deficit_fraction: f64,
    pub theft_window_secs: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            initial_level_var: 25.0,
            initial_rate_var: 1.0,
            q_level: 0.05,
            q_rate: 0.01,
            base_measurement_noise: 4.0,
            rate_blend_alpha: 0.7,

            baseline_rate: 0.5,
            load_factor: 0.01,
            altitude_factor: 0.002,
            idle_rate: 0.05,
            model_calibrated: true,

            bias_window: 4,
            bias_trigger_magnitude: 1.0,
            bias_fault_magnitude: 5.0,
            bias_fault_window: 12,

            temp_reference_f: 60.0,
            temp_coefficient_per_f: 0.00067,
            biodiesel_blend_pct: 0.0,

            liters_magnitude_threshold: 300_000.0,
            unit_ambiguity_band: 0.10,

            ecu_warning_deviation: 0.15,
            ecu_critical_deviation: 0.30,
            ecu_min_rate_gpm: 0.01,
            ecu_max_rate_gpm: 2.0,

            tank_capacity_gal: 100.0,
            tank_capacity_overrides_gal: HashMap::new(),
            sensor_noise_fraction: 0.02,
            snr_floor: 1.0,
            min_fuel_sample_gal: 1.5,
            low_snr_min_fuel_sample_gal: 2.5,
            min_mpg: 2.0,
            max_mpg: 12.0,
            mpg_ewma_alpha: 0.15,
            ecu_mpg_trust_delta: 2.0,

            refuel_threshold_pct: 10.0,
            refuel_merge_window_secs: 600.0,
            refuel_dedup_secs: 120.0,
            refuel_dedup_pct: 1.0,
            theft_speed_gate_mph: 1.0,
            theft_deficit_fraction: 0.02,
            theft_window_secs: 900.0,
        }
    }
}

impl EstimatorConfig {
    /// Resolve this config for one vehicle. Uniform fleets share the one
    /// Arc; a capacity override gets its own value with everything else
    /// unchanged.
    pub fn for_vehicle(self: &Arc<Self>, vehicle_id: &str) -> Arc<Self> {
        match self.tank_capacity_overrides_gal.get(vehicle_id) {
            Some(&capacity) => Arc::new(Self {
                tank_capacity_gal: capacity,
                ..(**self).clone()
            }),
            None => Arc::clone(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_vehicle_applies_override() {
        let mut config = EstimatorConfig::default();
        config
            .tank_capacity_overrides_gal
            .insert("tanker-9".to_string(), 400.0);
        let config = Arc::new(config);

        let resolved = config.for_vehicle("tanker-9");
        assert_eq!(resolved.tank_capacity_gal, 400.0);
        // Everything else carries over.
        assert_eq!(resolved.refuel_threshold_pct, config.refuel_threshold_pct);
    }

    #[test]
    fn test_for_vehicle_without_override_shares_config() {
        let config = Arc::new(EstimatorConfig::default());
        let resolved = config.for_vehicle("truck-1");
        assert!(Arc::ptr_eq(&config, &resolved));
    }
}
