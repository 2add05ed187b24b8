//! Consumption-rate (MPG) engine.
//!
//! Accumulates distance and fuel until the fuel total clears both the
//! minimum-sample threshold and the SNR floor, then folds the resulting
//! instantaneous figure into a smoothed EWMA and lifetime totals. Fuel
//! deltas arrive already source-prioritized by the orchestrator; this
//! module only decides when an accumulated window is trustworthy.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::EstimatorConfig;

/// Which measurement produced a fuel delta, in priority order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FuelSource {
    /// Cumulative ECU counter delta (±1%).
    EcuCounter,
    /// Fuel-level sensor percentage delta.
    SensorLevel,
    /// Filter rate × elapsed time, when nothing better is available.
    RateFallback,
}

/// One accepted consumption sample.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MpgSample {
    pub instant_mpg: f64,
    pub distance_mi: f64,
    pub fuel_gal: f64,
    pub source: FuelSource,
    /// True when the ECU's direct economy figure was preferred over the
    /// computed quotient.
    pub ecu_preferred: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MpgEngine {
    /// Distance accumulated since the last accepted sample, miles.
    pub unconsumed_distance_mi: f64,
    /// Fuel accumulated since the last accepted sample, gallons.
    pub unconsumed_fuel_gal: f64,
    /// EWMA-smoothed MPG; None until the first accepted sample.
    pub smoothed_mpg: Option<f64>,
    pub lifetime_distance_mi: f64,
    pub lifetime_fuel_gal: f64,
    /// Set while SNR is below the floor: the minimum-accumulation
    /// threshold is raised instead of the window being discarded.
    pub low_snr_hold: bool,
    /// Source of the dominant share of the pending window.
    pending_source: Option<FuelSource>,
    pub samples_accepted: u64,
    pub samples_rejected: u64,
}

impl MpgEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lifetime average MPG across all accepted samples.
    pub fn overall_mpg(&self) -> Option<f64> {
        if self.lifetime_fuel_gal > 0.0 {
            Some(self.lifetime_distance_mi / self.lifetime_fuel_gal)
        } else {
            None
        }
    }

    /// Accumulate one interval and, when the window qualifies, produce a
    /// consumption sample.
    ///
    /// SNR gate: expected sensor noise is `sensor_noise_fraction ×
    /// tank_capacity`. A window whose fuel total fails `fuel / noise ≥
    /// snr_floor` is NOT discarded; the acceptance threshold rises to the
    /// low-SNR value and accumulation simply continues.
    pub fn accumulate(
        &mut self,
        fuel_gal: f64,
        distance_mi: f64,
        source: FuelSource,
        ecu_instant_mpg: Option<f64>,
        config: &EstimatorConfig,
    ) -> Option<MpgSample> {
        if fuel_gal > 0.0 {
            self.unconsumed_fuel_gal += fuel_gal;
            // Highest-priority source seen in the window labels the sample.
            self.pending_source = Some(match (self.pending_source, source) {
                (Some(FuelSource::EcuCounter), _) | (_, FuelSource::EcuCounter) => {
                    FuelSource::EcuCounter
                }
                (Some(FuelSource::SensorLevel), _) | (_, FuelSource::SensorLevel) => {
                    FuelSource::SensorLevel
                }
                _ => FuelSource::RateFallback,
            });
        }
        if distance_mi > 0.0 {
            self.unconsumed_distance_mi += distance_mi;
        }

        let threshold = if self.low_snr_hold {
            config.low_snr_min_fuel_sample_gal
        } else {
            config.min_fuel_sample_gal
        };
        if self.unconsumed_fuel_gal < threshold {
            return None;
        }

        let expected_noise = config.sensor_noise_fraction * config.tank_capacity_gal;
        let snr = if expected_noise > 0.0 {
            self.unconsumed_fuel_gal / expected_noise
        } else {
            f64::INFINITY
        };
        if snr < config.snr_floor {
            if !self.low_snr_hold {
                debug!(
                    "SNR {:.2} below floor, raising accumulation threshold to {:.1} gal",
                    snr, config.low_snr_min_fuel_sample_gal
                );
                self.low_snr_hold = true;
            }
            return None;
        }

        // Window qualifies; compute and validate.
        let fuel = self.unconsumed_fuel_gal;
        let distance = self.unconsumed_distance_mi;
        let computed_mpg = distance / fuel;

        let (instant_mpg, ecu_preferred) = match ecu_instant_mpg {
            Some(ecu) if (ecu - computed_mpg).abs() > config.ecu_mpg_trust_delta => (ecu, true),
            _ => (computed_mpg, false),
        };

        // The window is consumed either way; an out-of-band figure must
        // not linger and poison the next window.
        self.unconsumed_fuel_gal = 0.0;
        self.unconsumed_distance_mi = 0.0;
        self.low_snr_hold = false;
        let source = self.pending_source.take().unwrap_or(source);

        if instant_mpg < config.min_mpg || instant_mpg > config.max_mpg {
            debug!(
                "instant MPG {:.2} outside [{:.1}, {:.1}], sample discarded",
                instant_mpg, config.min_mpg, config.max_mpg
            );
            self.samples_rejected += 1;
            return None;
        }

        let alpha = config.mpg_ewma_alpha;
        self.smoothed_mpg = Some(match self.smoothed_mpg {
            Some(prev) => alpha * instant_mpg + (1.0 - alpha) * prev,
            None => instant_mpg,
        });
        self.lifetime_distance_mi += distance;
        self.lifetime_fuel_gal += fuel;
        self.samples_accepted += 1;

        Some(MpgSample {
            instant_mpg,
            distance_mi: distance,
            fuel_gal: fuel,
            source,
            ecu_preferred,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn config() -> EstimatorConfig {
        EstimatorConfig::default()
    }

    #[test]
    fn test_accumulates_until_threshold() {
        let mut engine = MpgEngine::new();
        let c = config();
        // 1.0 gal < 1.5 gal minimum: no sample.
        assert!(engine
            .accumulate(1.0, 6.0, FuelSource::EcuCounter, None, &c)
            .is_none());
        // 2.0 gal total, SNR = 2.0/2.0 = 1.0: sample produced.
        let sample = engine
            .accumulate(1.0, 6.0, FuelSource::EcuCounter, None, &c)
            .unwrap();
        assert_relative_eq!(sample.instant_mpg, 6.0, epsilon = 1e-9);
        assert_relative_eq!(engine.smoothed_mpg.unwrap(), 6.0, epsilon = 1e-9);
    }

    #[test]
    fn test_snr_gate_raises_threshold_and_keeps_state() {
        let mut engine = MpgEngine::new();
        let mut c = config();
        c.tank_capacity_gal = 120.0; // expected noise 2.4 gal

        // 1.8 gal clears the 1.5 gal minimum but SNR = 0.75 < 1.0.
        assert!(engine
            .accumulate(1.8, 10.0, FuelSource::SensorLevel, None, &c)
            .is_none());
        assert!(engine.low_snr_hold);
        assert_relative_eq!(engine.unconsumed_fuel_gal, 1.8, epsilon = 1e-9);
        assert_relative_eq!(engine.unconsumed_distance_mi, 10.0, epsilon = 1e-9);

        // Still short of the raised 2.5 gal threshold.
        assert!(engine
            .accumulate(0.5, 3.0, FuelSource::SensorLevel, None, &c)
            .is_none());

        // 2.6 gal total: SNR = 1.08, sample produced from the whole window.
        let sample = engine
            .accumulate(0.3, 2.0, FuelSource::SensorLevel, None, &c)
            .unwrap();
        assert_relative_eq!(sample.fuel_gal, 2.6, epsilon = 1e-9);
        assert_relative_eq!(sample.instant_mpg, 15.0 / 2.6, epsilon = 1e-9);
        assert!(!engine.low_snr_hold);
    }

    #[test]
    fn test_out_of_band_sample_discarded_smoothed_unchanged() {
        let mut engine = MpgEngine::new();
        let c = config();
        // Seed a smoothed value.
        engine.accumulate(2.0, 12.0, FuelSource::EcuCounter, None, &c);
        let smoothed = engine.smoothed_mpg.unwrap();

        // 2.0 gal over 40 mi = 20 MPG, above the 12 MPG band.
        assert!(engine
            .accumulate(2.0, 40.0, FuelSource::EcuCounter, None, &c)
            .is_none());
        assert_relative_eq!(engine.smoothed_mpg.unwrap(), smoothed, epsilon = 1e-12);
        assert_eq!(engine.samples_rejected, 1);
        // Window was consumed, not left to poison the next one.
        assert_relative_eq!(engine.unconsumed_fuel_gal, 0.0);
    }

    #[test]
    fn test_ecu_direct_economy_preferred_when_divergent() {
        let mut engine = MpgEngine::new();
        let c = config();
        // Computed: 12 mi / 2 gal = 6.0 MPG; ECU claims 9.0 (diff > 2).
        let sample = engine
            .accumulate(2.0, 12.0, FuelSource::EcuCounter, Some(9.0), &c)
            .unwrap();
        assert!(sample.ecu_preferred);
        assert_relative_eq!(sample.instant_mpg, 9.0, epsilon = 1e-9);
    }

    #[test]
    fn test_ecu_direct_economy_ignored_when_close() {
        let mut engine = MpgEngine::new();
        let c = config();
        // Computed 6.0 vs ECU 7.0: within the 2 MPG trust delta.
        let sample = engine
            .accumulate(2.0, 12.0, FuelSource::EcuCounter, Some(7.0), &c)
            .unwrap();
        assert!(!sample.ecu_preferred);
        assert_relative_eq!(sample.instant_mpg, 6.0, epsilon = 1e-9);
    }

    #[test]
    fn test_smoothing_and_lifetime_totals() {
        let mut engine = MpgEngine::new();
        let c = config();
        engine.accumulate(2.0, 12.0, FuelSource::EcuCounter, None, &c);
        engine.accumulate(2.0, 16.0, FuelSource::EcuCounter, None, &c);

        // EWMA: 0.15*8.0 + 0.85*6.0 = 6.3
        assert_relative_eq!(engine.smoothed_mpg.unwrap(), 6.3, epsilon = 1e-9);
        assert_relative_eq!(engine.overall_mpg().unwrap(), 28.0 / 4.0, epsilon = 1e-9);
    }

    #[test]
    fn test_source_priority_labels_window() {
        let mut engine = MpgEngine::new();
        let c = config();
        engine.accumulate(1.0, 6.0, FuelSource::RateFallback, None, &c);
        let sample = engine
            .accumulate(1.0, 6.0, FuelSource::EcuCounter, None, &c)
            .unwrap();
        assert_eq!(sample.source, FuelSource::EcuCounter);
    }
}
