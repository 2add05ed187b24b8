// units.rs — Cumulative fuel counter unit classification
//
// ECU counters arrive without a declared unit. A liters counter mistaken
// for gallons inflates every downstream MPG figure by ~3.78x, so the
// magnitude threshold is a hard contract. Values near the threshold are
// classified by the previous sample's unit and flagged low confidence.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::config::{EstimatorConfig, LITERS_PER_GALLON};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterUnit {
    Gallons,
    Liters,
}

/// A normalized counter interval: delta in gallons plus how sure we are
/// about the unit call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NormalizedDelta {
    pub delta_gal: f64,
    pub unit: CounterUnit,
    pub ambiguous: bool,
}

/// Per-vehicle normalizer; remembers the last counter value and its
/// classified unit so interval deltas and tie-breaks are possible.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UnitNormalizer {
    pub last_counter: Option<f64>,
    pub last_unit: Option<CounterUnit>,
}

impl UnitNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from a persisted snapshot.
    pub fn with_state(last_counter: Option<f64>, last_unit: Option<CounterUnit>) -> Self {
        Self { last_counter, last_unit }
    }

    /// Classify a raw counter value. Either endpoint of the interval
    /// exceeding the threshold forces liters.
    fn classify(&self, value: f64, prev: Option<f64>, config: &EstimatorConfig) -> (CounterUnit, bool) {
        let threshold = config.liters_magnitude_threshold;
        let band = threshold * config.unit_ambiguity_band;
        let max_mag = prev.map(|p| p.max(value)).unwrap_or(value);

        let in_band = (max_mag - threshold).abs() <= band;
        if in_band {
            // Tie-break with the previous classification rather than
            // flip-flopping across the threshold.
            if let Some(unit) = self.last_unit {
                return (unit, true);
            }
        }
        let unit = if max_mag > threshold {
            CounterUnit::Liters
        } else {
            CounterUnit::Gallons
        };
        (unit, in_band)
    }

    /// Ingest a new cumulative counter value; returns the interval delta in
    /// gallons, or None on the first sample or a counter rollback.
    pub fn ingest(&mut self, value: f64, config: &EstimatorConfig) -> Option<NormalizedDelta> {
        let prev = self.last_counter;
        let (unit, ambiguous) = self.classify(value, prev, config);
        if ambiguous {
            warn!(
                "counter {:.0} within ambiguity band of {:.0}; classified as {:?} by prior sample",
                value, config.liters_magnitude_threshold, unit
            );
        }
        self.last_counter = Some(value);
        self.last_unit = Some(unit);

        let prev = prev?;
        let raw_delta = value - prev;
        if raw_delta < 0.0 {
            // ECU reset or counter rollback; skip the interval.
            warn!("counter rolled back {:.1} -> {:.1}, interval skipped", prev, value);
            return None;
        }
        let delta_gal = match unit {
            CounterUnit::Gallons => raw_delta,
            CounterUnit::Liters => raw_delta / LITERS_PER_GALLON,
        };
        Some(NormalizedDelta { delta_gal, unit, ambiguous })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_large_counter_is_liters() {
        let config = EstimatorConfig::default();
        let mut norm = UnitNormalizer::new();
        norm.ingest(500_000.0, &config);
        assert_eq!(norm.last_unit, Some(CounterUnit::Liters));

        let delta = norm.ingest(500_378.541, &config).unwrap();
        assert_eq!(delta.unit, CounterUnit::Liters);
        assert_relative_eq!(delta.delta_gal, 100.0, epsilon = 1e-6);
    }

    #[test]
    fn test_small_counter_is_gallons() {
        let config = EstimatorConfig::default();
        let mut norm = UnitNormalizer::new();
        norm.ingest(50_000.0, &config);
        assert_eq!(norm.last_unit, Some(CounterUnit::Gallons));

        let delta = norm.ingest(50_010.0, &config).unwrap();
        assert_eq!(delta.unit, CounterUnit::Gallons);
        assert_relative_eq!(delta.delta_gal, 10.0, epsilon = 1e-9);
    }

    #[test]
    fn test_ambiguous_value_keeps_previous_unit() {
        let config = EstimatorConfig::default();
        let mut norm = UnitNormalizer::new();
        // Clearly gallons first, then a value inside the ±10% band.
        norm.ingest(200_000.0, &config);
        let delta = norm.ingest(295_000.0, &config).unwrap();
        assert_eq!(delta.unit, CounterUnit::Gallons);
        assert!(delta.ambiguous);
    }

    #[test]
    fn test_rollback_skips_interval() {
        let config = EstimatorConfig::default();
        let mut norm = UnitNormalizer::new();
        norm.ingest(50_000.0, &config);
        assert!(norm.ingest(10.0, &config).is_none());
        // Next interval proceeds from the new baseline.
        let delta = norm.ingest(15.0, &config).unwrap();
        assert_relative_eq!(delta.delta_gal, 5.0, epsilon = 1e-9);
    }

    #[test]
    fn test_first_sample_yields_no_delta() {
        let config = EstimatorConfig::default();
        let mut norm = UnitNormalizer::new();
        assert!(norm.ingest(1_000.0, &config).is_none());
    }
}
