// events.rs — Refuel / theft / bias event classification
//
// Consumes the innovation stream and movement context; the filter itself
// never classifies. Theft and refuel share one physical gate: movement
// implies normal consumption, so only a stationary deficit is suspicious,
// and a large positive spike is a refuel no matter how the bias window
// looks (a single spike is not a 4-sample persistent pattern).

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::config::EstimatorConfig;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum FuelEvent {
    Refuel {
        vehicle_id: String,
        timestamp: f64,
        gained_pct: f64,
        gained_gal: f64,
        confidence: f64,
        innovation: f64,
    },
    TheftSuspicion {
        vehicle_id: String,
        timestamp: f64,
        deficit_gal: f64,
        confidence: f64,
        /// Innovations observed across the deficit window.
        innovations: Vec<f64>,
    },
    SensorBiasWarning {
        vehicle_id: String,
        timestamp: f64,
        mean_innovation: f64,
        confidence: f64,
        innovations: Vec<f64>,
    },
}

impl FuelEvent {
    pub fn timestamp(&self) -> f64 {
        match self {
            FuelEvent::Refuel { timestamp, .. }
            | FuelEvent::TheftSuspicion { timestamp, .. }
            | FuelEvent::SensorBiasWarning { timestamp, .. } => *timestamp,
        }
    }
}

/// A refuel being buffered: rapid successive increases merge into one
/// event instead of a burst of small ones.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct PendingRefuel {
    first_timestamp: f64,
    last_timestamp: f64,
    total_gained_pct: f64,
    max_innovation: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EventClassifier {
    pending_refuel: Option<PendingRefuel>,
    /// (timestamp, gained_pct) of recently emitted refuels, for dedup.
    recent_refuels: VecDeque<(f64, f64)>,
    /// Unexplained stationary fuel loss, gallons, with its window start.
    deficit_gal: f64,
    deficit_window_start: Option<f64>,
    deficit_innovations: Vec<f64>,
}

impl EventClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one cycle's context. `innovation` is the pre-update level
    /// innovation (percent points) against the post-predict level, so its
    /// negative part is already the loss the model cannot explain.
    /// `speed_mph` is the movement gate.
    pub fn classify(
        &mut self,
        vehicle_id: &str,
        timestamp: f64,
        innovation: f64,
        speed_mph: f64,
        config: &EstimatorConfig,
    ) -> Vec<FuelEvent> {
        let mut events = Vec::new();

        // Flush a buffered refuel once its merge window has passed.
        if let Some(event) = self.flush_refuel(vehicle_id, timestamp, config) {
            events.push(event);
        }

        if innovation > config.refuel_threshold_pct {
            self.buffer_refuel(timestamp, innovation);
            // A genuine level jump ends any theft window.
            self.clear_deficit();
            return events;
        }

        // A stale window is retired before this cycle's contribution so a
        // new episode starts cleanly instead of inheriting its state.
        if let Some(start) = self.deficit_window_start {
            if timestamp - start > config.theft_window_secs {
                self.clear_deficit();
            }
        }

        // Theft bookkeeping: predict already charged the model's expected
        // use, so the negative innovation IS the unexplained deficit.
        // Gated on being effectively stationary.
        if speed_mph < config.theft_speed_gate_mph {
            let unexplained_pct = -innovation;
            if unexplained_pct > 0.0 {
                if self.deficit_window_start.is_none() {
                    self.deficit_window_start = Some(timestamp);
                }
                self.deficit_gal += unexplained_pct / 100.0 * config.tank_capacity_gal;
                self.deficit_innovations.push(innovation);
            }
        } else {
            // Moving implies normal consumption, not loss.
            self.clear_deficit();
        }

        if self.deficit_gal > config.theft_deficit_fraction * config.tank_capacity_gal {
            let confidence =
                (self.deficit_gal / (config.theft_deficit_fraction * config.tank_capacity_gal))
                    .min(2.0)
                    / 2.0;
            events.push(FuelEvent::TheftSuspicion {
                vehicle_id: vehicle_id.to_string(),
                timestamp,
                deficit_gal: self.deficit_gal,
                confidence,
                innovations: self.deficit_innovations.clone(),
            });
            self.clear_deficit();
        }

        events
    }

    /// Bias escalation from the adaptive detector, packaged as an event.
    pub fn bias_warning(
        &self,
        vehicle_id: &str,
        timestamp: f64,
        innovations: Vec<f64>,
        config: &EstimatorConfig,
    ) -> FuelEvent {
        let mean = if innovations.is_empty() {
            0.0
        } else {
            innovations.iter().sum::<f64>() / innovations.len() as f64
        };
        let confidence = (mean.abs() / config.bias_fault_magnitude).min(1.0);
        FuelEvent::SensorBiasWarning {
            vehicle_id: vehicle_id.to_string(),
            timestamp,
            mean_innovation: mean,
            confidence,
            innovations,
        }
    }

    /// True while a refuel is buffered; the orchestrator reseeds the
    /// filter level immediately but the event itself waits for the merge
    /// window.
    pub fn refuel_pending(&self) -> bool {
        self.pending_refuel.is_some()
    }

    /// Emit the buffered refuel if its merge window has elapsed.
    pub fn flush_refuel(
        &mut self,
        vehicle_id: &str,
        now: f64,
        config: &EstimatorConfig,
    ) -> Option<FuelEvent> {
        let pending = self.pending_refuel.as_ref()?;
        if now - pending.first_timestamp < config.refuel_merge_window_secs {
            return None;
        }
        let pending = self.pending_refuel.take()?;

        // Dedup against an already-recorded event within tolerance.
        let duplicate = self.recent_refuels.iter().any(|(ts, pct)| {
            (pending.first_timestamp - ts).abs() < config.refuel_dedup_secs
                && (pending.total_gained_pct - pct).abs() < config.refuel_dedup_pct
        });
        if duplicate {
            return None;
        }

        self.recent_refuels
            .push_back((pending.first_timestamp, pending.total_gained_pct));
        while self.recent_refuels.len() > 8 {
            self.recent_refuels.pop_front();
        }

        let gained_pct = pending.total_gained_pct;
        // Confidence grows with spike size relative to the threshold.
        let confidence = (pending.max_innovation / (2.0 * config.refuel_threshold_pct)).min(1.0);
        Some(FuelEvent::Refuel {
            vehicle_id: vehicle_id.to_string(),
            timestamp: pending.first_timestamp,
            gained_pct,
            gained_gal: gained_pct / 100.0 * config.tank_capacity_gal,
            confidence,
            innovation: pending.max_innovation,
        })
    }

    fn buffer_refuel(&mut self, timestamp: f64, innovation: f64) {
        match self.pending_refuel.as_mut() {
            Some(pending) => {
                pending.last_timestamp = timestamp;
                pending.total_gained_pct += innovation;
                pending.max_innovation = pending.max_innovation.max(innovation);
            }
            None => {
                self.pending_refuel = Some(PendingRefuel {
                    first_timestamp: timestamp,
                    last_timestamp: timestamp,
                    total_gained_pct: innovation,
                    max_innovation: innovation,
                });
            }
        }
    }

    fn clear_deficit(&mut self) {
        self.deficit_gal = 0.0;
        self.deficit_window_start = None;
        self.deficit_innovations.clear();
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
    fn test_large_positive_spike_is_refuel_not_bias() {
        let c = config();
        let mut classifier = EventClassifier::new();
        // Predicted 48.5, sensor 85.0: innovation 36.5.
        let events = classifier.classify("truck-1", 1000.0, 36.5, 0.0, &c);
        assert!(events.is_empty(), "refuel buffers, does not emit immediately");
        assert!(classifier.refuel_pending());

        // After the merge window the single merged event appears.
        let event = classifier.flush_refuel("truck-1", 1000.0 + 601.0, &c).unwrap();
        match event {
            FuelEvent::Refuel { gained_pct, innovation, .. } => {
                assert_relative_eq!(gained_pct, 36.5, epsilon = 1e-9);
                assert_relative_eq!(innovation, 36.5, epsilon = 1e-9);
            }
            other => panic!("expected Refuel, got {:?}", other),
        }
    }

    #[test]
    fn test_rapid_increases_merge_into_one_refuel() {
        let c = config();
        let mut classifier = EventClassifier::new();
        classifier.classify("truck-1", 1000.0, 15.0, 0.0, &c);
        classifier.classify("truck-1", 1060.0, 12.0, 0.0, &c);
        classifier.classify("truck-1", 1120.0, 11.0, 0.0, &c);

        let event = classifier.flush_refuel("truck-1", 1000.0 + 601.0, &c).unwrap();
        match event {
            FuelEvent::Refuel { gained_pct, .. } => {
                assert_relative_eq!(gained_pct, 38.0, epsilon = 1e-9);
            }
            other => panic!("expected Refuel, got {:?}", other),
        }
        // Nothing left pending.
        assert!(!classifier.refuel_pending());
    }

    #[test]
    fn test_refuel_dedup() {
        let c = config();
        let mut classifier = EventClassifier::new();
        classifier.classify("truck-1", 1000.0, 20.0, 0.0, &c);
        assert!(classifier.flush_refuel("truck-1", 1700.0, &c).is_some());

        // Same magnitude within the dedup tolerance window: suppressed.
        classifier.classify("truck-1", 1060.0, 20.3, 0.0, &c);
        assert!(classifier.flush_refuel("truck-1", 1800.0, &c).is_none());
    }

    #[test]
    fn test_stationary_deficit_triggers_theft() {
        let c = config();
        let mut classifier = EventClassifier::new();
        // Default tank 100 gal, theft at >2 gal deficit. Each cycle loses
        // 0.85% unexplained (0.85 gal): third cycle crosses 2.0 gal.
        let mut fired = Vec::new();
        for i in 0..4 {
            let ts = 1000.0 + i as f64 * 60.0;
            fired.extend(classifier.classify("truck-1", ts, -0.85, 0.0, &c));
        }
        assert!(fired.iter().any(|e| matches!(e, FuelEvent::TheftSuspicion { .. })));
        if let Some(FuelEvent::TheftSuspicion { deficit_gal, innovations, .. }) = fired.first() {
            assert!(*deficit_gal > 2.0);
            assert!(!innovations.is_empty());
        }
    }

    #[test]
    fn test_moving_vehicle_never_accumulates_theft_deficit() {
        let c = config();
        let mut classifier = EventClassifier::new();
        for i in 0..20 {
            let ts = 1000.0 + i as f64 * 60.0;
            let events = classifier.classify("truck-1", ts, -0.85, 45.0, &c);
            assert!(events.is_empty());
        }
    }

    #[test]
    fn test_slow_siphon_accumulates_full_deficit() {
        let c = config();
        let mut classifier = EventClassifier::new();
        // A slow siphon: 0.18% unexplained per minute (0.18 gal on a
        // 100 gal tank), 2.7 gal total over 15 minutes. The full negative
        // innovation must count; trimming it by the model's expected use
        // would leave this permanently under the 2.0 gal trigger.
        let mut fired = Vec::new();
        for i in 0..15 {
            let ts = 1000.0 + i as f64 * 60.0;
            fired.extend(classifier.classify("truck-1", ts, -0.18, 0.0, &c));
        }
        match fired.first() {
            Some(FuelEvent::TheftSuspicion { deficit_gal, .. }) => {
                assert!(*deficit_gal > 2.0);
            }
            other => panic!("expected TheftSuspicion, got {:?}", other),
        }
    }

    #[test]
    fn test_deficit_window_expires() {
        let c = config();
        let mut classifier = EventClassifier::new();
        classifier.classify("truck-1", 0.0, -0.85, 0.0, &c);
        // Next contribution lands past the 900 s window: the stale
        // accumulator is retired and a fresh episode starts at 0.85 gal.
        let events = classifier.classify("truck-1", 1000.0, -0.85, 0.0, &c);
        assert!(events.is_empty());
    }

    #[test]
    fn test_expired_window_does_not_swallow_new_episode() {
        let c = config();
        let mut classifier = EventClassifier::new();
        // One old contribution, then a gap past the 900 s window.
        classifier.classify("truck-1", 0.0, -0.85, 0.0, &c);

        // Three rapid losses after the gap form their own episode and must
        // cross the 2.0 gal trigger on the third sample; the first of them
        // belongs to the new window, not the discarded one.
        let mut fired = Vec::new();
        for i in 0..3 {
            let ts = 2000.0 + i as f64 * 60.0;
            fired.extend(classifier.classify("truck-1", ts, -0.85, 0.0, &c));
        }
        assert!(
            fired.iter().any(|e| matches!(e, FuelEvent::TheftSuspicion { .. })),
            "episode starting right after an expired window must still accumulate"
        );
    }
}
