//! Innovation-driven measurement noise adaptation and bias detection.
//!
//! Two independent mechanisms share the innovation stream:
//!
//! 1. Magnitude tiering: small innovations tighten R (trust the sensor),
//!    large ones loosen it.
//! 2. A short sliding window that separates persistent one-directional
//!    bias from random noise. Four same-signed innovations each past the
//!    trigger magnitude means the sensor is drifting, not noisy, and R is
//!    forced to the highest tier so the filter stops chasing it.
//!
//! Detection is statistical; correction is policy and lives with the
//! caller. In particular a stationary vehicle with persistent downward
//! bias is exactly the theft signature, so nothing here ever resyncs the
//! level to the raw sensor.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::config::EstimatorConfig;

/// Noise tier multipliers by innovation magnitude.
const TIER_TIGHT: f64 = 0.7;
const TIER_NOMINAL: f64 = 1.0;
const TIER_LOOSE: f64 = 1.5;
const TIER_DISTRUST: f64 = 2.5;

/// What the bias window currently says about the sensor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BiasStatus {
    /// No one-directional pattern.
    Clear,
    /// Short-window persistent bias: R is forced high, no event yet.
    Persistent,
    /// Long-window bias past the hard threshold: surface a SensorFault
    /// warning to the caller; estimation continues with degraded
    /// confidence.
    Escalated,
}

#[derive(Clone, Debug)]
pub struct AdaptiveNoise {
    /// Short window for persistence detection, 4 samples by default.
    window: VecDeque<f64>,
    window_len: usize,
    trigger_magnitude: f64,
    /// Longer window for fault escalation.
    fault_window: VecDeque<f64>,
    fault_window_len: usize,
    fault_magnitude: f64,
    /// Latched once escalated; cleared only by an explicit reset.
    fault_latched: bool,
}

impl AdaptiveNoise {
    pub fn new(config: &EstimatorConfig) -> Self {
        Self {
            window: VecDeque::with_capacity(config.bias_window),
            window_len: config.bias_window.max(2),
            trigger_magnitude: config.bias_trigger_magnitude,
            fault_window: VecDeque::with_capacity(config.bias_fault_window),
            fault_window_len: config.bias_fault_window.max(2),
            fault_magnitude: config.bias_fault_magnitude,
            fault_latched: false,
        }
    }

    /// Noise multiplier for a given innovation magnitude, ignoring the
    /// bias window.
    fn tier(innovation: f64) -> f64 {
        let mag = innovation.abs();
        if mag < 2.0 {
            TIER_TIGHT
        } else if mag < 5.0 {
            TIER_NOMINAL
        } else if mag < 10.0 {
            TIER_LOOSE
        } else {
            TIER_DISTRUST
        }
    }

    fn window_is_biased(window: &VecDeque<f64>, len: usize, magnitude: f64) -> bool {
        if window.len() < len {
            return false;
        }
        let all_positive = window.iter().all(|y| *y > magnitude);
        let all_negative = window.iter().all(|y| *y < -magnitude);
        all_positive || all_negative
    }

    /// Record a raw (pre-update) innovation and return the measurement
    /// noise to use for this update plus the bias classification.
    pub fn observe(&mut self, innovation: f64, base_r: f64) -> (f64, BiasStatus) {
        self.window.push_back(innovation);
        while self.window.len() > self.window_len {
            self.window.pop_front();
        }
        self.fault_window.push_back(innovation);
        while self.fault_window.len() > self.fault_window_len {
            self.fault_window.pop_front();
        }

        let persistent =
            Self::window_is_biased(&self.window, self.window_len, self.trigger_magnitude);
        let escalated =
            Self::window_is_biased(&self.fault_window, self.fault_window_len, self.fault_magnitude);

        let status = if escalated && !self.fault_latched {
            self.fault_latched = true;
            BiasStatus::Escalated
        } else if persistent {
            BiasStatus::Persistent
        } else {
            BiasStatus::Clear
        };

        // Persistent bias overrides the magnitude tier: individual
        // innovations may be small, but the filter must not chase a
        // miscalibrated sensor.
        let scale = if persistent {
            TIER_DISTRUST
        } else {
            Self::tier(innovation)
        };
        (base_r * scale, status)
    }

    /// True once a fault has been escalated; confidence reporting keys
    /// off this.
    pub fn fault_latched(&self) -> bool {
        self.fault_latched
    }

    pub fn innovation_history(&self) -> Vec<f64> {
        self.window.iter().copied().collect()
    }

    /// Restore the short window from a persisted snapshot.
    pub fn restore_history(&mut self, history: &[f64], fault_latched: bool) {
        self.window.clear();
        for y in history.iter().rev().take(self.window_len).rev() {
            self.window.push_back(*y);
        }
        self.fault_latched = fault_latched;
    }

    /// Explicit external reset (e.g. after sensor service).
    pub fn reset(&mut self) {
        self.window.clear();
        self.fault_window.clear();
        self.fault_latched = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn detector() -> AdaptiveNoise {
        AdaptiveNoise::new(&EstimatorConfig::default())
    }

    #[test]
    fn test_tiering() {
        assert_relative_eq!(AdaptiveNoise::tier(1.0), 0.7);
        assert_relative_eq!(AdaptiveNoise::tier(-1.9), 0.7);
        assert_relative_eq!(AdaptiveNoise::tier(3.0), 1.0);
        assert_relative_eq!(AdaptiveNoise::tier(7.5), 1.5);
        assert_relative_eq!(AdaptiveNoise::tier(-36.5), 2.5);
    }

    #[test]
    fn test_alternating_signs_never_flag_bias() {
        let mut d = detector();
        let mut last = BiasStatus::Clear;
        for (i, y) in [1.5, -1.5, 1.5, -1.5, 1.4, -1.6, 1.7, -1.3].iter().enumerate() {
            let (_, status) = d.observe(*y, 4.0);
            last = status;
            assert_eq!(status, BiasStatus::Clear, "sample {} flagged bias", i);
        }
        assert_eq!(last, BiasStatus::Clear);
    }

    #[test]
    fn test_four_same_sign_innovations_flag_persistent() {
        let mut d = detector();
        d.observe(1.2, 4.0);
        d.observe(1.5, 4.0);
        d.observe(1.1, 4.0);
        let (r, status) = d.observe(1.3, 4.0);
        assert_eq!(status, BiasStatus::Persistent);
        // Forced to the distrust tier despite each |y| being in the
        // tight-tier band.
        assert_relative_eq!(r, 4.0 * 2.5);
    }

    #[test]
    fn test_negative_bias_also_flags() {
        let mut d = detector();
        for _ in 0..3 {
            d.observe(-1.5, 4.0);
        }
        let (_, status) = d.observe(-1.5, 4.0);
        assert_eq!(status, BiasStatus::Persistent);
    }

    #[test]
    fn test_subthreshold_magnitudes_do_not_flag() {
        let mut d = detector();
        for _ in 0..3 {
            d.observe(0.5, 4.0);
        }
        let (_, status) = d.observe(0.5, 4.0);
        assert_eq!(status, BiasStatus::Clear);
    }

    #[test]
    fn test_escalation_after_sustained_hard_bias() {
        let mut d = detector();
        let mut escalated = false;
        for _ in 0..12 {
            let (_, status) = d.observe(-6.0, 4.0);
            if status == BiasStatus::Escalated {
                escalated = true;
            }
        }
        assert!(escalated);
        assert!(d.fault_latched());
        // Escalation fires once; afterwards the window reports Persistent.
        let (_, status) = d.observe(-6.0, 4.0);
        assert_eq!(status, BiasStatus::Persistent);
    }

    #[test]
    fn test_reset_clears_latch() {
        let mut d = detector();
        for _ in 0..12 {
            d.observe(-6.0, 4.0);
        }
        assert!(d.fault_latched());
        d.reset();
        assert!(!d.fault_latched());
    }
}
