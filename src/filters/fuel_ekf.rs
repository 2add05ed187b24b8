//! Two-state fuel-level EKF.
//!
//! State vector x = [fuel_level_pct, consumption_rate_pct_per_min]:
//! - `fuel_level_pct` is the filtered tank level, 0-100
//! - `consumption_rate_pct_per_min` tracks how fast the level is dropping
//!
//! Predict integrates the physical consumption model; update observes only
//! the level through H = [1, 0]. The filter estimates and exposes the
//! innovation — classification of what an innovation *means* (refuel,
//! theft, bias) belongs to the caller.

use log::warn;
use nalgebra::{Matrix2, Vector2};
use serde::{Deserialize, Serialize};

use crate::config::EstimatorConfig;
use crate::physics;

/// Snapshot of the filter internals for output and persistence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FuelEkfState {
    pub fuel_level_pct: f64,
    pub consumption_rate_pct_per_min: f64,
    /// 1-sigma level uncertainty, percent points.
    pub uncertainty_pct: f64,
    pub covariance: [[f64; 2]; 2],
    pub predict_count: u64,
    pub update_count: u64,
    pub covariance_resets: u64,
}

pub struct FuelEkf {
    /// State vector [level %, rate %/min]
    state: Vector2<f64>,
    /// Error covariance [2x2]
    covariance: Matrix2<f64>,
    /// Initial covariance, kept for resets after numerical failure.
    initial_covariance: Matrix2<f64>,
    q_level: f64,
    q_rate: f64,
    rate_blend_alpha: f64,
    predict_count: u64,
    update_count: u64,
    covariance_resets: u64,
    initialized: bool,
}

impl FuelEkf {
    pub fn new(config: &EstimatorConfig) -> Self {
        let initial_covariance =
            Matrix2::from_diagonal(&Vector2::new(config.initial_level_var, config.initial_rate_var));
        Self {
            state: Vector2::new(0.0, config.idle_rate),
            covariance: initial_covariance,
            initial_covariance,
            q_level: config.q_level,
            q_rate: config.q_rate,
            rate_blend_alpha: config.rate_blend_alpha,
            predict_count: 0,
            update_count: 0,
            covariance_resets: 0,
            initialized: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Seed the level from the first measurement (or a refuel resync).
    /// Covariance returns to its initial value: the old uncertainty no
    /// longer describes the reseeded state.
    pub fn reseed(&mut self, level_pct: f64) {
        self.state[0] = level_pct.clamp(0.0, 100.0);
        self.covariance = self.initial_covariance;
        self.initialized = true;
    }

    /// Restore from a persisted snapshot.
    pub fn restore(&mut self, snapshot: &FuelEkfState) {
        self.state = Vector2::new(
            snapshot.fuel_level_pct,
            snapshot.consumption_rate_pct_per_min,
        );
        self.covariance = Matrix2::new(
            snapshot.covariance[0][0],
            snapshot.covariance[0][1],
            snapshot.covariance[1][0],
            snapshot.covariance[1][1],
        );
        self.predict_count = snapshot.predict_count;
        self.update_count = snapshot.update_count;
        self.covariance_resets = snapshot.covariance_resets;
        self.initialized = true;
        self.guard_numerics();
    }

    /// Time update. `dt_minutes == 0` is a no-op: state and covariance
    /// must pass through unchanged.
    pub fn predict(
        &mut self,
        dt_minutes: f64,
        engine_load_pct: f64,
        altitude_delta_m: f64,
        is_moving: bool,
        config: &EstimatorConfig,
    ) -> f64 {
        if dt_minutes <= 0.0 {
            return self.state[1];
        }

        let model_rate = physics::consumption_rate(
            engine_load_pct,
            altitude_delta_m,
            dt_minutes,
            is_moving,
            config,
        );

        // Rate: exponential blend toward the model; level: integrate the
        // blended rate over the interval.
        let alpha = self.rate_blend_alpha;
        let blended_rate = alpha * model_rate + (1.0 - alpha) * self.state[1];
        self.state[1] = blended_rate;
        self.state[0] = (self.state[0] - blended_rate * dt_minutes).clamp(0.0, 100.0);

        // Jacobian of the blend:
        //   level' = level - (α·model + (1-α)·rate)·dt
        //   rate'  = α·model + (1-α)·rate
        let f = Matrix2::new(1.0, -(1.0 - alpha) * dt_minutes, 0.0, 1.0 - alpha);

        // Process noise grows with engine load while moving: more dynamic
        // operation means the constant-coefficient model is less certain.
        let q_scale = if is_moving {
            1.0 + engine_load_pct / 100.0
        } else {
            1.0
        };
        let q = Matrix2::from_diagonal(&Vector2::new(
            self.q_level * q_scale * dt_minutes,
            self.q_rate * q_scale * dt_minutes,
        ));

        self.covariance = f * self.covariance * f.transpose() + q;
        self.predict_count += 1;
        self.guard_numerics();
        blended_rate
    }

    /// Innovation the next update would see, before any correction.
    pub fn predicted_innovation(&self, measurement_pct: f64) -> f64 {
        measurement_pct - self.state[0]
    }

    /// Measurement update with observation H = [1, 0] and scalar noise `r`.
    /// Returns the innovation for bias/event classification.
    pub fn update(&mut self, measurement_pct: f64, r: f64) -> f64 {
        let innovation = measurement_pct - self.state[0];

        let p = &self.covariance;
        let s = p[(0, 0)] + r;
        let k = Vector2::new(p[(0, 0)] / s, p[(1, 0)] / s);

        self.state += k * innovation;
        self.state[0] = self.state[0].clamp(0.0, 100.0);

        // Joseph-free form: P = (I - K·H)·P with H = [1, 0], then
        // symmetrize to keep P well conditioned.
        let i_kh = Matrix2::new(1.0 - k[0], 0.0, -k[1], 1.0);
        let updated = i_kh * self.covariance;
        self.covariance = (updated + updated.transpose()) * 0.5;

        self.update_count += 1;
        self.guard_numerics();
        innovation
    }

    pub fn fuel_level(&self) -> f64 {
        self.state[0]
    }

    pub fn consumption_rate(&self) -> f64 {
        self.state[1]
    }

    pub fn uncertainty(&self) -> f64 {
        self.covariance[(0, 0)].max(0.0).sqrt()
    }

    pub fn get_state(&self) -> FuelEkfState {
        FuelEkfState {
            fuel_level_pct: self.state[0],
            consumption_rate_pct_per_min: self.state[1],
            uncertainty_pct: self.uncertainty(),
            covariance: [
                [self.covariance[(0, 0)], self.covariance[(0, 1)]],
                [self.covariance[(1, 0)], self.covariance[(1, 1)]],
            ],
            predict_count: self.predict_count,
            update_count: self.update_count,
            covariance_resets: self.covariance_resets,
        }
    }

    /// Numerical failure recovery: non-finite state entries are repaired
    /// and a non-positive-semi-definite covariance is reset to its initial
    /// value. Estimation continues either way.
    fn guard_numerics(&mut self) {
        if !self.state[0].is_finite() {
            warn!("fuel level became non-finite, clamping to 0");
            self.state[0] = 0.0;
        }
        if !self.state[1].is_finite() {
            warn!("consumption rate became non-finite, clamping to 0");
            self.state[1] = 0.0;
        }

        let p = &self.covariance;
        let finite = p.iter().all(|v| v.is_finite());
        let psd = finite
            && p[(0, 0)] >= 0.0
            && p[(1, 1)] >= 0.0
            && p[(0, 0)] * p[(1, 1)] - p[(0, 1)] * p[(1, 0)] >= -1e-9;
        if !psd {
            warn!("covariance lost positive semi-definiteness, resetting to initial");
            self.covariance = self.initial_covariance;
            self.covariance_resets += 1;
        }
    }
}
