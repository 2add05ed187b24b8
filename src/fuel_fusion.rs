// fuel_fusion.rs — Per-vehicle estimation cycle
//
// Everything in this module is independent of:
//   - tokio / async runtime
//   - the ingestion transport and snapshot storage
//   - alert delivery
//
// It takes telemetry samples in, produces fuel estimates and events out,
// so the whole cycle is unit-testable with recorded data and replayable
// from session logs without touching fleet plumbing.
//
// One FuelFusion per vehicle, exclusively owned by that vehicle's worker
// task; the only shared data is the immutable config.

use std::sync::Arc;

use log::{debug, warn};

use crate::config::EstimatorConfig;
use crate::ecu::{self, EcuValidation};
use crate::events::{EventClassifier, FuelEvent};
use crate::filters::adaptive::{AdaptiveNoise, BiasStatus};
use crate::filters::fuel_ekf::FuelEkf;
use crate::mpg::{FuelSource, MpgEngine};
use crate::snapshot::{VehicleSnapshot, SNAPSHOT_SCHEMA_VERSION};
use crate::types::{SampleError, TelemetrySample};
use crate::physics;
use crate::units::UnitNormalizer;

/// Current best estimate for one vehicle.
#[derive(Clone, Copy, Debug)]
pub struct FuelEstimate {
    pub fuel_level_pct: f64,
    pub consumption_rate_pct_per_min: f64,
    /// 1-sigma level uncertainty, percent points.
    pub uncertainty_pct: f64,
    /// 0-1; degraded by a latched sensor fault or ambiguous units.
    pub confidence: f64,
}

pub struct FuelFusion {
    vehicle_id: String,
    config: Arc<EstimatorConfig>,

    ekf: FuelEkf,
    adaptive: AdaptiveNoise,
    normalizer: UnitNormalizer,
    mpg: MpgEngine,
    classifier: EventClassifier,

    /// Latest ECU cross-validation verdict.
    ecu_validation: EcuValidation,
    /// Last cycle's unit classification was inside the ambiguity band.
    unit_ambiguous: bool,
    /// Last corrected sensor reading, for sensor-delta fuel accounting.
    last_corrected_level: Option<f64>,
    last_timestamp: Option<f64>,

    samples_processed: u64,
    samples_dropped: u64,
}

impl FuelFusion {
    pub fn new(vehicle_id: impl Into<String>, config: Arc<EstimatorConfig>) -> Self {
        let vehicle_id = vehicle_id.into();
        let config = config.for_vehicle(&vehicle_id);
        Self {
            vehicle_id,
            ekf: FuelEkf::new(&config),
            adaptive: AdaptiveNoise::new(&config),
            normalizer: UnitNormalizer::new(),
            mpg: MpgEngine::new(),
            classifier: EventClassifier::new(),
            ecu_validation: EcuValidation::uncalibrated(),
            unit_ambiguous: false,
            last_corrected_level: None,
            last_timestamp: None,
            samples_processed: 0,
            samples_dropped: 0,
            config,
        }
    }

    pub fn vehicle_id(&self) -> &str {
        &self.vehicle_id
    }

    /// Effective configuration, with this vehicle's tank capacity resolved.
    pub fn config(&self) -> &EstimatorConfig {
        &self.config
    }

    /// Run one predict/update cycle. Returns classified events; a
    /// malformed or out-of-order sample returns an error and leaves all
    /// state untouched.
    pub fn process(&mut self, sample: &TelemetrySample) -> Result<Vec<FuelEvent>, SampleError> {
        sample.validate().map_err(|e| {
            self.samples_dropped += 1;
            e
        })?;
        if let Some(last) = self.last_timestamp {
            if sample.timestamp <= last {
                self.samples_dropped += 1;
                return Err(SampleError::OutOfOrder {
                    timestamp: sample.timestamp,
                    last_timestamp: last,
                });
            }
        }

        let dt_minutes = self
            .last_timestamp
            .map(|last| (sample.timestamp - last) / 60.0)
            .unwrap_or(0.0);
        let engine_load = sample.engine_load_pct.unwrap_or(0.0);
        let altitude_delta = sample.altitude_delta_m.unwrap_or(0.0);
        let speed = sample.speed_mph.unwrap_or(0.0);
        let is_moving = sample.is_moving();

        // ── Predict ──
        let blended_rate =
            self.ekf
                .predict(dt_minutes, engine_load, altitude_delta, is_moving, &self.config);

        let mut events = Vec::new();
        let mut refueled = false;

        // ── Measurement update ──
        if let Some(raw_level) = sample.fuel_level_pct {
            let corrected = physics::correct_measurement(raw_level, sample.ambient_temp_f, &self.config);

            if !self.ekf.is_initialized() {
                self.ekf.reseed(corrected);
                debug!("{}: seeded at {:.1}%", self.vehicle_id, corrected);
            } else {
                let innovation = self.ekf.predicted_innovation(corrected);
                events.extend(self.classifier.classify(
                    &self.vehicle_id,
                    sample.timestamp,
                    innovation,
                    speed,
                    &self.config,
                ));

                if innovation > self.config.refuel_threshold_pct {
                    // A refuel is a legitimate step change: reseed the level
                    // rather than asking the filter to chase a 30-point jump.
                    self.ekf.reseed(corrected);
                    refueled = true;
                } else {
                    let (r, status) = self
                        .adaptive
                        .observe(innovation, self.config.base_measurement_noise);
                    self.ekf.update(corrected, r);
                    if status == BiasStatus::Escalated {
                        warn!(
                            "{}: persistent sensor bias escalated (innovation {:.2})",
                            self.vehicle_id, innovation
                        );
                        events.push(self.classifier.bias_warning(
                            &self.vehicle_id,
                            sample.timestamp,
                            self.adaptive.innovation_history(),
                            &self.config,
                        ));
                    }
                }
            }

            // ── Fuel accounting for the MPG engine ──
            let sensor_drop_gal = self
                .last_corrected_level
                .map(|prev| (prev - corrected).max(0.0) / 100.0 * self.config.tank_capacity_gal)
                .filter(|_| !refueled)
                .unwrap_or(0.0);
            self.last_corrected_level = Some(corrected);

            let (fuel_gal, source) = self.pick_fuel_source(sample, dt_minutes, sensor_drop_gal, blended_rate);
            let distance = sample.distance_delta_mi.unwrap_or(0.0);
            self.mpg.accumulate(fuel_gal, distance, source, sample.ecu_instant_mpg, &self.config);
        } else {
            // No level reading this tick; ECU/distance accounting still runs.
            let (fuel_gal, source) = self.pick_fuel_source(sample, dt_minutes, 0.0, blended_rate);
            let distance = sample.distance_delta_mi.unwrap_or(0.0);
            self.mpg.accumulate(fuel_gal, distance, source, sample.ecu_instant_mpg, &self.config);
        }

        self.last_timestamp = Some(sample.timestamp);
        self.samples_processed += 1;
        Ok(events)
    }

    /// Source priority: ECU counter delta, then sensor-level delta, then
    /// rate × time. A Critical cross-validation verdict demotes the ECU
    /// counter for the interval.
    fn pick_fuel_source(
        &mut self,
        sample: &TelemetrySample,
        dt_minutes: f64,
        sensor_drop_gal: f64,
        blended_rate: f64,
    ) -> (f64, FuelSource) {
        if let Some(counter) = sample.ecu_fuel_counter {
            if let Some(delta) = self.normalizer.ingest(counter, &self.config) {
                self.unit_ambiguous = delta.ambiguous;
                self.ecu_validation = ecu::cross_validate(
                    delta.delta_gal,
                    dt_minutes,
                    sample.engine_load_pct.unwrap_or(0.0),
                    sample.altitude_delta_m.unwrap_or(0.0),
                    sample.is_moving(),
                    &self.config,
                );
                if self.ecu_validation.status != ecu::EcuStatus::Critical {
                    return (delta.delta_gal, FuelSource::EcuCounter);
                }
                debug!(
                    "{}: ECU counter demoted, cross-validation critical",
                    self.vehicle_id
                );
            }
        }
        if sensor_drop_gal > 0.0 {
            return (sensor_drop_gal, FuelSource::SensorLevel);
        }
        let fallback_gal = blended_rate * dt_minutes / 100.0 * self.config.tank_capacity_gal;
        (fallback_gal.max(0.0), FuelSource::RateFallback)
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn estimate(&self) -> FuelEstimate {
        let uncertainty = self.ekf.uncertainty();
        // Confidence: uncertainty shrinks it smoothly; a latched fault or
        // ambiguous unit classification applies a hard discount.
        let mut confidence = (1.0 / (1.0 + uncertainty / 5.0)).clamp(0.0, 1.0);
        if self.adaptive.fault_latched() {
            confidence *= 0.5;
        }
        if self.unit_ambiguous {
            confidence *= 0.8;
        }
        FuelEstimate {
            fuel_level_pct: self.ekf.fuel_level(),
            consumption_rate_pct_per_min: self.ekf.consumption_rate(),
            uncertainty_pct: uncertainty,
            confidence,
        }
    }

    pub fn ecu_status(&self) -> EcuValidation {
        self.ecu_validation
    }

    pub fn smoothed_mpg(&self) -> Option<f64> {
        self.mpg.smoothed_mpg
    }

    pub fn overall_mpg(&self) -> Option<f64> {
        self.mpg.overall_mpg()
    }

    /// Force out any buffered refuel event (end of session).
    pub fn flush(&mut self, now: f64) -> Vec<FuelEvent> {
        let deadline = now + self.config.refuel_merge_window_secs;
        self.classifier
            .flush_refuel(&self.vehicle_id, deadline, &self.config)
            .into_iter()
            .collect()
    }

    /// Explicit external reset: fresh covariance and cleared windows; the
    /// next level reading reseeds the state.
    pub fn reset(&mut self) {
        let config = Arc::clone(&self.config);
        self.ekf = FuelEkf::new(&config);
        self.adaptive.reset();
        self.last_corrected_level = None;
    }

    // ── Persistence ──────────────────────────────────────────────────────

    pub fn to_snapshot(&self) -> VehicleSnapshot {
        VehicleSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            vehicle_id: self.vehicle_id.clone(),
            ekf: self.ekf.get_state(),
            innovation_history: self.adaptive.innovation_history(),
            sensor_fault_latched: self.adaptive.fault_latched(),
            last_counter: self.normalizer.last_counter,
            last_counter_unit: self.normalizer.last_unit,
            mpg: self.mpg.clone(),
            ecu_validation: self.ecu_validation,
            last_timestamp: self.last_timestamp,
            last_corrected_level: self.last_corrected_level,
            samples_processed: self.samples_processed,
            samples_dropped: self.samples_dropped,
        }
    }

    pub fn from_snapshot(snapshot: VehicleSnapshot, config: Arc<EstimatorConfig>) -> Self {
        let mut fusion = Self::new(snapshot.vehicle_id.clone(), config);
        fusion.ekf.restore(&snapshot.ekf);
        fusion
            .adaptive
            .restore_history(&snapshot.innovation_history, snapshot.sensor_fault_latched);
        fusion.normalizer =
            UnitNormalizer::with_state(snapshot.last_counter, snapshot.last_counter_unit);
        fusion.mpg = snapshot.mpg;
        fusion.ecu_validation = snapshot.ecu_validation;
        fusion.last_timestamp = snapshot.last_timestamp;
        fusion.last_corrected_level = snapshot.last_corrected_level;
        fusion.samples_processed = snapshot.samples_processed;
        fusion.samples_dropped = snapshot.samples_dropped;
        fusion
    }

    pub fn samples_processed(&self) -> u64 {
        self.samples_processed
    }

    pub fn samples_dropped(&self) -> u64 {
        self.samples_dropped
    }
}
