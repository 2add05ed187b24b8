// ecu.rs — ECU-reported consumption sanity check
//
// Independent of filter state: compares the ECU's own consumption rate
// for an interval against the same physical model the EKF predicts with.
// Never overrides the filter; the result is a parallel sensor-health
// signal the MPG engine uses to demote ECU-sourced fuel deltas.

use serde::{Deserialize, Serialize};

use crate::config::EstimatorConfig;
use crate::physics;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EcuStatus {
    Ok,
    Warning,
    Critical,
    /// Consumption-model coefficients are unset for this vehicle class;
    /// deviation is meaningless.
    NoCalibration,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct EcuValidation {
    pub status: EcuStatus,
    /// |ecu - model| / model, when calibrated.
    pub deviation: Option<f64>,
}

impl EcuValidation {
    pub fn uncalibrated() -> Self {
        Self { status: EcuStatus::NoCalibration, deviation: None }
    }
}

/// Validate an interval's ECU consumption against the physical model.
///
/// `ecu_gal` is the unit-normalized counter delta; the interval's engine
/// load, altitude delta, and movement flag feed the shared model.
pub fn cross_validate(
    ecu_gal: f64,
    dt_minutes: f64,
    engine_load_pct: f64,
    altitude_delta_m: f64,
    is_moving: bool,
    config: &EstimatorConfig,
) -> EcuValidation {
    if !config.model_calibrated {
        return EcuValidation::uncalibrated();
    }
    if dt_minutes <= 0.0 {
        return EcuValidation::uncalibrated();
    }

    let ecu_rate_gpm = ecu_gal / dt_minutes;
    // A cumulative counter claiming a physically implausible burn rate is
    // itself a critical signal, regardless of model agreement.
    if ecu_rate_gpm < config.ecu_min_rate_gpm || ecu_rate_gpm > config.ecu_max_rate_gpm {
        return EcuValidation { status: EcuStatus::Critical, deviation: None };
    }

    let model_rate_pct_per_min = physics::consumption_rate(
        engine_load_pct,
        altitude_delta_m,
        dt_minutes,
        is_moving,
        config,
    );
    // Model speaks %/min; convert through tank capacity to gal/min.
    let model_rate_gpm = model_rate_pct_per_min / 100.0 * config.tank_capacity_gal;
    if model_rate_gpm <= 0.0 {
        return EcuValidation::uncalibrated();
    }

    let deviation = (ecu_rate_gpm - model_rate_gpm).abs() / model_rate_gpm;
    let status = if deviation < config.ecu_warning_deviation {
        EcuStatus::Ok
    } else if deviation <= config.ecu_critical_deviation {
        EcuStatus::Warning
    } else {
        EcuStatus::Critical
    };
    EcuValidation { status, deviation: Some(deviation) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EstimatorConfig {
        EstimatorConfig::default()
    }

    // Model at load=50, flat, moving: 0.5 + 0.01*50 = 1.0 %/min
    // = 1.0 gal/min with the default 100 gal tank.
    const DT_MIN: f64 = 10.0;

    #[test]
    fn test_matching_rate_is_ok() {
        let v = cross_validate(10.0, DT_MIN, 50.0, 0.0, true, &config());
        assert_eq!(v.status, EcuStatus::Ok);
        assert!(v.deviation.unwrap() < 0.01);
    }

    #[test]
    fn test_moderate_deviation_is_warning() {
        // ECU claims 1.2 gal/min vs 1.0 model: 20% off.
        let v = cross_validate(12.0, DT_MIN, 50.0, 0.0, true, &config());
        assert_eq!(v.status, EcuStatus::Warning);
    }

    #[test]
    fn test_large_deviation_is_critical() {
        // 1.5 gal/min vs 1.0 model: 50% off.
        let v = cross_validate(15.0, DT_MIN, 50.0, 0.0, true, &config());
        assert_eq!(v.status, EcuStatus::Critical);
    }

    #[test]
    fn test_implausible_rate_is_critical() {
        // 5 gal/min exceeds the 2.0 gal/min calibration bound.
        let v = cross_validate(50.0, DT_MIN, 50.0, 0.0, true, &config());
        assert_eq!(v.status, EcuStatus::Critical);
        assert!(v.deviation.is_none());
    }

    #[test]
    fn test_uncalibrated_model() {
        let mut c = config();
        c.model_calibrated = false;
        let v = cross_validate(10.0, DT_MIN, 50.0, 0.0, true, &c);
        assert_eq!(v.status, EcuStatus::NoCalibration);
    }
}
