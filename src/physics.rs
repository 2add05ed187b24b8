// physics.rs — Physical consumption model and sensor corrections
//
// The consumption model is a pure function shared by the EKF predict step
// and ECU cross-validation. Both callers MUST go through this one
// implementation: if they diverged, a mismatch between "predicted" and
// "ECU-reported" consumption could no longer be attributed to the ECU.

use crate::config::EstimatorConfig;

/// Predicted fuel consumption rate in %/min.
///
/// Moving:     rate = baseline + load_factor × load + altitude_factor × climb_rate
/// Stationary: fixed idle rate.
///
/// `altitude_delta_m` is the altitude change over `dt_minutes`; the model
/// works with the climb rate (m/min), so sample interval drops out.
pub fn consumption_rate(
    engine_load_pct: f64,
    altitude_delta_m: f64,
    dt_minutes: f64,
    is_moving: bool,
    config: &EstimatorConfig,
) -> f64 {
    if !is_moving {
        return config.idle_rate;
    }
    let climb_rate = if dt_minutes > 0.0 {
        altitude_delta_m / dt_minutes
    } else {
        0.0
    };
    let rate = config.baseline_rate
        + config.load_factor * engine_load_pct
        + config.altitude_factor * climb_rate;
    rate.max(0.0)
}

/// Thermal expansion correction for capacitive level senders.
///
/// The sensor measures volume, not mass; diesel expands roughly 0.067% per
/// degree F, so a warm tank reads high. Referenced to 60°F.
pub fn temperature_correction(level_pct: f64, temp_f: f64, config: &EstimatorConfig) -> f64 {
    let corrected =
        level_pct * (1.0 - (temp_f - config.temp_reference_f) * config.temp_coefficient_per_f);
    corrected.clamp(0.0, 100.0)
}

/// Biodiesel dielectric correction factor.
///
/// Higher blend percentages raise the fuel's dielectric constant, so a
/// capacitive sender reads artificially high. Discounts per common blends;
/// intermediate blends take the next lower bracket.
pub fn biodiesel_correction(blend_pct: f64) -> f64 {
    if blend_pct >= 20.0 {
        0.988
    } else if blend_pct >= 10.0 {
        0.994
    } else if blend_pct >= 5.0 {
        0.997
    } else {
        1.0
    }
}

/// Full raw-measurement correction pipeline, applied before the reading
/// enters the EKF update.
pub fn correct_measurement(
    level_pct: f64,
    ambient_temp_f: Option<f64>,
    config: &EstimatorConfig,
) -> f64 {
    let mut corrected = level_pct * biodiesel_correction(config.biodiesel_blend_pct);
    if let Some(temp) = ambient_temp_f {
        corrected = temperature_correction(corrected, temp, config);
    }
    corrected.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_idle_rate() {
        let config = EstimatorConfig::default();
        let rate = consumption_rate(0.0, 0.0, 1.0, false, &config);
        assert_relative_eq!(rate, 0.05, epsilon = 1e-9);
    }

    #[test]
    fn test_loaded_climb_rate() {
        // load=80, +50 m over 60 s: 0.5 + 0.01*80 + 0.002*50 = 1.4 %/min
        let config = EstimatorConfig::default();
        let rate = consumption_rate(80.0, 50.0, 1.0, true, &config);
        assert_relative_eq!(rate, 1.4, epsilon = 1e-9);
    }

    #[test]
    fn test_descent_never_negative() {
        let config = EstimatorConfig::default();
        let rate = consumption_rate(0.0, -2000.0, 1.0, true, &config);
        assert!(rate >= 0.0);
    }

    #[test]
    fn test_temperature_correction_warm_tank_reads_high() {
        let config = EstimatorConfig::default();
        // 100°F: 40° above reference, correction shrinks the reading
        let corrected = temperature_correction(50.0, 100.0, &config);
        assert!(corrected < 50.0);
        assert_relative_eq!(corrected, 50.0 * (1.0 - 40.0 * 0.00067), epsilon = 1e-9);
    }

    #[test]
    fn test_temperature_correction_at_reference() {
        let config = EstimatorConfig::default();
        assert_relative_eq!(temperature_correction(50.0, 60.0, &config), 50.0);
    }

    #[test]
    fn test_biodiesel_brackets() {
        assert_relative_eq!(biodiesel_correction(0.0), 1.0);
        assert_relative_eq!(biodiesel_correction(5.0), 0.997);
        assert_relative_eq!(biodiesel_correction(10.0), 0.994);
        assert_relative_eq!(biodiesel_correction(20.0), 0.988);
        // B15 takes the B10 bracket
        assert_relative_eq!(biodiesel_correction(15.0), 0.994);
    }
}
