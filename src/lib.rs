//! Adaptive fuel-level estimation for noisy vehicle telemetry.
//!
//! Each vehicle gets an independent estimator: a 2-state EKF over fuel
//! level and consumption rate, an adaptive measurement-noise layer that
//! distinguishes random jitter from persistent sensor bias, ECU
//! cross-validation, a gated MPG engine, and refuel/theft event
//! classification. [`fuel_fusion::FuelFusion`] is the per-vehicle entry
//! point; [`fleet::Fleet`] runs one worker per vehicle.

pub mod config;
pub mod ecu;
pub mod events;
pub mod filters;
pub mod fleet;
pub mod fuel_fusion;
pub mod ingest;
pub mod mpg;
pub mod physics;
pub mod snapshot;
pub mod types;
pub mod units;

pub use config::EstimatorConfig;
pub use events::FuelEvent;
pub use fuel_fusion::{FuelEstimate, FuelFusion};
pub use types::TelemetrySample;
