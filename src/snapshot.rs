// snapshot.rs — Versioned per-vehicle state persistence
//
// The estimator core does no I/O of its own; the fleet runner decides when
// to persist. Writes go through a temp file and an atomic rename so a torn
// write can never be loaded back as a start state: on any failure the
// previous snapshot survives untouched.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ecu::EcuValidation;
use crate::filters::fuel_ekf::FuelEkfState;
use crate::mpg::MpgEngine;
use crate::units::CounterUnit;

/// Bumped on any incompatible layout change; reloads check it.
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VehicleSnapshot {
    pub schema_version: u32,
    pub vehicle_id: String,
    pub ekf: FuelEkfState,
    pub innovation_history: Vec<f64>,
    pub sensor_fault_latched: bool,
    pub last_counter: Option<f64>,
    pub last_counter_unit: Option<CounterUnit>,
    pub mpg: MpgEngine,
    pub ecu_validation: EcuValidation,
    pub last_timestamp: Option<f64>,
    pub last_corrected_level: Option<f64>,
    pub samples_processed: u64,
    pub samples_dropped: u64,
}

fn snapshot_path(dir: &Path, vehicle_id: &str) -> PathBuf {
    // Vehicle ids come from external senders; keep filenames tame.
    let safe: String = vehicle_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    dir.join(format!("vehicle_{}.json", safe))
}

/// Atomically persist one vehicle's snapshot under `dir`.
pub fn save(dir: &Path, snapshot: &VehicleSnapshot) -> io::Result<()> {
    fs::create_dir_all(dir)?;
    let path = snapshot_path(dir, &snapshot.vehicle_id);
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(snapshot)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    fs::write(&tmp, json)?;
    fs::rename(&tmp, &path)
}

/// Load a vehicle's snapshot if one exists and its schema matches.
pub fn load(dir: &Path, vehicle_id: &str) -> io::Result<Option<VehicleSnapshot>> {
    let path = snapshot_path(dir, vehicle_id);
    let data = match fs::read_to_string(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let snapshot: VehicleSnapshot = serde_json::from_str(&data)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if snapshot.schema_version != SNAPSHOT_SCHEMA_VERSION {
        log::warn!(
            "snapshot for {} has schema {} (expected {}), starting fresh",
            vehicle_id,
            snapshot.schema_version,
            SNAPSHOT_SCHEMA_VERSION
        );
        return Ok(None);
    }
    Ok(Some(snapshot))
}
