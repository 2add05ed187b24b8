// fleet.rs — Per-vehicle worker pool
//
// One tokio task and one mpsc channel per vehicle: samples for different
// vehicles never contend, and within a vehicle the channel guarantees the
// strictly sequential predict/update ordering the filter requires. The
// only cross-task data is the immutable Arc'd config. A panicking or
// cancelled vehicle task takes nothing else down.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::EstimatorConfig;
use crate::events::FuelEvent;
use crate::fuel_fusion::{FuelEstimate, FuelFusion};
use crate::snapshot;
use crate::types::TelemetrySample;

/// What a vehicle worker reports upward after each processed sample.
#[derive(Clone, Debug)]
pub struct FleetUpdate {
    pub vehicle_id: String,
    pub estimate: FuelEstimate,
    pub events: Vec<FuelEvent>,
}

enum WorkerMsg {
    Sample(TelemetrySample),
    /// Persist state now (periodic checkpoint and shutdown).
    Checkpoint,
}

struct VehicleWorker {
    tx: mpsc::Sender<WorkerMsg>,
    handle: JoinHandle<()>,
}

pub struct Fleet {
    config: Arc<EstimatorConfig>,
    snapshot_dir: Option<PathBuf>,
    workers: HashMap<String, VehicleWorker>,
    update_tx: mpsc::Sender<FleetUpdate>,
}

impl Fleet {
    /// `snapshot_dir: None` disables persistence (replay/tests).
    pub fn new(
        config: Arc<EstimatorConfig>,
        snapshot_dir: Option<PathBuf>,
    ) -> (Self, mpsc::Receiver<FleetUpdate>) {
        let (update_tx, update_rx) = mpsc::channel(1024);
        (
            Self {
                config,
                snapshot_dir,
                workers: HashMap::new(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Route a sample to its vehicle's worker, spawning one on first
    /// contact (restored from a snapshot when available).
    pub async fn dispatch(&mut self, vehicle_id: &str, sample: TelemetrySample) {
        if !self.workers.contains_key(vehicle_id) {
            let worker = self.spawn_worker(vehicle_id);
            self.workers.insert(vehicle_id.to_string(), worker);
        }
        let worker = &self.workers[vehicle_id];
        if worker.tx.send(WorkerMsg::Sample(sample)).await.is_err() {
            warn!("worker for {} is gone, sample dropped", vehicle_id);
        }
    }

    /// Ask every worker to persist its state.
    pub async fn checkpoint(&self) {
        for (vehicle_id, worker) in &self.workers {
            if worker.tx.send(WorkerMsg::Checkpoint).await.is_err() {
                warn!("worker for {} is gone, checkpoint skipped", vehicle_id);
            }
        }
    }

    /// Close all channels and wait for workers to drain and persist.
    pub async fn shutdown(self) {
        for (vehicle_id, worker) in self.workers {
            drop(worker.tx);
            if worker.handle.await.is_err() {
                warn!("worker for {} ended abnormally", vehicle_id);
            }
        }
    }

    pub fn vehicle_count(&self) -> usize {
        self.workers.len()
    }

    fn spawn_worker(&self, vehicle_id: &str) -> VehicleWorker {
        let (tx, mut rx) = mpsc::channel::<WorkerMsg>(256);
        let vehicle_id = vehicle_id.to_string();
        let config = Arc::clone(&self.config);
        let snapshot_dir = self.snapshot_dir.clone();
        let update_tx = self.update_tx.clone();

        let handle = tokio::spawn(async move {
            let mut fusion = match snapshot_dir
                .as_deref()
                .and_then(|dir| snapshot::load(dir, &vehicle_id).ok().flatten())
            {
                Some(snap) => {
                    info!("{}: restored from snapshot", vehicle_id);
                    FuelFusion::from_snapshot(snap, config)
                }
                None => FuelFusion::new(vehicle_id.clone(), config),
            };

            while let Some(msg) = rx.recv().await {
                match msg {
                    WorkerMsg::Sample(sample) => match fusion.process(&sample) {
                        Ok(events) => {
                            let update = FleetUpdate {
                                vehicle_id: vehicle_id.clone(),
                                estimate: fusion.estimate(),
                                events,
                            };
                            if update_tx.send(update).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!("{}: sample dropped: {}", vehicle_id, e),
                    },
                    WorkerMsg::Checkpoint => persist(&snapshot_dir, &fusion),
                }
            }
            // Channel closed: final checkpoint.
            persist(&snapshot_dir, &fusion);
        });

        VehicleWorker { tx, handle }
    }
}

fn persist(snapshot_dir: &Option<PathBuf>, fusion: &FuelFusion) {
    if let Some(dir) = snapshot_dir {
        if let Err(e) = snapshot::save(dir, &fusion.to_snapshot()) {
            // Previous snapshot stays valid; nothing to roll back.
            warn!("{}: snapshot write failed: {}", fusion.vehicle_id(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: f64, level: f64) -> TelemetrySample {
        TelemetrySample {
            timestamp: ts,
            fuel_level_pct: Some(level),
            engine_load_pct: Some(30.0),
            altitude_delta_m: None,
            speed_mph: Some(40.0),
            ambient_temp_f: None,
            ecu_fuel_counter: None,
            ecu_instant_mpg: None,
            distance_delta_mi: Some(0.6),
        }
    }

    #[tokio::test]
    async fn test_vehicles_are_independent() {
        let (mut fleet, mut updates) = Fleet::new(Arc::new(EstimatorConfig::default()), None);

        fleet.dispatch("a", sample(0.0, 80.0)).await;
        fleet.dispatch("b", sample(0.0, 20.0)).await;
        assert_eq!(fleet.vehicle_count(), 2);

        let mut levels = HashMap::new();
        for _ in 0..2 {
            let update = updates.recv().await.unwrap();
            levels.insert(update.vehicle_id.clone(), update.estimate.fuel_level_pct);
        }
        assert!((levels["a"] - 80.0).abs() < 1e-6);
        assert!((levels["b"] - 20.0).abs() < 1e-6);
        fleet.shutdown().await;
    }

    #[tokio::test]
    async fn test_out_of_order_sample_produces_no_update() {
        let (mut fleet, mut updates) = Fleet::new(Arc::new(EstimatorConfig::default()), None);
        fleet.dispatch("a", sample(100.0, 50.0)).await;
        fleet.dispatch("a", sample(50.0, 60.0)).await; // stale, dropped
        fleet.dispatch("a", sample(200.0, 49.5)).await;
        fleet.shutdown().await;

        let mut count = 0;
        while updates.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }
}
