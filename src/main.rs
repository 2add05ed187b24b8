use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use tokio::time::{Duration, Instant};

use fuel_tracker_rs::config::EstimatorConfig;
use fuel_tracker_rs::events::FuelEvent;
use fuel_tracker_rs::fleet::Fleet;
use fuel_tracker_rs::ingest;

#[derive(Parser, Debug)]
#[command(name = "fuel_tracker")]
#[command(about = "Fleet fuel-level estimator - adaptive EKF over vehicle telemetry", long_about = None)]
struct Args {
    /// Telemetry log to process (.jsonl[.gz] or session .json[.gz])
    input: PathBuf,

    /// Snapshot directory (state restored from and persisted to)
    #[arg(long, default_value = "fuel_tracker_state")]
    state_dir: PathBuf,

    /// Disable snapshot persistence
    #[arg(long)]
    no_persist: bool,

    /// Seconds between periodic checkpoints
    #[arg(long, default_value = "15")]
    checkpoint_interval: u64,

    /// Default tank capacity in gallons
    #[arg(long, default_value = "100.0")]
    tank_capacity: f64,

    /// Per-vehicle capacity override, VEHICLE=GALLONS (repeatable)
    #[arg(long = "vehicle-tank", value_parser = parse_vehicle_tank)]
    vehicle_tank: Vec<(String, f64)>,

    /// Biodiesel blend percentage (0, 5, 10 or 20)
    #[arg(long, default_value = "0.0")]
    biodiesel_blend: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    println!("[{}] Fuel Tracker RS Starting", ts_now());
    println!("  Input: {}", args.input.display());
    println!("  State Dir: {}", args.state_dir.display());
    println!("  Tank Capacity: {} gal", args.tank_capacity);

    let config = Arc::new(EstimatorConfig {
        tank_capacity_gal: args.tank_capacity,
        tank_capacity_overrides_gal: args.vehicle_tank.iter().cloned().collect(),
        biodiesel_blend_pct: args.biodiesel_blend,
        ..EstimatorConfig::default()
    });

    let records = ingest::load_log(&args.input)?;
    println!("[{}] Loaded {} records", ts_now(), records.len());

    let state_dir = (!args.no_persist).then(|| args.state_dir.clone());
    let (mut fleet, mut updates) = Fleet::new(config, state_dir);

    let reporter = tokio::spawn(async move {
        let mut event_count = 0u64;
        let mut update_count = 0u64;
        let mut last_estimates: BTreeMap<String, f64> = BTreeMap::new();
        while let Some(update) = updates.recv().await {
            update_count += 1;
            last_estimates.insert(update.vehicle_id.clone(), update.estimate.fuel_level_pct);
            for event in &update.events {
                event_count += 1;
                print_event(event);
            }
        }
        (update_count, event_count, last_estimates)
    });

    let checkpoint_every = Duration::from_secs(args.checkpoint_interval.max(1));
    let mut last_checkpoint = Instant::now();

    for record in records {
        fleet.dispatch(&record.vehicle_id, record.sample).await;
        if last_checkpoint.elapsed() >= checkpoint_every {
            fleet.checkpoint().await;
            last_checkpoint = Instant::now();
        }
    }

    let vehicle_count = fleet.vehicle_count();
    fleet.shutdown().await;
    let (update_count, event_count, last_estimates) = reporter.await?;

    println!("\n=== Final Stats ===");
    println!("Vehicles: {}", vehicle_count);
    println!("Updates: {}", update_count);
    println!("Events: {}", event_count);
    for (vehicle_id, level) in &last_estimates {
        println!("  {}: {:.1}% fuel", vehicle_id, level);
    }

    Ok(())
}

fn print_event(event: &FuelEvent) {
    match event {
        FuelEvent::Refuel { vehicle_id, timestamp, gained_gal, confidence, .. } => {
            println!(
                "[REFUEL] {} t={:.0}s +{:.1} gal (conf {:.2})",
                vehicle_id, timestamp, gained_gal, confidence
            );
        }
        FuelEvent::TheftSuspicion { vehicle_id, timestamp, deficit_gal, confidence, .. } => {
            println!(
                "[THEFT?] {} t={:.0}s -{:.1} gal while stationary (conf {:.2})",
                vehicle_id, timestamp, deficit_gal, confidence
            );
        }
        FuelEvent::SensorBiasWarning { vehicle_id, timestamp, mean_innovation, .. } => {
            println!(
                "[BIAS] {} t={:.0}s mean innovation {:+.2}%",
                vehicle_id, timestamp, mean_innovation
            );
        }
    }
}

fn parse_vehicle_tank(s: &str) -> Result<(String, f64), String> {
    let (vehicle, capacity) = s
        .split_once('=')
        .ok_or_else(|| "expected VEHICLE=GALLONS".to_string())?;
    let capacity: f64 = capacity
        .parse()
        .map_err(|e| format!("bad capacity '{}': {}", capacity, e))?;
    if !(capacity > 0.0) {
        return Err(format!("capacity must be positive, got {}", capacity));
    }
    Ok((vehicle.to_string(), capacity))
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}
