use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use serde_json::json;

use fuel_tracker_rs::config::EstimatorConfig;
use fuel_tracker_rs::events::FuelEvent;
use fuel_tracker_rs::fuel_fusion::FuelFusion;
use fuel_tracker_rs::ingest;

#[derive(Parser, Debug)]
struct Args {
    /// Path to a single telemetry log (.jsonl[.gz] or session .json[.gz])
    #[arg(long, conflicts_with = "golden_dir")]
    log: Option<PathBuf>,

    /// Directory of golden logs to batch replay (processes fleet_*.json*)
    #[arg(long)]
    golden_dir: Option<PathBuf>,

    /// Level process noise (q_level)
    #[arg(long, default_value = "0.05")]
    q_level: f64,

    /// Rate process noise (q_rate)
    #[arg(long, default_value = "0.01")]
    q_rate: f64,

    /// Base measurement noise variance
    #[arg(long, default_value = "4.0")]
    measurement_noise: f64,

    /// Rate blend weight toward the physical model
    #[arg(long, default_value = "0.7")]
    rate_blend_alpha: f64,

    /// Tank capacity in gallons
    #[arg(long, default_value = "100.0")]
    tank_capacity: f64,
}

fn run_once(path: &Path, args: &Args) -> anyhow::Result<serde_json::Value> {
    let records = ingest::load_log(path)?;
    let config = Arc::new(EstimatorConfig {
        q_level: args.q_level,
        q_rate: args.q_rate,
        base_measurement_noise: args.measurement_noise,
        rate_blend_alpha: args.rate_blend_alpha,
        tank_capacity_gal: args.tank_capacity,
        ..EstimatorConfig::default()
    });

    let mut fusions: BTreeMap<String, FuelFusion> = BTreeMap::new();
    let mut refuels = 0u64;
    let mut thefts = 0u64;
    let mut bias_warnings = 0u64;
    let mut last_timestamp: f64 = 0.0;

    for record in &records {
        let fusion = fusions
            .entry(record.vehicle_id.clone())
            .or_insert_with(|| FuelFusion::new(record.vehicle_id.clone(), Arc::clone(&config)));
        last_timestamp = last_timestamp.max(record.sample.timestamp);
        let events = match fusion.process(&record.sample) {
            Ok(events) => events,
            Err(e) => {
                eprintln!("{}: {}", record.vehicle_id, e);
                continue;
            }
        };
        for event in events {
            count_event(&event, &mut refuels, &mut thefts, &mut bias_warnings);
        }
    }

    // Drain buffered refuels at end-of-log.
    let flush_at = last_timestamp + 1e6;
    let mut vehicles = Vec::new();
    for (vehicle_id, fusion) in fusions.iter_mut() {
        for event in fusion.flush(flush_at) {
            count_event(&event, &mut refuels, &mut thefts, &mut bias_warnings);
        }
        let estimate = fusion.estimate();
        vehicles.push(json!({
            "vehicle_id": vehicle_id,
            "fuel_level_pct": estimate.fuel_level_pct,
            "consumption_rate_pct_per_min": estimate.consumption_rate_pct_per_min,
            "uncertainty_pct": estimate.uncertainty_pct,
            "confidence": estimate.confidence,
            "smoothed_mpg": fusion.smoothed_mpg(),
            "overall_mpg": fusion.overall_mpg(),
            "ecu_status": format!("{:?}", fusion.ecu_status().status),
            "samples_processed": fusion.samples_processed(),
            "samples_dropped": fusion.samples_dropped(),
        }));
    }

    Ok(json!({
        "log": path.display().to_string(),
        "q_level": args.q_level,
        "q_rate": args.q_rate,
        "measurement_noise": args.measurement_noise,
        "rate_blend_alpha": args.rate_blend_alpha,
        "records": records.len(),
        "refuels": refuels,
        "theft_suspicions": thefts,
        "bias_warnings": bias_warnings,
        "vehicles": vehicles,
    }))
}

fn count_event(event: &FuelEvent, refuels: &mut u64, thefts: &mut u64, bias: &mut u64) {
    match event {
        FuelEvent::Refuel { .. } => *refuels += 1,
        FuelEvent::TheftSuspicion { .. } => *thefts += 1,
        FuelEvent::SensorBiasWarning { .. } => *bias += 1,
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let mut results = Vec::new();

    if let Some(dir) = args.golden_dir.as_ref() {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !(name.starts_with("fleet_")
                && (name.contains(".json") || name.contains(".jsonl")))
            {
                continue;
            }
            match run_once(&path, &args) {
                Ok(res) => results.push(res),
                Err(e) => eprintln!("Failed {}: {}", path.display(), e),
            }
        }
    } else if let Some(log) = args.log.as_ref() {
        results.push(run_once(log, &args)?);
    } else {
        anyhow::bail!("Provide --log or --golden-dir");
    }

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
