//! Telemetry log readers.
//!
//! Two on-disk shapes are accepted: JSONL (one record per line, the live
//! collector format) and a single JSON document with a `records` array,
//! optionally gzip-compressed (archived sessions). Records carry the
//! vehicle id alongside the sample so one log can interleave a whole
//! fleet.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use anyhow::Context;
use flate2::read::GzDecoder;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::types::TelemetrySample;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FleetRecord {
    pub vehicle_id: String,
    #[serde(flatten)]
    pub sample: TelemetrySample,
}

#[derive(Deserialize)]
struct SessionFile {
    records: Vec<FleetRecord>,
}

fn open_reader(path: &Path) -> anyhow::Result<Box<dyn Read>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

/// Load a whole log into memory, picking the format from the extension:
/// `.jsonl[.gz]` is line-delimited, anything else is a session document.
pub fn load_log(path: &Path) -> anyhow::Result<Vec<FleetRecord>> {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if name.ends_with(".jsonl") || name.ends_with(".jsonl.gz") {
        load_jsonl(path)
    } else {
        let reader = BufReader::new(open_reader(path)?);
        let session: SessionFile = serde_json::from_reader(reader)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(session.records)
    }
}

fn load_jsonl(path: &Path) -> anyhow::Result<Vec<FleetRecord>> {
    let reader = BufReader::new(open_reader(path)?);
    let mut records = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        // A corrupt line loses one sample, not the session.
        match serde_json::from_str::<FleetRecord>(&line) {
            Ok(record) => records.push(record),
            Err(e) => warn!("{}:{}: skipping bad record: {}", path.display(), lineno + 1, e),
        }
    }
    Ok(records)
}
