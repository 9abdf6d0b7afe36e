use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::domain::CostTraceEntry;

/// Append-only destination for committed ticks.
pub trait TraceSink: Send + Sync {
    fn append(&self, entry: &CostTraceEntry) -> Result<()>;
}

/// One JSON object per line, flushed after every tick.
pub struct JsonLinesTraceSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesTraceSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("cannot create {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("cannot open trace file {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TraceSink for JsonLinesTraceSink {
    fn append(&self, entry: &CostTraceEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry).context("trace entry serialization failed")?;
        line.push(b'\n');
        let mut file = self.file.lock();
        file.write_all(&line)
            .and_then(|_| file.flush())
            .with_context(|| format!("trace write to {} failed", self.path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TickFlag;
    use chrono::{TimeZone, Utc};

    fn entry(tick: u64) -> CostTraceEntry {
        CostTraceEntry {
            tick,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, tick as u32, 0, 0).unwrap(),
            modulation: 0.5,
            thermal_kw: 7.0,
            electrical_kw: 2.0,
            node_temps_c: vec![60.0, 50.0, 40.0],
            grid_import_kwh: 0.5,
            renewable_surplus_kwh: 0.0,
            comfort_violation_k: 0.0,
            unmet_demand_kwh: 0.0,
            flags: vec![TickFlag::DemandShortfall],
        }
    }

    #[test]
    fn test_lines_are_appended_in_order() {
        let path = std::env::temp_dir()
            .join(format!("heat-mpc-{}", uuid::Uuid::new_v4()))
            .join("trace.jsonl");
        let sink = JsonLinesTraceSink::open(&path).unwrap();
        sink.append(&entry(0)).unwrap();
        sink.append(&entry(1)).unwrap();
        drop(sink);

        // reopening appends rather than truncating
        let sink = JsonLinesTraceSink::open(&path).unwrap();
        sink.append(&entry(2)).unwrap();

        let text = std::fs::read_to_string(sink.path()).unwrap();
        let ticks: Vec<u64> = text
            .lines()
            .map(|l| serde_json::from_str::<CostTraceEntry>(l).unwrap().tick)
            .collect();
        assert_eq!(ticks, vec![0, 1, 2]);
        assert!(text.contains("\"demand_shortfall\""));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
