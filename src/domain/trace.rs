use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ControlResult, TickFlag};

/// Realized outcome of one committed control step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostTraceEntry {
    pub tick: u64,
    pub timestamp: DateTime<Utc>,
    pub modulation: f64,
    pub thermal_kw: f64,
    pub electrical_kw: f64,
    pub node_temps_c: Vec<f64>,
    pub grid_import_kwh: f64,
    pub renewable_surplus_kwh: f64,
    /// Largest node excursion outside the safe envelope, either side (K)
    pub comfort_violation_k: f64,
    pub unmet_demand_kwh: f64,
    pub flags: Vec<TickFlag>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostTotals {
    pub ticks: usize,
    pub grid_import_kwh: f64,
    pub renewable_surplus_kwh: f64,
    pub unmet_demand_kwh: f64,
    pub worst_comfort_violation_k: f64,
    pub flagged_ticks: usize,
}

/// Append-only record of realized costs, ordered by tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostTrace {
    entries: Vec<CostTraceEntry>,
}

impl CostTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: CostTraceEntry) -> ControlResult<()> {
        if let Some(last) = self.entries.last() {
            if entry.tick <= last.tick {
                return Err(ControlError::InputValidation(format!(
                    "trace entry for tick {} after tick {}",
                    entry.tick, last.tick
                )));
            }
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[CostTraceEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&CostTraceEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn totals(&self) -> CostTotals {
        self.entries.iter().fold(CostTotals::default(), |mut acc, e| {
            acc.ticks += 1;
            acc.grid_import_kwh += e.grid_import_kwh;
            acc.renewable_surplus_kwh += e.renewable_surplus_kwh;
            acc.unmet_demand_kwh += e.unmet_demand_kwh;
            acc.worst_comfort_violation_k = acc.worst_comfort_violation_k.max(e.comfort_violation_k);
            if !e.flags.is_empty() {
                acc.flagged_ticks += 1;
            }
            acc
        })
    }
}
