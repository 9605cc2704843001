//! Administrative commands
//!
//! Diagnostic-command style operations on a running heap. Commands parse
//! from their textual form (`full-gc`, `set-target-heap-size <bytes>`,
//! `region-sampling`) or deserialize from JSON; output serializes to JSON.

use std::str::FromStr;
use std::sync::atomic::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{GcError, GcResult};
use crate::heap::Heap;
use crate::heuristics::GcCause;
use crate::region::RegionSample;
use crate::stats::CycleSummary;

/// Command accepted by [`Heap::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdminCommand {
    /// Run a full compacting collection now
    FullGc,
    /// Change the soft heap size the heuristics aim for
    SetTargetHeapSize(usize),
    /// Report the occupancy of every region
    RegionSampling,
}

impl FromStr for AdminCommand {
    type Err = GcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let command = match (words.next(), words.next()) {
            (Some("full-gc"), None) => AdminCommand::FullGc,
            (Some("region-sampling"), None) => AdminCommand::RegionSampling,
            (Some("set-target-heap-size"), Some(bytes)) => AdminCommand::SetTargetHeapSize(
                bytes
                    .parse()
                    .map_err(|_| GcError::UnknownCommand(s.to_string()))?,
            ),
            _ => return Err(GcError::UnknownCommand(s.to_string())),
        };
        if words.next().is_some() {
            return Err(GcError::UnknownCommand(s.to_string()));
        }
        Ok(command)
    }
}

/// Result of an [`AdminCommand`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdminOutput {
    /// Summary of the collection that ran
    Collected(CycleSummary),
    /// Target heap size before and after the change
    TargetHeapSize {
        /// Old target in bytes
        previous: usize,
        /// New target in bytes
        current: usize,
    },
    /// One sample per region
    Regions(Vec<RegionSample>),
}

impl AdminOutput {
    /// Render as JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl Heap {
    /// Run an administrative command.
    ///
    /// Lowering the target heap size below the bytes in use starts a cycle:
    /// the request goes to the [`ControlThread`](crate::ControlThread) if one
    /// is running, otherwise the cycle runs on the calling thread before
    /// this returns.
    ///
    /// Must not be called from inside a [`MutatorScope`](crate::MutatorScope).
    pub fn execute(&self, command: AdminCommand) -> GcResult<AdminOutput> {
        tracing::info!(target: "shoal::gc", ?command, "Admin command");
        match command {
            AdminCommand::FullGc => self.collect_full(GcCause::Admin).map(AdminOutput::Collected),
            AdminCommand::SetTargetHeapSize(bytes) => {
                let capacity = self.capacity();
                let region_size = self.directory.region_size();
                if bytes < region_size || bytes > capacity {
                    return Err(GcError::InvalidConfig(format!(
                        "target heap size {bytes} must be between {region_size} and {capacity}"
                    )));
                }
                let previous = self.target_heap_size.swap(bytes, Ordering::Relaxed);
                tracing::info!(target: "shoal::gc", previous, current = bytes, "Target heap size changed");
                if self.used_bytes() > bytes {
                    if self.has_control_thread() {
                        self.request_gc(GcCause::Admin);
                    } else {
                        self.collect(GcCause::Admin)?;
                    }
                }
                Ok(AdminOutput::TargetHeapSize {
                    previous,
                    current: bytes,
                })
            }
            AdminCommand::RegionSampling => Ok(AdminOutput::Regions(self.directory.snapshot())),
        }
    }
}
