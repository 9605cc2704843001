//! Collection statistics

use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::heuristics::GcCause;
use crate::reference::ReferenceStats;
use crate::safepoint::PauseStats;

/// How a cycle ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CycleKind {
    /// Concurrent phases completed with only short pauses
    Concurrent,
    /// Finished inside a single pause after cancellation
    Degenerated,
    /// Stop-the-world mark-compact
    Full,
}

fn as_micros<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_micros() as u64)
}

/// Outcome of one collection
#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    /// Cycle number
    pub gc_id: u64,
    /// Why it started
    pub cause: GcCause,
    /// How it ran
    pub kind: CycleKind,
    /// Regions in the collection set
    pub cset_regions: usize,
    /// Live bytes in the collection set at selection
    pub cset_live_bytes: usize,
    /// Bytes copied by evacuation or compaction
    pub bytes_copied: usize,
    /// Regions with no live data reclaimed at final mark
    pub immediate_regions: usize,
    /// Bytes those regions held
    pub immediate_bytes: usize,
    /// Regions handed back to the free set
    pub regions_recycled: usize,
    /// Heap usage when the cycle started
    pub used_before: usize,
    /// Heap usage when it ended
    pub used_after: usize,
    /// Reference processing outcome
    pub references: ReferenceStats,
    /// Wall-clock duration
    #[serde(rename = "duration_us", serialize_with = "as_micros")]
    pub duration: Duration,
}

impl CycleSummary {
    pub(crate) fn new(gc_id: u64, cause: GcCause, kind: CycleKind, used_before: usize) -> Self {
        Self {
            gc_id,
            cause,
            kind,
            cset_regions: 0,
            cset_live_bytes: 0,
            bytes_copied: 0,
            immediate_regions: 0,
            immediate_bytes: 0,
            regions_recycled: 0,
            used_before,
            used_after: used_before,
            references: ReferenceStats::default(),
            duration: Duration::ZERO,
        }
    }

    /// Bytes freed by this cycle
    pub fn reclaimed(&self) -> usize {
        self.used_before.saturating_sub(self.used_after)
    }
}

/// Cumulative collector statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct GcStats {
    /// Completed cycles of any kind
    pub cycles: u64,
    /// Concurrent cycles
    pub concurrent: u64,
    /// Degenerated cycles
    pub degenerated: u64,
    /// Full collections
    pub full: u64,
    /// Concurrent cycles that were cancelled
    pub cancelled: u64,
    /// Bytes copied by evacuation and compaction
    pub bytes_copied: u64,
    /// Bytes reclaimed
    pub bytes_reclaimed: u64,
    /// Regions handed back to the free set
    pub regions_recycled: u64,
    /// Objects whose evacuation failed
    pub evacuation_failures: u64,
    /// Races lost while evacuating
    pub evacuation_races: u64,
    /// Mark queue overflow events
    pub mark_overflows: u64,
    /// Weak, soft and phantom referents cleared
    pub references_cleared: u64,
    /// References appended to queues
    pub references_enqueued: u64,
    /// Regions uncommitted after idling
    pub regions_uncommitted: u64,
    /// Allocation failures injected
    pub injected_alloc_failures: u64,
    /// Evacuation failures injected
    pub injected_evac_failures: u64,
    /// Pauses taken
    #[serde(skip)]
    pub pauses: PauseStats,
    /// Most recent cycle
    pub last_cycle: Option<CycleSummary>,
}

impl GcStats {
    pub(crate) fn record(&mut self, summary: &CycleSummary) {
        self.cycles += 1;
        match summary.kind {
            CycleKind::Concurrent => self.concurrent += 1,
            CycleKind::Degenerated => self.degenerated += 1,
            CycleKind::Full => self.full += 1,
        }
        self.bytes_copied += summary.bytes_copied as u64;
        self.bytes_reclaimed += summary.reclaimed() as u64;
        self.regions_recycled += summary.regions_recycled as u64;
        self.references_cleared += summary.references.cleared as u64;
        self.references_enqueued += summary.references.enqueued as u64;
        self.last_cycle = Some(summary.clone());
    }
}
