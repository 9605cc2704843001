//! Collection heuristics
//!
//! A heuristic decides when a concurrent cycle should start and which
//! regions form its collection set. Strategies share one trait and are
//! picked once, from [`HeuristicsKind`], when the heap is built.
//!
//! Candidates are regions holding dead bytes. They are ranked by garbage
//! ratio, `(region_size - live) / region_size`, highest first; equal ratios
//! go to the lower region id so selection is deterministic.

mod adaptive;
mod aggressive;
mod compact;
mod static_threshold;

use std::cmp::Ordering;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::HeapConfig;
use crate::region::RegionId;
use crate::stats::CycleSummary;

pub use adaptive::AdaptiveHeuristics;
pub use aggressive::AggressiveHeuristics;
pub use compact::CompactHeuristics;
pub use static_threshold::StaticHeuristics;

/// Why a collection was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GcCause {
    /// Requested by the embedder
    Explicit,
    /// An allocation could not be satisfied
    AllocationFailure,
    /// No cycle ran within the guaranteed interval
    GuaranteedInterval,
    /// Free space dropped below the minimum
    MinFreeThreshold,
    /// Learning phase of the adaptive heuristic
    Learning,
    /// Predicted to run out of memory before a cycle could finish
    AllocationRate,
    /// Enough was allocated since the last cycle (compact)
    AllocationThreshold,
    /// The aggressive heuristic collects continuously
    Always,
    /// Administrative command
    Admin,
}

/// Heap occupancy handed to the heuristics.
#[derive(Debug, Clone)]
pub struct HeuristicsContext {
    /// Soft capacity in bytes (target heap size)
    pub capacity: usize,
    /// Hard capacity in bytes
    pub max_capacity: usize,
    /// Object bytes in the heap
    pub used: usize,
    /// Bytes that can still be allocated before the soft capacity is reached
    pub available: usize,
    /// Region size in bytes
    pub region_size: usize,
    /// Bytes allocated since the last cycle started
    pub allocated_since_cycle: usize,
    /// Time since the last cycle started
    pub since_last_cycle: Duration,
    /// Force a cycle if none ran for this long
    pub guaranteed_interval: Option<Duration>,
}

/// A region eligible for the collection set.
#[derive(Debug, Clone, Copy)]
pub struct RegionCandidate {
    /// Region id
    pub id: RegionId,
    /// Object bytes in the region
    pub used: usize,
    /// Live bytes
    pub live: usize,
    /// Dead bytes (`used - live`)
    pub garbage: usize,
    /// `(region_size - live) / region_size`
    pub garbage_ratio: f64,
}

impl RegionCandidate {
    /// Build a candidate from region occupancy.
    pub fn new(id: RegionId, used: usize, live: usize, region_size: usize) -> Self {
        let live = live.min(region_size);
        Self {
            id,
            used,
            live,
            garbage: used.saturating_sub(live),
            garbage_ratio: (region_size - live) as f64 / region_size as f64,
        }
    }

    /// Garbage ratio as a percentage.
    #[inline]
    pub fn garbage_percent(&self) -> f64 {
        self.garbage_ratio * 100.0
    }
}

fn rank(a: &RegionCandidate, b: &RegionCandidate) -> Ordering {
    b.garbage_ratio
        .partial_cmp(&a.garbage_ratio)
        .unwrap_or(Ordering::Equal)
        .then(a.id.cmp(&b.id))
}

/// Collection-set under construction.
pub struct CollectionSetBuilder {
    candidates: Vec<RegionCandidate>,
    selected: Vec<RegionId>,
    live: usize,
    garbage: usize,
    max_regions: usize,
    immediate_garbage: usize,
}

impl CollectionSetBuilder {
    /// Start from `candidates`, ranked by garbage ratio.
    pub fn new(
        mut candidates: Vec<RegionCandidate>,
        max_regions: usize,
        immediate_garbage: usize,
    ) -> Self {
        candidates.sort_by(rank);
        Self {
            candidates,
            selected: Vec::new(),
            live: 0,
            garbage: 0,
            max_regions,
            immediate_garbage,
        }
    }

    /// Ranked candidates
    pub fn candidates(&self) -> &[RegionCandidate] {
        &self.candidates
    }

    /// Add a candidate. Returns false once the region budget is used up.
    pub fn add(&mut self, candidate: &RegionCandidate) -> bool {
        if self.is_full() {
            return false;
        }
        self.selected.push(candidate.id);
        self.live += candidate.live;
        self.garbage += candidate.garbage;
        true
    }

    /// Whether the region budget is used up
    pub fn is_full(&self) -> bool {
        self.selected.len() >= self.max_regions
    }

    /// Number of selected regions
    pub fn len(&self) -> usize {
        self.selected.len()
    }

    /// Whether nothing was selected
    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    /// Live bytes of the selected regions
    pub fn live_bytes(&self) -> usize {
        self.live
    }

    /// Garbage bytes of the selected regions
    pub fn garbage_bytes(&self) -> usize {
        self.garbage
    }

    /// Garbage already reclaimed without evacuation this cycle
    pub fn immediate_garbage(&self) -> usize {
        self.immediate_garbage
    }

    /// Whether immediate garbage alone makes evacuation not worth it.
    pub fn immediate_garbage_dominates(&self, threshold_percent: usize) -> bool {
        let candidate_garbage: usize = self.candidates.iter().map(|c| c.garbage).sum();
        let total = self.immediate_garbage + candidate_garbage;
        total > 0 && self.immediate_garbage * 100 > total * threshold_percent
    }

    /// Select every candidate whose garbage percentage reaches `threshold`.
    pub fn add_above(&mut self, threshold_percent: f64) {
        let picked: Vec<RegionCandidate> = self
            .candidates
            .iter()
            .filter(|c| c.garbage_percent() >= threshold_percent)
            .copied()
            .collect();
        for c in &picked {
            if !self.add(c) {
                break;
            }
        }
    }

    /// Freeze the selection.
    pub fn build(self) -> CollectionSet {
        let mut regions = self.selected;
        regions.sort();
        CollectionSet {
            regions,
            live_bytes: self.live,
            garbage_bytes: self.garbage,
        }
    }
}

/// Regions chosen for evacuation. Immutable once evacuation starts.
#[derive(Debug, Clone, Default)]
pub struct CollectionSet {
    regions: Vec<RegionId>,
    live_bytes: usize,
    garbage_bytes: usize,
}

impl CollectionSet {
    /// Build a collection set from explicit region ids.
    #[cfg(test)]
    pub(crate) fn from_regions(
        mut regions: Vec<RegionId>,
        dir: &crate::directory::RegionDirectory,
    ) -> Self {
        regions.sort();
        regions.dedup();
        let (live_bytes, garbage_bytes) = regions
            .iter()
            .filter_map(|&id| dir.region(id))
            .fold((0, 0), |(live, garbage), r| {
                (live + r.live(), garbage + r.used().saturating_sub(r.live()))
            });
        Self {
            regions,
            live_bytes,
            garbage_bytes,
        }
    }

    /// Region ids in address order
    pub fn regions(&self) -> &[RegionId] {
        &self.regions
    }

    /// Number of regions
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Whether `id` is in the set
    pub fn contains(&self, id: RegionId) -> bool {
        self.regions.binary_search(&id).is_ok()
    }

    /// Live bytes that must be copied
    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    /// Dead bytes reclaimed by evacuating the set
    pub fn garbage_bytes(&self) -> usize {
        self.garbage_bytes
    }
}

/// A collection strategy.
pub trait Heuristics: Send {
    /// Strategy name
    fn name(&self) -> &'static str;

    /// Decide whether to start a concurrent cycle now.
    fn should_start_cycle(&mut self, ctx: &HeuristicsContext) -> Option<GcCause>;

    /// Pick regions from the ranked candidates.
    fn select_collection_set(&mut self, cset: &mut CollectionSetBuilder, ctx: &HeuristicsContext);

    /// A cycle is starting
    fn record_cycle_start(&mut self) {}

    /// A cycle finished
    fn record_cycle_end(&mut self, _summary: &CycleSummary) {}

    /// A cycle had to degenerate
    fn record_degenerated(&mut self) {}

    /// A concurrent cycle completed without degenerating
    fn record_success(&mut self) {}
}

/// Triggers every strategy honors.
pub(crate) fn common_trigger(ctx: &HeuristicsContext) -> Option<GcCause> {
    match ctx.guaranteed_interval {
        Some(interval) if ctx.since_last_cycle >= interval => Some(GcCause::GuaranteedInterval),
        _ => None,
    }
}

/// Percentage of the soft capacity.
#[inline]
pub(crate) fn percent_of(capacity: usize, percent: usize) -> usize {
    capacity / 100 * percent + capacity % 100 * percent / 100
}

/// Heuristic selected in the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeuristicsKind {
    /// Fixed free-space and garbage thresholds
    Static,
    /// Learns cycle time and allocation rate
    #[default]
    Adaptive,
    /// Collects continuously and evacuates everything it can
    Aggressive,
    /// Collects often to keep the footprint small
    Compact,
}

impl HeuristicsKind {
    /// Instantiate the strategy.
    pub fn build(self, config: &HeapConfig) -> Box<dyn Heuristics> {
        match self {
            HeuristicsKind::Static => Box::new(StaticHeuristics::new(config)),
            HeuristicsKind::Adaptive => Box::new(AdaptiveHeuristics::new(config)),
            HeuristicsKind::Aggressive => Box::new(AggressiveHeuristics::new()),
            HeuristicsKind::Compact => Box::new(CompactHeuristics::new(config)),
        }
    }
}
