//! Compact heuristic: trade throughput for a small footprint.

use super::{
    CollectionSetBuilder, GcCause, Heuristics, HeuristicsContext, common_trigger, percent_of,
};
use crate::config::HeapConfig;

/// Starts a cycle after every `compact_allocation_threshold_percent` of
/// allocation and evacuates regions with little garbage.
pub struct CompactHeuristics {
    min_free_percent: usize,
    allocation_threshold_percent: usize,
    garbage_threshold_percent: usize,
}

impl CompactHeuristics {
    /// Create from the heap configuration
    pub fn new(config: &HeapConfig) -> Self {
        Self {
            min_free_percent: config.min_free_threshold_percent,
            allocation_threshold_percent: config.compact_allocation_threshold_percent,
            garbage_threshold_percent: config.compact_garbage_threshold_percent,
        }
    }
}

impl Heuristics for CompactHeuristics {
    fn name(&self) -> &'static str {
        "compact"
    }

    fn should_start_cycle(&mut self, ctx: &HeuristicsContext) -> Option<GcCause> {
        if ctx.available < percent_of(ctx.capacity, self.min_free_percent) {
            return Some(GcCause::MinFreeThreshold);
        }
        if ctx.allocated_since_cycle > percent_of(ctx.capacity, self.allocation_threshold_percent)
        {
            return Some(GcCause::AllocationThreshold);
        }
        common_trigger(ctx)
    }

    fn select_collection_set(&mut self, cset: &mut CollectionSetBuilder, _ctx: &HeuristicsContext) {
        cset.add_above(self.garbage_threshold_percent as f64);
    }
}
