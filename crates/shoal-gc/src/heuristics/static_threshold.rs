//! Static heuristic: fixed free-space trigger and garbage threshold.

use super::{
    CollectionSetBuilder, GcCause, Heuristics, HeuristicsContext, common_trigger, percent_of,
};
use crate::config::HeapConfig;

/// Starts a cycle when free space drops below `min_free_threshold_percent`
/// and evacuates every region at or above `garbage_threshold_percent`.
pub struct StaticHeuristics {
    min_free_percent: usize,
    garbage_threshold_percent: usize,
}

impl StaticHeuristics {
    /// Create from the heap configuration
    pub fn new(config: &HeapConfig) -> Self {
        Self {
            min_free_percent: config.min_free_threshold_percent,
            garbage_threshold_percent: config.garbage_threshold_percent,
        }
    }
}

impl Heuristics for StaticHeuristics {
    fn name(&self) -> &'static str {
        "static"
    }

    fn should_start_cycle(&mut self, ctx: &HeuristicsContext) -> Option<GcCause> {
        if ctx.available < percent_of(ctx.capacity, self.min_free_percent) {
            return Some(GcCause::MinFreeThreshold);
        }
        common_trigger(ctx)
    }

    fn select_collection_set(&mut self, cset: &mut CollectionSetBuilder, _ctx: &HeuristicsContext) {
        cset.add_above(self.garbage_threshold_percent as f64);
    }
}
