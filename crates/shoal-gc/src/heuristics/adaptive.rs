//! Adaptive heuristic
//!
//! Learns how long cycles take and how fast mutators allocate, and starts a
//! cycle when the heap would otherwise run out of space before the cycle
//! could finish. The safety margin, in standard deviations of cycle time,
//! widens after every degenerated cycle and slowly narrows again after
//! successful ones.

use std::collections::VecDeque;

use super::{
    CollectionSetBuilder, GcCause, Heuristics, HeuristicsContext, common_trigger, percent_of,
};
use crate::config::HeapConfig;
use crate::stats::CycleSummary;

const SAMPLES: usize = 10;
const INITIAL_MARGIN: f64 = 1.0;
const MIN_MARGIN: f64 = 0.1;
const MAX_MARGIN: f64 = 3.0;
const DEGENERATE_PENALTY: f64 = 0.1;
const SUCCESS_REWARD: f64 = 0.025;

/// Moving window over the last few samples.
#[derive(Debug, Default)]
struct TruncatedSeq {
    samples: VecDeque<f64>,
}

impl TruncatedSeq {
    fn add(&mut self, v: f64) {
        if self.samples.len() == SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(v);
    }

    fn avg(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    fn sd(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let avg = self.avg();
        let var = self.samples.iter().map(|v| (v - avg) * (v - avg)).sum::<f64>()
            / self.samples.len() as f64;
        var.sqrt()
    }
}

/// Feedback-driven heuristic.
pub struct AdaptiveHeuristics {
    min_free_percent: usize,
    init_free_percent: usize,
    learning_steps: usize,
    spike_percent: usize,
    evac_reserve_percent: usize,
    evac_waste: f64,
    garbage_threshold_percent: usize,
    cycle_secs: TruncatedSeq,
    margin: f64,
    completed: usize,
}

impl AdaptiveHeuristics {
    /// Create from the heap configuration
    pub fn new(config: &HeapConfig) -> Self {
        Self {
            min_free_percent: config.min_free_threshold_percent,
            init_free_percent: config.init_free_threshold_percent,
            learning_steps: config.learning_steps,
            spike_percent: config.alloc_spike_percent,
            evac_reserve_percent: config.evac_reserve_percent,
            evac_waste: config.evac_waste,
            garbage_threshold_percent: config.garbage_threshold_percent,
            cycle_secs: TruncatedSeq::default(),
            margin: INITIAL_MARGIN,
            completed: 0,
        }
    }

    /// Current safety margin in standard deviations
    pub fn margin(&self) -> f64 {
        self.margin
    }

    fn predicted_cycle_secs(&self) -> f64 {
        self.cycle_secs.avg() + self.margin * self.cycle_secs.sd()
    }
}

impl Heuristics for AdaptiveHeuristics {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn should_start_cycle(&mut self, ctx: &HeuristicsContext) -> Option<GcCause> {
        if ctx.available < percent_of(ctx.capacity, self.min_free_percent) {
            return Some(GcCause::MinFreeThreshold);
        }
        if self.completed < self.learning_steps
            && ctx.available < percent_of(ctx.capacity, self.init_free_percent)
        {
            return Some(GcCause::Learning);
        }

        let elapsed = ctx.since_last_cycle.as_secs_f64();
        if elapsed > 0.0 && ctx.allocated_since_cycle > 0 {
            let rate = ctx.allocated_since_cycle as f64 / elapsed;
            let headroom = ctx
                .available
                .saturating_sub(percent_of(ctx.capacity, self.spike_percent));
            let time_to_exhaustion = headroom as f64 / rate;
            if self.predicted_cycle_secs() > time_to_exhaustion {
                tracing::debug!(
                    target: "shoal::gc",
                    rate_bytes_per_sec = rate as u64,
                    headroom,
                    margin = self.margin,
                    "Allocation rate trigger"
                );
                return Some(GcCause::AllocationRate);
            }
        }
        common_trigger(ctx)
    }

    fn select_collection_set(&mut self, cset: &mut CollectionSetBuilder, ctx: &HeuristicsContext) {
        // Copy no more live data than the evacuation reserve can hold.
        let reserve = percent_of(ctx.capacity, self.evac_reserve_percent);
        let max_cset_live = (reserve as f64 / self.evac_waste) as usize;
        let free_target = percent_of(ctx.capacity, self.min_free_percent) + max_cset_live;
        let min_garbage = free_target.saturating_sub(ctx.available);

        let candidates = cset.candidates().to_vec();
        for c in &candidates {
            if cset.live_bytes() + c.live > max_cset_live {
                break;
            }
            let wanted = cset.garbage_bytes() < min_garbage
                || c.garbage_percent() >= self.garbage_threshold_percent as f64;
            if wanted && !cset.add(c) {
                break;
            }
        }
    }

    fn record_cycle_end(&mut self, summary: &CycleSummary) {
        self.cycle_secs.add(summary.duration.as_secs_f64());
        self.completed += 1;
    }

    fn record_degenerated(&mut self) {
        self.margin = (self.margin + DEGENERATE_PENALTY).min(MAX_MARGIN);
    }

    fn record_success(&mut self) {
        self.margin = (self.margin - SUCCESS_REWARD).max(MIN_MARGIN);
    }
}
