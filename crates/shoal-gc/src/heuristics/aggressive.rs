//! Aggressive heuristic: collect continuously, evacuate everything.
//!
//! Useful for shaking out barrier bugs; never meant for production.

use super::{CollectionSetBuilder, GcCause, Heuristics, HeuristicsContext};

/// Always wants a cycle and takes every region that holds garbage.
#[derive(Debug, Default)]
pub struct AggressiveHeuristics;

impl AggressiveHeuristics {
    /// Create the heuristic
    pub fn new() -> Self {
        Self
    }
}

impl Heuristics for AggressiveHeuristics {
    fn name(&self) -> &'static str {
        "aggressive"
    }

    fn should_start_cycle(&mut self, _ctx: &HeuristicsContext) -> Option<GcCause> {
        Some(GcCause::Always)
    }

    fn select_collection_set(&mut self, cset: &mut CollectionSetBuilder, _ctx: &HeuristicsContext) {
        let picked: Vec<_> = cset
            .candidates()
            .iter()
            .filter(|c| c.garbage > 0)
            .copied()
            .collect();
        for c in &picked {
            if !cset.add(c) {
                break;
            }
        }
    }
}
