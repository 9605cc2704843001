//! Heap configuration
//!
//! Every field has a default, so a TOML file only needs the options it
//! changes:
//!
//! ```toml
//! heuristics = "compact"
//! mode = "incremental-update"
//! region_size = 1048576
//! region_count = 1024
//! verify = true
//!
//! [alloc_failure_a_lot]
//! schedule = "every"
//! n = 50
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GcError, GcResult};
use crate::fault::FaultSchedule;
use crate::heuristics::HeuristicsKind;
use crate::object::OBJECT_ALIGNMENT;
use crate::reference::SoftRefPolicy;

/// Write-barrier discipline used while marking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MarkingMode {
    /// Snapshot-at-the-beginning: report overwritten values
    #[default]
    #[serde(alias = "snapshot-at-beginning")]
    Satb,
    /// Incremental update: report newly stored values, rescan roots at
    /// final mark
    IncrementalUpdate,
}

/// Heap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    /// Region size in bytes (power of two)
    pub region_size: usize,

    /// Number of regions
    pub region_count: usize,

    /// Collection strategy
    pub heuristics: HeuristicsKind,

    /// Marking barrier discipline
    pub mode: MarkingMode,

    /// Uncommit regions that stayed empty this long
    pub uncommit_delay_ms: u64,

    /// Run internal consistency checks after every cycle
    pub verify: bool,

    /// Force a cycle if none ran for this long (0 disables)
    pub guaranteed_interval_ms: u64,

    /// Smallest TLAB in bytes
    pub min_tlab_size: usize,

    /// Largest TLAB in bytes
    pub max_tlab_size: usize,

    /// Shrink a thread's TLAB back to the minimum after this much idle time
    pub tlab_idle_shrink_ms: u64,

    /// GC worker threads (defaults to the number of CPUs)
    pub parallel_gc_threads: Option<usize>,

    /// Per-worker mark queue capacity before falling back to region rescan
    pub mark_queue_capacity: usize,

    /// Objects at or above this percentage of a region are humongous
    pub humongous_threshold_percent: usize,

    /// Regions with at least this much garbage are evacuated
    pub garbage_threshold_percent: usize,

    /// Start a cycle when free space drops below this
    pub min_free_threshold_percent: usize,

    /// Free-space trigger while the adaptive heuristic is learning
    pub init_free_threshold_percent: usize,

    /// Cycles the adaptive heuristic spends learning
    pub learning_steps: usize,

    /// Headroom kept for allocation spikes
    pub alloc_spike_percent: usize,

    /// Space reserved for evacuation copies
    pub evac_reserve_percent: usize,

    /// Expected evacuation overhead factor
    pub evac_waste: f64,

    /// Skip evacuation when immediate garbage is this share of all garbage
    pub immediate_threshold_percent: usize,

    /// Compact heuristic: allocation between cycles
    pub compact_allocation_threshold_percent: usize,

    /// Compact heuristic: garbage threshold
    pub compact_garbage_threshold_percent: usize,

    /// Upper bound on collection-set size (defaults to all regions)
    pub max_cset_regions: Option<usize>,

    /// Soft reference clearing policy
    pub soft_ref_policy: SoftRefPolicy,

    /// Force allocation failures on this schedule
    pub alloc_failure_a_lot: Option<FaultSchedule>,

    /// Force evacuation failures on this schedule
    pub evac_failure_a_lot: Option<FaultSchedule>,

    /// Soft heap size limit in bytes (defaults to full capacity)
    pub target_heap_size: Option<usize>,

    /// Control thread polling interval
    pub control_interval_ms: u64,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            region_size: 256 * 1024,
            region_count: 256,
            heuristics: HeuristicsKind::default(),
            mode: MarkingMode::default(),
            uncommit_delay_ms: 5 * 60 * 1000,
            verify: false,
            guaranteed_interval_ms: 5 * 60 * 1000,
            min_tlab_size: 2 * 1024,
            max_tlab_size: 64 * 1024,
            tlab_idle_shrink_ms: 100,
            parallel_gc_threads: None,
            mark_queue_capacity: 16 * 1024,
            humongous_threshold_percent: 100,
            garbage_threshold_percent: 25,
            min_free_threshold_percent: 10,
            init_free_threshold_percent: 70,
            learning_steps: 5,
            alloc_spike_percent: 5,
            evac_reserve_percent: 5,
            evac_waste: 1.2,
            immediate_threshold_percent: 90,
            compact_allocation_threshold_percent: 10,
            compact_garbage_threshold_percent: 10,
            max_cset_regions: None,
            soft_ref_policy: SoftRefPolicy::default(),
            alloc_failure_a_lot: None,
            evac_failure_a_lot: None,
            target_heap_size: None,
            control_interval_ms: 10,
        }
    }
}

fn check_percent(name: &str, value: usize) -> GcResult<()> {
    if value > 100 {
        return Err(GcError::InvalidConfig(format!(
            "{name} must be a percentage, got {value}"
        )));
    }
    Ok(())
}

impl HeapConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> GcResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| GcError::ConfigLoad(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> GcResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            GcError::ConfigLoad(format!("failed to read '{}': {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> GcResult<()> {
        if !self.region_size.is_power_of_two() || self.region_size < 4 * 1024 {
            return Err(GcError::InvalidConfig(format!(
                "region_size must be a power of two of at least 4096, got {}",
                self.region_size
            )));
        }
        if self.region_size > u32::MAX as usize {
            return Err(GcError::InvalidConfig(
                "region_size must fit in 32 bits".into(),
            ));
        }
        if self.region_count == 0 || self.region_count > u32::MAX as usize - 1 {
            return Err(GcError::InvalidConfig(format!(
                "region_count out of range: {}",
                self.region_count
            )));
        }
        if self.min_tlab_size < OBJECT_ALIGNMENT || self.min_tlab_size > self.max_tlab_size {
            return Err(GcError::InvalidConfig(format!(
                "TLAB sizes must satisfy {} <= min ({}) <= max ({})",
                OBJECT_ALIGNMENT, self.min_tlab_size, self.max_tlab_size
            )));
        }
        if self.humongous_threshold_percent == 0 {
            return Err(GcError::InvalidConfig(
                "humongous_threshold_percent must be positive".into(),
            ));
        }
        for (name, value) in [
            ("humongous_threshold_percent", self.humongous_threshold_percent),
            ("garbage_threshold_percent", self.garbage_threshold_percent),
            ("min_free_threshold_percent", self.min_free_threshold_percent),
            ("init_free_threshold_percent", self.init_free_threshold_percent),
            ("alloc_spike_percent", self.alloc_spike_percent),
            ("evac_reserve_percent", self.evac_reserve_percent),
            ("immediate_threshold_percent", self.immediate_threshold_percent),
            (
                "compact_allocation_threshold_percent",
                self.compact_allocation_threshold_percent,
            ),
            (
                "compact_garbage_threshold_percent",
                self.compact_garbage_threshold_percent,
            ),
        ] {
            check_percent(name, value)?;
        }
        if !(self.evac_waste >= 1.0) {
            return Err(GcError::InvalidConfig(format!(
                "evac_waste must be at least 1.0, got {}",
                self.evac_waste
            )));
        }
        if self.mark_queue_capacity == 0 {
            return Err(GcError::InvalidConfig(
                "mark_queue_capacity must be positive".into(),
            ));
        }
        if self.parallel_gc_threads == Some(0) {
            return Err(GcError::InvalidConfig(
                "parallel_gc_threads must be positive".into(),
            ));
        }
        if let Some(target) = self.target_heap_size {
            if target == 0 || target > self.capacity() {
                return Err(GcError::InvalidConfig(format!(
                    "target_heap_size {} outside (0, {}]",
                    target,
                    self.capacity()
                )));
            }
        }
        for schedule in [self.alloc_failure_a_lot, self.evac_failure_a_lot]
            .into_iter()
            .flatten()
        {
            schedule.validate()?;
        }
        Ok(())
    }

    /// Heap capacity in bytes
    pub fn capacity(&self) -> usize {
        self.region_size * self.region_count
    }

    /// Size at which objects take the humongous path
    pub fn humongous_threshold(&self) -> usize {
        self.region_size * self.humongous_threshold_percent / 100
    }

    /// TLAB size bounds, capped at the region size
    pub fn tlab_bounds(&self) -> (usize, usize) {
        let max = self.max_tlab_size.min(self.region_size);
        (self.min_tlab_size.min(max), max)
    }

    /// Number of GC worker threads
    pub fn gc_threads(&self) -> usize {
        self.parallel_gc_threads.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Collection-set region budget
    pub fn cset_region_budget(&self) -> usize {
        self.max_cset_regions.unwrap_or(self.region_count)
    }
}
