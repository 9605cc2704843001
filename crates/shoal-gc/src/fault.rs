//! Fault injection
//!
//! Forces allocation and evacuation failures on a controllable cadence so
//! the recovery paths run under test. A forced failure is decided before
//! any heap state is touched.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{GcError, GcResult};

/// When to force a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "schedule", rename_all = "kebab-case")]
pub enum FaultSchedule {
    /// Fail every `n`-th attempt
    Every {
        /// Period
        n: u64,
    },
    /// Fail each attempt with probability `1 / one_in`
    Random {
        /// Inverse probability
        one_in: u64,
        /// RNG seed, for reproducible runs
        seed: u64,
    },
}

impl FaultSchedule {
    pub(crate) fn validate(&self) -> GcResult<()> {
        match *self {
            FaultSchedule::Every { n: 0 } | FaultSchedule::Random { one_in: 0, .. } => Err(
                GcError::InvalidConfig("fault schedule period must be positive".into()),
            ),
            _ => Ok(()),
        }
    }
}

struct FaultPoint {
    schedule: FaultSchedule,
    attempts: AtomicU64,
    injected: AtomicU64,
    rng: Mutex<SmallRng>,
}

impl FaultPoint {
    fn new(schedule: FaultSchedule) -> Self {
        let seed = match schedule {
            FaultSchedule::Random { seed, .. } => seed,
            FaultSchedule::Every { .. } => 0,
        };
        Self {
            schedule,
            attempts: AtomicU64::new(0),
            injected: AtomicU64::new(0),
            rng: Mutex::new(SmallRng::seed_from_u64(seed)),
        }
    }

    fn fire(&self) -> bool {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        let fail = match self.schedule {
            FaultSchedule::Every { n } => attempt % n == 0,
            FaultSchedule::Random { one_in, .. } => self.rng.lock().gen_range(0..one_in) == 0,
        };
        if fail {
            self.injected.fetch_add(1, Ordering::Relaxed);
        }
        fail
    }
}

/// Decides when to inject failures.
#[derive(Default)]
pub struct FaultInjector {
    alloc: Option<FaultPoint>,
    evac: Option<FaultPoint>,
}

impl FaultInjector {
    /// Create an injector. `None` disables a fault point.
    pub fn new(alloc: Option<FaultSchedule>, evac: Option<FaultSchedule>) -> Self {
        Self {
            alloc: alloc.map(FaultPoint::new),
            evac: evac.map(FaultPoint::new),
        }
    }

    /// Whether this allocation attempt must fail.
    #[inline]
    pub fn should_fail_alloc(&self) -> bool {
        self.alloc.as_ref().is_some_and(FaultPoint::fire)
    }

    /// Whether this evacuation must fail.
    #[inline]
    pub fn should_fail_evac(&self) -> bool {
        self.evac.as_ref().is_some_and(FaultPoint::fire)
    }

    /// Allocation failures injected so far
    pub fn injected_alloc_failures(&self) -> u64 {
        self.alloc
            .as_ref()
            .map_or(0, |p| p.injected.load(Ordering::Relaxed))
    }

    /// Evacuation failures injected so far
    pub fn injected_evac_failures(&self) -> u64 {
        self.evac
            .as_ref()
            .map_or(0, |p| p.injected.load(Ordering::Relaxed))
    }
}
