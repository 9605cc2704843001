//! # Shoal Garbage Collector
//!
//! Concurrent, region-based, evacuating garbage collector over a simulated
//! heap.
//!
//! ## Design
//!
//! - **Regions**: the heap is a directory of equal-sized regions; small
//!   objects bump-allocate through elastic TLABs, humongous objects take a
//!   contiguous run of regions
//! - **Marking**: concurrent SATB or incremental-update marking with
//!   top-at-mark-start black allocation
//! - **Evacuation**: live objects in the collection set are copied
//!   concurrently; forwarding is installed with one CAS and mutators go
//!   through load/store barriers
//! - **Degeneration**: a cancelled cycle finishes inside one pause; a full
//!   sliding compaction is the last resort before out-of-memory
//! - **Heuristics**: static, adaptive, aggressive and compact policies
//!   decide when to collect and which regions to evacuate

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod admin;
mod allocator;
pub mod barrier;
pub mod collector;
pub mod config;
pub mod control;
pub mod directory;
pub mod error;
pub mod evacuation;
pub mod fault;
pub mod full_gc;
pub mod heap;
pub mod heuristics;
mod marking;
pub mod mutator;
pub mod object;
pub mod reference;
pub mod region;
pub mod roots;
pub mod safepoint;
pub mod stats;
pub mod verify;
pub mod workers;

pub use admin::{AdminCommand, AdminOutput};
pub use barrier::{GcPhase, WriteBarrierBuffer};
pub use config::{HeapConfig, MarkingMode};
pub use control::ControlThread;
pub use directory::RegionDirectory;
pub use error::{GcError, GcResult};
pub use fault::{FaultInjector, FaultSchedule};
pub use heap::{Heap, ProviderId};
pub use heuristics::{
    CollectionSet, CollectionSetBuilder, GcCause, Heuristics, HeuristicsContext, HeuristicsKind,
    RegionCandidate,
};
pub use mutator::{Mutator, MutatorScope};
pub use object::{ObjRef, ObjectKind};
pub use reference::{QueueId, RefKind, ReferenceQueue, ReferenceStats, SoftRefPolicy};
pub use region::{RegionId, RegionSample, RegionState};
pub use roots::{Handle, RootProvider, RootSet, RootSlot};
pub use safepoint::{PauseStats, Safepoint};
pub use stats::{CycleKind, CycleSummary, GcStats};
pub use workers::WorkerGang;
