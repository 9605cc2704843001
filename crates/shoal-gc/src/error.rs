//! GC error types

use crate::object::ObjRef;
use thiserror::Error;

/// Errors surfaced by the collector to its callers.
///
/// Mark queue overflow is recovered internally and has no variant here.
#[derive(Debug, Error)]
pub enum GcError {
    /// No empty region is left in the region directory.
    #[error("out of regions")]
    OutOfRegions,

    /// An allocation could not be satisfied even after collecting.
    #[error("allocation of {size} bytes failed")]
    AllocationFailure {
        /// Requested size in bytes
        size: usize,
    },

    /// Unrecoverable: every collection mode failed to free enough memory,
    /// or the request can never fit in the heap.
    #[error("fatal out of memory: requested {requested} bytes, heap capacity is {capacity} bytes")]
    FatalOutOfMemory {
        /// Requested size in bytes
        requested: usize,
        /// Maximum heap capacity in bytes
        capacity: usize,
    },

    /// No destination space was available while evacuating the collection set.
    #[error("evacuation failure")]
    EvacuationFailure,

    /// Object size is smaller than its header and reference fields need.
    #[error("invalid object size {size} for {ref_fields} reference fields (minimum {minimum})")]
    InvalidSize {
        /// Requested size in bytes
        size: usize,
        /// Number of reference fields
        ref_fields: usize,
        /// Minimum size for that many fields
        minimum: usize,
    },

    /// The reference does not name a live object.
    #[error("invalid reference {0:?}")]
    InvalidReference(ObjRef),

    /// Field index outside the object's reference fields.
    #[error("field {field} out of bounds for object with {count} reference fields")]
    FieldOutOfBounds {
        /// Requested field index
        field: usize,
        /// Number of reference fields on the object
        count: usize,
    },

    /// Operation requires a different object kind.
    #[error("object {0:?} has the wrong kind for this operation")]
    WrongObjectKind(ObjRef),

    /// No reference queue with this id exists.
    #[error("unknown reference queue {0}")]
    UnknownQueue(u32),

    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration file could not be read or parsed.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(String),

    /// An internal consistency check failed (only with `verify = true`).
    #[error("heap verification failed: {0}")]
    Verification(String),

    /// An administrative command could not be parsed.
    #[error("unknown admin command: {0}")]
    UnknownCommand(String),

    /// The control thread could not be started.
    #[error("failed to spawn GC thread")]
    Spawn(#[source] std::io::Error),
}

/// Result alias used throughout the collector.
pub type GcResult<T> = Result<T, GcError>;
