//! Error taxonomy for the virtio transport core.

use core::fmt;

/// A failure from any operation in the transport core.
///
/// Variants are grouped by the subsystem that raises them, but any
/// operation may in principle return any variant - callers should match
/// exhaustively rather than assume a narrower subset per call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtioError {
    /// No common-cfg capability at all, or a queue index beyond `num_queues`.
    NotPresent,
    /// Mandatory capability missing, bad alignment/offset, non-power-of-two
    /// queue size, `VERSION_1` missing at `finalize_features`, or an illegal
    /// access width against device-config.
    Invalid,
    /// A host-services allocation failed.
    NoMemory,
    /// The host refused the requested MSI-X vector for a queue.
    Busy,
    /// A submit requested more descriptors than are currently free.
    NoSpace,
    /// A violated precondition: setting status to 0 via `set_status` instead
    /// of `reset`, or a device-config access out of bounds. Programmer error.
    Bug,
}

impl fmt::Display for VirtioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VirtioError::NotPresent => write!(f, "virtio structure or queue not present"),
            VirtioError::Invalid => write!(f, "invalid virtio transport state or parameter"),
            VirtioError::NoMemory => write!(f, "host services allocation failed"),
            VirtioError::Busy => write!(f, "host refused requested resource"),
            VirtioError::NoSpace => write!(f, "queue has no free descriptors"),
            VirtioError::Bug => write!(f, "virtio transport precondition violated"),
        }
    }
}

/// Shorthand for `Result<T, VirtioError>`, defaulting `T` to `()`.
pub type VirtioResult<T = ()> = Result<T, VirtioError>;
