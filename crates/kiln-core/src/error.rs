//! # KILN Error Handling
//!
//! Error types for the copy-engine dispatch stack.
//!
//! Error handling in KILN follows these principles:
//! - Errors are typed and categorized
//! - Encoder/estimator disagreement panics in debug builds and is
//!   reported as `EncodingSizeMismatch` in release builds
//! - Errors are `no_std` compatible and `Copy`

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// KILN Result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// KILN unified error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Generic Errors
    // =========================================================================
    /// Invalid parameter provided
    InvalidParameter,
    /// Resource not found
    NotFound,
    /// Operation not supported on this hardware
    NotSupported,
    /// Object is in a state that does not permit the operation
    InvalidState,

    // =========================================================================
    // Descriptor Errors
    // =========================================================================
    /// Unrecognized or mismatched copy direction
    InvalidDirection,
    /// Copy request rejected by the descriptor builder
    Builder(BuilderError),

    // =========================================================================
    // Memory Errors
    // =========================================================================
    /// Allocation failed
    AllocationFailed,
    /// Out of memory or address space
    OutOfMemory,
    /// Buffer overflow
    BufferOverflow,

    // =========================================================================
    // Command Submission Errors
    // =========================================================================
    /// Command buffer cannot hold the requested bytes
    CommandBufferFull,
    /// Encoder wrote a different byte count than was reserved
    EncodingSizeMismatch,
    /// Transport rejected the submission
    SubmissionFailed,
    /// GPU hang detected
    GpuHang,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Generic
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NotFound => write!(f, "resource not found"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::InvalidState => write!(f, "invalid state"),

            // Descriptor
            Self::InvalidDirection => write!(f, "invalid blit direction"),
            Self::Builder(e) => write!(f, "copy request rejected: {}", e),

            // Memory
            Self::AllocationFailed => write!(f, "allocation failed"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::BufferOverflow => write!(f, "buffer overflow"),

            // Command
            Self::CommandBufferFull => write!(f, "command buffer full"),
            Self::EncodingSizeMismatch => write!(f, "encoded size differs from estimate"),
            Self::SubmissionFailed => write!(f, "submission failed"),
            Self::GpuHang => write!(f, "GPU hang detected"),
        }
    }
}

// =============================================================================
// SUB-ERROR TYPES
// =============================================================================

/// Descriptor builder rejection reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuilderError {
    /// Direction tag is unknown
    InvalidDirection,
    /// Endpoint kinds do not match the direction
    EndpointMismatch,
    /// Copy region has zero width
    EmptyRegion,
    /// Compressed surface without a clear-color allocation
    MissingClearColor,
    /// Fill pattern length or fill size is unusable
    InvalidPattern,
}

impl fmt::Display for BuilderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDirection => write!(f, "unknown direction"),
            Self::EndpointMismatch => write!(f, "endpoints do not match direction"),
            Self::EmptyRegion => write!(f, "empty copy region"),
            Self::MissingClearColor => write!(f, "missing clear-color allocation"),
            Self::InvalidPattern => write!(f, "invalid fill pattern"),
        }
    }
}

/// Transport submission failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// Device stopped responding
    GpuHang,
    /// Transport refused the batch
    Rejected,
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GpuHang => write!(f, "gpu hang during submission"),
            Self::Rejected => write!(f, "batch rejected by transport"),
        }
    }
}

// =============================================================================
// ERROR CONVERSION
// =============================================================================

impl From<BuilderError> for Error {
    fn from(e: BuilderError) -> Self {
        match e {
            BuilderError::InvalidDirection | BuilderError::EndpointMismatch => {
                Error::InvalidDirection
            }
            other => Error::Builder(other),
        }
    }
}

impl From<SubmitError> for Error {
    fn from(e: SubmitError) -> Self {
        match e {
            SubmitError::GpuHang => Error::GpuHang,
            SubmitError::Rejected => Error::SubmissionFailed,
        }
    }
}
