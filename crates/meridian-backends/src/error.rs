//! Error types for provider, device and copy operations

use meridian_core::{DataType, MemoryLocation};
use meridian_graph::GraphError;

use crate::memory::BufferId;

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors surfaced by execution providers and the device layer.
///
/// Nothing here is retried: every variant points at a logic error or at
/// resource exhaustion.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Source and destination of a copy hold different element counts
    #[error("shape mismatch: source has {src} elements, destination has {dst}")]
    ShapeMismatch { src: usize, dst: usize },

    /// Source and destination element types differ
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: DataType, actual: DataType },

    /// Copy between locations this provider does not own
    #[error("unsupported tensor location: {src} -> {dst}")]
    UnsupportedLocation { src: MemoryLocation, dst: MemoryLocation },

    /// A device runtime call reported failure
    #[error("device call {call} failed: {message}")]
    DeviceCall { call: &'static str, message: String },

    /// Allocation exceeds what the device or pool can hold
    #[error("out of memory: requested {requested} bytes, {available} available")]
    OutOfMemory { requested: usize, available: usize },

    /// Queue handle unknown to the device
    #[error("invalid queue handle: {0}")]
    InvalidQueue(u64),

    /// Buffer too small for the requested access
    #[error("buffer too small: need {needed} bytes, buffer holds {actual}")]
    BufferTooSmall { needed: usize, actual: usize },

    /// Buffer returned to an allocator that did not hand it out
    #[error("buffer {buffer} at {location} does not belong to allocator {allocator}")]
    ForeignBuffer {
        buffer: BufferId,
        location: MemoryLocation,
        allocator: String,
    },

    /// Host access to memory that is not host-visible
    #[error("{0} memory is not host accessible")]
    HostOnly(MemoryLocation),

    /// Tensor shape with symbolic or overflowing dimensions
    #[error("invalid tensor shape: {0}")]
    InvalidShape(String),

    /// Operation needs a running execution
    #[error("no active run: {0}")]
    NoActiveRun(&'static str),

    /// Deferred release for a completion token the ledger does not track
    #[error("unknown release token: {0}")]
    UnknownReleaseToken(u64),

    /// Provider used after shutdown
    #[error("execution provider {0} has been shut down")]
    ShutDown(String),

    /// Two providers registered under one type
    #[error("execution provider already registered: {0}")]
    DuplicateProvider(String),

    /// Invalid provider configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Graph rewriting failed
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl BackendError {
    pub(crate) fn device_call(call: &'static str, message: impl Into<String>) -> Self {
        Self::DeviceCall {
            call,
            message: message.into(),
        }
    }

    /// True for failures reported by the device runtime itself.
    pub fn is_device_failure(&self) -> bool {
        matches!(self, Self::DeviceCall { .. })
    }
}
