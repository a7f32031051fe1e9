//! Device runtime abstraction
//!
//! [`DeviceRuntime`] is the narrow set of calls the device execution provider
//! makes against a device driver: queues, memory, transfers, events and math
//! library handles. [`sim::SimDevice`] implements it in-process with one
//! worker thread per queue.
//!
//! ```text
//!  DeviceExecutionProvider
//!        │ DeviceRef (Arc<dyn DeviceRuntime>)
//!        ▼
//!  ┌─────────────────────────────────────────────┐
//!  │ queues:  default ─ copy-in ─ copy-out        │
//!  │ memory:  device ─ pinned host                │
//!  │ events:  create ─ record ─ query ─ sync      │
//!  └─────────────────────────────────────────────┘
//! ```

pub mod sim;

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::memory::BufferRef;

pub use sim::{SimDevice, SimTransfer, TransferRecord};

/// Device queue. Work on one queue runs in issue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueHandle(pub u64);

impl fmt::Display for QueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue{}", self.0)
    }
}

/// Device event used as a completion signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(pub u64);

impl fmt::Display for EventHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event{}", self.0)
    }
}

/// Math library handles owned by one device context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LibraryHandles {
    pub blas: u64,
    pub dnn: u64,
}

/// Calls a device driver must provide.
pub trait DeviceRuntime: Send + Sync {
    fn device_id(&self) -> u32;

    fn name(&self) -> &str;

    /// The implicit queue every device has. Blocking copies are ordered
    /// after work already queued here.
    fn default_queue(&self) -> QueueHandle;

    /// New non-blocking queue.
    fn create_queue(&self) -> Result<QueueHandle>;

    fn destroy_queue(&self, queue: QueueHandle) -> Result<()>;

    fn alloc(&self, bytes: usize) -> Result<BufferRef>;

    fn free(&self, buffer: BufferRef) -> Result<()>;

    /// Page-locked host memory.
    fn alloc_pinned(&self, bytes: usize) -> Result<BufferRef>;

    fn free_pinned(&self, buffer: BufferRef) -> Result<()>;

    /// Blocking copy of the first `bytes` bytes.
    fn copy_sync(&self, src: &BufferRef, dst: &BufferRef, bytes: usize) -> Result<()>;

    /// Copy queued on `queue`; returns once issued.
    fn copy_async(&self, src: &BufferRef, dst: &BufferRef, bytes: usize, queue: QueueHandle) -> Result<()>;

    fn create_event(&self) -> Result<EventHandle>;

    /// Complete `event` once the work queued on `queue` so far has finished.
    fn record_event(&self, event: EventHandle, queue: QueueHandle) -> Result<()>;

    /// True once the recorded work finished. Never-recorded events report
    /// finished.
    fn query_event(&self, event: EventHandle) -> Result<bool>;

    fn synchronize_event(&self, event: EventHandle) -> Result<()>;

    fn destroy_event(&self, event: EventHandle) -> Result<()>;

    fn synchronize_queue(&self, queue: QueueHandle) -> Result<()>;

    /// Wait for every queue to drain.
    fn synchronize(&self) -> Result<()>;

    fn create_library_handles(&self) -> Result<LibraryHandles>;

    fn destroy_library_handles(&self, handles: LibraryHandles) -> Result<()>;
}

/// Shared device handle.
pub type DeviceRef = Arc<dyn DeviceRuntime>;

// ============================================================================
// Completion tokens
// ============================================================================

/// Opaque signal that becomes finished once previously queued asynchronous
/// work completes.
pub trait CompletionToken: Send + Sync {
    /// Identity used to key ledger entries.
    fn id(&self) -> u64;

    fn is_finished(&self) -> Result<bool>;

    fn block_until_finished(&self) -> Result<()>;

    /// Free the underlying signal resource.
    fn release(self: Box<Self>) -> Result<()>;
}

/// Completion token backed by a device event.
pub struct DeviceEvent {
    device: DeviceRef,
    event: EventHandle,
}

impl DeviceEvent {
    pub fn create(device: DeviceRef) -> Result<Self> {
        let event = device.create_event()?;
        Ok(Self { device, event })
    }

    pub fn handle(&self) -> EventHandle {
        self.event
    }
}

impl CompletionToken for DeviceEvent {
    fn id(&self) -> u64 {
        self.event.0
    }

    fn is_finished(&self) -> Result<bool> {
        self.device.query_event(self.event)
    }

    fn block_until_finished(&self) -> Result<()> {
        self.device.synchronize_event(self.event)
    }

    fn release(self: Box<Self>) -> Result<()> {
        self.device.destroy_event(self.event)
    }
}
