//! Byte-exact transfers between host, pinned host and device memory
//!
//! Only transfers touching page-locked memory may run asynchronously: the
//! OS may page plain host memory out from under an in-flight transfer, so
//! those are staged synchronously.
//!
//! | src         | dst         | mode                         |
//! |-------------|-------------|------------------------------|
//! | pinned-host | device      | async, designated queue      |
//! | device      | device      | async, default queue         |
//! | host        | device      | sync                         |
//! | device      | pinned-host | async, designated queue      |
//! | device      | host        | sync                         |
//! | host        | host        | rejected                     |
//! | otherwise   |             | host memory copy             |

use meridian_core::{MemoryKind, MemoryLocation, QueueId};
use meridian_tracing::perf_span;
use meridian_tracing::performance::record_transfer;

use crate::device::{DeviceRef, QueueHandle};
use crate::error::{BackendError, Result};
use crate::tensor::Tensor;

/// How a transfer is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Queued on a device queue; returns once issued.
    Async { queue: QueueId },
    /// Blocking device transfer.
    Sync,
    /// Plain memory copy on the calling thread.
    HostMemcpy,
}

/// Pick the transfer mode for a copy from `src` to `dst`. `queue` is the
/// queue designated by the caller for pinned transfers.
pub fn plan_transfer(src: MemoryLocation, dst: MemoryLocation, queue: QueueId) -> Result<TransferMode> {
    use MemoryKind::*;

    let mode = match (src.kind, dst.kind) {
        (Host, Host) => return Err(BackendError::UnsupportedLocation { src, dst }),
        (PinnedHost, Device) | (Device, PinnedHost) => TransferMode::Async { queue },
        (Device, Device) => TransferMode::Async {
            queue: QueueId::Default,
        },
        (Host, Device) | (Device, Host) => TransferMode::Sync,
        _ => TransferMode::HostMemcpy,
    };
    Ok(mode)
}

fn direction(src: MemoryKind, dst: MemoryKind) -> &'static str {
    match (src.is_host(), dst.is_host()) {
        (true, false) => "H2D",
        (false, true) => "D2H",
        (false, false) => "D2D",
        (true, true) => "H2H",
    }
}

/// Device queue handles indexed by [`QueueId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueTable([QueueHandle; 3]);

impl QueueTable {
    pub fn new(default: QueueHandle, copy_in: QueueHandle, copy_out: QueueHandle) -> Self {
        Self([default, copy_in, copy_out])
    }

    pub fn get(&self, queue: QueueId) -> QueueHandle {
        self.0[queue.index()]
    }
}

/// Executes tensor copies against one device.
pub struct CopyDispatcher {
    device: DeviceRef,
    queues: QueueTable,
}

impl CopyDispatcher {
    pub fn new(device: DeviceRef, queues: QueueTable) -> Self {
        Self { device, queues }
    }

    pub fn queues(&self) -> QueueTable {
        self.queues
    }

    /// Copy `src` into `dst`. Asynchronous modes return once the transfer
    /// is issued; the returned mode says which path was taken.
    pub fn copy(&self, src: &Tensor, dst: &Tensor, queue: QueueId) -> Result<TransferMode> {
        if src.element_count() != dst.element_count() {
            return Err(BackendError::ShapeMismatch {
                src: src.element_count(),
                dst: dst.element_count(),
            });
        }
        if src.dtype() != dst.dtype() {
            return Err(BackendError::TypeMismatch {
                expected: dst.dtype(),
                actual: src.dtype(),
            });
        }

        let (src_loc, dst_loc) = (src.location(), dst.location());
        let device_id = self.device.device_id();
        let foreign = |loc: MemoryLocation| loc.kind != MemoryKind::Host && loc.device_id != device_id;
        if foreign(src_loc) || foreign(dst_loc) {
            return Err(BackendError::UnsupportedLocation {
                src: src_loc,
                dst: dst_loc,
            });
        }

        let mode = plan_transfer(src_loc, dst_loc, queue)?;
        let bytes = src.size_in_bytes();
        let span = perf_span!("copy_tensor", bytes = bytes);
        match mode {
            TransferMode::Async { queue } => {
                self.device
                    .copy_async(src.buffer(), dst.buffer(), bytes, self.queues.get(queue))?;
            }
            TransferMode::Sync => self.device.copy_sync(src.buffer(), dst.buffer(), bytes)?,
            TransferMode::HostMemcpy => dst.buffer().copy_prefix_from(src.buffer(), bytes)?,
        }
        record_transfer(bytes, direction(src_loc.kind, dst_loc.kind), span.elapsed_us());
        tracing::trace!(src = %src_loc, dst = %dst_loc, ?mode, bytes, "tensor_copied");
        Ok(mode)
    }
}
