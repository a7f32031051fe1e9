//! Host execution provider
//!
//! Everything runs synchronously on the calling thread, so there is nothing
//! to defer and no boundary of its own to bridge.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use meridian_core::{MemType, MemoryKind, QueueId, CPU_EXECUTION_PROVIDER};
use meridian_graph::Graph;

use super::{ExecutionContext, ExecutionProvider, RunState};
use crate::allocator::{AllocatorRef, HostAllocator};
use crate::error::{BackendError, Result};
use crate::memory::BufferRef;
use crate::tensor::Tensor;

pub struct CpuExecutionProvider {
    host: AllocatorRef,
    next_run: AtomicU64,
}

impl CpuExecutionProvider {
    pub fn new() -> Self {
        Self::with_allocator(Arc::new(HostAllocator::plain()))
    }

    pub fn with_allocator(host: AllocatorRef) -> Self {
        Self {
            host,
            next_run: AtomicU64::new(1),
        }
    }
}

impl Default for CpuExecutionProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionProvider for CpuExecutionProvider {
    fn provider_type(&self) -> &str {
        CPU_EXECUTION_PROVIDER
    }

    fn allocator(&self, _mem_type: MemType) -> Option<AllocatorRef> {
        Some(self.host.clone())
    }

    fn copy_tensor_on_queue(&self, src: &Tensor, dst: &Tensor, _queue: QueueId) -> Result<()> {
        let (src_loc, dst_loc) = (src.location(), dst.location());
        if src_loc.kind == MemoryKind::Device || dst_loc.kind == MemoryKind::Device {
            return Err(BackendError::UnsupportedLocation {
                src: src_loc,
                dst: dst_loc,
            });
        }
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
        dst.buffer().copy_prefix_from(src.buffer(), src.size_in_bytes())
    }

    fn on_run_start(&self) -> Result<ExecutionContext> {
        let mut ctx = ExecutionContext::starting(self.next_run.fetch_add(1, Ordering::Relaxed));
        ctx.set_state(RunState::Running);
        Ok(ctx)
    }

    fn on_run_end(&self, ctx: &mut ExecutionContext) -> Result<()> {
        if !ctx.is_running() {
            return Err(BackendError::NoActiveRun("on_run_end"));
        }
        ctx.set_state(RunState::Idle);
        Ok(())
    }

    fn add_deferred_release_ptr(&self, ctx: &ExecutionContext, buffer: BufferRef) -> Result<()> {
        if !ctx.is_running() {
            return Err(BackendError::NoActiveRun("add_deferred_release_ptr"));
        }
        self.host.free(buffer)
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn insert_copy_nodes(&self, _graph: &mut Graph) -> Result<bool> {
        Ok(false)
    }
}
