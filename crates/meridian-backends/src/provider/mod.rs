//! Execution providers
//!
//! The execution engine talks to every backend through [`ExecutionProvider`]:
//! allocator lookup, tensor copies, the per-run lifecycle hooks and the
//! graph rewrite that bridges provider boundaries.
//!
//! Run state lives in an explicit [`ExecutionContext`] returned by
//! `on_run_start` and handed back to `on_run_end`, rather than in
//! thread-local storage:
//!
//! ```text
//!   Idle ──on_run_start──▶ RunStarting ──▶ Running ──on_run_end──▶ RunEnding ──▶ Idle
//! ```

pub mod cpu;
pub mod device;

use std::fmt;
use std::sync::Arc;

use meridian_core::{MemType, QueueId};
use meridian_graph::Graph;

use crate::allocator::AllocatorRef;
use crate::context::DeviceContext;
use crate::error::Result;
use crate::memory::BufferRef;
use crate::tensor::Tensor;

pub use cpu::CpuExecutionProvider;
pub use device::DeviceExecutionProvider;

/// Lifecycle position of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    RunStarting,
    Running,
    RunEnding,
}

/// Resources bound to one run. Not shareable between runs: the device
/// context and allocator it carries are owned by this run alone.
pub struct ExecutionContext {
    run_id: u64,
    state: RunState,
    device_context: Option<DeviceContext>,
    allocator: Option<AllocatorRef>,
}

impl ExecutionContext {
    pub(crate) fn starting(run_id: u64) -> Self {
        Self {
            run_id,
            state: RunState::RunStarting,
            device_context: None,
            allocator: None,
        }
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == RunState::Running
    }

    pub fn device_context(&self) -> Option<&DeviceContext> {
        self.device_context.as_ref()
    }

    /// Allocator for the provider's default memory, borrowed for this run.
    pub fn allocator(&self) -> Option<&AllocatorRef> {
        self.allocator.as_ref()
    }

    pub(crate) fn set_state(&mut self, state: RunState) {
        self.state = state;
    }

    pub(crate) fn bind(&mut self, device_context: DeviceContext, allocator: AllocatorRef) {
        self.device_context = Some(device_context);
        self.allocator = Some(allocator);
    }

    pub(crate) fn unbind(&mut self) -> (Option<DeviceContext>, Option<AllocatorRef>) {
        (self.device_context.take(), self.allocator.take())
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("run_id", &self.run_id)
            .field("state", &self.state)
            .field("device_context", &self.device_context)
            .field("allocator", &self.allocator.as_ref().map(|a| a.info().name.clone()))
            .finish()
    }
}

/// A backend that executes a subset of graph nodes.
pub trait ExecutionProvider: Send + Sync {
    /// Provider type string nodes are tagged with.
    fn provider_type(&self) -> &str;

    /// Allocator serving `mem_type`, if this provider has one.
    fn allocator(&self, mem_type: MemType) -> Option<AllocatorRef>;

    /// Copy on the default queue.
    fn copy_tensor(&self, src: &Tensor, dst: &Tensor) -> Result<()> {
        self.copy_tensor_on_queue(src, dst, QueueId::Default)
    }

    fn copy_tensor_on_queue(&self, src: &Tensor, dst: &Tensor, queue: QueueId) -> Result<()>;

    fn on_run_start(&self) -> Result<ExecutionContext>;

    fn on_run_end(&self, ctx: &mut ExecutionContext) -> Result<()>;

    /// Free `buffer` once work queued by the run in `ctx` has finished.
    fn add_deferred_release_ptr(&self, ctx: &ExecutionContext, buffer: BufferRef) -> Result<()>;

    /// Block until all work issued through this provider has finished.
    fn sync(&self) -> Result<()>;

    /// Bridge every edge between this provider's nodes and the rest.
    fn insert_copy_nodes(&self, graph: &mut Graph) -> Result<bool> {
        Ok(meridian_graph::insert_copy_nodes(graph, self.provider_type())?)
    }
}

pub type ProviderRef = Arc<dyn ExecutionProvider>;
