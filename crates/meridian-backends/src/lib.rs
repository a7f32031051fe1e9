//! # Meridian Backends
//!
//! Execution providers and the device plumbing underneath them.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  ExecutionProviders (registry, rewrite per provider)          │
//! └───────────────┬──────────────────────────────┬───────────────┘
//!                 ▼                              ▼
//!   CpuExecutionProvider            DeviceExecutionProvider
//!                                   ├─ ContextPool ─ DeviceContext
//!                                   ├─ AllocatorPool ─ Allocator
//!                                   ├─ DeferredReleaseLedger
//!                                   └─ CopyDispatcher
//!                                              │
//!                                              ▼
//!                                   DeviceRuntime (SimDevice)
//! ```
//!
//! ## Example
//!
//! ```rust
//! use meridian_backends::{DeviceExecutionProvider, DeviceProviderConfig, ExecutionProvider, Tensor};
//! use meridian_core::MemType;
//!
//! # fn main() -> Result<(), meridian_backends::BackendError> {
//! let provider = DeviceExecutionProvider::simulated(DeviceProviderConfig::default())?;
//! let mut ctx = provider.on_run_start()?;
//!
//! let host = provider.allocator(MemType::Cpu).expect("host allocator");
//! let device = ctx.allocator().expect("run allocator").clone();
//! let input = Tensor::from_slice(host.as_ref(), [4], &[1.0f32, 2.0, 3.0, 4.0])?;
//! let on_device = Tensor::allocate(device.as_ref(), input.dtype(), [4])?;
//! provider.copy_tensor(&input, &on_device)?;
//!
//! // The host input may still be read by queued work; free it after the run.
//! provider.add_deferred_release_ptr(&ctx, input.buffer().clone())?;
//! provider.on_run_end(&mut ctx)?;
//! provider.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod allocator_pool;
pub mod config;
pub mod context;
pub mod copy;
pub mod device;
pub mod error;
pub mod ledger;
pub mod memory;
pub mod provider;
pub mod providers;
pub mod tensor;

pub use allocator::{Allocator, AllocatorInfo, AllocatorRef, AllocatorStats, DeviceAllocator, HostAllocator, PinnedAllocator};
pub use allocator_pool::AllocatorPool;
pub use config::DeviceProviderConfig;
pub use context::{ContextPool, DeviceContext, ReleaseSignal};
pub use copy::{plan_transfer, CopyDispatcher, QueueTable, TransferMode};
pub use device::{
    CompletionToken, DeviceEvent, DeviceRef, DeviceRuntime, EventHandle, LibraryHandles, QueueHandle, SimDevice,
    SimTransfer, TransferRecord,
};
pub use error::{BackendError, Result};
pub use ledger::{DeferredReleaseLedger, SweepStats};
pub use memory::{Buffer, BufferId, BufferRef};
pub use provider::{
    CpuExecutionProvider, DeviceExecutionProvider, ExecutionContext, ExecutionProvider, ProviderRef, RunState,
};
pub use providers::ExecutionProviders;
pub use tensor::Tensor;
