//! Device execution provider
//!
//! Composes the pieces a device-resident provider needs:
//!
//! ```text
//!  ┌──────────────────────── DeviceExecutionProvider ────────────────────────┐
//!  │ ContextPool        one DeviceContext per concurrent run                 │
//!  │ AllocatorPool      one default-memory allocator per concurrent run      │
//!  │ PinnedAllocator    shared; host-visible output memory                   │
//!  │ HostAllocator      shared; plain host memory                            │
//!  │ DeferredReleaseLedger   host buffers held until the run's event fires   │
//!  │ CopyDispatcher     default / copy-in / copy-out queues                  │
//!  └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A run borrows a context and an allocator in `on_run_start`, registers a
//! ledger entry keyed by a fresh device event, and gives everything back in
//! `on_run_end` after queueing that event on the default queue. Buffers
//! passed to `add_deferred_release_ptr` in between are freed by a later
//! `on_run_start` once the event has fired, or by `shutdown`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use meridian_core::{MemType, MemoryKind, QueueId, DEVICE_EXECUTION_PROVIDER};
use meridian_graph::CopyDirection;

use super::{ExecutionContext, ExecutionProvider, RunState};
use crate::allocator::{AllocatorRef, DeviceAllocator, HostAllocator, PinnedAllocator};
use crate::allocator_pool::AllocatorPool;
use crate::config::DeviceProviderConfig;
use crate::context::{ContextPool, ReleaseSignal};
use crate::copy::{CopyDispatcher, QueueTable, TransferMode};
use crate::device::{DeviceEvent, DeviceRef, QueueHandle, SimDevice};
use crate::error::{BackendError, Result};
use crate::ledger::DeferredReleaseLedger;
use crate::memory::BufferRef;
use crate::tensor::Tensor;

pub struct DeviceExecutionProvider {
    config: DeviceProviderConfig,
    device: DeviceRef,
    dispatcher: CopyDispatcher,
    contexts: ContextPool,
    run_allocators: AllocatorPool,
    device_allocator: AllocatorRef,
    pinned_allocator: AllocatorRef,
    host_allocator: AllocatorRef,
    ledger: DeferredReleaseLedger,
    next_run: AtomicU64,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for DeviceExecutionProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceExecutionProvider")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DeviceExecutionProvider {
    pub fn new(config: DeviceProviderConfig, device: DeviceRef) -> Result<Self> {
        Self::with_host_allocator(config, device, Arc::new(HostAllocator::plain()))
    }

    /// Provider over its own [`SimDevice`], honouring the configured memory
    /// limit.
    pub fn simulated(config: DeviceProviderConfig) -> Result<Self> {
        let sim = match config.device_memory_limit {
            Some(limit) => SimDevice::with_memory_limit(config.device_id, limit)?,
            None => SimDevice::new(config.device_id)?,
        };
        Self::new(config, Arc::new(sim))
    }

    /// Provider whose plain host memory, including deferred releases, goes
    /// through `host`.
    pub fn with_host_allocator(config: DeviceProviderConfig, device: DeviceRef, host: AllocatorRef) -> Result<Self> {
        if config.device_id != device.device_id() {
            return Err(BackendError::Config(format!(
                "configured for device {} but given {}",
                config.device_id,
                device.name()
            )));
        }

        let copy_in = device.create_queue()?;
        let copy_out = match device.create_queue() {
            Ok(queue) => queue,
            Err(err) => {
                if let Err(cleanup) = device.destroy_queue(copy_in) {
                    tracing::warn!(error = %cleanup, "copy_queue_cleanup_failed");
                }
                return Err(err);
            }
        };
        let queues = QueueTable::new(device.default_queue(), copy_in, copy_out);

        let run_allocators = {
            let device = device.clone();
            AllocatorPool::new("device", config.max_idle_allocators, move || {
                Ok(Arc::new(DeviceAllocator::new(device.clone())) as AllocatorRef)
            })
        };

        tracing::info!(
            device = device.name(),
            %copy_in,
            %copy_out,
            max_idle_contexts = config.max_idle_contexts,
            "device_provider_created"
        );

        Ok(Self {
            dispatcher: CopyDispatcher::new(device.clone(), queues),
            contexts: ContextPool::new(device.clone(), config.max_idle_contexts),
            run_allocators,
            device_allocator: Arc::new(DeviceAllocator::new(device.clone())),
            pinned_allocator: Arc::new(PinnedAllocator::new(device.clone())),
            ledger: DeferredReleaseLedger::new(host.clone()),
            host_allocator: host,
            device,
            config,
            next_run: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &DeviceProviderConfig {
        &self.config
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    pub fn dispatcher(&self) -> &CopyDispatcher {
        &self.dispatcher
    }

    pub fn queue(&self, queue: QueueId) -> QueueHandle {
        self.dispatcher.queues().get(queue)
    }

    /// Ledger entries not yet freed.
    pub fn pending_releases(&self) -> usize {
        self.ledger.pending_len()
    }

    /// Host buffers waiting on a completion signal.
    pub fn pending_release_buffers(&self) -> usize {
        self.ledger.pending_buffers()
    }

    pub fn idle_contexts(&self) -> usize {
        self.contexts.idle_len()
    }

    pub fn contexts_created(&self) -> usize {
        self.contexts.created_count()
    }

    pub fn idle_allocators(&self) -> usize {
        self.run_allocators.idle_count()
    }

    pub fn allocators_created(&self) -> usize {
        self.run_allocators.created_count()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_shut_down() {
            Err(BackendError::ShutDown(self.provider_type().to_string()))
        } else {
            Ok(())
        }
    }

    /// Run a memcpy node: copies into this provider's memory go on the
    /// copy-in queue, copies out of it on the copy-out queue.
    #[tracing::instrument(level = "trace", skip_all, fields(run_id = ctx.run_id(), ?direction))]
    pub fn execute_memcpy(
        &self,
        ctx: &ExecutionContext,
        direction: CopyDirection,
        src: &Tensor,
        dst: &Tensor,
    ) -> Result<TransferMode> {
        self.ensure_live()?;
        if !ctx.is_running() {
            return Err(BackendError::NoActiveRun("execute_memcpy"));
        }
        let queue = match direction {
            CopyDirection::ToProvider => QueueId::CopyIn,
            CopyDirection::FromProvider => QueueId::CopyOut,
        };
        self.dispatcher.copy(src, dst, queue)
    }

    /// Drain deferred releases and release every device resource. Safe to
    /// call more than once; later calls do nothing.
    #[tracing::instrument(skip(self), fields(device = self.device.name()))]
    pub fn shutdown(&self) -> Result<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut first_error: Option<BackendError> = None;
        let mut note = |result: Result<()>, step: &'static str| {
            if let Err(err) = result {
                tracing::error!(step, error = %err, "device_provider_shutdown_step_failed");
                first_error.get_or_insert(err);
            }
        };

        note(self.device.synchronize(), "synchronize");
        note(self.ledger.drain().map(|_| ()), "drain_deferred_releases");
        self.contexts.clear();
        self.run_allocators.clear();
        let queues = self.dispatcher.queues();
        for queue in [QueueId::CopyIn, QueueId::CopyOut] {
            note(self.device.destroy_queue(queues.get(queue)), "destroy_queue");
        }

        tracing::info!(ok = first_error.is_none(), "device_provider_shut_down");
        first_error.map_or(Ok(()), Err)
    }

    fn release_run_resources(&self, ctx: &mut ExecutionContext) {
        let (device_context, allocator) = ctx.unbind();
        if let Some(device_context) = device_context {
            self.contexts.restore(device_context);
        }
        if let Some(allocator) = allocator {
            self.run_allocators.restore(allocator);
        }
    }
}

impl ExecutionProvider for DeviceExecutionProvider {
    fn provider_type(&self) -> &str {
        DEVICE_EXECUTION_PROVIDER
    }

    /// `Default` hands out a shared device allocator; runs get their own
    /// through [`ExecutionContext::allocator`].
    fn allocator(&self, mem_type: MemType) -> Option<AllocatorRef> {
        let allocator = match mem_type {
            MemType::Default => &self.device_allocator,
            MemType::CpuOutput => &self.pinned_allocator,
            MemType::CpuInput | MemType::Cpu => &self.host_allocator,
        };
        Some(allocator.clone())
    }

    #[tracing::instrument(level = "trace", skip_all, fields(src = %src.location(), dst = %dst.location(), %queue))]
    fn copy_tensor_on_queue(&self, src: &Tensor, dst: &Tensor, queue: QueueId) -> Result<()> {
        self.ensure_live()?;
        self.dispatcher.copy(src, dst, queue).map(|_| ())
    }

    #[tracing::instrument(skip(self), fields(device = self.device.name()))]
    fn on_run_start(&self) -> Result<ExecutionContext> {
        self.ensure_live()?;
        let mut ctx = ExecutionContext::starting(self.next_run.fetch_add(1, Ordering::Relaxed));

        self.ledger.sweep()?;

        let mut device_context = self.contexts.checkout()?;
        let allocator = match self.run_allocators.checkout() {
            Ok(allocator) => allocator,
            Err(err) => {
                self.contexts.restore(device_context);
                return Err(err);
            }
        };
        let token = match DeviceEvent::create(self.device.clone()) {
            Ok(token) => token,
            Err(err) => {
                self.contexts.restore(device_context);
                self.run_allocators.restore(allocator);
                return Err(err);
            }
        };

        let event = token.handle();
        let key = self.ledger.register(Box::new(token));
        device_context.set_current_release(ReleaseSignal { token: key, event });
        tracing::debug!(
            run_id = ctx.run_id(),
            context = device_context.id(),
            %event,
            "run_started"
        );

        ctx.bind(device_context, allocator);
        ctx.set_state(RunState::Running);
        Ok(ctx)
    }

    #[tracing::instrument(skip_all, fields(run_id = ctx.run_id()))]
    fn on_run_end(&self, ctx: &mut ExecutionContext) -> Result<()> {
        if !ctx.is_running() {
            return Err(BackendError::NoActiveRun("on_run_end"));
        }
        ctx.set_state(RunState::RunEnding);

        let signal = ctx
            .device_context
            .as_mut()
            .and_then(|device_context| device_context.take_current_release());
        let result = match signal {
            Some(signal) => self
                .device
                .record_event(signal.event, self.device.default_queue())
                .and_then(|()| self.ledger.mark_signaled(signal.token)),
            None => Err(BackendError::NoActiveRun("on_run_end")),
        };

        self.release_run_resources(ctx);
        ctx.set_state(RunState::Idle);
        if let Err(err) = &result {
            tracing::error!(error = %err, "run_end_failed");
        } else {
            tracing::debug!("run_ended");
        }
        result
    }

    fn add_deferred_release_ptr(&self, ctx: &ExecutionContext, buffer: BufferRef) -> Result<()> {
        if !ctx.is_running() {
            return Err(BackendError::NoActiveRun("add_deferred_release_ptr"));
        }
        if buffer.location().kind != MemoryKind::Host {
            return Err(BackendError::HostOnly(buffer.location()));
        }
        let signal = ctx
            .device_context()
            .and_then(|device_context| device_context.current_release())
            .ok_or(BackendError::NoActiveRun("add_deferred_release_ptr"))?;
        if self.is_shut_down() {
            // Shutdown synchronized the device before draining.
            self.host_allocator.free(buffer)?;
            return Err(BackendError::ShutDown(self.provider_type().to_string()));
        }
        if let Err(err) = self.ledger.defer(signal.token, buffer.clone()) {
            // The entry was drained by a concurrent shutdown.
            tracing::warn!(error = %err, buffer = %buffer.id(), "deferred_release_freed_now");
            self.host_allocator.free(buffer)?;
            return Err(err);
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.ensure_live()?;
        self.device.synchronize()
    }
}

impl Drop for DeviceExecutionProvider {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown() {
            if err.is_device_failure() {
                tracing::error!(error = %err, "device_provider_teardown_failed");
                std::process::abort();
            }
            tracing::warn!(error = %err, "device_provider_teardown_incomplete");
        }
    }
}
