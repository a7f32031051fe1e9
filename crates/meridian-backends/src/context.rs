//! Device contexts and their pool
//!
//! A [`DeviceContext`] bundles the math library handles a run issues work
//! through, plus the completion signal of the run it is serving. Contexts
//! are expensive to build, so the provider keeps idle ones in a
//! [`ContextPool`] keyed only by availability:
//!
//! ```text
//!   on_run_start ──checkout──▶ [ctx bound to one run] ──restore──▶ on_run_end
//!                     ▲                                               │
//!                     └──────────────── idle freelist ◀───────────────┘
//! ```
//!
//! A checked-out context is owned by exactly one run, which is what keeps
//! per-run issue order intact when several threads run concurrently.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::device::{DeviceRef, EventHandle, LibraryHandles};
use crate::error::Result;

/// Completion signal of the run a context is currently serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseSignal {
    /// Ledger key.
    pub token: u64,
    pub event: EventHandle,
}

pub struct DeviceContext {
    id: u64,
    device: DeviceRef,
    handles: LibraryHandles,
    current_release: Option<ReleaseSignal>,
}

impl DeviceContext {
    fn create(id: u64, device: DeviceRef) -> Result<Self> {
        let handles = device.create_library_handles()?;
        tracing::debug!(context = id, device = device.name(), "device_context_created");
        Ok(Self {
            id,
            device,
            handles,
            current_release: None,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn handles(&self) -> LibraryHandles {
        self.handles
    }

    pub fn current_release(&self) -> Option<ReleaseSignal> {
        self.current_release
    }

    pub(crate) fn set_current_release(&mut self, signal: ReleaseSignal) {
        self.current_release = Some(signal);
    }

    pub(crate) fn take_current_release(&mut self) -> Option<ReleaseSignal> {
        self.current_release.take()
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("id", &self.id)
            .field("device", &self.device.name())
            .field("handles", &self.handles)
            .field("current_release", &self.current_release)
            .finish()
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        if let Err(err) = self.device.destroy_library_handles(self.handles) {
            tracing::error!(context = self.id, error = %err, "device_context_teardown_failed");
            std::process::abort();
        }
    }
}

/// Freelist of idle device contexts for one device.
pub struct ContextPool {
    device: DeviceRef,
    idle: Mutex<Vec<DeviceContext>>,
    next_id: AtomicU64,
    created: AtomicUsize,
    max_idle: usize,
}

impl ContextPool {
    pub fn new(device: DeviceRef, max_idle: usize) -> Self {
        Self {
            device,
            idle: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            created: AtomicUsize::new(0),
            max_idle,
        }
    }

    /// Borrow an idle context, or build one.
    pub fn checkout(&self) -> Result<DeviceContext> {
        if let Some(ctx) = self.idle.lock().pop() {
            tracing::trace!(context = ctx.id, "device_context_reused");
            return Ok(ctx);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ctx = DeviceContext::create(id, self.device.clone())?;
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(ctx)
    }

    /// Return a context. Its run association is cleared; past the idle cap
    /// the context is destroyed instead of parked.
    pub fn restore(&self, mut ctx: DeviceContext) {
        ctx.current_release = None;
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(ctx);
        } else {
            drop(idle);
            tracing::debug!(context = ctx.id, max_idle = self.max_idle, "device_context_pool_full");
        }
    }

    pub fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }

    /// Contexts built over the pool's lifetime.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Destroy every idle context.
    pub fn clear(&self) {
        let drained = std::mem::take(&mut *self.idle.lock());
        let released = drained.len();
        drop(drained);
        if released > 0 {
            tracing::debug!(released, "device_context_pool_cleared");
        }
    }
}
