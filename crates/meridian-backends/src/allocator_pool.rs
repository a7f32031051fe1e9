//! Freelist of allocator instances
//!
//! An allocator is either borrowed by one run or idle in the pool. Returning
//! an allocator parks it for the next run instead of destroying it; the
//! mutex is held only for the push or pop.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::allocator::AllocatorRef;
use crate::error::Result;

type AllocatorFactory = Box<dyn Fn() -> Result<AllocatorRef> + Send + Sync>;

pub struct AllocatorPool {
    name: String,
    factory: AllocatorFactory,
    idle: Mutex<Vec<AllocatorRef>>,
    created: AtomicUsize,
    max_idle: usize,
}

impl AllocatorPool {
    /// Pool that builds allocators with `factory` when none is idle and keeps
    /// at most `max_idle` of them parked.
    pub fn new<F>(name: impl Into<String>, max_idle: usize, factory: F) -> Self
    where
        F: Fn() -> Result<AllocatorRef> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Box::new(factory),
            idle: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
            max_idle,
        }
    }

    /// Borrow an idle allocator, or build one.
    pub fn checkout(&self) -> Result<AllocatorRef> {
        if let Some(allocator) = self.idle.lock().pop() {
            tracing::trace!(pool = %self.name, "allocator_reused");
            return Ok(allocator);
        }
        let allocator = (self.factory)()?;
        let created = self.created.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(pool = %self.name, created, "allocator_created");
        Ok(allocator)
    }

    /// Park a borrowed allocator for reuse.
    pub fn restore(&self, allocator: AllocatorRef) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(allocator);
        } else {
            tracing::debug!(pool = %self.name, max_idle = self.max_idle, "allocator_pool_full");
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Allocators built over the pool's lifetime.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Drop every idle allocator.
    pub fn clear(&self) {
        let drained = std::mem::take(&mut *self.idle.lock());
        if !drained.is_empty() {
            tracing::debug!(pool = %self.name, released = drained.len(), "allocator_pool_cleared");
        }
    }
}

impl std::fmt::Debug for AllocatorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatorPool")
            .field("name", &self.name)
            .field("idle", &self.idle_count())
            .field("created", &self.created_count())
            .field("max_idle", &self.max_idle)
            .finish()
    }
}
