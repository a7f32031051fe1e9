//! Allocators handed out by execution providers
//!
//! Every allocator tracks the buffers it handed out, so returning a buffer
//! to the wrong allocator is caught instead of silently corrupting the
//! accounting of two memory spaces.
//!
//! | Allocator          | Memory       | Shared across threads |
//! |--------------------|--------------|-----------------------|
//! | [`HostAllocator`]  | plain host   | yes                   |
//! | [`PinnedAllocator`]| pinned host  | yes                   |
//! | [`DeviceAllocator`]| device       | no (pooled per run)   |

use std::sync::Arc;
use std::time::Instant;

use meridian_core::{MemType, MemoryLocation};
use meridian_tracing::performance::record_allocation;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::device::DeviceRef;
use crate::error::{BackendError, Result};
use crate::memory::{Buffer, BufferId, BufferRef};

/// Static description of an allocator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorInfo {
    pub name: String,
    pub mem_type: MemType,
    pub location: MemoryLocation,
}

/// Usage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub allocations: u64,
    pub frees: u64,
    pub bytes_in_use: usize,
    pub peak_bytes: usize,
}

/// Source of buffers in one memory space.
pub trait Allocator: Send + Sync {
    fn info(&self) -> &AllocatorInfo;

    fn alloc(&self, bytes: usize) -> Result<BufferRef>;

    /// Return a buffer previously handed out by this allocator.
    fn free(&self, buffer: BufferRef) -> Result<()>;

    fn stats(&self) -> AllocatorStats;
}

pub type AllocatorRef = Arc<dyn Allocator>;

// ============================================================================
// Bookkeeping shared by the implementations
// ============================================================================

#[derive(Default)]
struct Usage {
    live: FxHashMap<BufferId, usize>,
    stats: AllocatorStats,
}

#[derive(Default)]
struct UsageTracker(Mutex<Usage>);

impl UsageTracker {
    fn track(&self, buffer: &Buffer) {
        let mut usage = self.0.lock();
        usage.live.insert(buffer.id(), buffer.len());
        usage.stats.allocations += 1;
        usage.stats.bytes_in_use += buffer.len();
        usage.stats.peak_bytes = usage.stats.peak_bytes.max(usage.stats.bytes_in_use);
    }

    fn untrack(&self, buffer: &Buffer, info: &AllocatorInfo) -> Result<()> {
        let mut usage = self.0.lock();
        let len = usage.live.remove(&buffer.id()).ok_or_else(|| BackendError::ForeignBuffer {
            buffer: buffer.id(),
            location: buffer.location(),
            allocator: info.name.clone(),
        })?;
        usage.stats.frees += 1;
        usage.stats.bytes_in_use -= len;
        Ok(())
    }

    fn stats(&self) -> AllocatorStats {
        self.0.lock().stats
    }
}

fn timed_alloc(info: &AllocatorInfo, bytes: usize, alloc: impl FnOnce() -> Result<BufferRef>) -> Result<BufferRef> {
    let start = Instant::now();
    let buffer = alloc()?;
    record_allocation(bytes, &info.name, start.elapsed().as_micros() as u64);
    Ok(buffer)
}

// ============================================================================
// Host
// ============================================================================

/// Plain pageable host memory.
pub struct HostAllocator {
    info: AllocatorInfo,
    usage: UsageTracker,
}

impl HostAllocator {
    pub fn new(name: impl Into<String>, mem_type: MemType) -> Self {
        Self {
            info: AllocatorInfo {
                name: name.into(),
                mem_type,
                location: MemoryLocation::host(),
            },
            usage: UsageTracker::default(),
        }
    }

    /// The general purpose host allocator.
    pub fn plain() -> Self {
        Self::new("Cpu", MemType::Cpu)
    }
}

impl Allocator for HostAllocator {
    fn info(&self) -> &AllocatorInfo {
        &self.info
    }

    fn alloc(&self, bytes: usize) -> Result<BufferRef> {
        let buffer = timed_alloc(&self.info, bytes, || Ok(Buffer::zeroed(self.info.location, bytes)))?;
        self.usage.track(&buffer);
        Ok(buffer)
    }

    fn free(&self, buffer: BufferRef) -> Result<()> {
        self.usage.untrack(&buffer, &self.info)
    }

    fn stats(&self) -> AllocatorStats {
        self.usage.stats()
    }
}

// ============================================================================
// Pinned host
// ============================================================================

/// Page-locked host memory obtained from the device runtime.
pub struct PinnedAllocator {
    info: AllocatorInfo,
    device: DeviceRef,
    usage: UsageTracker,
}

impl PinnedAllocator {
    pub fn new(device: DeviceRef) -> Self {
        Self {
            info: AllocatorInfo {
                name: "DevicePinned".to_string(),
                mem_type: MemType::CpuOutput,
                location: MemoryLocation::pinned(device.device_id()),
            },
            device,
            usage: UsageTracker::default(),
        }
    }
}

impl Allocator for PinnedAllocator {
    fn info(&self) -> &AllocatorInfo {
        &self.info
    }

    fn alloc(&self, bytes: usize) -> Result<BufferRef> {
        let buffer = timed_alloc(&self.info, bytes, || self.device.alloc_pinned(bytes))?;
        self.usage.track(&buffer);
        Ok(buffer)
    }

    fn free(&self, buffer: BufferRef) -> Result<()> {
        self.usage.untrack(&buffer, &self.info)?;
        self.device.free_pinned(buffer)
    }

    fn stats(&self) -> AllocatorStats {
        self.usage.stats()
    }
}

// ============================================================================
// Device
// ============================================================================

/// Device-resident memory.
pub struct DeviceAllocator {
    info: AllocatorInfo,
    device: DeviceRef,
    usage: UsageTracker,
}

impl DeviceAllocator {
    pub fn new(device: DeviceRef) -> Self {
        Self {
            info: AllocatorInfo {
                name: "Device".to_string(),
                mem_type: MemType::Default,
                location: MemoryLocation::device(device.device_id()),
            },
            device,
            usage: UsageTracker::default(),
        }
    }
}

impl Allocator for DeviceAllocator {
    fn info(&self) -> &AllocatorInfo {
        &self.info
    }

    fn alloc(&self, bytes: usize) -> Result<BufferRef> {
        let buffer = timed_alloc(&self.info, bytes, || self.device.alloc(bytes))?;
        self.usage.track(&buffer);
        Ok(buffer)
    }

    fn free(&self, buffer: BufferRef) -> Result<()> {
        self.usage.untrack(&buffer, &self.info)?;
        self.device.free(buffer)
    }

    fn stats(&self) -> AllocatorStats {
        self.usage.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SimDevice;
    use meridian_core::MemoryKind;

    fn sim() -> DeviceRef {
        Arc::new(SimDevice::new(0).unwrap())
    }

    #[test]
    fn host_allocator_tracks_usage() {
        let alloc = HostAllocator::plain();
        let a = alloc.alloc(16).unwrap();
        let b = alloc.alloc(8).unwrap();
        assert_eq!(alloc.stats().bytes_in_use, 24);

        alloc.free(a).unwrap();
        let stats = alloc.stats();
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.frees, 1);
        assert_eq!(stats.bytes_in_use, 8);
        assert_eq!(stats.peak_bytes, 24);
        alloc.free(b).unwrap();
    }

    #[test]
    fn foreign_buffers_are_rejected() {
        let first = HostAllocator::plain();
        let second = HostAllocator::plain();
        let buf = first.alloc(4).unwrap();
        let err = second.free(buf.clone()).unwrap_err();
        assert!(matches!(err, BackendError::ForeignBuffer { .. }));
        first.free(buf.clone()).unwrap();
        assert!(first.free(buf).is_err());
    }

    #[test]
    fn device_allocators_report_their_memory() {
        let device = sim();
        let pinned = PinnedAllocator::new(device.clone());
        let dev = DeviceAllocator::new(device);

        assert_eq!(pinned.info().mem_type, MemType::CpuOutput);
        assert_eq!(pinned.alloc(4).unwrap().location().kind, MemoryKind::PinnedHost);
        assert_eq!(dev.info().location, MemoryLocation::device(0));
        assert_eq!(dev.alloc(4).unwrap().location().kind, MemoryKind::Device);
    }

    #[test]
    fn device_allocator_returns_memory_to_device() {
        let sim = Arc::new(SimDevice::new(0).unwrap());
        let dev = DeviceAllocator::new(sim.clone());
        let buf = dev.alloc(32).unwrap();
        assert_eq!(sim.device_bytes_in_use(), 32);
        dev.free(buf).unwrap();
        assert_eq!(sim.device_bytes_in_use(), 0);
    }
}
