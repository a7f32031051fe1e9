//! In-process simulated device
//!
//! Each queue is a worker thread draining a `crossbeam` channel, so queued
//! copies and event records really run asynchronously and in issue order
//! per queue. Device and pinned memory are ordinary byte buffers tagged with
//! their location.
//!
//! Beyond [`DeviceRuntime`], the simulator exposes hooks tests lean on:
//! pausing a queue to hold back completion, injecting a failure into the
//! next call of a given name, a device memory limit, live-resource counters
//! and a log of issued transfers.

use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use meridian_core::{MemoryKind, MemoryLocation};
use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{DeviceRuntime, EventHandle, LibraryHandles, QueueHandle};
use crate::error::{BackendError, Result};
use crate::memory::{Buffer, BufferId, BufferRef};

// ============================================================================
// Public inspection types
// ============================================================================

/// How the device was asked to move bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimTransfer {
    Sync,
    Async(QueueHandle),
}

/// One issued transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferRecord {
    pub mode: SimTransfer,
    pub bytes: usize,
    pub src: MemoryLocation,
    pub dst: MemoryLocation,
}

// ============================================================================
// Queue workers
// ============================================================================

enum QueueCommand {
    Copy { src: BufferRef, dst: BufferRef, bytes: usize },
    Record { event: u64, epoch: u64 },
    Barrier(Sender<()>),
    Shutdown,
}

#[derive(Default)]
struct QueueGate {
    paused: Mutex<bool>,
    resumed: Condvar,
}

impl QueueGate {
    fn set_paused(&self, paused: bool) {
        *self.paused.lock() = paused;
        if !paused {
            self.resumed.notify_all();
        }
    }

    fn wait_open(&self) {
        let mut paused = self.paused.lock();
        while *paused {
            self.resumed.wait(&mut paused);
        }
    }
}

struct QueueWorker {
    commands: Sender<QueueCommand>,
    gate: Arc<QueueGate>,
    thread: Option<JoinHandle<()>>,
}

impl QueueWorker {
    fn spawn(device_id: u32, queue: QueueHandle, shared: Arc<SimShared>) -> Result<Self> {
        let (tx, rx) = channel::unbounded();
        let gate = Arc::new(QueueGate::default());
        let worker_gate = Arc::clone(&gate);
        let thread = thread::Builder::new()
            .name(format!("sim-dev{device_id}-{queue}"))
            .spawn(move || run_queue(queue, rx, worker_gate, shared))
            .map_err(|e| BackendError::device_call("create_queue", e.to_string()))?;

        Ok(Self {
            commands: tx,
            gate,
            thread: Some(thread),
        })
    }

    /// Let queued work drain, then stop the thread.
    fn shutdown(mut self) -> Result<()> {
        self.gate.set_paused(false);
        let _ = self.commands.send(QueueCommand::Shutdown);
        match self.thread.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| BackendError::device_call("destroy_queue", "queue worker panicked")),
            None => Ok(()),
        }
    }
}

fn run_queue(queue: QueueHandle, commands: Receiver<QueueCommand>, gate: Arc<QueueGate>, shared: Arc<SimShared>) {
    while let Ok(command) = commands.recv() {
        gate.wait_open();
        match command {
            QueueCommand::Copy { src, dst, bytes } => {
                if let Err(err) = dst.copy_prefix_from(&src, bytes) {
                    tracing::error!(%queue, error = %err, "queued_copy_failed");
                }
            }
            QueueCommand::Record { event, epoch } => shared.complete_event(event, epoch),
            QueueCommand::Barrier(done) => {
                let _ = done.send(());
            }
            QueueCommand::Shutdown => break,
        }
    }
}

// ============================================================================
// Shared event state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventState {
    Created,
    Pending(u64),
    Complete,
}

#[derive(Default)]
struct SimShared {
    events: Mutex<FxHashMap<u64, EventState>>,
    event_done: Condvar,
    next_epoch: AtomicU64,
}

impl SimShared {
    fn complete_event(&self, event: u64, epoch: u64) {
        let mut events = self.events.lock();
        // A re-record supersedes older records of the same event.
        if let Some(state) = events.get_mut(&event) {
            if *state == EventState::Pending(epoch) {
                *state = EventState::Complete;
                self.event_done.notify_all();
            }
        }
    }
}

#[derive(Default)]
struct MemoryTracker {
    live: FxHashMap<BufferId, usize>,
    bytes: usize,
}

impl MemoryTracker {
    fn insert(&mut self, buffer: &Buffer) {
        self.live.insert(buffer.id(), buffer.len());
        self.bytes += buffer.len();
    }

    fn remove(&mut self, buffer: &Buffer) -> bool {
        match self.live.remove(&buffer.id()) {
            Some(len) => {
                self.bytes -= len;
                true
            }
            None => false,
        }
    }
}

// ============================================================================
// SimDevice
// ============================================================================

/// Simulated device with real asynchronous queues.
pub struct SimDevice {
    device_id: u32,
    name: String,
    memory_limit: Option<usize>,
    shared: Arc<SimShared>,
    default_queue: QueueHandle,
    queues: Mutex<FxHashMap<u64, QueueWorker>>,
    next_handle: AtomicU64,
    device_memory: Mutex<MemoryTracker>,
    pinned_memory: Mutex<MemoryTracker>,
    library_handles: Mutex<FxHashSet<LibraryHandles>>,
    transfers: Mutex<Vec<TransferRecord>>,
    faults: Mutex<FxHashSet<&'static str>>,
}

impl SimDevice {
    /// Device with unlimited memory.
    pub fn new(device_id: u32) -> Result<Self> {
        Self::build(device_id, None)
    }

    /// Device whose allocations fail once `limit` bytes are live.
    pub fn with_memory_limit(device_id: u32, limit: usize) -> Result<Self> {
        Self::build(device_id, Some(limit))
    }

    fn build(device_id: u32, memory_limit: Option<usize>) -> Result<Self> {
        let shared = Arc::new(SimShared::default());
        let default_queue = QueueHandle(0);
        let worker = QueueWorker::spawn(device_id, default_queue, Arc::clone(&shared))?;
        let mut queues = FxHashMap::default();
        queues.insert(default_queue.0, worker);

        tracing::debug!(device_id, ?memory_limit, "sim_device_created");
        Ok(Self {
            device_id,
            name: format!("sim:{device_id}"),
            memory_limit,
            shared,
            default_queue,
            queues: Mutex::new(queues),
            next_handle: AtomicU64::new(1),
            device_memory: Mutex::new(MemoryTracker::default()),
            pinned_memory: Mutex::new(MemoryTracker::default()),
            library_handles: Mutex::new(FxHashSet::default()),
            transfers: Mutex::new(Vec::new()),
            faults: Mutex::new(FxHashSet::default()),
        })
    }

    // ---- test hooks -------------------------------------------------------

    /// Hold back execution on `queue` until [`SimDevice::resume_queue`].
    pub fn pause_queue(&self, queue: QueueHandle) -> Result<()> {
        self.gate(queue)?.set_paused(true);
        Ok(())
    }

    pub fn resume_queue(&self, queue: QueueHandle) -> Result<()> {
        self.gate(queue)?.set_paused(false);
        Ok(())
    }

    /// Make the next call named `call` (e.g. `"create_event"`) fail.
    pub fn fail_next(&self, call: &'static str) {
        self.faults.lock().insert(call);
    }

    pub fn transfers(&self) -> Vec<TransferRecord> {
        self.transfers.lock().clone()
    }

    pub fn clear_transfers(&self) {
        self.transfers.lock().clear();
    }

    pub fn device_bytes_in_use(&self) -> usize {
        self.device_memory.lock().bytes
    }

    pub fn pinned_bytes_in_use(&self) -> usize {
        self.pinned_memory.lock().bytes
    }

    pub fn live_events(&self) -> usize {
        self.shared.events.lock().len()
    }

    /// Queues including the default one.
    pub fn live_queues(&self) -> usize {
        self.queues.lock().len()
    }

    pub fn live_library_handles(&self) -> usize {
        self.library_handles.lock().len()
    }

    // ---- internals --------------------------------------------------------

    fn next_id(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn check_fault(&self, call: &'static str) -> Result<()> {
        if self.faults.lock().remove(call) {
            return Err(BackendError::device_call(call, "injected failure"));
        }
        Ok(())
    }

    fn gate(&self, queue: QueueHandle) -> Result<Arc<QueueGate>> {
        self.queues
            .lock()
            .get(&queue.0)
            .map(|w| Arc::clone(&w.gate))
            .ok_or(BackendError::InvalidQueue(queue.0))
    }

    fn submit(&self, queue: QueueHandle, command: QueueCommand) -> Result<()> {
        let sender = self
            .queues
            .lock()
            .get(&queue.0)
            .map(|w| w.commands.clone())
            .ok_or(BackendError::InvalidQueue(queue.0))?;
        sender
            .send(command)
            .map_err(|_| BackendError::device_call("submit", format!("{queue} is no longer running")))
    }

    fn check_copy(&self, src: &BufferRef, dst: &BufferRef, bytes: usize) -> Result<()> {
        for buffer in [src, dst] {
            if bytes > buffer.len() {
                return Err(BackendError::BufferTooSmall {
                    needed: bytes,
                    actual: buffer.len(),
                });
            }
        }
        Ok(())
    }

    fn log_transfer(&self, mode: SimTransfer, src: &BufferRef, dst: &BufferRef, bytes: usize) {
        self.transfers.lock().push(TransferRecord {
            mode,
            bytes,
            src: src.location(),
            dst: dst.location(),
        });
    }

    fn release_memory(&self, tracker: &Mutex<MemoryTracker>, buffer: &Buffer, kind: MemoryKind) -> Result<()> {
        let call = if kind == MemoryKind::Device { "free" } else { "free_pinned" };
        self.check_fault(call)?;
        if buffer.location().kind != kind || !tracker.lock().remove(buffer) {
            return Err(BackendError::device_call(
                call,
                format!("{} at {} was not allocated here", buffer.id(), buffer.location()),
            ));
        }
        Ok(())
    }
}

impl DeviceRuntime for SimDevice {
    fn device_id(&self) -> u32 {
        self.device_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn default_queue(&self) -> QueueHandle {
        self.default_queue
    }

    fn create_queue(&self) -> Result<QueueHandle> {
        self.check_fault("create_queue")?;
        let queue = QueueHandle(self.next_id());
        let worker = QueueWorker::spawn(self.device_id, queue, Arc::clone(&self.shared))?;
        self.queues.lock().insert(queue.0, worker);
        tracing::trace!(%queue, "sim_queue_created");
        Ok(queue)
    }

    fn destroy_queue(&self, queue: QueueHandle) -> Result<()> {
        self.check_fault("destroy_queue")?;
        if queue == self.default_queue {
            return Err(BackendError::InvalidQueue(queue.0));
        }
        let worker = self
            .queues
            .lock()
            .remove(&queue.0)
            .ok_or(BackendError::InvalidQueue(queue.0))?;
        worker.shutdown()
    }

    fn alloc(&self, bytes: usize) -> Result<BufferRef> {
        self.check_fault("alloc")?;
        let mut memory = self.device_memory.lock();
        if let Some(limit) = self.memory_limit {
            let available = limit.saturating_sub(memory.bytes);
            if bytes > available {
                return Err(BackendError::OutOfMemory {
                    requested: bytes,
                    available,
                });
            }
        }
        let buffer = Buffer::zeroed(MemoryLocation::device(self.device_id), bytes);
        memory.insert(&buffer);
        Ok(buffer)
    }

    fn free(&self, buffer: BufferRef) -> Result<()> {
        self.release_memory(&self.device_memory, &buffer, MemoryKind::Device)
    }

    fn alloc_pinned(&self, bytes: usize) -> Result<BufferRef> {
        self.check_fault("alloc_pinned")?;
        let buffer = Buffer::zeroed(MemoryLocation::pinned(self.device_id), bytes);
        self.pinned_memory.lock().insert(&buffer);
        Ok(buffer)
    }

    fn free_pinned(&self, buffer: BufferRef) -> Result<()> {
        self.release_memory(&self.pinned_memory, &buffer, MemoryKind::PinnedHost)
    }

    fn copy_sync(&self, src: &BufferRef, dst: &BufferRef, bytes: usize) -> Result<()> {
        self.check_fault("copy_sync")?;
        self.check_copy(src, dst, bytes)?;
        self.synchronize_queue(self.default_queue)?;
        self.log_transfer(SimTransfer::Sync, src, dst, bytes);
        dst.copy_prefix_from(src, bytes)
    }

    fn copy_async(&self, src: &BufferRef, dst: &BufferRef, bytes: usize, queue: QueueHandle) -> Result<()> {
        self.check_fault("copy_async")?;
        self.check_copy(src, dst, bytes)?;
        self.submit(
            queue,
            QueueCommand::Copy {
                src: Arc::clone(src),
                dst: Arc::clone(dst),
                bytes,
            },
        )?;
        self.log_transfer(SimTransfer::Async(queue), src, dst, bytes);
        Ok(())
    }

    fn create_event(&self) -> Result<EventHandle> {
        self.check_fault("create_event")?;
        let event = EventHandle(self.next_id());
        self.shared.events.lock().insert(event.0, EventState::Created);
        Ok(event)
    }

    fn record_event(&self, event: EventHandle, queue: QueueHandle) -> Result<()> {
        self.check_fault("record_event")?;
        // Validate the queue before touching the event state.
        self.gate(queue)?;
        let epoch = self.shared.next_epoch.fetch_add(1, Ordering::Relaxed);
        {
            let mut events = self.shared.events.lock();
            let state = events
                .get_mut(&event.0)
                .ok_or_else(|| BackendError::device_call("record_event", format!("unknown {event}")))?;
            *state = EventState::Pending(epoch);
        }
        self.submit(queue, QueueCommand::Record { event: event.0, epoch })
    }

    fn query_event(&self, event: EventHandle) -> Result<bool> {
        self.check_fault("query_event")?;
        match self.shared.events.lock().get(&event.0) {
            Some(EventState::Pending(_)) => Ok(false),
            Some(EventState::Created | EventState::Complete) => Ok(true),
            None => Err(BackendError::device_call("query_event", format!("unknown {event}"))),
        }
    }

    fn synchronize_event(&self, event: EventHandle) -> Result<()> {
        self.check_fault("synchronize_event")?;
        let mut events = self.shared.events.lock();
        loop {
            match events.get(&event.0) {
                Some(EventState::Pending(_)) => self.shared.event_done.wait(&mut events),
                Some(_) => return Ok(()),
                None => {
                    return Err(BackendError::device_call("synchronize_event", format!("unknown {event}")));
                }
            }
        }
    }

    fn destroy_event(&self, event: EventHandle) -> Result<()> {
        self.check_fault("destroy_event")?;
        self.shared
            .events
            .lock()
            .remove(&event.0)
            .map(|_| ())
            .ok_or_else(|| BackendError::device_call("destroy_event", format!("unknown {event}")))
    }

    fn synchronize_queue(&self, queue: QueueHandle) -> Result<()> {
        let (tx, rx) = channel::bounded(1);
        self.submit(queue, QueueCommand::Barrier(tx))?;
        rx.recv()
            .map_err(|_| BackendError::device_call("synchronize_queue", format!("{queue} stopped")))
    }

    fn synchronize(&self) -> Result<()> {
        self.check_fault("synchronize")?;
        let queues: Vec<QueueHandle> = self.queues.lock().keys().map(|&id| QueueHandle(id)).collect();
        let mut pending = Vec::with_capacity(queues.len());
        for queue in queues {
            let (tx, rx) = channel::bounded(1);
            self.submit(queue, QueueCommand::Barrier(tx))?;
            pending.push((queue, rx));
        }
        for (queue, rx) in pending {
            rx.recv()
                .map_err(|_| BackendError::device_call("synchronize", format!("{queue} stopped")))?;
        }
        Ok(())
    }

    fn create_library_handles(&self) -> Result<LibraryHandles> {
        self.check_fault("create_library_handles")?;
        let handles = LibraryHandles {
            blas: self.next_id(),
            dnn: self.next_id(),
        };
        self.library_handles.lock().insert(handles);
        Ok(handles)
    }

    fn destroy_library_handles(&self, handles: LibraryHandles) -> Result<()> {
        self.check_fault("destroy_library_handles")?;
        if self.library_handles.lock().remove(&handles) {
            Ok(())
        } else {
            Err(BackendError::device_call(
                "destroy_library_handles",
                format!("unknown handles {handles:?}"),
            ))
        }
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        let workers: Vec<QueueWorker> = self.queues.lock().drain().map(|(_, w)| w).collect();
        for worker in workers {
            if let Err(err) = worker.shutdown() {
                tracing::warn!(error = %err, device_id = self.device_id, "sim_queue_shutdown_failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn host(bytes: &[u8]) -> BufferRef {
        let buf = Buffer::zeroed(MemoryLocation::host(), bytes.len());
        buf.write_bytes(bytes).unwrap();
        buf
    }

    #[test]
    fn unrecorded_event_reports_finished() {
        let device = SimDevice::new(0).unwrap();
        let event = device.create_event().unwrap();
        assert!(device.query_event(event).unwrap());
        device.synchronize_event(event).unwrap();
        device.destroy_event(event).unwrap();
        assert_eq!(device.live_events(), 0);
    }

    #[test]
    fn paused_queue_holds_event_pending() {
        let device = SimDevice::new(0).unwrap();
        let queue = device.default_queue();
        let event = device.create_event().unwrap();

        device.pause_queue(queue).unwrap();
        device.record_event(event, queue).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(!device.query_event(event).unwrap());

        device.resume_queue(queue).unwrap();
        device.synchronize_event(event).unwrap();
        assert!(device.query_event(event).unwrap());
    }

    #[test]
    fn queued_copies_run_in_order() {
        let device = SimDevice::new(0).unwrap();
        let queue = device.create_queue().unwrap();
        let dev = device.alloc(4).unwrap();
        let out = Buffer::zeroed(MemoryLocation::pinned(0), 4);

        device.copy_async(&host(&[1, 1, 1, 1]), &dev, 4, queue).unwrap();
        device.copy_async(&host(&[2, 2]), &dev, 2, queue).unwrap();
        device.copy_async(&dev, &out, 4, queue).unwrap();
        device.synchronize_queue(queue).unwrap();

        assert_eq!(out.read_bytes().unwrap(), vec![2, 2, 1, 1]);
        device.destroy_queue(queue).unwrap();
    }

    #[test]
    fn sync_copy_waits_for_default_queue() {
        let device = SimDevice::new(0).unwrap();
        let queue = device.default_queue();
        let dev = device.alloc(2).unwrap();
        let out = Buffer::zeroed(MemoryLocation::host(), 2);

        device.copy_async(&host(&[7, 8]), &dev, 2, queue).unwrap();
        device.copy_sync(&dev, &out, 2).unwrap();
        assert_eq!(out.read_bytes().unwrap(), vec![7, 8]);
    }

    #[test]
    fn memory_limit_is_enforced() {
        let device = SimDevice::with_memory_limit(0, 16).unwrap();
        let a = device.alloc(12).unwrap();
        let err = device.alloc(8).unwrap_err();
        assert!(matches!(err, BackendError::OutOfMemory { requested: 8, available: 4 }));
        device.free(a).unwrap();
        assert_eq!(device.device_bytes_in_use(), 0);
        device.alloc(16).unwrap();
    }

    #[test]
    fn freeing_foreign_memory_fails() {
        let device = SimDevice::new(0).unwrap();
        let err = device.free(Buffer::zeroed(MemoryLocation::device(0), 4)).unwrap_err();
        assert!(err.is_device_failure());
        let pinned = device.alloc_pinned(4).unwrap();
        assert!(device.free(pinned.clone()).is_err());
        device.free_pinned(pinned).unwrap();
    }

    #[test]
    fn injected_failure_hits_once() {
        let device = SimDevice::new(0).unwrap();
        device.fail_next("create_event");
        let err = device.create_event().unwrap_err();
        assert!(matches!(err, BackendError::DeviceCall { call: "create_event", .. }));
        device.create_event().unwrap();
    }

    #[test]
    fn default_queue_cannot_be_destroyed() {
        let device = SimDevice::new(0).unwrap();
        assert!(matches!(
            device.destroy_queue(device.default_queue()),
            Err(BackendError::InvalidQueue(0))
        ));
        assert_eq!(device.live_queues(), 1);
    }

    #[test]
    fn library_handles_are_tracked() {
        let device = SimDevice::new(0).unwrap();
        let handles = device.create_library_handles().unwrap();
        assert_eq!(device.live_library_handles(), 1);
        device.destroy_library_handles(handles).unwrap();
        assert!(device.destroy_library_handles(handles).is_err());
    }

    #[test]
    fn transfers_are_logged() {
        let device = SimDevice::new(0).unwrap();
        let dev = device.alloc(2).unwrap();
        device.copy_sync(&host(&[1, 2]), &dev, 2).unwrap();
        let log = device.transfers();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].mode, SimTransfer::Sync);
        assert_eq!(log[0].dst, MemoryLocation::device(0));
    }
}
