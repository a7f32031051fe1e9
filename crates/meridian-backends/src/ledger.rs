//! Deferred reclamation of host buffers
//!
//! A host buffer that an in-flight device operation may still read or write
//! must not go back to the host allocator until that operation is known to
//! have finished. Each run registers one entry keyed by its completion
//! token; buffers released during the run are parked on that entry.
//!
//! ```text
//!   register ──▶ defer* ──▶ mark_signaled ──▶ sweep (token finished) ──▶ freed
//!                                        └──▶ drain (blocks on token) ──▶ freed
//! ```
//!
//! Entries that have not been signaled are never swept: the run that owns
//! them may still be issuing work. A single mutex guards every operation.

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::allocator::AllocatorRef;
use crate::device::CompletionToken;
use crate::error::{BackendError, Result};
use crate::memory::BufferRef;

struct PendingRelease {
    token: Box<dyn CompletionToken>,
    buffers: Vec<BufferRef>,
    signaled: bool,
}

/// Outcome of a sweep or drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub entries_released: usize,
    pub buffers_freed: usize,
}

#[derive(Default)]
struct LedgerState {
    entries: BTreeMap<u64, PendingRelease>,
    next_key: u64,
}

pub struct DeferredReleaseLedger {
    host: AllocatorRef,
    state: Mutex<LedgerState>,
}

impl DeferredReleaseLedger {
    /// Ledger returning buffers to `host`.
    pub fn new(host: AllocatorRef) -> Self {
        Self {
            host,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Start an empty entry for `token`. Returns the entry key.
    pub fn register(&self, token: Box<dyn CompletionToken>) -> u64 {
        let mut state = self.state.lock();
        state.next_key += 1;
        let key = state.next_key;
        tracing::trace!(key, token = token.id(), "release_entry_registered");
        state.entries.insert(
            key,
            PendingRelease {
                token,
                buffers: Vec::new(),
                signaled: false,
            },
        );
        key
    }

    /// Park `buffer` on entry `key` until its token finishes.
    pub fn defer(&self, key: u64, buffer: BufferRef) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(&key)
            .ok_or(BackendError::UnknownReleaseToken(key))?;
        tracing::trace!(key, buffer = %buffer.id(), "release_deferred");
        entry.buffers.push(buffer);
        Ok(())
    }

    /// The entry's token has been queued; it may be swept once finished.
    pub fn mark_signaled(&self, key: u64) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state
            .entries
            .get_mut(&key)
            .ok_or(BackendError::UnknownReleaseToken(key))?;
        entry.signaled = true;
        Ok(())
    }

    /// Free every signaled entry whose token reports finished.
    pub fn sweep(&self) -> Result<SweepStats> {
        let ready = {
            let mut state = self.state.lock();
            let mut keys = Vec::new();
            for (&key, entry) in &state.entries {
                if entry.signaled && entry.token.is_finished()? {
                    keys.push(key);
                }
            }
            keys.into_iter()
                .filter_map(|key| state.entries.remove(&key).map(|e| (key, e)))
                .collect::<Vec<_>>()
        };

        let mut stats = SweepStats::default();
        let mut first_error = None;
        for (key, entry) in ready {
            self.release(key, entry, &mut stats, &mut first_error);
        }
        if stats.entries_released > 0 {
            tracing::debug!(
                entries = stats.entries_released,
                buffers = stats.buffers_freed,
                "deferred_release_swept"
            );
        }
        first_error.map_or(Ok(stats), Err)
    }

    /// Free everything, blocking on each signaled token first. Keeps going
    /// past failures and reports the first one.
    pub fn drain(&self) -> Result<SweepStats> {
        let entries = std::mem::take(&mut self.state.lock().entries);

        let mut stats = SweepStats::default();
        let mut first_error = None;
        for (key, entry) in entries {
            if entry.signaled {
                if let Err(err) = entry.token.block_until_finished() {
                    tracing::error!(key, error = %err, "deferred_release_wait_failed");
                    first_error.get_or_insert(err);
                }
            }
            self.release(key, entry, &mut stats, &mut first_error);
        }
        tracing::debug!(
            entries = stats.entries_released,
            buffers = stats.buffers_freed,
            "deferred_release_drained"
        );
        first_error.map_or(Ok(stats), Err)
    }

    fn release(&self, key: u64, entry: PendingRelease, stats: &mut SweepStats, first_error: &mut Option<BackendError>) {
        for buffer in entry.buffers {
            match self.host.free(buffer) {
                Ok(()) => stats.buffers_freed += 1,
                Err(err) => {
                    tracing::error!(key, error = %err, "deferred_free_failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Err(err) = entry.token.release() {
            tracing::error!(key, error = %err, "completion_token_release_failed");
            first_error.get_or_insert(err);
        }
        stats.entries_released += 1;
    }

    /// Entries not yet freed.
    pub fn pending_len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Buffers parked across all entries.
    pub fn pending_buffers(&self) -> usize {
        self.state.lock().entries.values().map(|e| e.buffers.len()).sum()
    }
}
