//! Raw byte buffers shared between allocators, tensors and device queues

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use meridian_core::MemoryLocation;
use parking_lot::Mutex;

use crate::error::{BackendError, Result};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique buffer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    fn next() -> Self {
        BufferId(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf{}", self.0)
    }
}

/// Fixed-size region of memory at one location.
///
/// Bytes are reachable from the host only for host and pinned buffers;
/// device buffers are touched exclusively by the device runtime, which may
/// do so from its queue threads while the buffer is in flight.
pub struct Buffer {
    id: BufferId,
    location: MemoryLocation,
    data: Mutex<Vec<u8>>,
}

/// Shared handle to a buffer. In-flight transfers keep their own clone.
pub type BufferRef = Arc<Buffer>;

impl Buffer {
    /// Zero-filled buffer. Meant for allocator and device implementations.
    pub fn zeroed(location: MemoryLocation, len: usize) -> BufferRef {
        Arc::new(Self {
            id: BufferId::next(),
            location,
            data: Mutex::new(vec![0; len]),
        })
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn location(&self) -> MemoryLocation {
        self.location
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the contents. Host-visible buffers only.
    pub fn read_bytes(&self) -> Result<Vec<u8>> {
        self.ensure_host_visible()?;
        Ok(self.data.lock().clone())
    }

    /// Overwrite the leading bytes. Host-visible buffers only.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        self.ensure_host_visible()?;
        let mut data = self.data.lock();
        if bytes.len() > data.len() {
            return Err(BackendError::BufferTooSmall {
                needed: bytes.len(),
                actual: data.len(),
            });
        }
        data[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Copy the first `bytes` bytes of `src` into `self`, regardless of
    /// location. This is the primitive every transfer mode ends in.
    pub(crate) fn copy_prefix_from(&self, src: &Buffer, bytes: usize) -> Result<()> {
        if self.id == src.id {
            return Ok(());
        }
        // Snapshot first so the two locks are never held together.
        let staged = {
            let data = src.data.lock();
            if bytes > data.len() {
                return Err(BackendError::BufferTooSmall {
                    needed: bytes,
                    actual: data.len(),
                });
            }
            data[..bytes].to_vec()
        };

        let mut dst = self.data.lock();
        if bytes > dst.len() {
            return Err(BackendError::BufferTooSmall {
                needed: bytes,
                actual: dst.len(),
            });
        }
        dst[..bytes].copy_from_slice(&staged);
        Ok(())
    }

    fn ensure_host_visible(&self) -> Result<()> {
        if self.location.kind.is_host() {
            Ok(())
        } else {
            Err(BackendError::HostOnly(self.location))
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = Buffer::zeroed(MemoryLocation::host(), 4);
        let b = Buffer::zeroed(MemoryLocation::host(), 4);
        assert_ne!(a.id(), b.id());
        assert!(a.id().to_string().starts_with("buf"));
    }

    #[test]
    fn host_buffers_read_and_write() {
        let buf = Buffer::zeroed(MemoryLocation::pinned(0), 4);
        buf.write_bytes(&[1, 2]).unwrap();
        assert_eq!(buf.read_bytes().unwrap(), vec![1, 2, 0, 0]);
    }

    #[test]
    fn oversized_write_is_rejected() {
        let buf = Buffer::zeroed(MemoryLocation::host(), 2);
        let err = buf.write_bytes(&[0; 3]).unwrap_err();
        assert!(matches!(err, BackendError::BufferTooSmall { needed: 3, actual: 2 }));
    }

    #[test]
    fn device_buffers_are_not_host_visible() {
        let buf = Buffer::zeroed(MemoryLocation::device(0), 8);
        assert!(matches!(buf.read_bytes(), Err(BackendError::HostOnly(_))));
        assert!(matches!(buf.write_bytes(&[1]), Err(BackendError::HostOnly(_))));
    }

    #[test]
    fn prefix_copy_crosses_locations() {
        let src = Buffer::zeroed(MemoryLocation::host(), 4);
        src.write_bytes(&[9, 8, 7, 6]).unwrap();
        let dev = Buffer::zeroed(MemoryLocation::device(0), 4);
        let back = Buffer::zeroed(MemoryLocation::host(), 4);

        dev.copy_prefix_from(&src, 3).unwrap();
        back.copy_prefix_from(&dev, 4).unwrap();
        assert_eq!(back.read_bytes().unwrap(), vec![9, 8, 7, 0]);
    }

    #[test]
    fn self_copy_is_a_no_op() {
        let buf = Buffer::zeroed(MemoryLocation::host(), 2);
        buf.write_bytes(&[5, 5]).unwrap();
        buf.copy_prefix_from(&buf, 2).unwrap();
        assert_eq!(buf.read_bytes().unwrap(), vec![5, 5]);
    }
}
