//! Where tensor bytes live and how providers name their memory.

use std::fmt;

/// Physical class of memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryKind {
    /// Pageable host memory. Device transfers touching it must be synchronous.
    Host,
    /// Page-locked host memory, safe for asynchronous device transfers.
    PinnedHost,
    /// Device-resident memory.
    Device,
}

impl MemoryKind {
    pub const fn is_host(self) -> bool {
        matches!(self, Self::Host | Self::PinnedHost)
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Host => "host",
            Self::PinnedHost => "pinned-host",
            Self::Device => "device",
        };
        f.write_str(name)
    }
}

/// Memory kind plus the device the memory belongs to. Plain host memory
/// always reports device 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryLocation {
    pub kind: MemoryKind,
    pub device_id: u32,
}

impl MemoryLocation {
    pub const fn host() -> Self {
        Self {
            kind: MemoryKind::Host,
            device_id: 0,
        }
    }

    pub const fn pinned(device_id: u32) -> Self {
        Self {
            kind: MemoryKind::PinnedHost,
            device_id,
        }
    }

    pub const fn device(device_id: u32) -> Self {
        Self {
            kind: MemoryKind::Device,
            device_id,
        }
    }
}

impl fmt::Display for MemoryLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            MemoryKind::Host => write!(f, "host"),
            kind => write!(f, "{kind}:{}", self.device_id),
        }
    }
}

/// Flavour of memory requested from a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemType {
    /// The provider's native memory (device memory for a device provider).
    Default,
    /// Host memory a provider kernel reads as input.
    CpuInput,
    /// Host-visible memory a provider kernel writes as output. Pinned on
    /// device providers.
    CpuOutput,
    /// Plain host memory.
    Cpu,
}

impl MemType {
    /// Memory kind backing this flavour on a device provider.
    pub const fn device_provider_kind(self) -> MemoryKind {
        match self {
            Self::Default => MemoryKind::Device,
            Self::CpuOutput => MemoryKind::PinnedHost,
            Self::CpuInput | Self::Cpu => MemoryKind::Host,
        }
    }
}

/// Device queues owned by a device provider. Work on one queue executes in
/// issue order; different queues are unordered relative to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueId {
    /// Compute and device-to-device traffic.
    Default,
    /// Transfers into device memory.
    CopyIn,
    /// Transfers out of device memory.
    CopyOut,
}

impl QueueId {
    pub const ALL: [QueueId; 3] = [QueueId::Default, QueueId::CopyIn, QueueId::CopyOut];

    pub const fn index(self) -> usize {
        match self {
            Self::Default => 0,
            Self::CopyIn => 1,
            Self::CopyOut => 2,
        }
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Default => "default",
            Self::CopyIn => "copy-in",
            Self::CopyOut => "copy-out",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_provider_mem_types() {
        assert_eq!(MemType::Default.device_provider_kind(), MemoryKind::Device);
        assert_eq!(MemType::CpuOutput.device_provider_kind(), MemoryKind::PinnedHost);
        assert_eq!(MemType::CpuInput.device_provider_kind(), MemoryKind::Host);
        assert_eq!(MemType::Cpu.device_provider_kind(), MemoryKind::Host);
    }

    #[test]
    fn locations_display() {
        assert_eq!(MemoryLocation::host().to_string(), "host");
        assert_eq!(MemoryLocation::device(1).to_string(), "device:1");
        assert_eq!(MemoryLocation::pinned(0).to_string(), "pinned-host:0");
    }

    #[test]
    fn queue_indices_are_dense() {
        for (i, queue) in QueueId::ALL.iter().enumerate() {
            assert_eq!(queue.index(), i);
        }
    }
}
