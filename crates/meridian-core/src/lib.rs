//! # Meridian Core
//!
//! Vocabulary shared by the graph passes and the execution providers: tensor
//! element types and shapes, where memory lives, which flavour of memory a
//! provider is asked for, and which device queue a transfer is issued on.
//!
//! Nothing in this crate allocates or talks to a device.

pub mod dtype;
pub mod memory;
pub mod shape;

pub use dtype::{DataType, Element};
pub use memory::{MemType, MemoryKind, MemoryLocation, QueueId};
pub use shape::TensorShape;

/// Provider type of the host execution provider.
pub const CPU_EXECUTION_PROVIDER: &str = "CPUExecutionProvider";

/// Provider type of the device execution provider.
pub const DEVICE_EXECUTION_PROVIDER: &str = "DeviceExecutionProvider";
