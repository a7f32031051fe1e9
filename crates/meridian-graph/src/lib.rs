//! # Meridian Graph
//!
//! Mutable computation graph plus the passes that prepare it for mixed-provider
//! execution.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  Graph (arena)                                           │
//! │  nodes ─ node args ─ initializers ─ provider tags        │
//! └──────────────────────────┬──────────────────────────────┘
//!                            │ &mut Graph
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │  GraphTransformer / TransformerChain                     │
//! │    └─ TransformerMemcpy: bridges provider boundaries     │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use meridian_graph::{insert_copy_nodes, Graph};
//!
//! let mut graph = Graph::new();
//! graph.set_inputs(&["x"]);
//! let a = graph.add_node("a", "Relu", &["x"], &["h"]).unwrap();
//! let b = graph.add_node("b", "Gemm", &["h"], &["y"]).unwrap();
//! graph.set_outputs(&["y"]);
//! graph.assign_provider(a, "CPUExecutionProvider").unwrap();
//! graph.assign_provider(b, "DeviceExecutionProvider").unwrap();
//!
//! assert!(insert_copy_nodes(&mut graph, "DeviceExecutionProvider").unwrap());
//! // One copy into the device for "h", one back out for the output "y".
//! assert_eq!(graph.node_count(), 4);
//! ```

pub mod error;
pub mod graph;
pub mod memcpy;
pub mod transform;

pub use error::{GraphError, Result};
pub use graph::{ArgId, Graph, Initializer, Node, NodeArg, NodeId};
pub use memcpy::{insert_copy_nodes, CopyDirection, MemcpyStats, TransformerMemcpy, MEMCPY_FROM_HOST, MEMCPY_TO_HOST};
pub use transform::{GraphTransformer, TransformerChain};
