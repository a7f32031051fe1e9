//! Provider boundary rewriting
//!
//! After partitioning, every node carries the provider that will run it. A
//! node arg written on one side of a provider boundary and read on the other
//! must be moved between memory spaces. [`TransformerMemcpy`] makes those
//! moves explicit by inserting memcpy nodes:
//!
//! ```text
//!  before:   A(cpu) ──x──► X(dev) ──y──► B(cpu)
//!
//!  after:    A(cpu) ──x──► MemcpyFromHost(dev) ──x_dev──► X(dev)
//!                                                           │ y_dev
//!            B(cpu) ◄──y── MemcpyToHost(dev) ◄──────────────┘
//! ```
//!
//! The pass runs in three steps:
//!
//! 1. **Classify** every node arg touched by the target provider
//!    (`provider_input_defs`, `provider_output_defs`) and every arg touched
//!    by anything else (`non_provider_defs`). Slots a provider node reads or
//!    writes in host memory count as non-provider, and so do graph outputs.
//! 2. **Materialize initializers** consumed on both sides: the constant is
//!    duplicated under a provider-specific name so it can live in provider
//!    memory without a per-run copy.
//! 3. **Bridge** the remaining crossings with one memcpy node per
//!    (arg, direction), and redirect the provider nodes through a single
//!    replacement table.
//!
//! Memcpy nodes are themselves tagged with the target provider and declare
//! their host-side slot, so a second run classifies them consistently and
//! changes nothing.

use std::collections::BTreeSet;

use meridian_tracing::perf_span;
use rustc_hash::FxHashMap;

use crate::error::Result;
use crate::graph::{ArgId, Graph, Initializer, NodeId};
use crate::transform::GraphTransformer;

/// Op type of nodes copying host memory into provider memory.
pub const MEMCPY_FROM_HOST: &str = "MemcpyFromHost";

/// Op type of nodes copying provider memory back to host memory.
pub const MEMCPY_TO_HOST: &str = "MemcpyToHost";

/// Which way a memcpy node moves data relative to its provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyDirection {
    /// Host memory into provider memory.
    ToProvider,
    /// Provider memory into host memory.
    FromProvider,
}

impl CopyDirection {
    /// Direction of a memcpy node, from its op type.
    pub fn of_op_type(op_type: &str) -> Option<Self> {
        match op_type {
            MEMCPY_FROM_HOST => Some(Self::ToProvider),
            MEMCPY_TO_HOST => Some(Self::FromProvider),
            _ => None,
        }
    }

    pub fn op_type(self) -> &'static str {
        match self {
            Self::ToProvider => MEMCPY_FROM_HOST,
            Self::FromProvider => MEMCPY_TO_HOST,
        }
    }
}

/// What a rewrite did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemcpyStats {
    pub copies_in: usize,
    pub copies_out: usize,
    pub initializers_duplicated: usize,
}

impl MemcpyStats {
    pub fn inserted_nodes(&self) -> usize {
        self.copies_in + self.copies_out
    }

    pub fn changed(&self) -> bool {
        self.inserted_nodes() > 0 || self.initializers_duplicated > 0
    }
}

/// Inserts memcpy nodes at the boundaries of one provider.
#[derive(Debug, Clone)]
pub struct TransformerMemcpy {
    provider: String,
}

impl TransformerMemcpy {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Rewrite `graph` in place.
    ///
    /// The graph is validated first; on error nothing has been mutated.
    #[tracing::instrument(skip(self, graph), fields(provider = %self.provider, nodes = graph.node_count()))]
    pub fn run(&self, graph: &mut Graph) -> Result<MemcpyStats> {
        let _span = perf_span!("memcpy_transform", nodes = graph.node_count());
        graph.validate()?;

        let mut pass = MemcpyPass::classify(graph, &self.provider);
        pass.materialize_initializers(graph)?;
        pass.insert_copies(graph)?;
        pass.apply_replacements(graph);

        tracing::debug!(
            copies_in = pass.stats.copies_in,
            copies_out = pass.stats.copies_out,
            initializers_duplicated = pass.stats.initializers_duplicated,
            "memcpy_transform_complete"
        );
        Ok(pass.stats)
    }
}

impl GraphTransformer for TransformerMemcpy {
    fn name(&self) -> &str {
        "TransformerMemcpy"
    }

    fn apply(&self, graph: &mut Graph) -> Result<bool> {
        Ok(self.run(graph)?.changed())
    }
}

/// Insert memcpy nodes at the boundaries of `provider`. Returns whether the
/// graph changed.
pub fn insert_copy_nodes(graph: &mut Graph, provider: &str) -> Result<bool> {
    TransformerMemcpy::new(provider).apply(graph)
}

// ============================================================================
// Pass state
// ============================================================================

struct MemcpyPass<'p> {
    provider: &'p str,
    provider_nodes: Vec<NodeId>,
    provider_input_defs: BTreeSet<ArgId>,
    provider_output_defs: BTreeSet<ArgId>,
    non_provider_defs: BTreeSet<ArgId>,
    /// Args already served by a duplicated initializer.
    materialized: BTreeSet<ArgId>,
    replacements: FxHashMap<ArgId, ArgId>,
    stats: MemcpyStats,
}

impl<'p> MemcpyPass<'p> {
    fn classify(graph: &Graph, provider: &'p str) -> Self {
        let mut pass = Self {
            provider,
            provider_nodes: Vec::new(),
            provider_input_defs: BTreeSet::new(),
            provider_output_defs: BTreeSet::new(),
            non_provider_defs: BTreeSet::new(),
            materialized: BTreeSet::new(),
            replacements: FxHashMap::default(),
            stats: MemcpyStats::default(),
        };

        for node in graph.nodes() {
            if node.provider() == Some(provider) {
                pass.provider_nodes.push(node.id());
                for (slot, &arg) in node.inputs().iter().enumerate() {
                    if !graph.arg(arg).exists() {
                        continue;
                    }
                    if node.is_host_input(slot) {
                        pass.non_provider_defs.insert(arg);
                    } else {
                        pass.provider_input_defs.insert(arg);
                    }
                }
                for (slot, &arg) in node.outputs().iter().enumerate() {
                    if !graph.arg(arg).exists() {
                        continue;
                    }
                    if node.is_host_output(slot) {
                        pass.non_provider_defs.insert(arg);
                    } else {
                        pass.provider_output_defs.insert(arg);
                    }
                }
            } else {
                pass.non_provider_defs.extend(
                    node.inputs()
                        .iter()
                        .chain(node.outputs())
                        .copied()
                        .filter(|&arg| graph.arg(arg).exists()),
                );
            }
        }

        // The caller reads graph outputs from host memory.
        pass.non_provider_defs
            .extend(graph.outputs().iter().copied().filter(|&arg| graph.arg(arg).exists()));

        pass
    }

    fn crosses(&self, arg: ArgId) -> bool {
        self.non_provider_defs.contains(&arg)
    }

    fn materialize_initializers(&mut self, graph: &mut Graph) -> Result<()> {
        let shared: Vec<ArgId> = self
            .provider_input_defs
            .iter()
            .filter(|&&arg| self.crosses(arg) && graph.is_initializer(arg))
            .copied()
            .collect();

        for arg in shared {
            let Some(original) = graph.initializer(&graph.arg(arg).name).cloned() else {
                continue;
            };
            let new_name = graph.generate_arg_name(&format!("{}_{}", original.name, self.provider));
            let duplicate = Initializer::new(new_name.clone(), original.dtype, original.dims.clone(), original.raw);
            let new_arg = graph.add_initializer(duplicate)?;

            tracing::debug!(
                initializer = %original.name,
                duplicate = %new_name,
                provider = self.provider,
                "initializer_duplicated"
            );
            self.replacements.insert(arg, new_arg);
            self.materialized.insert(arg);
            self.stats.initializers_duplicated += 1;
        }
        Ok(())
    }

    fn insert_copies(&mut self, graph: &mut Graph) -> Result<()> {
        // A provider output read by a provider node is bridged outward; the
        // provider readers then follow the producer onto the new arg.
        let copy_in: Vec<ArgId> = self
            .provider_input_defs
            .iter()
            .filter(|&&arg| {
                self.crosses(arg) && !self.provider_output_defs.contains(&arg) && !self.materialized.contains(&arg)
            })
            .copied()
            .collect();
        let copy_out: Vec<ArgId> = self
            .provider_output_defs
            .iter()
            .filter(|&&arg| self.crosses(arg))
            .copied()
            .collect();

        for arg in copy_in {
            self.add_copy_node(graph, arg, CopyDirection::ToProvider)?;
        }
        for arg in copy_out {
            self.add_copy_node(graph, arg, CopyDirection::FromProvider)?;
        }
        Ok(())
    }

    /// Bridge `arg` with one memcpy node. The original arg stays on the host
    /// side and the new arg lives in provider memory.
    fn add_copy_node(&mut self, graph: &mut Graph, arg: ArgId, direction: CopyDirection) -> Result<()> {
        if self.replacements.contains_key(&arg) {
            return Ok(());
        }

        let original = graph.arg(arg).clone();
        let new_name = graph.generate_arg_name(&format!("{}_{}", original.name, self.provider));
        let new_arg = graph.add_arg(new_name.clone(), original.dtype, original.shape.clone())?;

        let node_name = graph.generate_node_name("Memcpy");
        let (inputs, outputs) = match direction {
            CopyDirection::ToProvider => ([arg], [new_arg]),
            CopyDirection::FromProvider => ([new_arg], [arg]),
        };
        let node = graph.add_node_with_args(&node_name, direction.op_type(), &inputs, &outputs)?;
        graph.assign_provider(node, self.provider)?;
        graph.node_mut(node).description = format!("Copy of {} for {}", original.name, self.provider);
        match direction {
            CopyDirection::ToProvider => {
                graph.pin_input_to_host(node, 0)?;
                self.stats.copies_in += 1;
            }
            CopyDirection::FromProvider => {
                graph.pin_output_to_host(node, 0)?;
                self.stats.copies_out += 1;
            }
        }

        tracing::debug!(
            node = %node_name,
            arg = %original.name,
            replacement = %new_name,
            shape = ?original.shape,
            ?direction,
            "memcpy_inserted"
        );
        self.replacements.insert(arg, new_arg);
        Ok(())
    }

    /// Only nodes that existed before the pass are redirected; memcpy nodes
    /// were built against the final args already.
    fn apply_replacements(&self, graph: &mut Graph) {
        if self.replacements.is_empty() {
            return;
        }
        for &node in &self.provider_nodes {
            graph.node_mut(node).replace_defs(&self.replacements);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::{DataType, TensorShape};

    const DEV: &str = "DeviceExecutionProvider";
    const CPU: &str = "CPUExecutionProvider";

    fn tag(graph: &mut Graph, node: &str, provider: &str) {
        let id = graph.node_by_name(node).unwrap().id();
        graph.assign_provider(id, provider).unwrap();
    }

    #[test]
    fn copy_in_keeps_dtype_and_shape() {
        let mut graph = Graph::new();
        graph.set_inputs(&["x"]);
        graph.add_node("a", "Relu", &["x"], &["h"]).unwrap();
        graph.add_node("b", "Relu", &["h"], &["y"]).unwrap();
        graph.set_outputs(&["y"]);
        let h = graph.arg_id("h").unwrap();
        graph.set_arg_type(h, DataType::Float32, TensorShape::from([2, 3])).unwrap();
        tag(&mut graph, "a", CPU);
        tag(&mut graph, "b", DEV);

        let stats = TransformerMemcpy::new(DEV).run(&mut graph).unwrap();
        assert_eq!(stats.copies_in, 1);
        assert_eq!(stats.copies_out, 1);

        let replacement = graph.arg_id("h_DeviceExecutionProvider").unwrap();
        assert_eq!(graph.arg(replacement).dtype, Some(DataType::Float32));
        assert_eq!(graph.arg(replacement).shape, Some(TensorShape::from([2, 3])));
        assert_eq!(graph.node_by_name("b").unwrap().inputs(), &[replacement]);

        let memcpy = graph.node_by_name("Memcpy").unwrap();
        assert_eq!(memcpy.op_type, MEMCPY_FROM_HOST);
        assert_eq!(memcpy.provider(), Some(DEV));
        assert!(memcpy.is_host_input(0));
        assert_eq!(memcpy.inputs(), &[h]);
        assert_eq!(memcpy.outputs(), &[replacement]);
    }

    #[test]
    fn host_slot_of_provider_node_is_bridged() {
        // "size" runs on the device but reads its input from host memory, so
        // the device-produced value has to come back out.
        let mut graph = Graph::new();
        graph.set_inputs(&["x"]);
        graph.add_node("conv", "Conv", &["x"], &["h"]).unwrap();
        graph.add_node("size", "Size", &["h"], &["y"]).unwrap();
        graph.set_outputs(&["y"]);
        tag(&mut graph, "conv", DEV);
        tag(&mut graph, "size", DEV);
        let size = graph.node_by_name("size").unwrap().id();
        graph.pin_input_to_host(size, 0).unwrap();

        let stats = TransformerMemcpy::new(DEV).run(&mut graph).unwrap();
        // One for "h", one for the graph output "y".
        assert_eq!(stats.copies_out, 2);
        assert_eq!(stats.copies_in, 0);

        let h = graph.arg_id("h").unwrap();
        let h_dev = graph.arg_id("h_DeviceExecutionProvider").unwrap();
        assert_eq!(graph.node_by_name("conv").unwrap().outputs(), &[h_dev]);
        assert_eq!(graph.node(size).inputs(), &[h]);
        assert_eq!(graph.node_by_name("Memcpy").unwrap().op_type, MEMCPY_TO_HOST);
        graph.validate().unwrap();

        assert!(!TransformerMemcpy::new(DEV).apply(&mut graph).unwrap());
    }

    #[test]
    fn provider_output_read_on_both_sides_is_copied_out_once() {
        let mut graph = Graph::new();
        graph.set_inputs(&["x"]);
        graph.add_node("p", "Relu", &["x"], &["h"]).unwrap();
        graph.add_node("q", "Relu", &["h"], &["y1"]).unwrap();
        graph.add_node("c", "Relu", &["h"], &["y2"]).unwrap();
        graph.set_outputs(&["y1", "y2"]);
        tag(&mut graph, "p", DEV);
        tag(&mut graph, "q", DEV);
        tag(&mut graph, "c", CPU);

        let stats = TransformerMemcpy::new(DEV).run(&mut graph).unwrap();
        // "h" once, plus the device-produced graph output "y1".
        assert_eq!(stats.copies_out, 2);
        assert_eq!(stats.copies_in, 0);

        let h = graph.arg_id("h").unwrap();
        let h_dev = graph.arg_id("h_DeviceExecutionProvider").unwrap();
        assert_eq!(graph.node_by_name("p").unwrap().outputs(), &[h_dev]);
        assert_eq!(graph.node_by_name("q").unwrap().inputs(), &[h_dev]);
        assert_eq!(graph.node_by_name("c").unwrap().inputs(), &[h]);
        graph.validate().unwrap();
    }

    #[test]
    fn device_produced_graph_output_is_copied_to_host() {
        let mut graph = Graph::new();
        graph.set_inputs(&["in"]);
        graph.add_node("A", "Relu", &["in"], &["h"]).unwrap();
        graph.add_node("X", "Gemm", &["h"], &["y"]).unwrap();
        graph.set_outputs(&["y"]);
        tag(&mut graph, "A", CPU);
        tag(&mut graph, "X", DEV);

        let stats = TransformerMemcpy::new(DEV).run(&mut graph).unwrap();
        assert_eq!(stats.copies_in, 1);
        assert_eq!(stats.copies_out, 1);
        assert_eq!(graph.node_count(), 4);

        // The graph output keeps its name and is now written by the memcpy
        // node into host memory.
        let y = graph.arg_id("y").unwrap();
        let y_dev = graph.arg_id("y_DeviceExecutionProvider").unwrap();
        assert_eq!(graph.outputs(), &[y]);
        assert_eq!(graph.node_by_name("X").unwrap().outputs(), &[y_dev]);
        let copy_out = graph.node(graph.producer(y).unwrap());
        assert_eq!(copy_out.op_type, MEMCPY_TO_HOST);
        assert!(copy_out.is_host_output(0));
        assert_eq!(copy_out.inputs(), &[y_dev]);
        graph.validate().unwrap();

        let again = TransformerMemcpy::new(DEV).run(&mut graph).unwrap();
        assert!(!again.changed());
        assert_eq!(graph.node_count(), 4);
    }

    #[test]
    fn invalid_graph_is_left_untouched() {
        let mut graph = Graph::new();
        graph.add_node("a", "Relu", &["ghost"], &["y"]).unwrap();
        graph.add_node("b", "Relu", &["y"], &["z"]).unwrap();
        tag(&mut graph, "b", DEV);

        let before = graph.node_count();
        assert!(TransformerMemcpy::new(DEV).run(&mut graph).is_err());
        assert_eq!(graph.node_count(), before);
    }

    #[test]
    fn direction_round_trips_through_op_type() {
        for direction in [CopyDirection::ToProvider, CopyDirection::FromProvider] {
            assert_eq!(CopyDirection::of_op_type(direction.op_type()), Some(direction));
        }
        assert_eq!(CopyDirection::of_op_type("Relu"), None);
    }
}
