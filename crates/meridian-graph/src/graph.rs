//! Mutable graph arena
//!
//! Nodes and node args live in flat vectors and refer to each other through
//! [`NodeId`] and [`ArgId`]. Rewrites never mutate a node arg in place: they
//! create a new arg and redirect node slots through a replacement table, so
//! every id handed out stays valid for the lifetime of the graph.
//!
//! ```text
//!   args:  [x]──────┐          ┌──►[y]
//!                   ▼          │
//!   nodes:      Node{inputs:[x], outputs:[y], provider:"..."}
//! ```

use std::fmt;

use indexmap::IndexMap;
use meridian_core::{DataType, TensorShape};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::error::{GraphError, Result};

// ============================================================================
// Identifiers
// ============================================================================

/// Stable index of a node arg in its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArgId(u32);

impl ArgId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ArgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "arg{}", self.0)
    }
}

/// Stable index of a node in its graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

// ============================================================================
// Node args, nodes, initializers
// ============================================================================

/// A typed def/use site. An empty name marks an omitted optional slot.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeArg {
    pub name: String,
    pub dtype: Option<DataType>,
    pub shape: Option<TensorShape>,
}

impl NodeArg {
    pub fn exists(&self) -> bool {
        !self.name.is_empty()
    }
}

/// One operator instance.
#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    pub name: String,
    pub op_type: String,
    pub description: String,
    inputs: SmallVec<[ArgId; 4]>,
    outputs: SmallVec<[ArgId; 2]>,
    provider: Option<String>,
    host_inputs: SmallVec<[usize; 2]>,
    host_outputs: SmallVec<[usize; 2]>,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn inputs(&self) -> &[ArgId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ArgId] {
        &self.outputs
    }

    /// Execution provider assigned to this node, if any.
    pub fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    /// True when input `slot` is read from host memory even though the node
    /// runs on its provider.
    pub fn is_host_input(&self, slot: usize) -> bool {
        self.host_inputs.contains(&slot)
    }

    /// True when output `slot` is written to host memory.
    pub fn is_host_output(&self, slot: usize) -> bool {
        self.host_outputs.contains(&slot)
    }

    /// Redirect provider-memory slots through `replacements`. Host slots
    /// keep their original args.
    pub(crate) fn replace_defs(&mut self, replacements: &FxHashMap<ArgId, ArgId>) {
        for (slot, arg) in self.inputs.iter_mut().enumerate() {
            if self.host_inputs.contains(&slot) {
                continue;
            }
            if let Some(&new_arg) = replacements.get(arg) {
                *arg = new_arg;
            }
        }
        for (slot, arg) in self.outputs.iter_mut().enumerate() {
            if self.host_outputs.contains(&slot) {
                continue;
            }
            if let Some(&new_arg) = replacements.get(arg) {
                *arg = new_arg;
            }
        }
    }
}

/// Constant tensor bound to a node arg of the same name.
#[derive(Debug, Clone, PartialEq)]
pub struct Initializer {
    pub name: String,
    pub dtype: DataType,
    pub dims: Vec<i64>,
    pub raw: Vec<u8>,
}

impl Initializer {
    pub fn new(name: impl Into<String>, dtype: DataType, dims: impl Into<Vec<i64>>, raw: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            dtype,
            dims: dims.into(),
            raw,
        }
    }

    fn expected_len(&self) -> Option<usize> {
        TensorShape::new(self.dims.clone())
            .element_count()
            .and_then(|count| count.checked_mul(self.dtype.size()))
    }
}

// ============================================================================
// Graph
// ============================================================================

/// Mutable computation graph.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    node_names: FxHashMap<String, NodeId>,
    args: Vec<NodeArg>,
    arg_names: FxHashMap<String, ArgId>,
    inputs: Vec<ArgId>,
    outputs: Vec<ArgId>,
    initializers: IndexMap<String, Initializer>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- node args -------------------------------------------------------

    /// Look up `name`, creating an untyped arg when it is new.
    pub fn get_or_create_arg(&mut self, name: &str) -> ArgId {
        if let Some(&id) = self.arg_names.get(name) {
            return id;
        }
        self.push_arg(NodeArg {
            name: name.to_string(),
            dtype: None,
            shape: None,
        })
    }

    /// Create a new arg. Fails if the name is taken.
    pub fn add_arg(
        &mut self,
        name: impl Into<String>,
        dtype: Option<DataType>,
        shape: Option<TensorShape>,
    ) -> Result<ArgId> {
        let name = name.into();
        if self.arg_names.contains_key(&name) {
            return Err(GraphError::DuplicateArg(name));
        }
        Ok(self.push_arg(NodeArg { name, dtype, shape }))
    }

    fn push_arg(&mut self, arg: NodeArg) -> ArgId {
        let id = ArgId(self.args.len() as u32);
        self.arg_names.insert(arg.name.clone(), id);
        self.args.push(arg);
        id
    }

    /// Declare the element type and shape of an existing arg.
    pub fn set_arg_type(&mut self, id: ArgId, dtype: DataType, shape: TensorShape) -> Result<()> {
        let arg = self
            .args
            .get_mut(id.index())
            .ok_or_else(|| GraphError::UnknownArg(id.to_string()))?;
        arg.dtype = Some(dtype);
        arg.shape = Some(shape);
        Ok(())
    }

    pub fn arg(&self, id: ArgId) -> &NodeArg {
        &self.args[id.index()]
    }

    pub fn arg_id(&self, name: &str) -> Option<ArgId> {
        self.arg_names.get(name).copied()
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// `base` if unused, otherwise `base_N` for the smallest free `N`.
    pub fn generate_arg_name(&self, base: &str) -> String {
        unique_name(base, |candidate| self.arg_names.contains_key(candidate))
    }

    // ---- nodes -----------------------------------------------------------

    /// Add a node whose slots are named args, creating args on first use.
    /// An empty name leaves an optional slot unset.
    pub fn add_node(&mut self, name: &str, op_type: &str, inputs: &[&str], outputs: &[&str]) -> Result<NodeId> {
        let inputs: Vec<ArgId> = inputs.iter().map(|n| self.get_or_create_arg(n)).collect();
        let outputs: Vec<ArgId> = outputs.iter().map(|n| self.get_or_create_arg(n)).collect();
        self.add_node_with_args(name, op_type, &inputs, &outputs)
    }

    /// Add a node over existing arg ids.
    pub fn add_node_with_args(
        &mut self,
        name: &str,
        op_type: &str,
        inputs: &[ArgId],
        outputs: &[ArgId],
    ) -> Result<NodeId> {
        if self.node_names.contains_key(name) {
            return Err(GraphError::DuplicateNode(name.to_string()));
        }
        if let Some(bad) = inputs.iter().chain(outputs).find(|a| a.index() >= self.args.len()) {
            return Err(GraphError::UnknownArg(bad.to_string()));
        }

        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            id,
            name: name.to_string(),
            op_type: op_type.to_string(),
            description: String::new(),
            inputs: inputs.iter().copied().collect(),
            outputs: outputs.iter().copied().collect(),
            provider: None,
            host_inputs: SmallVec::new(),
            host_outputs: SmallVec::new(),
        });
        self.node_names.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.node_names.get(name).map(|&id| self.node(id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// `base` if unused, otherwise `base_N`.
    pub fn generate_node_name(&self, base: &str) -> String {
        unique_name(base, |candidate| self.node_names.contains_key(candidate))
    }

    pub fn assign_provider(&mut self, node: NodeId, provider: &str) -> Result<()> {
        self.checked_node_mut(node)?.provider = Some(provider.to_string());
        Ok(())
    }

    /// Mark input `slot` of `node` as read from host memory.
    pub fn pin_input_to_host(&mut self, node: NodeId, slot: usize) -> Result<()> {
        let node = self.checked_node_mut(node)?;
        if !node.host_inputs.contains(&slot) {
            node.host_inputs.push(slot);
        }
        Ok(())
    }

    /// Mark output `slot` of `node` as written to host memory.
    pub fn pin_output_to_host(&mut self, node: NodeId, slot: usize) -> Result<()> {
        let node = self.checked_node_mut(node)?;
        if !node.host_outputs.contains(&slot) {
            node.host_outputs.push(slot);
        }
        Ok(())
    }

    fn checked_node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes.get_mut(id.index()).ok_or(GraphError::UnknownNode(id.0))
    }

    /// The node writing `arg`, if any. When validation has not run and
    /// several nodes write it, the first one wins.
    pub fn producer(&self, arg: ArgId) -> Option<NodeId> {
        self.nodes.iter().find(|n| n.outputs.contains(&arg)).map(|n| n.id)
    }

    /// Nodes reading `arg`, in insertion order.
    pub fn consumers(&self, arg: ArgId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.inputs.contains(&arg))
            .map(|n| n.id)
            .collect()
    }

    // ---- graph inputs, outputs, initializers -----------------------------

    pub fn set_inputs(&mut self, names: &[&str]) {
        self.inputs = names.iter().map(|n| self.get_or_create_arg(n)).collect();
    }

    pub fn set_outputs(&mut self, names: &[&str]) {
        self.outputs = names.iter().map(|n| self.get_or_create_arg(n)).collect();
    }

    pub fn inputs(&self) -> &[ArgId] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ArgId] {
        &self.outputs
    }

    /// Register a constant. The arg of the same name is created if needed
    /// and typed after the initializer when it has no declared type.
    pub fn add_initializer(&mut self, initializer: Initializer) -> Result<ArgId> {
        if self.initializers.contains_key(&initializer.name) {
            return Err(GraphError::InvalidInitializer {
                name: initializer.name,
                reason: "already registered".to_string(),
            });
        }

        let id = self.get_or_create_arg(&initializer.name);
        let arg = &mut self.args[id.index()];
        if arg.dtype.is_none() {
            arg.dtype = Some(initializer.dtype);
        }
        if arg.shape.is_none() {
            arg.shape = Some(TensorShape::new(initializer.dims.clone()));
        }
        self.initializers.insert(initializer.name.clone(), initializer);
        Ok(id)
    }

    pub fn initializer(&self, name: &str) -> Option<&Initializer> {
        self.initializers.get(name)
    }

    pub fn initializers(&self) -> impl Iterator<Item = &Initializer> {
        self.initializers.values()
    }

    pub fn is_initializer(&self, arg: ArgId) -> bool {
        self.initializers.contains_key(&self.arg(arg).name)
    }

    // ---- validation ------------------------------------------------------

    /// Check the structural invariants every pass relies on:
    /// - each arg has at most one producer
    /// - each consumed arg has a producer or is a graph input or initializer
    /// - each graph output is reachable the same way
    /// - initializer payloads agree with their dtype, dims and declared shape
    pub fn validate(&self) -> Result<()> {
        let mut producers: FxHashMap<ArgId, NodeId> = FxHashMap::default();
        for node in &self.nodes {
            for &out in &node.outputs {
                if !self.arg(out).exists() {
                    continue;
                }
                if let Some(&first) = producers.get(&out) {
                    return Err(GraphError::MultipleProducers {
                        arg: self.arg(out).name.clone(),
                        first: self.node(first).name.clone(),
                        second: node.name.clone(),
                    });
                }
                producers.insert(out, node.id);
            }
        }

        let is_source = |arg: ArgId| producers.contains_key(&arg) || self.inputs.contains(&arg) || self.is_initializer(arg);

        for node in &self.nodes {
            for &input in &node.inputs {
                if self.arg(input).exists() && !is_source(input) {
                    return Err(GraphError::DanglingArg {
                        arg: self.arg(input).name.clone(),
                        node: node.name.clone(),
                    });
                }
            }
        }

        for &output in &self.outputs {
            if !is_source(output) {
                return Err(GraphError::InvalidGraph(format!(
                    "graph output '{}' is never produced",
                    self.arg(output).name
                )));
            }
        }

        for init in self.initializers.values() {
            self.validate_initializer(init)?;
        }

        Ok(())
    }

    fn validate_initializer(&self, init: &Initializer) -> Result<()> {
        let invalid = |reason: String| GraphError::InvalidInitializer {
            name: init.name.clone(),
            reason,
        };

        let expected = init
            .expected_len()
            .ok_or_else(|| invalid(format!("dims {:?} do not describe a concrete tensor", init.dims)))?;
        if init.raw.len() != expected {
            return Err(invalid(format!(
                "payload is {} bytes, {} {:?} needs {}",
                init.raw.len(),
                init.dtype,
                init.dims,
                expected
            )));
        }

        if let Some(arg) = self.arg_id(&init.name).map(|id| self.arg(id)) {
            if let Some(shape) = &arg.shape {
                if !shape.matches_dims(&init.dims) {
                    return Err(invalid(format!("declared shape {shape} but dims are {:?}", init.dims)));
                }
            }
            if arg.dtype.is_some_and(|dtype| dtype != init.dtype) {
                return Err(invalid(format!("declared {:?} but payload is {}", arg.dtype, init.dtype)));
            }
        }

        Ok(())
    }
}

fn unique_name(base: &str, taken: impl Fn(&str) -> bool) -> String {
    if !taken(base) {
        return base.to_string();
    }
    (1u64..)
        .map(|n| format!("{base}_{n}"))
        .find(|candidate| !taken(candidate))
        .unwrap_or_else(|| base.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_graph() -> Graph {
        let mut graph = Graph::new();
        graph.set_inputs(&["x"]);
        graph.add_node("a", "Relu", &["x"], &["y"]).unwrap();
        graph.add_node("b", "Relu", &["y"], &["z"]).unwrap();
        graph.set_outputs(&["z"]);
        graph
    }

    #[test]
    fn args_are_shared_by_name() {
        let graph = linear_graph();
        let y = graph.arg_id("y").unwrap();
        let a = graph.node_by_name("a").unwrap();
        let b = graph.node_by_name("b").unwrap();
        assert_eq!(a.outputs(), &[y]);
        assert_eq!(b.inputs(), &[y]);
        assert_eq!(graph.producer(y), Some(a.id()));
        assert_eq!(graph.consumers(y), vec![b.id()]);
    }

    #[test]
    fn duplicate_node_names_are_rejected() {
        let mut graph = linear_graph();
        let err = graph.add_node("a", "Relu", &["z"], &["w"]).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateNode(name) if name == "a"));
    }

    #[test]
    fn generated_names_avoid_collisions() {
        let mut graph = linear_graph();
        assert_eq!(graph.generate_arg_name("w"), "w");
        assert_eq!(graph.generate_arg_name("y"), "y_1");
        graph.get_or_create_arg("y_1");
        assert_eq!(graph.generate_arg_name("y"), "y_2");
        assert_eq!(graph.generate_node_name("a"), "a_1");
    }

    #[test]
    fn valid_graph_passes() {
        linear_graph().validate().unwrap();
    }

    #[test]
    fn dangling_input_is_reported() {
        let mut graph = linear_graph();
        graph.add_node("c", "Add", &["z", "ghost"], &["w"]).unwrap();
        let err = graph.validate().unwrap_err();
        assert!(matches!(err, GraphError::DanglingArg { arg, node } if arg == "ghost" && node == "c"));
    }

    #[test]
    fn missing_optional_input_is_not_dangling() {
        let mut graph = linear_graph();
        graph.add_node("c", "Clip", &["z", "", ""], &["w"]).unwrap();
        graph.validate().unwrap();
    }

    #[test]
    fn multiple_producers_are_reported() {
        let mut graph = linear_graph();
        graph.add_node("c", "Relu", &["x"], &["y"]).unwrap();
        let err = graph.validate().unwrap_err();
        assert!(matches!(err, GraphError::MultipleProducers { arg, .. } if arg == "y"));
    }

    #[test]
    fn unproduced_graph_output_is_invalid() {
        let mut graph = linear_graph();
        graph.set_outputs(&["nowhere"]);
        assert!(matches!(graph.validate(), Err(GraphError::InvalidGraph(_))));
    }

    #[test]
    fn initializer_payload_must_match_dims() {
        let mut graph = Graph::new();
        graph
            .add_initializer(Initializer::new("w", DataType::Float32, [2, 2], vec![0; 12]))
            .unwrap();
        graph.add_node("a", "MatMul", &["w", "w"], &["y"]).unwrap();
        assert!(matches!(graph.validate(), Err(GraphError::InvalidInitializer { .. })));
    }

    #[test]
    fn initializer_dims_must_match_declared_shape() {
        let mut graph = Graph::new();
        let w = graph.get_or_create_arg("w");
        graph.set_arg_type(w, DataType::Float32, TensorShape::from([4, 1])).unwrap();
        graph
            .add_initializer(Initializer::new("w", DataType::Float32, [1, 4], vec![0; 16]))
            .unwrap();
        graph.add_node("a", "Relu", &["w"], &["y"]).unwrap();
        let err = graph.validate().unwrap_err();
        assert!(matches!(err, GraphError::InvalidInitializer { name, .. } if name == "w"));
    }

    #[test]
    fn initializer_types_its_arg() {
        let mut graph = Graph::new();
        let w = graph
            .add_initializer(Initializer::new("w", DataType::Int64, [3], vec![0; 24]))
            .unwrap();
        assert_eq!(graph.arg(w).dtype, Some(DataType::Int64));
        assert_eq!(graph.arg(w).shape, Some(TensorShape::from([3])));
        assert!(graph.is_initializer(w));
    }

    #[test]
    fn replace_defs_redirects_both_sides() {
        let mut graph = linear_graph();
        let y = graph.arg_id("y").unwrap();
        let z = graph.arg_id("z").unwrap();
        let y2 = graph.add_arg("y2", None, None).unwrap();
        let z2 = graph.add_arg("z2", None, None).unwrap();
        let mut table = FxHashMap::default();
        table.insert(y, y2);
        table.insert(z, z2);

        let b = graph.node_by_name("b").unwrap().id();
        graph.node_mut(b).replace_defs(&table);
        assert_eq!(graph.node(b).inputs(), &[y2]);
        assert_eq!(graph.node(b).outputs(), &[z2]);
    }

    #[test]
    fn replace_defs_skips_host_slots() {
        let mut graph = Graph::new();
        graph.add_node("n", "Reshape", &["data", "dims"], &["out"]).unwrap();
        let data = graph.arg_id("data").unwrap();
        let dims = graph.arg_id("dims").unwrap();
        let data2 = graph.add_arg("data2", None, None).unwrap();
        let dims2 = graph.add_arg("dims2", None, None).unwrap();
        let n = graph.node_by_name("n").unwrap().id();
        graph.pin_input_to_host(n, 1).unwrap();

        let mut table = FxHashMap::default();
        table.insert(data, data2);
        table.insert(dims, dims2);
        graph.node_mut(n).replace_defs(&table);
        assert_eq!(graph.node(n).inputs(), &[data2, dims]);
    }

    #[test]
    fn host_slots_are_recorded_once() {
        let mut graph = linear_graph();
        let a = graph.node_by_name("a").unwrap().id();
        graph.pin_input_to_host(a, 0).unwrap();
        graph.pin_input_to_host(a, 0).unwrap();
        graph.pin_output_to_host(a, 0).unwrap();
        assert!(graph.node(a).is_host_input(0));
        assert!(graph.node(a).is_host_output(0));
        assert!(!graph.node(a).is_host_input(1));
    }
}
