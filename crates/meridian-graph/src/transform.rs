//! Graph transformer interface

use crate::error::Result;
use crate::graph::Graph;

/// A pass that mutates a graph in place.
pub trait GraphTransformer {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Apply the pass. Returns whether the graph changed.
    fn apply(&self, graph: &mut Graph) -> Result<bool>;
}

/// Ordered list of transformers applied one after another.
#[derive(Default)]
pub struct TransformerChain {
    transformers: Vec<Box<dyn GraphTransformer + Send + Sync>>,
}

impl TransformerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, transformer: impl GraphTransformer + Send + Sync + 'static) -> Self {
        self.transformers.push(Box::new(transformer));
        self
    }

    pub fn push(&mut self, transformer: Box<dyn GraphTransformer + Send + Sync>) {
        self.transformers.push(transformer);
    }

    pub fn len(&self) -> usize {
        self.transformers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }

    /// Run every transformer once. Stops at the first error.
    pub fn apply(&self, graph: &mut Graph) -> Result<bool> {
        let mut changed = false;
        for transformer in &self.transformers {
            let modified = transformer.apply(graph)?;
            tracing::debug!(transformer = transformer.name(), modified, "transformer_applied");
            changed |= modified;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;

    struct Rename(&'static str);

    impl GraphTransformer for Rename {
        fn name(&self) -> &str {
            "rename"
        }

        fn apply(&self, graph: &mut Graph) -> Result<bool> {
            let name = graph.generate_node_name(self.0);
            graph.add_node(&name, "Identity", &[], &[])?;
            Ok(true)
        }
    }

    struct Noop;

    impl GraphTransformer for Noop {
        fn name(&self) -> &str {
            "noop"
        }

        fn apply(&self, _graph: &mut Graph) -> Result<bool> {
            Ok(false)
        }
    }

    struct Fails;

    impl GraphTransformer for Fails {
        fn name(&self) -> &str {
            "fails"
        }

        fn apply(&self, _graph: &mut Graph) -> Result<bool> {
            Err(GraphError::InvalidGraph("boom".to_string()))
        }
    }

    #[test]
    fn chain_reports_any_change() {
        let chain = TransformerChain::new().with(Noop).with(Rename("n"));
        let mut graph = Graph::new();
        assert!(chain.apply(&mut graph).unwrap());
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn chain_without_changes_reports_none() {
        let chain = TransformerChain::new().with(Noop).with(Noop);
        assert_eq!(chain.len(), 2);
        assert!(!chain.apply(&mut Graph::new()).unwrap());
    }

    #[test]
    fn chain_stops_at_first_error() {
        let chain = TransformerChain::new().with(Fails).with(Rename("n"));
        let mut graph = Graph::new();
        assert!(chain.apply(&mut graph).is_err());
        assert_eq!(graph.node_count(), 0);
    }
}
