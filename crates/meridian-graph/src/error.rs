//! Error types for graph construction, validation and rewriting

/// Result type for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;

/// Errors raised while building, validating or rewriting a graph.
///
/// Every variant describes a malformed graph. Rewrites run once during
/// session construction, so callers abort construction on any of these.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Generic structural inconsistency
    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    /// Input with no producer that is neither a graph input nor an initializer
    #[error("Node arg '{arg}' consumed by node '{node}' has no producer and is not a graph input or initializer")]
    DanglingArg { arg: String, node: String },

    /// Node arg written by more than one node
    #[error("Node arg '{arg}' is produced by both '{first}' and '{second}'")]
    MultipleProducers { arg: String, first: String, second: String },

    /// Node name already taken
    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    /// Node arg name already taken
    #[error("Duplicate node arg name: {0}")]
    DuplicateArg(String),

    /// Lookup of a node arg that does not exist
    #[error("Unknown node arg: {0}")]
    UnknownArg(String),

    /// Lookup of a node id that does not exist
    #[error("Unknown node id: {0}")]
    UnknownNode(u32),

    /// Initializer payload or shape disagrees with its declaration
    #[error("Invalid initializer '{name}': {reason}")]
    InvalidInitializer { name: String, reason: String },
}
