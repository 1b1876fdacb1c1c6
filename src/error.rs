//! Error types.

/// Errors reported for caller-reachable failure conditions.
///
/// Conditions that can only arise from malformed input or from distributed
/// inconsistency are preconditions and are not represented here; they are
/// reported through diagnostics instead. Searches that may legitimately
/// miss (e.g. [crate::forest::Forest::find_enclosing]) return `Option`.
#[derive(Debug, thiserror::Error)]
pub enum ForestError {
    /// The mesh order is outside the supported range.
    #[error("unsupported mesh order {0}, only orders 2 and 3 are available")]
    UnsupportedOrder(usize),
    /// An operation requires a connectivity to be set first.
    #[error("no connectivity has been set on this forest")]
    NotConfigured,
    /// An operation requires cells to have been created first.
    #[error("the forest contains no cells; call create_trees first")]
    NoCells,
    /// An operation requires nodes to have been created first.
    #[error("nodes have not been created; call create_nodes first")]
    NodesNotCreated,
}
