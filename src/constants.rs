//! Crate-wide constants.

/// The maximum refinement level of a quadtree.
pub const MAX_LEVEL: i32 = 30;

/// The coordinate length of a block edge, `2^MAX_LEVEL`.
pub const MAX_COORD: i32 = 1 << MAX_LEVEL;

/// Number of siblings of a cell.
pub const NSIBLINGS: usize = 4;

/// Number of edges of a cell or block.
pub const NUM_EDGES: usize = 4;

/// Number of corners of a cell or block.
pub const NUM_CORNERS: usize = 4;

/// The two corner indices bounding each edge of a block.
///
/// Edges 0 and 1 are the `x = 0` and `x = 1` sides, edges 2 and 3 the
/// `y = 0` and `y = 1` sides. The first entry is the corner at the lower
/// parameter value along the edge.
pub const EDGE_CORNERS: [[usize; 2]; NUM_EDGES] = [[0, 2], [1, 3], [0, 1], [2, 3]];
