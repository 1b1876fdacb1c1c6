//! The integer cell type locating a square region of one block's quadtree.

use std::cmp::Ordering;

use mpi::traits::Equivalence;

use crate::constants::{MAX_COORD, MAX_LEVEL, NSIBLINGS};

/// A cell of the forest.
///
/// A cell is identified by the id of the block whose quadtree it belongs
/// to, the coordinates of its lower-left corner in the block-local integer
/// coordinate system `[0, MAX_COORD)`, and its refinement level. The
/// coordinates of a cell are always multiples of its own side length
/// `2^(MAX_LEVEL - level)`.
///
/// Node locations reuse the same record with `level = MAX_LEVEL`; two nodes
/// are identical if they agree on block and coordinates alone (see
/// [Cell::cmp_node]).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Equivalence)]
pub struct Cell {
    /// Id of the owning block.
    pub block: i32,
    /// x-coordinate of the lower-left corner.
    pub x: i32,
    /// y-coordinate of the lower-left corner.
    pub y: i32,
    /// Refinement level, `0 <= level <= MAX_LEVEL`.
    pub level: i32,
}

impl Cell {
    /// Create a new cell.
    pub fn new(block: i32, x: i32, y: i32, level: i32) -> Self {
        debug_assert!((0..=MAX_LEVEL).contains(&level));
        Self { block, x, y, level }
    }

    /// The side length of the cell in integer coordinates.
    #[inline]
    pub fn side_length(&self) -> i32 {
        1 << (MAX_LEVEL - self.level)
    }

    /// The index of this cell within its parent, in `0..4`.
    pub fn child_id(&self) -> usize {
        let h = self.side_length();
        let mut id = 0;
        if self.x & h != 0 {
            id |= 1;
        }
        if self.y & h != 0 {
            id |= 2;
        }
        id
    }

    /// The parent cell one level up.
    ///
    /// Must not be called on a level-0 cell.
    pub fn parent(&self) -> Cell {
        debug_assert!(self.level > 0);
        let h = self.side_length();
        Cell {
            block: self.block,
            x: self.x & !h,
            y: self.y & !h,
            level: self.level - 1,
        }
    }

    /// The sibling with the given child index at the same level.
    pub fn sibling(&self, id: usize) -> Cell {
        debug_assert!(id < NSIBLINGS);
        let h = self.side_length();
        Cell {
            block: self.block,
            x: (self.x & !h) | if id & 1 != 0 { h } else { 0 },
            y: (self.y & !h) | if id & 2 != 0 { h } else { 0 },
            level: self.level,
        }
    }

    /// The four children of this cell, ordered by child index.
    ///
    /// Must not be called on a cell at `MAX_LEVEL`.
    pub fn children(&self) -> [Cell; NSIBLINGS] {
        debug_assert!(self.level < MAX_LEVEL);
        let hc = self.side_length() >> 1;
        let child = |i: i32, j: i32| Cell {
            block: self.block,
            x: self.x + i * hc,
            y: self.y + j * hc,
            level: self.level + 1,
        };
        [child(0, 0), child(1, 0), child(0, 1), child(1, 1)]
    }

    /// The same-level neighbor across the given edge index.
    ///
    /// The result may have coordinates outside `[0, MAX_COORD)`; the caller
    /// detects this with [Cell::in_bounds] and transforms the cell into an
    /// adjacent block's frame via the block connectivity.
    pub fn edge_neighbor(&self, edge_index: usize) -> Cell {
        let h = self.side_length();
        let (dx, dy) = match edge_index {
            0 => (-h, 0),
            1 => (h, 0),
            2 => (0, -h),
            _ => (0, h),
        };
        Cell {
            block: self.block,
            x: self.x + dx,
            y: self.y + dy,
            level: self.level,
        }
    }

    /// The same-level neighbor diagonally across the given corner index.
    pub fn corner_neighbor(&self, corner: usize) -> Cell {
        let h = self.side_length();
        Cell {
            block: self.block,
            x: self.x + (2 * (corner as i32 & 1) - 1) * h,
            y: self.y + ((corner as i32 & 2) - 1) * h,
            level: self.level,
        }
    }

    /// Whether the coordinates lie inside the block-local unit square.
    pub fn in_bounds(&self) -> bool {
        (0..MAX_COORD).contains(&self.x) && (0..MAX_COORD).contains(&self.y)
    }

    /// Whether `other` lies within the closed region covered by this cell.
    pub fn encloses(&self, other: &Cell) -> bool {
        let h = self.side_length();
        self.block == other.block
            && (self.x..self.x + h).contains(&other.x)
            && (self.y..self.y + h).contains(&other.y)
    }

    /// Compare two cells by block and Morton (bit-interleaved) position.
    ///
    /// The level does not participate; a cell and its first child compare
    /// equal here. The Morton order is obtained without interleaving by
    /// comparing along the dimension holding the most significant
    /// differing coordinate bit, with y the more significant dimension.
    pub fn cmp_encoding(&self, other: &Cell) -> Ordering {
        if self.block != other.block {
            return self.block.cmp(&other.block);
        }
        let xxor = self.x ^ other.x;
        let yxor = self.y ^ other.y;
        let sor = xxor | yxor;
        if yxor > (sor ^ yxor) {
            self.y.cmp(&other.y)
        } else {
            self.x.cmp(&other.x)
        }
    }

    /// Compare two cells as node locations: encoding only, level ignored.
    pub fn cmp_node(&self, other: &Cell) -> Ordering {
        self.cmp_encoding(other)
    }
}

impl PartialOrd for Cell {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cell {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_encoding(other).then(self.level.cmp(&other.level))
    }
}

impl std::fmt::Display for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "(block: {}, x: {}, y: {}, level: {})",
            self.block, self.x, self.y, self.level
        )
    }
}

#[cfg(test)]
mod test {
    use itertools::Itertools;

    use super::Cell;
    use crate::constants::{MAX_COORD, MAX_LEVEL};

    #[test]
    fn test_parent_child_round_trip() {
        let cell = Cell::new(2, 3 << (MAX_LEVEL - 3), 5 << (MAX_LEVEL - 3), 3);
        for (id, child) in cell.children().iter().enumerate() {
            assert_eq!(child.parent(), cell);
            assert_eq!(child.child_id(), id);
            assert_eq!(child.level, cell.level + 1);
            assert_eq!(child.sibling(0), cell.children()[0]);
        }
    }

    #[test]
    fn test_children_are_morton_sorted() {
        let cell = Cell::new(0, 0, 0, 1);
        let children = cell.children();
        for (c1, c2) in children.iter().tuple_windows() {
            assert!(c1 < c2);
        }
        // The parent shares the encoding of its first child and sorts
        // before it by level.
        assert!(cell < children[0]);
        assert_eq!(
            cell.cmp_encoding(&children[0]),
            std::cmp::Ordering::Equal
        );
    }

    #[test]
    fn test_total_order_on_uniform_level() {
        // All cells of a level-2 tree in generation order, then sorted.
        let h = 1 << (MAX_LEVEL - 2);
        let mut cells = Vec::new();
        for x in (0..MAX_COORD).step_by(h as usize) {
            for y in (0..MAX_COORD).step_by(h as usize) {
                cells.push(Cell::new(0, x, y, 2));
            }
        }
        cells.sort_unstable();
        assert_eq!(cells.len(), 16);
        // In Morton order the first four cells are the children of the
        // first level-1 cell.
        let first = Cell::new(0, 0, 0, 1);
        for (cell, child) in cells.iter().zip(first.children().iter()) {
            assert_eq!(cell, child);
        }
        // Blocks dominate the comparison.
        assert!(Cell::new(1, 0, 0, 0) > *cells.last().unwrap());
    }

    #[test]
    fn test_neighbors() {
        let h = 1 << (MAX_LEVEL - 2);
        let cell = Cell::new(0, h, h, 2);
        assert_eq!(cell.edge_neighbor(0), Cell::new(0, 0, h, 2));
        assert_eq!(cell.edge_neighbor(1), Cell::new(0, 2 * h, h, 2));
        assert_eq!(cell.edge_neighbor(2), Cell::new(0, h, 0, 2));
        assert_eq!(cell.edge_neighbor(3), Cell::new(0, h, 2 * h, 2));
        assert_eq!(cell.corner_neighbor(0), Cell::new(0, 0, 0, 2));
        assert_eq!(cell.corner_neighbor(3), Cell::new(0, 2 * h, 2 * h, 2));

        // Neighbors of a boundary cell leave the block.
        let corner = Cell::new(0, 0, 0, 2);
        assert!(!corner.edge_neighbor(0).in_bounds());
        assert!(!corner.corner_neighbor(0).in_bounds());
        assert!(corner.edge_neighbor(1).in_bounds());
    }

    #[test]
    fn test_encloses() {
        let cell = Cell::new(0, 0, 0, 1);
        for child in cell.children() {
            assert!(cell.encloses(&child));
            for grandchild in child.children() {
                assert!(cell.encloses(&grandchild));
            }
        }
        assert!(!cell.encloses(&Cell::new(0, MAX_COORD / 2, 0, 1)));
        assert!(!cell.encloses(&Cell::new(1, 0, 0, 1)));
    }
}
