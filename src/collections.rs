//! Collections of cells: sorted arrays, dedup hash sets and worklists.

use std::collections::{HashSet, VecDeque};

use crate::cell::Cell;

/// A sorted, duplicate-free array of cells.
///
/// The position of a cell in the array doubles as its dense local index,
/// so structural changes (sorting in new cells) implicitly renumber the
/// local cells.
#[derive(Clone, Debug, Default)]
pub struct CellArray {
    cells: Vec<Cell>,
}

impl CellArray {
    /// Build a sorted unique array from an unsorted buffer.
    pub fn from_unsorted(mut cells: Vec<Cell>) -> Self {
        cells.sort_unstable();
        cells.dedup();
        Self { cells }
    }

    /// Wrap a buffer that is already sorted and unique.
    pub fn from_sorted(cells: Vec<Cell>) -> Self {
        debug_assert!(cells.windows(2).all(|w| w[0] < w[1]));
        Self { cells }
    }

    /// The cells as a slice.
    pub fn as_slice(&self) -> &[Cell] {
        &self.cells
    }

    /// Number of cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the array is empty.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Iterate over the cells.
    pub fn iter(&self) -> std::slice::Iter<'_, Cell> {
        self.cells.iter()
    }

    /// Binary search for a cell matching on full identity (encoding and
    /// level). Returns its index.
    pub fn contains(&self, query: &Cell) -> Option<usize> {
        self.cells.binary_search(query).ok()
    }

    /// Binary search for a cell matching on node identity (block and
    /// coordinates only).
    ///
    /// Valid on node arrays, where all entries carry `level = MAX_LEVEL`
    /// and encodings are unique.
    pub fn contains_node(&self, query: &Cell) -> Option<usize> {
        self.cells.binary_search_by(|c| c.cmp_node(query)).ok()
    }

    /// Consume the array and return the underlying buffer.
    pub fn into_vec(self) -> Vec<Cell> {
        self.cells
    }
}

/// An insert-if-absent set of cells.
///
/// Used wherever an algorithm accumulates cells and must know whether an
/// insertion introduced a new element, e.g. to decide whether balancing
/// work has to propagate further.
#[derive(Clone, Debug, Default)]
pub struct CellHash {
    cells: HashSet<Cell>,
}

impl CellHash {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a cell; returns true if it was not already present.
    pub fn insert(&mut self, cell: Cell) -> bool {
        self.cells.insert(cell)
    }

    /// Whether the set contains the cell.
    pub fn contains(&self, cell: &Cell) -> bool {
        self.cells.contains(cell)
    }

    /// Number of cells in the set.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Drain the set into a sorted unique array.
    pub fn into_sorted(self) -> CellArray {
        CellArray::from_unsorted(self.cells.into_iter().collect())
    }

    /// Drain the set into an unsorted buffer.
    pub fn into_vec(self) -> Vec<Cell> {
        self.cells.into_iter().collect()
    }
}

/// A FIFO worklist of cells.
#[derive(Clone, Debug, Default)]
pub struct CellQueue {
    cells: VecDeque<Cell>,
}

impl CellQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a cell at the back.
    pub fn push(&mut self, cell: Cell) {
        self.cells.push_back(cell);
    }

    /// Pop the oldest cell.
    pub fn pop(&mut self) -> Option<Cell> {
        self.cells.pop_front()
    }

    /// Number of queued cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Drain the queue into a buffer in FIFO order.
    pub fn into_vec(self) -> Vec<Cell> {
        self.cells.into_iter().collect()
    }
}

#[cfg(test)]
mod test {
    use super::{CellArray, CellHash, CellQueue};
    use crate::cell::Cell;
    use crate::constants::MAX_LEVEL;

    #[test]
    fn test_sorted_array_dedup_and_search() {
        let root = Cell::new(0, 0, 0, 1);
        let mut buffer = root.children().to_vec();
        buffer.extend_from_slice(&root.children());
        buffer.push(root);

        let array = CellArray::from_unsorted(buffer);
        assert_eq!(array.len(), 5);

        for child in root.children() {
            let index = array.contains(&child).unwrap();
            assert_eq!(array.as_slice()[index], child);
        }
        // The parent and its first child differ only by level.
        assert!(array.contains(&root).is_some());
        assert!(array.contains(&Cell::new(0, 0, 0, 3)).is_none());
    }

    #[test]
    fn test_node_identity_search() {
        let h = 1 << (MAX_LEVEL - 1);
        let nodes = CellArray::from_unsorted(vec![
            Cell::new(0, 0, 0, MAX_LEVEL),
            Cell::new(0, h, 0, MAX_LEVEL),
            Cell::new(0, 0, h, MAX_LEVEL),
        ]);
        // A query at a different level still matches on node identity.
        let query = Cell::new(0, h, 0, 5);
        assert!(nodes.contains(&query).is_none());
        let index = nodes.contains_node(&query).unwrap();
        assert_eq!(nodes.as_slice()[index].x, h);
    }

    #[test]
    fn test_hash_insert_if_absent() {
        let mut hash = CellHash::new();
        let cell = Cell::new(3, 0, 0, 0);
        assert!(hash.insert(cell));
        assert!(!hash.insert(cell));
        assert_eq!(hash.len(), 1);
        assert_eq!(hash.into_sorted().len(), 1);
    }

    #[test]
    fn test_queue_order() {
        let mut queue = CellQueue::new();
        let cells = Cell::new(0, 0, 0, 1).children();
        for cell in cells {
            queue.push(cell);
        }
        assert_eq!(queue.len(), 4);
        for cell in cells {
            assert_eq!(queue.pop(), Some(cell));
        }
        assert!(queue.is_empty());
    }
}
