//! The distributed forest of quadtrees.

pub mod nodes;

use std::cmp::Ordering;
use std::sync::Arc;

use mpi::traits::{CommunicatorCollectives, Equivalence};
use rand::Rng;

use crate::cell::Cell;
use crate::collections::{CellArray, CellHash, CellQueue};
use crate::connectivity::Connectivity;
use crate::constants::{MAX_COORD, MAX_LEVEL, NSIBLINGS, NUM_CORNERS, NUM_EDGES};
use crate::error::ForestError;
use crate::transport::{gather_to_all, redistribute, redistribute_with_counts};

// The two children of a cell adjacent to each of its edges, by child index.
pub(crate) const EDGE_CHILDREN: [[usize; 2]; NUM_EDGES] = [[0, 2], [1, 3], [0, 1], [2, 3]];

/// A cell together with the rank it is destined for.
#[derive(Copy, Clone, Equivalence)]
pub(crate) struct RankCell {
    pub(crate) rank: i32,
    pub(crate) cell: Cell,
}

/// A forest of quadtrees, one per block, distributed across the ranks of a
/// communicator.
///
/// Each rank owns a contiguous slice of the cells of all blocks in the
/// Morton order defined by [Cell::cmp_encoding]. The partition boundaries
/// are recorded in the replicated `owners` array holding the first cell of
/// every rank; all ownership queries are binary searches against it.
///
/// The lifecycle is: [Forest::set_connectivity], then
/// [Forest::create_trees] (or [Forest::create_random_trees]), any number
/// of [Forest::refine] calls, [Forest::balance], and finally
/// [Forest::create_nodes]. Refining again discards ghosts and nodes.
pub struct Forest<'f, C> {
    comm: &'f C,
    rank: i32,
    size: i32,
    conn: Option<Arc<Connectivity>>,
    cells: CellArray,
    owners: Vec<Cell>,
    ghosts: Option<CellArray>,
    nodes: Option<nodes::NodeData>,
}

impl<'f, C: CommunicatorCollectives> Forest<'f, C> {
    /// Create an empty, unconfigured forest on the communicator.
    pub fn new(comm: &'f C) -> Self {
        Self {
            comm,
            rank: comm.rank(),
            size: comm.size(),
            conn: None,
            cells: CellArray::default(),
            owners: Vec::new(),
            ghosts: None,
            nodes: None,
        }
    }

    /// Return the communicator.
    pub fn comm(&self) -> &C {
        self.comm
    }

    /// The rank of this worker.
    pub fn rank(&self) -> i32 {
        self.rank
    }

    /// The number of workers.
    pub fn size(&self) -> i32 {
        self.size
    }

    /// Set the block connectivity shared by all ranks.
    ///
    /// This resets all cell and node data. The same connectivity object
    /// can be shared between several forests (e.g. a fine and a coarsened
    /// forest).
    pub fn set_connectivity(&mut self, conn: Arc<Connectivity>) {
        self.conn = Some(conn);
        self.cells = CellArray::default();
        self.owners.clear();
        self.ghosts = None;
        self.nodes = None;
    }

    /// The block connectivity, if one has been set.
    pub fn connectivity(&self) -> Option<&Arc<Connectivity>> {
        self.conn.as_ref()
    }

    /// The locally owned cells, sorted by encoding.
    pub fn cells(&self) -> &CellArray {
        &self.cells
    }

    /// The ghost cells received from other ranks, if they have been
    /// exchanged.
    pub fn ghosts(&self) -> Option<&CellArray> {
        self.ghosts.as_ref()
    }

    /// The first cell of every rank's partition.
    pub fn owners(&self) -> &[Cell] {
        &self.owners
    }

    fn conn(&self) -> &Connectivity {
        self.conn.as_ref().expect("no connectivity set")
    }

    fn require_conn(&self) -> Result<Arc<Connectivity>, ForestError> {
        self.conn.clone().ok_or(ForestError::NotConfigured)
    }

    fn invalidate_mesh(&mut self) {
        self.ghosts = None;
        self.nodes = None;
    }

    // The contiguous range of blocks seeded on this rank; the remainder
    // blocks go to the low ranks.
    fn block_range(&self, num_blocks: usize) -> (usize, usize) {
        let size = self.size as usize;
        let rank = self.rank as usize;
        let per_rank = num_blocks / size;
        let remain = num_blocks % size;
        let start = rank * per_rank + rank.min(remain);
        let end = start + per_rank + usize::from(rank < remain);
        (start, end)
    }

    // Refresh the replicated owners array from the first local cell.
    // Ranks without cells take over the previous rank's first cell so the
    // binary search still sees a monotone sequence.
    fn update_owners(&mut self) {
        let sentinel = Cell {
            block: i32::MAX,
            x: MAX_COORD,
            y: MAX_COORD,
            level: 0,
        };
        let first = self.cells.as_slice().first().copied().unwrap_or(sentinel);
        let mut owners = gather_to_all(std::slice::from_ref(&first), self.comm);
        for k in 1..owners.len() {
            if owners[k].x == MAX_COORD {
                owners[k] = owners[k - 1];
            }
        }
        self.owners = owners;
    }

    /// The rank owning the partition interval that contains the cell.
    pub fn get_owner(&self, cell: &Cell) -> i32 {
        debug_assert!(!self.owners.is_empty());
        let index = self
            .owners
            .partition_point(|owner| owner.cmp_encoding(cell) != Ordering::Greater);
        index.max(1) as i32 - 1
    }

    /// Seed every block with a uniform tree at the given level.
    pub fn create_trees(&mut self, refine_level: i32) -> Result<(), ForestError> {
        let conn = self.require_conn()?;
        self.invalidate_mesh();

        let level = refine_level.clamp(0, MAX_LEVEL - 1);
        let (start, end) = self.block_range(conn.num_blocks());

        let h = 1 << (MAX_LEVEL - level);
        let cells_per_block = 1usize << (2 * level);
        let mut cells = Vec::with_capacity(cells_per_block * (end - start));
        for block in start..end {
            for x in (0..MAX_COORD).step_by(h as usize) {
                for y in (0..MAX_COORD).step_by(h as usize) {
                    cells.push(Cell::new(block as i32, x, y, level));
                }
            }
        }

        self.cells = CellArray::from_unsorted(cells);
        self.update_owners();
        log::debug!(
            "create_trees: rank {} seeded {} cells on blocks {}..{}",
            self.rank,
            self.cells.len(),
            start,
            end
        );
        Ok(())
    }

    /// Seed every local block with randomly placed cells at random levels.
    pub fn create_random_trees<R: Rng>(
        &mut self,
        nrand: usize,
        min_level: i32,
        max_level: i32,
        rng: &mut R,
    ) -> Result<(), ForestError> {
        let conn = self.require_conn()?;
        self.invalidate_mesh();

        let (start, end) = self.block_range(conn.num_blocks());

        let mut cells = Vec::with_capacity(nrand * (end - start));
        for block in start..end {
            for _ in 0..nrand {
                let level = rng.gen_range(min_level..=max_level);
                let h = 1 << (MAX_LEVEL - level);
                let x = h * rng.gen_range(0..(1 << level));
                let y = h * rng.gen_range(0..(1 << level));
                cells.push(Cell::new(block as i32, x, y, level));
            }
        }

        self.cells = CellArray::from_unsorted(cells);
        self.update_owners();
        Ok(())
    }

    /// Repartition the cells so that all ranks hold an (almost) equal
    /// share, preserving the global Morton order.
    ///
    /// Nodes and ghosts are discarded and must be recreated.
    pub fn repartition(&mut self) -> Result<(), ForestError> {
        if self.owners.is_empty() {
            return Err(ForestError::NoCells);
        }
        self.invalidate_mesh();

        let size = self.size as usize;
        let local_len = self.cells.len() as i64;
        let counts = gather_to_all(std::slice::from_ref(&local_len), self.comm);

        let mut ptr = vec![0i64; size + 1];
        for (k, &count) in counts.iter().enumerate() {
            ptr[k + 1] = ptr[k] + count;
        }

        let total = ptr[size];
        let average = total / size as i64;
        let remain = total % size as i64;
        let mut new_ptr = vec![0i64; size + 1];
        for k in 0..size {
            new_ptr[k + 1] = new_ptr[k] + average + i64::from((k as i64) < remain);
        }

        // Route every cell by its global index in the current ordering.
        let mut send_counts = vec![0i32; size];
        for i in 0..self.cells.len() {
            let global = ptr[self.rank as usize] + i as i64;
            let dest = new_ptr[1..].partition_point(|&p| p <= global);
            send_counts[dest] += 1;
        }

        let new_cells = redistribute(self.cells.as_slice(), &send_counts, self.comm);
        self.cells = CellArray::from_sorted(new_cells);
        self.update_owners();
        Ok(())
    }

    /// Create a cell-for-cell copy of this forest sharing the same
    /// connectivity but owning independent storage.
    pub fn duplicate(&self) -> Forest<'f, C> {
        Forest {
            comm: self.comm,
            rank: self.rank,
            size: self.size,
            conn: self.conn.clone(),
            cells: self.cells.clone(),
            owners: self.owners.clone(),
            ghosts: None,
            nodes: None,
        }
    }

    /// Create the coarsened forest: every sibling group is replaced by its
    /// parent.
    ///
    /// Sibling groups are assumed complete (the forest is balanced or
    /// uniformly refined); the coarsening keys off the first child and
    /// does not validate the remaining siblings. The result is not
    /// necessarily balanced.
    pub fn coarsen(&self) -> Result<Forest<'f, C>, ForestError> {
        self.require_conn()?;
        if self.owners.is_empty() {
            return Err(ForestError::NoCells);
        }

        let mut coarse_cells = Vec::with_capacity(self.cells.len() / NSIBLINGS + 1);
        for cell in self.cells.iter() {
            if cell.level > 0 {
                if cell.child_id() == 0 {
                    coarse_cells.push(cell.parent());
                }
            } else {
                coarse_cells.push(*cell);
            }
        }

        let mut coarse = Forest {
            comm: self.comm,
            rank: self.rank,
            size: self.size,
            conn: self.conn.clone(),
            cells: CellArray::from_unsorted(coarse_cells),
            owners: Vec::new(),
            ghosts: None,
            nodes: None,
        };
        coarse.update_owners();
        Ok(coarse)
    }

    /// Adapt the refinement level of every local cell.
    ///
    /// `refinement[i]` is the level delta of local cell `i`: zero keeps
    /// the cell, a negative delta coarsens towards `min_level` by snapping
    /// to the coarser alignment, and a positive delta subdivides into
    /// `4^delta` children up to `max_level`. Passing `None` refines
    /// everything by one level. Cells that land in another rank's
    /// partition interval are shipped there; ghosts and nodes are
    /// discarded.
    pub fn refine(
        &mut self,
        refinement: Option<&[i32]>,
        min_level: i32,
        max_level: i32,
    ) -> Result<(), ForestError> {
        self.require_conn()?;
        if self.owners.is_empty() {
            return Err(ForestError::NoCells);
        }
        if let Some(deltas) = refinement {
            debug_assert_eq!(deltas.len(), self.cells.len());
        }
        self.invalidate_mesh();

        let max_level = max_level.min(MAX_LEVEL - 1);
        let min_level = min_level.max(0).min(max_level);

        let mut hash = CellHash::new();
        let mut ext_hash = CellHash::new();

        for (i, &cell) in self.cells.iter().enumerate() {
            let delta = refinement.map_or(1, |deltas| deltas[i]);
            if delta == 0 || (delta < 0 && cell.level <= min_level) {
                hash.insert(cell);
            } else if delta > 0 && cell.level >= max_level {
                hash.insert(cell);
            } else if delta < 0 {
                // Coarsen by snapping to the coarser cell's alignment; a
                // sibling-complete set is not required.
                let new_level = (cell.level + delta).max(min_level);
                let h = 1 << (MAX_LEVEL - new_level);
                let coarse = Cell::new(cell.block, cell.x - cell.x % h, cell.y - cell.y % h, new_level);
                self.route_cell(coarse, &mut hash, &mut ext_hash);
            } else {
                // Subdivide into the full set of 4^delta children.
                let new_level = (cell.level + delta).min(max_level);
                let h = 1 << (MAX_LEVEL - new_level);
                let steps = 1 << (new_level - cell.level);
                for ii in 0..steps {
                    for jj in 0..steps {
                        let child =
                            Cell::new(cell.block, cell.x + ii * h, cell.y + jj * h, new_level);
                        self.route_cell(child, &mut hash, &mut ext_hash);
                    }
                }
            }
        }

        // Ship the externally owned cells to their ranks and merge.
        let outgoing = ext_hash.into_sorted();
        let incoming = self.distribute_by_owner(outgoing.as_slice());
        for cell in incoming {
            hash.insert(cell);
        }

        self.cells = hash.into_sorted();
        log::debug!("refine: rank {} holds {} cells", self.rank, self.cells.len());
        Ok(())
    }

    fn route_cell(&self, cell: Cell, hash: &mut CellHash, ext_hash: &mut CellHash) {
        if self.get_owner(&cell) == self.rank {
            hash.insert(cell);
        } else {
            ext_hash.insert(cell);
        }
    }

    // Send each cell of a sorted list to the rank owning its partition
    // interval. Cells already owned locally are dropped.
    fn distribute_by_owner(&self, cells: &[Cell]) -> Vec<Cell> {
        debug_assert!(cells.windows(2).all(|w| w[0] <= w[1]));
        let mut send = Vec::with_capacity(cells.len());
        let mut counts = vec![0i32; self.size as usize];
        for &cell in cells {
            let owner = self.get_owner(&cell);
            if owner != self.rank {
                send.push(cell);
                counts[owner as usize] += 1;
            }
        }
        redistribute(&send, &counts, self.comm)
    }

    // Distribute a lookup to the owning ranks and return the queries as
    // received there together with the counts needed to route per-element
    // answers back in query order.
    pub(crate) fn distribute_queries(&self, queries: &[Cell]) -> (Vec<Cell>, Vec<i32>) {
        let mut counts = vec![0i32; self.size as usize];
        for cell in queries {
            counts[self.get_owner(cell) as usize] += 1;
        }
        redistribute_with_counts(queries, &counts, self.comm)
    }

    // Route explicitly addressed cells; the list does not need any order.
    fn distribute_to_ranks(&self, mut destined: Vec<RankCell>) -> Vec<Cell> {
        destined.sort_unstable_by_key(|rc| (rc.rank, rc.cell));
        destined.dedup_by_key(|rc| (rc.rank, rc.cell));

        let mut counts = vec![0i32; self.size as usize];
        let mut send = Vec::with_capacity(destined.len());
        for rc in destined {
            counts[rc.rank as usize] += 1;
            send.push(rc.cell);
        }
        redistribute(&send, &counts, self.comm)
    }

    /// Enforce the 2:1 level balance across all face/edge (and corner, if
    /// requested) adjacencies, including across block boundaries.
    ///
    /// The algorithm works on the canonical first siblings of each sibling
    /// group: a local fixed point over a hash/queue pair, a reduction and
    /// global exchange of the externally owned requirements, a second
    /// local fixed point, and finally the expansion of every first sibling
    /// into its full sibling set. Ghosts and nodes are discarded.
    pub fn balance(&mut self, balance_corner: bool) -> Result<(), ForestError> {
        let conn = self.require_conn()?;
        if self.owners.is_empty() {
            return Err(ForestError::NoCells);
        }
        self.invalidate_mesh();

        let mut hash = CellHash::new();
        let mut ext_hash = CellHash::new();
        let mut queue = CellQueue::new();

        // Insert the first sibling of every element and balance it.
        for cell in self.cells.iter() {
            let sib = cell.sibling(0);
            if self.get_owner(&sib) == self.rank {
                hash.insert(sib);
            } else {
                ext_hash.insert(sib);
            }
            self.balance_cell(&conn, &sib, &mut hash, Some(&mut ext_hash), &mut queue, balance_corner);
        }

        // Propagate until the local fixed point is reached.
        while let Some(cell) = queue.pop() {
            self.balance_cell(&conn, &cell, &mut hash, Some(&mut ext_hash), &mut queue, balance_corner);
        }

        // The tree is now locally balanced. Reduce the externally owned
        // requirements to one representative per parent, then hand them to
        // the ranks that own the corresponding regions.
        let elems = ext_hash.into_sorted();
        let mut outgoing = Vec::new();
        if !elems.is_empty() {
            let arr = elems.as_slice();
            let parent_of = |c: &Cell| if c.level > 0 { c.parent() } else { *c };
            let mut rep = arr[0];
            let mut parent = parent_of(&rep);
            for &cell in arr.iter() {
                if !parent.encloses(&cell) {
                    outgoing.push(rep);
                }
                rep = cell;
                parent = parent_of(&rep);
            }
            outgoing.push(rep);
        }

        let incoming = self.distribute_by_owner(&outgoing);

        // The received cells balance the local tree without having to
        // revisit off-rank regions.
        let mut queue = CellQueue::new();
        for cell in incoming {
            if hash.insert(cell) {
                queue.push(cell);
            }
        }
        while let Some(cell) = queue.pop() {
            self.balance_cell(&conn, &cell, &mut hash, None, &mut queue, balance_corner);
        }

        // Expand the first siblings back into full sibling sets,
        // forwarding remote siblings to their owners.
        let reps = hash.into_sorted();
        let mut hash = CellHash::new();
        let mut remote = Vec::new();
        for &cell in reps.iter() {
            if cell.level > 0 {
                for j in 0..NSIBLINGS {
                    let sib = cell.sibling(j);
                    if self.get_owner(&sib) == self.rank {
                        hash.insert(sib);
                    } else {
                        remote.push(sib);
                    }
                }
            } else {
                hash.insert(cell);
            }
        }

        remote.sort_unstable();
        remote.dedup();
        let incoming = self.distribute_by_owner(&remote);
        for cell in incoming {
            hash.insert(cell);
        }

        // The expansion recreates a coarse cell wherever a neighbor
        // request targeted a region that is in fact subdivided. The
        // subdividing group's first sibling shares the coarse cell's
        // origin, so cells of equal encoding sort coarse-to-fine next to
        // each other; keep the finest of each run.
        let merged = hash.into_sorted().into_vec();
        let mut cells: Vec<Cell> = Vec::with_capacity(merged.len());
        for &cell in &merged {
            if let Some(&last) = cells.last() {
                if last.cmp_encoding(&cell) == Ordering::Equal {
                    cells.pop();
                }
            }
            cells.push(cell);
        }

        self.cells = CellArray::from_sorted(cells);
        log::debug!("balance: rank {} holds {} cells", self.rank, self.cells.len());
        Ok(())
    }

    // Add the first siblings of the parent-level neighbors required to
    // keep `cell` balanced.
    fn balance_cell(
        &self,
        conn: &Connectivity,
        cell: &Cell,
        hash: &mut CellHash,
        mut ext_hash: Option<&mut CellHash>,
        queue: &mut CellQueue,
        balance_corner: bool,
    ) {
        if cell.level <= 1 {
            return;
        }
        let parent = cell.parent();

        for edge_index in 0..NUM_EDGES {
            let q = parent.edge_neighbor(edge_index).sibling(0);
            if q.in_bounds() {
                self.route_balance_cell(q, hash, ext_hash.as_deref_mut(), queue);
            } else {
                self.add_edge_neighbors(conn, edge_index, q, hash, ext_hash.as_deref_mut(), queue);
            }
        }

        if balance_corner {
            for corner in 0..NUM_CORNERS {
                let q = parent.corner_neighbor(corner).sibling(0);
                if q.in_bounds() {
                    self.route_balance_cell(q, hash, ext_hash.as_deref_mut(), queue);
                } else {
                    let ex = q.x < 0 || q.x >= MAX_COORD;
                    let ey = q.y < 0 || q.y >= MAX_COORD;
                    if ex && ey {
                        self.add_corner_neighbors(conn, corner, q, hash, ext_hash.as_deref_mut(), queue);
                    } else {
                        let edge_index = if ex {
                            usize::from(q.x >= 0)
                        } else {
                            2 + usize::from(q.y >= 0)
                        };
                        self.add_edge_neighbors(conn, edge_index, q, hash, ext_hash.as_deref_mut(), queue);
                    }
                }
            }
        }
    }

    fn route_balance_cell(
        &self,
        cell: Cell,
        hash: &mut CellHash,
        ext_hash: Option<&mut CellHash>,
        queue: &mut CellQueue,
    ) {
        if self.get_owner(&cell) == self.rank {
            if hash.insert(cell) {
                queue.push(cell);
            }
        } else if let Some(ext) = ext_hash {
            if ext.insert(cell) {
                queue.push(cell);
            }
        }
    }

    // Map a first-sibling cell that left its block across an edge into
    // the frame of every edge-adjacent block. The mirrored coordinate
    // offsets by the sibling-group extent 2h so the result is again the
    // first sibling of its group.
    fn add_edge_neighbors(
        &self,
        conn: &Connectivity,
        edge_index: usize,
        p: Cell,
        hash: &mut CellHash,
        mut ext_hash: Option<&mut CellHash>,
        queue: &mut CellQueue,
    ) {
        let edge = conn.block_edge(p.block, edge_index);
        let h = p.side_length();
        let ucoord = if edge_index < 2 { p.y } else { p.x };

        for (adj, adj_index) in conn.edge_blocks(edge) {
            if adj == p.block {
                continue;
            }
            let reverse = conn.edges_reversed(p.block, edge_index, adj, adj_index);
            let u = if reverse {
                MAX_COORD - 2 * h - ucoord
            } else {
                ucoord
            };

            let offset = (MAX_COORD - 2 * h) * (adj_index as i32 % 2);
            let neighbor = if adj_index < 2 {
                Cell::new(adj, offset, u, p.level)
            } else {
                Cell::new(adj, u, offset, p.level)
            };
            self.route_balance_cell(neighbor, hash, ext_hash.as_deref_mut(), queue);
        }
    }

    // Fan a first-sibling cell that left its block across a corner out to
    // all corner-adjacent blocks.
    fn add_corner_neighbors(
        &self,
        conn: &Connectivity,
        corner: usize,
        p: Cell,
        hash: &mut CellHash,
        mut ext_hash: Option<&mut CellHash>,
        queue: &mut CellQueue,
    ) {
        let vertex = conn.block_vertex(p.block, corner);
        let h = p.side_length();

        for (adj, adj_index) in conn.vertex_blocks(vertex) {
            if adj == p.block {
                continue;
            }
            let neighbor = Cell::new(
                adj,
                (MAX_COORD - 2 * h) * (adj_index as i32 % 2),
                (MAX_COORD - 2 * h) * (adj_index as i32 / 2),
                p.level,
            );
            self.route_balance_cell(neighbor, hash, ext_hash.as_deref_mut(), queue);
        }
    }

    /// Exchange the one-cell-deep layer of ghost cells: every local cell
    /// with a face/edge/corner neighbor region owned by another rank is
    /// sent to that rank.
    ///
    /// Afterwards [Forest::ghosts] holds the cells of other ranks adjacent
    /// to the local partition, so dependent-edge queries never need
    /// further communication.
    pub fn compute_ghosts(&mut self) -> Result<(), ForestError> {
        let conn = self.require_conn()?;
        if self.owners.is_empty() {
            return Err(ForestError::NoCells);
        }

        let mut destined = Vec::<RankCell>::new();

        for &cell in self.cells.iter() {
            // Half-size neighbors across each edge.
            for edge_index in 0..NUM_EDGES {
                for &child in &EDGE_CHILDREN[edge_index] {
                    let q = cell.children()[child].edge_neighbor(edge_index);
                    if q.in_bounds() {
                        let owner = self.get_owner(&q);
                        if owner != self.rank {
                            destined.push(RankCell { rank: owner, cell });
                        }
                    } else {
                        self.add_adjacent_edge(&conn, edge_index, &q, &cell, &mut destined);
                    }
                }
            }

            // Half-size neighbors across each corner.
            for corner in 0..NUM_CORNERS {
                let q = cell.children()[corner].corner_neighbor(corner);
                if q.in_bounds() {
                    let owner = self.get_owner(&q);
                    if owner != self.rank {
                        destined.push(RankCell { rank: owner, cell });
                    }
                } else {
                    let ex = q.x < 0 || q.x >= MAX_COORD;
                    let ey = q.y < 0 || q.y >= MAX_COORD;
                    if ex && ey {
                        self.add_adjacent_corner(&conn, corner, &q, &cell, &mut destined);
                    } else {
                        let edge_index = if ex {
                            usize::from(q.x >= 0)
                        } else {
                            2 + usize::from(q.y >= 0)
                        };
                        self.add_adjacent_edge(&conn, edge_index, &q, &cell, &mut destined);
                    }
                }
            }
        }

        let ghosts = self.distribute_to_ranks(destined);
        self.ghosts = Some(CellArray::from_unsorted(ghosts));
        log::debug!(
            "compute_ghosts: rank {} received {} ghost cells",
            self.rank,
            self.ghosts.as_ref().unwrap().len()
        );
        Ok(())
    }

    // Queue `orig` for every rank owning the region of the out-of-block
    // neighbor `q` across the given edge. Unlike the balance transform,
    // `q` is an actual cell, so the mirrored coordinate offsets by h.
    fn add_adjacent_edge(
        &self,
        conn: &Connectivity,
        edge_index: usize,
        q: &Cell,
        orig: &Cell,
        destined: &mut Vec<RankCell>,
    ) {
        let edge = conn.block_edge(q.block, edge_index);
        let h = q.side_length();
        let ucoord = if edge_index < 2 { q.y } else { q.x };

        for (adj, adj_index) in conn.edge_blocks(edge) {
            if adj == q.block {
                continue;
            }
            let reverse = conn.edges_reversed(q.block, edge_index, adj, adj_index);
            let u = if reverse {
                MAX_COORD - h - ucoord
            } else {
                ucoord
            };

            let offset = (MAX_COORD - h) * (adj_index as i32 % 2);
            let neighbor = if adj_index < 2 {
                Cell::new(adj, offset, u, q.level)
            } else {
                Cell::new(adj, u, offset, q.level)
            };

            let owner = self.get_owner(&neighbor);
            if owner != self.rank {
                destined.push(RankCell {
                    rank: owner,
                    cell: *orig,
                });
            }
        }
    }

    fn add_adjacent_corner(
        &self,
        conn: &Connectivity,
        corner: usize,
        q: &Cell,
        orig: &Cell,
        destined: &mut Vec<RankCell>,
    ) {
        let vertex = conn.block_vertex(q.block, corner);
        let h = q.side_length();

        for (adj, adj_index) in conn.vertex_blocks(vertex) {
            if adj == q.block {
                continue;
            }
            let neighbor = Cell::new(
                adj,
                (MAX_COORD - h) * (adj_index as i32 % 2),
                (MAX_COORD - h) * (adj_index as i32 / 2),
                q.level,
            );
            let owner = self.get_owner(&neighbor);
            if owner != self.rank {
                destined.push(RankCell {
                    rank: owner,
                    cell: *orig,
                });
            }
        }
    }

    /// Canonicalize a node location into the frame of the owner block of
    /// the vertex or edge it lies on.
    ///
    /// Interior nodes are returned unchanged. Coordinates equal to
    /// `MAX_COORD` are truncated by one afterwards so the result stays
    /// inside the block's coordinate range; [crate::geometry::coordinate]
    /// undoes the truncation.
    pub fn transform_node(&self, mut node: Cell) -> Cell {
        let conn = self.conn();

        let fx0 = node.x == 0;
        let fy0 = node.y == 0;
        let fx = fx0 || node.x == MAX_COORD;
        let fy = fy0 || node.y == MAX_COORD;

        if fx && fy {
            // A corner node: move it to the owner block of the vertex.
            let corner = usize::from(!fx0) + 2 * usize::from(!fy0);
            let vertex = conn.block_vertex(node.block, corner);
            let owner = conn.vertex_owner(vertex);
            if node.block != owner {
                for (adj, adj_index) in conn.vertex_blocks(vertex) {
                    if adj == owner {
                        node.block = adj;
                        node.x = MAX_COORD * (adj_index as i32 % 2);
                        node.y = MAX_COORD * (adj_index as i32 / 2);
                        break;
                    }
                }
            }
        } else if fx || fy {
            // An edge node: move it to the owner block of the edge,
            // respecting the relative edge orientation.
            let edge_index = if fx {
                usize::from(!fx0)
            } else {
                2 + usize::from(!fy0)
            };
            let edge = conn.block_edge(node.block, edge_index);
            let owner = conn.edge_owner(edge);
            let u = if edge_index < 2 { node.y } else { node.x };

            if node.block != owner {
                for (adj, adj_index) in conn.edge_blocks(edge) {
                    if adj == owner {
                        let reverse =
                            conn.edges_reversed(node.block, edge_index, adj, adj_index);
                        let uq = if reverse { MAX_COORD - u } else { u };
                        node.block = adj;
                        if adj_index < 2 {
                            node.x = MAX_COORD * (adj_index as i32 % 2);
                            node.y = uq;
                        } else {
                            node.x = uq;
                            node.y = MAX_COORD * (adj_index as i32 % 2);
                        }
                        break;
                    }
                }
            }
        }

        if node.x == MAX_COORD {
            node.x = MAX_COORD - 1;
        }
        if node.y == MAX_COORD {
            node.y = MAX_COORD - 1;
        }
        node
    }

    /// Find the local cell whose closed region contains the given node
    /// location, if any.
    pub fn find_enclosing(&self, node: &Cell) -> Option<&Cell> {
        let arr = self.cells.as_slice();
        let encloses = |c: &Cell| {
            let h = c.side_length();
            c.block == node.block
                && (c.x..=c.x + h).contains(&node.x)
                && (c.y..=c.y + h).contains(&node.y)
        };

        let index = arr.partition_point(|c| c.cmp_encoding(node) != Ordering::Greater);
        if index > 0 && encloses(&arr[index - 1]) {
            return Some(&arr[index - 1]);
        }
        if index < arr.len() && encloses(&arr[index]) {
            return Some(&arr[index]);
        }
        None
    }
}
