//! Node creation, dependent-node constraints and interpolation transfer.

use std::collections::HashMap;

use itertools::izip;
use mpi::traits::{CommunicatorCollectives, Equivalence};

use crate::cell::Cell;
use crate::collections::{CellArray, CellHash};
use crate::connectivity::Connectivity;
use crate::constants::{MAX_COORD, MAX_LEVEL, NUM_EDGES};
use crate::error::ForestError;
use crate::forest::{Forest, EDGE_CHILDREN};
use crate::geometry::{coordinate, BlockGeometry};
use crate::interp::{
    interpolation_knots, lagrange_weights, merge_masters, InterpolationSink, InterpolationType,
};
use crate::transport::{gather_to_all, redistribute};

/// Tag answer for a node lookup that found nothing at the owning rank.
const TAG_MISSING: i64 = i64::MIN;

/// A dependent (hanging) edge: an element together with the local edge
/// index along which a more refined neighbor exists. The element may be a
/// ghost; the fine elements are local either way.
#[derive(Copy, Clone, Debug)]
pub(crate) struct DepEdge {
    cell: Cell,
    edge_index: usize,
}

// A node location traveling together with its global tag.
#[derive(Copy, Clone, Equivalence)]
struct TaggedCell {
    cell: Cell,
    tag: i64,
}

/// The dependent-node constraints in CSR form.
#[derive(Debug, Default)]
pub struct DepNodeConn {
    ptr: Vec<usize>,
    conn: Vec<i64>,
    weights: Vec<f64>,
}

impl DepNodeConn {
    /// Row pointer, one entry per dependent node plus one.
    pub fn ptr(&self) -> &[usize] {
        &self.ptr
    }

    /// Global independent node numbers mastering each dependent node.
    pub fn conn(&self) -> &[i64] {
        &self.conn
    }

    /// The interpolation weight of each master.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }
}

/// The node data of a forest whose nodes have been created.
pub struct NodeData {
    order: usize,
    interp_type: InterpolationType,
    knots: Vec<f64>,
    // order^2 entries per local element: a global node number, or -(k+1)
    // for the k-th local dependent node.
    conn: Vec<i64>,
    // Canonical node locations, sorted, with their tags alongside.
    node_cells: Vec<Cell>,
    node_tags: Vec<i64>,
    node_points: Vec<[f64; 3]>,
    num_dep: usize,
    // Owned-node partition: rank r owns global numbers
    // node_range[r]..node_range[r+1].
    node_range: Vec<i64>,
    dep_edges: Vec<DepEdge>,
    dep: Option<DepNodeConn>,
}

// The integer positions along an edge of size h that hang off the coarse
// side: the fine-grid knots that do not coincide with coarse-grid knots.
fn dep_positions(order: usize, h: i32) -> Vec<i32> {
    match order {
        2 => vec![h / 2],
        _ => vec![h / 4, 3 * (h / 4)],
    }
}

// The node location at parameter offset u along an edge of the cell.
fn edge_node(cell: &Cell, edge_index: usize, u: i32) -> Cell {
    let h = cell.side_length();
    let (x, y) = if edge_index < 2 {
        (cell.x + h * (edge_index as i32 % 2), cell.y + u)
    } else {
        (cell.x + u, cell.y + h * (edge_index as i32 % 2))
    };
    Cell {
        block: cell.block,
        x,
        y,
        level: MAX_LEVEL,
    }
}

// Binary search a sorted node array by node identity.
fn find_node(node_cells: &[Cell], query: &Cell) -> Option<usize> {
    node_cells.binary_search_by(|c| c.cmp_node(query)).ok()
}

impl<'f, C: CommunicatorCollectives> Forest<'f, C> {
    /// Create and globally number the mesh nodes.
    ///
    /// The forest must be balanced. Supported orders are 2 and 3; the
    /// interpolation points are placed uniformly or at Gauss-Lobatto
    /// locations (identical for these orders). The geometry evaluator is
    /// invoked exactly once per node.
    ///
    /// Afterwards every local element has `order^2` connectivity entries
    /// holding global node numbers, with `-(k+1)` marking the k-th local
    /// dependent node, and the owned-node counts of all ranks tile
    /// `0..total_node_count`.
    pub fn create_nodes(
        &mut self,
        order: usize,
        interp_type: InterpolationType,
        geometry: &dyn BlockGeometry,
    ) -> Result<(), ForestError> {
        if !(2..=3).contains(&order) {
            return Err(ForestError::UnsupportedOrder(order));
        }
        self.connectivity().ok_or(ForestError::NotConfigured)?;
        if self.owners().is_empty() {
            return Err(ForestError::NoCells);
        }

        // Exchange ghosts so that dependent edges can be found without
        // further communication.
        self.compute_ghosts()?;
        let dep_edges = self.compute_dep_edges();

        let knots = interpolation_knots(order, interp_type);

        // Canonical node location of every node slot of every local
        // element. Slots of adjacent elements that touch the same
        // location produce the same canonical cell, which is what unifies
        // them to a single index.
        let num_elements = self.cells().len();
        let nodes_per_elem = order * order;
        let mut slot_nodes = Vec::with_capacity(nodes_per_elem * num_elements);
        for cell in self.cells().iter() {
            let step = cell.side_length() / (order as i32 - 1);
            for jj in 0..order as i32 {
                for ii in 0..order as i32 {
                    let node = Cell {
                        block: cell.block,
                        x: cell.x + step * ii,
                        y: cell.y + step * jj,
                        level: MAX_LEVEL,
                    };
                    slot_nodes.push(self.transform_node(node));
                }
            }
        }

        let node_array = CellArray::from_unsorted(slot_nodes.clone());
        let conn_pos: Vec<usize> = slot_nodes
            .iter()
            .map(|node| node_array.contains_node(node).unwrap())
            .collect();
        let node_cells = node_array.into_vec();

        // Mark the dependent node locations hanging off each dependent
        // edge.
        let mut is_dep = vec![false; node_cells.len()];
        for dep in &dep_edges {
            let h = dep.cell.side_length();
            for u in dep_positions(order, h) {
                let node = self.transform_node(edge_node(&dep.cell, dep.edge_index, u));
                if let Some(pos) = find_node(&node_cells, &node) {
                    is_dep[pos] = true;
                }
            }
        }

        // Number the owned independent nodes; every rank contributes its
        // count to the replicated node range.
        let owner_ranks: Vec<i32> = node_cells.iter().map(|n| self.get_owner(n)).collect();
        let num_owned = izip!(&owner_ranks, &is_dep)
            .filter(|&(&owner, &dep)| owner == self.rank() && !dep)
            .count() as i64;

        let counts = gather_to_all(std::slice::from_ref(&num_owned), self.comm());
        let mut node_range = vec![0i64; self.size() as usize + 1];
        for (k, &count) in counts.iter().enumerate() {
            node_range[k + 1] = node_range[k] + count;
        }

        let mut node_tags = vec![TAG_MISSING; node_cells.len()];
        let mut next_owned = node_range[self.rank() as usize];
        let mut num_dep = 0usize;
        for i in 0..node_cells.len() {
            if is_dep[i] {
                num_dep += 1;
                node_tags[i] = -(num_dep as i64);
            } else if owner_ranks[i] == self.rank() {
                node_tags[i] = next_owned;
                next_owned += 1;
            }
        }

        // Resolve the tags of independent nodes owned elsewhere with a
        // distribute/lookup/return round trip.
        let queries: Vec<Cell> = izip!(&node_cells, &owner_ranks, &is_dep)
            .filter(|&(_, &owner, &dep)| owner != self.rank() && !dep)
            .map(|(&cell, _, _)| cell)
            .collect();
        let answers = self.resolve_node_tags(&queries, &node_cells, &node_tags);

        let mut answer_iter = answers.into_iter();
        for i in 0..node_cells.len() {
            if !is_dep[i] && owner_ranks[i] != self.rank() {
                let tag = answer_iter.next().unwrap();
                if tag < 0 {
                    log::error!(
                        "rank {}: node {} unresolved at its owning rank {}",
                        self.rank(),
                        node_cells[i],
                        owner_ranks[i]
                    );
                }
                node_tags[i] = tag;
            }
        }

        let conn: Vec<i64> = conn_pos.iter().map(|&pos| node_tags[pos]).collect();

        // Physical node locations from the geometry evaluator.
        let node_points: Vec<[f64; 3]> = node_cells
            .iter()
            .map(|n| geometry.eval_point(n.block, coordinate(n.x), coordinate(n.y)))
            .collect();

        log::debug!(
            "create_nodes: rank {} references {} nodes ({} owned, {} dependent)",
            self.rank(),
            node_cells.len(),
            num_owned,
            num_dep
        );

        self.nodes = Some(NodeData {
            order,
            interp_type,
            knots,
            conn,
            node_cells,
            node_tags,
            node_points,
            num_dep,
            node_range,
            dep_edges,
            dep: None,
        });
        Ok(())
    }

    // Find every (element, edge) pair whose edge has a more refined
    // neighbor, checking local elements against local and ghost cells and
    // ghost elements against local cells.
    fn compute_dep_edges(&self) -> Vec<DepEdge> {
        let conn = self.connectivity().unwrap().clone();
        let ghosts = self.ghosts().expect("ghosts not exchanged");

        let mut dep_edges = Vec::new();
        let passes: [(&CellArray, Option<&CellArray>); 2] =
            [(self.cells(), Some(ghosts)), (ghosts, None)];

        for (list, adj) in passes {
            for &cell in list.iter() {
                for edge_index in 0..NUM_EDGES {
                    let mut add_me = false;
                    for &child in &EDGE_CHILDREN[edge_index] {
                        let q = cell.children()[child].edge_neighbor(edge_index);
                        let found = if q.in_bounds() {
                            self.cells().contains(&q).is_some()
                                || adj.is_some_and(|a| a.contains(&q).is_some())
                        } else {
                            self.check_adjacent_dep_edges(&conn, edge_index, &q, adj)
                        };
                        if found {
                            add_me = true;
                            break;
                        }
                    }
                    if add_me {
                        dep_edges.push(DepEdge { cell, edge_index });
                    }
                }
            }
        }
        dep_edges
    }

    // Search for the refined neighbor of an out-of-block cell across all
    // edge-adjacent blocks.
    fn check_adjacent_dep_edges(
        &self,
        conn: &Connectivity,
        edge_index: usize,
        q: &Cell,
        adj_cells: Option<&CellArray>,
    ) -> bool {
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

            if self.cells().contains(&neighbor).is_some()
                || adj_cells.is_some_and(|a| a.contains(&neighbor).is_some())
            {
                return true;
            }
        }
        false
    }

    // Distribute node queries to their owning ranks, look each up in the
    // local node array, and return the tags in query order. Lookups that
    // miss answer with a sentinel and a diagnostic; the mesh downstream is
    // then observably wrong rather than the job crashing.
    fn resolve_node_tags(
        &self,
        queries: &[Cell],
        node_cells: &[Cell],
        node_tags: &[i64],
    ) -> Vec<i64> {
        let (incoming, recv_counts) = self.distribute_queries(queries);

        let answers: Vec<i64> = incoming
            .iter()
            .map(|q| match find_node(node_cells, q) {
                Some(pos) => node_tags[pos],
                None => {
                    log::error!("rank {}: no node found at {}", self.rank(), q);
                    TAG_MISSING
                }
            })
            .collect();

        redistribute(&answers, &recv_counts, self.comm())
    }

    /// Build the dependent-node constraints: for each local dependent
    /// node, the list of independent master nodes and interpolation
    /// weights.
    ///
    /// The masters of a dependent node are the nodes of the coarse edge it
    /// hangs on, weighted with the Lagrange basis at its knot position, so
    /// each row sums to one. Masters owned by other ranks are resolved
    /// with a lookup round trip; a master that is itself dependent is
    /// substituted by its own row. This call is collective.
    pub fn create_dep_node_conn(&mut self) -> Result<(), ForestError> {
        let mut nd = self.nodes.take().ok_or(ForestError::NodesNotCreated)?;
        if nd.dep.is_some() {
            self.nodes = Some(nd);
            return Ok(());
        }

        let order = nd.order;

        // Collect the master locations that are not present in the local
        // node array.
        let mut ext = CellHash::new();
        for dep in &nd.dep_edges {
            let h = dep.cell.side_length();
            let step = h / (order as i32 - 1);
            for k in 0..order as i32 {
                let master = self.transform_node(edge_node(&dep.cell, dep.edge_index, k * step));
                if find_node(&nd.node_cells, &master).is_none() {
                    ext.insert(master);
                }
            }
        }

        let queries = ext.into_sorted().into_vec();
        let answers = self.resolve_node_tags(&queries, &nd.node_cells, &nd.node_tags);
        let ext_tags: HashMap<Cell, i64> = queries.into_iter().zip(answers).collect();

        // Process the dependent edges coarse-to-fine so that a master
        // that is itself dependent already has its row built when it is
        // substituted.
        let mut edge_order: Vec<usize> = (0..nd.dep_edges.len()).collect();
        edge_order.sort_by_key(|&i| nd.dep_edges[i].cell.level);

        let mut rows: Vec<Option<Vec<(i64, f64)>>> = vec![None; nd.num_dep];

        for &e in &edge_order {
            let dep = nd.dep_edges[e];
            let h = dep.cell.side_length();
            let step = h / (order as i32 - 1);

            // The masters along the coarse edge: the local tag, or the
            // owner's answer for off-rank masters.
            let masters: Vec<(i64, bool)> = (0..order as i32)
                .map(|k| {
                    let master = self.transform_node(edge_node(&dep.cell, dep.edge_index, k * step));
                    match find_node(&nd.node_cells, &master) {
                        Some(pos) => (nd.node_tags[pos], true),
                        None => (*ext_tags.get(&master).unwrap_or(&TAG_MISSING), false),
                    }
                })
                .collect();

            for u in dep_positions(order, h) {
                let node = self.transform_node(edge_node(&dep.cell, dep.edge_index, u));
                let Some(pos) = find_node(&nd.node_cells, &node) else {
                    // The hanging location is not referenced by any local
                    // element.
                    continue;
                };
                let tag = nd.node_tags[pos];
                if tag >= 0 {
                    log::error!(
                        "rank {}: node {} on a dependent edge is not marked dependent",
                        self.rank(),
                        node
                    );
                    continue;
                }
                let dep_index = (-tag - 1) as usize;
                if rows[dep_index].is_some() {
                    continue;
                }

                let basis = lagrange_weights(&nd.knots, u as f64 / h as f64);
                let mut row = Vec::with_capacity(order);
                for (&(master_tag, local), &weight) in masters.iter().zip(basis.iter()) {
                    if master_tag >= 0 {
                        row.push((master_tag, weight));
                    } else if local && master_tag != TAG_MISSING {
                        // A chained hanging node: substitute its own
                        // masters.
                        let master_index = (-master_tag - 1) as usize;
                        match &rows[master_index] {
                            Some(master_row) => {
                                for &(col, master_weight) in master_row {
                                    row.push((col, weight * master_weight));
                                }
                            }
                            None => log::error!(
                                "rank {}: chained dependent master {} has no row yet",
                                self.rank(),
                                master_index
                            ),
                        }
                    } else {
                        log::error!(
                            "rank {}: dependent master on a remote rank is itself dependent",
                            self.rank()
                        );
                    }
                }
                merge_masters(&mut row);
                rows[dep_index] = Some(row);
            }
        }

        // Compact into CSR form.
        let mut dep_conn = DepNodeConn {
            ptr: Vec::with_capacity(nd.num_dep + 1),
            conn: Vec::new(),
            weights: Vec::new(),
        };
        dep_conn.ptr.push(0);
        for (index, row) in rows.into_iter().enumerate() {
            match row {
                Some(entries) => {
                    for (col, weight) in entries {
                        dep_conn.conn.push(col);
                        dep_conn.weights.push(weight);
                    }
                }
                None => log::error!(
                    "rank {}: dependent node {} has no constraint row",
                    self.rank(),
                    index
                ),
            }
            dep_conn.ptr.push(dep_conn.conn.len());
        }

        nd.dep = Some(dep_conn);
        self.nodes = Some(nd);
        Ok(())
    }

    /// Build the coarse-to-fine interpolation operator.
    ///
    /// `coarse` must be a coarsened (or duplicated) forest sharing this
    /// forest's connectivity, with its nodes created. For every fine node
    /// owned by this rank, the enclosing coarse cell is located, the
    /// coarse nodal basis is evaluated at the fine node's parametric
    /// position, coarse dependent nodes are expanded through their master
    /// rows, and the merged row is emitted through the sink on the rank
    /// owning the enclosing coarse cell. This call is collective.
    pub fn create_interpolation<S: InterpolationSink>(
        &self,
        coarse: &mut Forest<'f, C>,
        sink: &mut S,
    ) -> Result<(), ForestError> {
        coarse.create_dep_node_conn()?;

        let fine = self.node_data()?;
        let coarse_nd = coarse.node_data()?;
        let coarse_dep = coarse_nd.dep.as_ref().unwrap();

        // The fine nodes owned by this rank, with their global numbers.
        let rank = self.rank() as usize;
        let lo = fine.node_range[rank];
        let hi = fine.node_range[rank + 1];
        let owned: Vec<TaggedCell> = fine
            .node_cells
            .iter()
            .zip(fine.node_tags.iter())
            .filter(|&(_, &tag)| (lo..hi).contains(&tag))
            .map(|(&cell, &tag)| TaggedCell { cell, tag })
            .collect();

        // Ship every owned fine node to the rank holding the enclosing
        // coarse cell; local nodes are kept in place.
        let mut counts = vec![0i32; self.size() as usize];
        for node in &owned {
            counts[coarse.get_owner(&node.cell) as usize] += 1;
        }
        let fine_nodes = redistribute(&owned, &counts, self.comm());

        let order = coarse_nd.order;
        for node in &fine_nodes {
            let Some(&quad) = coarse.find_enclosing(&node.cell) else {
                log::error!(
                    "rank {}: no enclosing coarse cell for fine node {}",
                    self.rank(),
                    node.cell
                );
                continue;
            };

            let h = quad.side_length();
            let step = h / (order as i32 - 1);

            // Restore the far-boundary truncation before taking the
            // element-local offset.
            let x = if node.cell.x == MAX_COORD - 1 {
                MAX_COORD
            } else {
                node.cell.x
            };
            let y = if node.cell.y == MAX_COORD - 1 {
                MAX_COORD
            } else {
                node.cell.y
            };
            let u = (x - quad.x) as f64 / h as f64;
            let v = (y - quad.y) as f64 / h as f64;

            let nu = lagrange_weights(&coarse_nd.knots, u);
            let nv = lagrange_weights(&coarse_nd.knots, v);

            let mut row = Vec::with_capacity(order * order);
            for (jj, &wv) in nv.iter().enumerate() {
                for (ii, &wu) in nu.iter().enumerate() {
                    let weight = wu * wv;
                    if weight == 0.0 {
                        continue;
                    }

                    let coarse_node = coarse.transform_node(Cell {
                        block: quad.block,
                        x: quad.x + step * ii as i32,
                        y: quad.y + step * jj as i32,
                        level: MAX_LEVEL,
                    });
                    let Some(pos) = find_node(&coarse_nd.node_cells, &coarse_node) else {
                        log::error!(
                            "rank {}: coarse node {} missing from the local node array",
                            self.rank(),
                            coarse_node
                        );
                        continue;
                    };

                    let tag = coarse_nd.node_tags[pos];
                    if tag >= 0 {
                        row.push((tag, weight));
                    } else {
                        // Substitute the dependent coarse node by its
                        // masters.
                        let dep_index = (-tag - 1) as usize;
                        for jp in coarse_dep.ptr[dep_index]..coarse_dep.ptr[dep_index + 1] {
                            row.push((coarse_dep.conn[jp], weight * coarse_dep.weights[jp]));
                        }
                    }
                }
            }
            merge_masters(&mut row);

            let columns: Vec<i64> = row.iter().map(|&(col, _)| col).collect();
            let weights: Vec<f64> = row.iter().map(|&(_, weight)| weight).collect();
            sink.add_row(node.tag, &columns, &weights);
        }

        Ok(())
    }

    /// The per-element node connectivity: `order^2` global node numbers
    /// per local element, with `-(k+1)` marking the k-th local dependent
    /// node.
    pub fn node_conn(&self) -> Result<&[i64], ForestError> {
        Ok(&self.node_data()?.conn)
    }

    /// The mesh order.
    pub fn mesh_order(&self) -> Result<usize, ForestError> {
        Ok(self.node_data()?.order)
    }

    /// The interpolation point scheme the nodes were created with.
    pub fn interpolation_type(&self) -> Result<InterpolationType, ForestError> {
        Ok(self.node_data()?.interp_type)
    }

    /// The canonical node locations referenced by the local elements,
    /// sorted by encoding.
    pub fn node_cells(&self) -> Result<&[Cell], ForestError> {
        Ok(&self.node_data()?.node_cells)
    }

    /// The tag of every local node: its global number, or `-(k+1)` for
    /// the k-th local dependent node.
    pub fn node_tags(&self) -> Result<&[i64], ForestError> {
        Ok(&self.node_data()?.node_tags)
    }

    /// The physical location of every local node.
    pub fn node_points(&self) -> Result<&[[f64; 3]], ForestError> {
        Ok(&self.node_data()?.node_points)
    }

    /// The owned-node partition: rank r owns global node numbers
    /// `node_range[r]..node_range[r+1]`.
    pub fn node_range(&self) -> Result<&[i64], ForestError> {
        Ok(&self.node_data()?.node_range)
    }

    /// The number of local dependent nodes.
    pub fn num_dep_nodes(&self) -> Result<usize, ForestError> {
        Ok(self.node_data()?.num_dep)
    }

    /// The dependent-node constraints, if they have been created.
    pub fn dep_node_conn(&self) -> Result<&DepNodeConn, ForestError> {
        self.node_data()?
            .dep
            .as_ref()
            .ok_or(ForestError::NodesNotCreated)
    }

    fn node_data(&self) -> Result<&NodeData, ForestError> {
        self.nodes.as_ref().ok_or(ForestError::NodesNotCreated)
    }
}

#[cfg(test)]
mod test {
    use super::{dep_positions, edge_node};
    use crate::cell::Cell;
    use crate::constants::{MAX_COORD, MAX_LEVEL};

    #[test]
    fn test_dep_positions() {
        let h = 1 << 10;
        assert_eq!(dep_positions(2, h), vec![h / 2]);
        assert_eq!(dep_positions(3, h), vec![h / 4, 3 * h / 4]);
    }

    #[test]
    fn test_edge_node_locations() {
        let h = MAX_COORD / 2;
        let cell = Cell::new(0, h, 0, 1);
        // Edge 0 runs along x = cell.x at increasing y.
        let node = edge_node(&cell, 0, h / 2);
        assert_eq!((node.x, node.y), (h, h / 2));
        assert_eq!(node.level, MAX_LEVEL);
        // Edge 1 is offset by the cell size in x.
        let node = edge_node(&cell, 1, h / 2);
        assert_eq!((node.x, node.y), (2 * h, h / 2));
        // Edge 3 runs along y = cell.y + h at increasing x.
        let node = edge_node(&cell, 3, h / 4);
        assert_eq!((node.x, node.y), (h + h / 4, h));
    }
}
