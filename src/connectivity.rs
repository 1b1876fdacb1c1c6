//! Block connectivity: the replicated adjacency of the coarse blocks.

use crate::constants::{EDGE_CORNERS, NUM_CORNERS, NUM_EDGES};

/// The connectivity between the blocks of the forest.
///
/// Every worker holds an identical copy. The caller provides the
/// block-to-corner-vertex table; from it the connectivity derives a unique
/// global numbering of the edges, the inverse vertex-to-block and
/// edge-to-block maps, and a canonical owner block for every shared
/// vertex and edge (the lowest incident block id).
///
/// The input must be valid and symmetric; malformed connectivity (ids out
/// of range, inconsistent sharing) is not diagnosed.
#[derive(Debug)]
pub struct Connectivity {
    num_vertices: usize,
    num_edges: usize,
    num_blocks: usize,
    // 4 vertex ids per block.
    block_verts: Vec<i32>,
    // 4 global edge ids per block.
    block_edge_conn: Vec<i32>,
    // Vertex-to-block CSR; entries encode 4*block + corner_index.
    vert_block_ptr: Vec<usize>,
    vert_block_conn: Vec<usize>,
    // Edge-to-block CSR; entries encode 4*block + edge_index.
    edge_block_ptr: Vec<usize>,
    edge_block_conn: Vec<usize>,
    vert_block_owners: Vec<i32>,
    edge_block_owners: Vec<i32>,
}

impl Connectivity {
    /// Build the connectivity from the block-to-vertex table alone.
    ///
    /// `block_verts` holds four vertex ids per block, corners ordered
    /// `(0,0), (1,0), (0,1), (1,1)`. The edge numbering is derived.
    pub fn new(num_vertices: usize, block_verts: Vec<i32>) -> Self {
        assert_eq!(block_verts.len() % NUM_CORNERS, 0);
        let num_blocks = block_verts.len() / NUM_CORNERS;

        let mut conn = Self {
            num_vertices,
            num_edges: 0,
            num_blocks,
            block_verts,
            block_edge_conn: Vec::new(),
            vert_block_ptr: Vec::new(),
            vert_block_conn: Vec::new(),
            edge_block_ptr: Vec::new(),
            edge_block_conn: Vec::new(),
            vert_block_owners: Vec::new(),
            edge_block_owners: Vec::new(),
        };

        conn.compute_verts_to_blocks();
        conn.compute_edges_from_verts();
        conn.compute_edges_to_blocks();
        conn.compute_owners();
        conn
    }

    /// Build the connectivity with a caller-supplied edge numbering.
    pub fn with_edges(
        num_vertices: usize,
        num_edges: usize,
        block_verts: Vec<i32>,
        block_edge_conn: Vec<i32>,
    ) -> Self {
        assert_eq!(block_verts.len() % NUM_CORNERS, 0);
        let num_blocks = block_verts.len() / NUM_CORNERS;
        assert_eq!(block_edge_conn.len(), NUM_EDGES * num_blocks);

        let mut conn = Self {
            num_vertices,
            num_edges,
            num_blocks,
            block_verts,
            block_edge_conn,
            vert_block_ptr: Vec::new(),
            vert_block_conn: Vec::new(),
            edge_block_ptr: Vec::new(),
            edge_block_conn: Vec::new(),
            vert_block_owners: Vec::new(),
            edge_block_owners: Vec::new(),
        };

        conn.compute_verts_to_blocks();
        conn.compute_edges_to_blocks();
        conn.compute_owners();
        conn
    }

    /// Connectivity of a single block with no neighbors.
    pub fn single_block() -> Self {
        Self::new(4, vec![0, 1, 2, 3])
    }

    // Two-pass counting sort of the vertex occurrences. Each entry records
    // both the incident block and which local corner the vertex is.
    fn compute_verts_to_blocks(&mut self) {
        let mut ptr = vec![0; self.num_vertices + 1];
        for &v in &self.block_verts {
            ptr[v as usize + 1] += 1;
        }
        for i in 1..=self.num_vertices {
            ptr[i] += ptr[i - 1];
        }

        let mut conn = vec![0; ptr[self.num_vertices]];
        let mut next = ptr.clone();
        for block in 0..self.num_blocks {
            for corner in 0..NUM_CORNERS {
                let v = self.block_verts[NUM_CORNERS * block + corner] as usize;
                conn[next[v]] = NUM_CORNERS * block + corner;
                next[v] += 1;
            }
        }

        self.vert_block_ptr = ptr;
        self.vert_block_conn = conn;
    }

    // Derive a unique numbering of the geometric edges. For every still
    // unnumbered block-local edge, all block-local edges sharing its two
    // endpoint vertices (in either order) are collected via the vertex
    // inverse map and assigned the same new edge id.
    fn compute_edges_from_verts(&mut self) {
        self.block_edge_conn = vec![-1; NUM_EDGES * self.num_blocks];

        let mut edge = 0;
        for block in 0..self.num_blocks {
            for edge_index in 0..NUM_EDGES {
                if self.block_edge_conn[NUM_EDGES * block + edge_index] >= 0 {
                    continue;
                }
                let (n1, n2) = self.edge_verts(block as i32, edge_index);

                // Collect every block-local edge that maps to this
                // geometric edge. Any block sharing the edge also shares
                // vertex n1, so scanning its incidence list suffices.
                let mut found = vec![NUM_EDGES * block + edge_index];
                let mut edge_num = -1;

                for (adj, _) in self.vertex_blocks(n1) {
                    for adj_index in 0..NUM_EDGES {
                        let (m1, m2) = self.edge_verts(adj, adj_index);
                        if (n1 == m1 && n2 == m2) || (n1 == m2 && n2 == m1) {
                            let slot = NUM_EDGES * adj as usize + adj_index;
                            if self.block_edge_conn[slot] >= 0 {
                                edge_num = self.block_edge_conn[slot];
                            } else if !found.contains(&slot) {
                                found.push(slot);
                            }
                        }
                    }
                }

                if edge_num < 0 {
                    edge_num = edge;
                    edge += 1;
                }
                for slot in found {
                    self.block_edge_conn[slot] = edge_num;
                }
            }
        }

        self.num_edges = edge as usize;
    }

    // Invert the edge numbering into an edge-to-block CSR. The entries
    // record which local edge index each incidence is, so the forest can
    // recover the orientation of any pair of incident blocks.
    fn compute_edges_to_blocks(&mut self) {
        let mut ptr = vec![0; self.num_edges + 1];
        for &e in &self.block_edge_conn {
            ptr[e as usize + 1] += 1;
        }
        for i in 1..=self.num_edges {
            ptr[i] += ptr[i - 1];
        }

        let mut conn = vec![0; ptr[self.num_edges]];
        let mut next = ptr.clone();
        for block in 0..self.num_blocks {
            for edge_index in 0..NUM_EDGES {
                let e = self.block_edge_conn[NUM_EDGES * block + edge_index] as usize;
                conn[next[e]] = NUM_EDGES * block + edge_index;
                next[e] += 1;
            }
        }

        self.edge_block_ptr = ptr;
        self.edge_block_conn = conn;
    }

    fn compute_owners(&mut self) {
        self.edge_block_owners = (0..self.num_edges)
            .map(|e| {
                self.edge_blocks(e as i32)
                    .map(|(block, _)| block)
                    .min()
                    .unwrap()
            })
            .collect();
        self.vert_block_owners = (0..self.num_vertices)
            .map(|v| {
                self.vertex_blocks(v as i32)
                    .map(|(block, _)| block)
                    .min()
                    .unwrap()
            })
            .collect();
    }

    /// Number of blocks.
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Number of unique geometric vertices.
    pub fn num_vertices(&self) -> usize {
        self.num_vertices
    }

    /// Number of unique geometric edges.
    pub fn num_edges(&self) -> usize {
        self.num_edges
    }

    /// The global vertex id at a corner of a block.
    pub fn block_vertex(&self, block: i32, corner: usize) -> i32 {
        self.block_verts[NUM_CORNERS * block as usize + corner]
    }

    /// The global edge id of a local edge of a block.
    pub fn block_edge(&self, block: i32, edge_index: usize) -> i32 {
        self.block_edge_conn[NUM_EDGES * block as usize + edge_index]
    }

    /// The two global vertex ids bounding a local edge of a block, in the
    /// direction of increasing edge parameter.
    pub fn edge_verts(&self, block: i32, edge_index: usize) -> (i32, i32) {
        let [c1, c2] = EDGE_CORNERS[edge_index];
        (self.block_vertex(block, c1), self.block_vertex(block, c2))
    }

    /// The blocks incident to a vertex, as `(block, corner_index)` pairs.
    pub fn vertex_blocks(&self, vertex: i32) -> impl Iterator<Item = (i32, usize)> + '_ {
        let v = vertex as usize;
        self.vert_block_conn[self.vert_block_ptr[v]..self.vert_block_ptr[v + 1]]
            .iter()
            .map(|&entry| ((entry / NUM_CORNERS) as i32, entry % NUM_CORNERS))
    }

    /// The blocks incident to an edge, as `(block, edge_index)` pairs.
    pub fn edge_blocks(&self, edge: i32) -> impl Iterator<Item = (i32, usize)> + '_ {
        let e = edge as usize;
        self.edge_block_conn[self.edge_block_ptr[e]..self.edge_block_ptr[e + 1]]
            .iter()
            .map(|&entry| ((entry / NUM_EDGES) as i32, entry % NUM_EDGES))
    }

    /// The owner block (lowest incident id) of a vertex.
    pub fn vertex_owner(&self, vertex: i32) -> i32 {
        self.vert_block_owners[vertex as usize]
    }

    /// The owner block (lowest incident id) of an edge.
    pub fn edge_owner(&self, edge: i32) -> i32 {
        self.edge_block_owners[edge as usize]
    }

    /// Whether the local edge parameterizations of two incidences of the
    /// same geometric edge run in opposite directions.
    pub fn edges_reversed(
        &self,
        block: i32,
        edge_index: usize,
        adj_block: i32,
        adj_index: usize,
    ) -> bool {
        let (n1, n2) = self.edge_verts(block, edge_index);
        let (m1, m2) = self.edge_verts(adj_block, adj_index);
        debug_assert!((n1 == m1 && n2 == m2) || (n1 == m2 && n2 == m1));
        n1 == m2 && n2 == m1
    }
}

#[cfg(test)]
mod test {
    use super::Connectivity;

    // Two blocks side by side sharing one vertical edge:
    //
    //   2 --- 3 --- 5
    //   |  0  |  1  |
    //   0 --- 1 --- 4
    fn two_blocks() -> Connectivity {
        Connectivity::new(6, vec![0, 1, 2, 3, 1, 4, 3, 5])
    }

    #[test]
    fn test_single_block() {
        let conn = Connectivity::single_block();
        assert_eq!(conn.num_blocks(), 1);
        assert_eq!(conn.num_edges(), 4);
        for v in 0..4 {
            assert_eq!(conn.vertex_owner(v), 0);
            assert_eq!(conn.vertex_blocks(v).count(), 1);
        }
    }

    #[test]
    fn test_two_blocks_share_one_edge() {
        let conn = two_blocks();
        assert_eq!(conn.num_blocks(), 2);
        // 4 + 4 local edges, one of which is shared.
        assert_eq!(conn.num_edges(), 7);

        // The shared edge is edge index 1 of block 0 and index 0 of
        // block 1, and both map to the same global id.
        let shared = conn.block_edge(0, 1);
        assert_eq!(shared, conn.block_edge(1, 0));
        assert_eq!(conn.edge_owner(shared), 0);

        let incident: Vec<_> = conn.edge_blocks(shared).collect();
        assert_eq!(incident.len(), 2);
        assert!(incident.contains(&(0, 1)));
        assert!(incident.contains(&(1, 0)));

        // Both parameterizations run bottom-up: not reversed.
        assert!(!conn.edges_reversed(0, 1, 1, 0));
    }

    #[test]
    fn test_shared_vertex_inverse_map() {
        let conn = two_blocks();
        // Vertex 1 is corner 1 of block 0 and corner 0 of block 1.
        let incident: Vec<_> = conn.vertex_blocks(1).collect();
        assert_eq!(incident.len(), 2);
        assert!(incident.contains(&(0, 1)));
        assert!(incident.contains(&(1, 0)));
        assert_eq!(conn.vertex_owner(1), 0);
        assert_eq!(conn.vertex_owner(4), 1);
    }

    #[test]
    fn test_reversed_orientation() {
        // Second block flipped: its local edge 0 runs against block 0's
        // edge 1.
        //
        //   2 --- 3 --- 4
        //   |  0  |  1  |
        //   0 --- 1 --- 5
        let conn = Connectivity::new(6, vec![0, 1, 2, 3, 3, 4, 1, 5]);
        let shared = conn.block_edge(0, 1);
        assert_eq!(shared, conn.block_edge(1, 0));
        assert!(conn.edges_reversed(0, 1, 1, 0));
    }

    #[test]
    fn test_full_connectivity_input() {
        // Same two-block mesh with edges numbered by the caller.
        let block_edge_conn = vec![0, 1, 2, 3, 1, 4, 5, 6];
        let conn =
            Connectivity::with_edges(6, 7, vec![0, 1, 2, 3, 1, 4, 3, 5], block_edge_conn);
        assert_eq!(conn.num_edges(), 7);
        assert_eq!(conn.block_edge(0, 1), conn.block_edge(1, 0));
        assert_eq!(conn.edge_blocks(1).count(), 2);
    }
}
