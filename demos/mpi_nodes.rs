//! Testing node numbering, hanging-node constraints and interpolation.
use std::sync::Arc;

use mpi::traits::CommunicatorCollectives;
use quadforest::connectivity::Connectivity;
use quadforest::constants::MAX_LEVEL;
use quadforest::error::ForestError;
use quadforest::forest::Forest;
use quadforest::geometry::BilinearGeometry;
use quadforest::interp::{CsrInterpolation, InterpolationType};
use quadforest::transport::{gather_to_all, global_size};

// Two unit blocks side by side spanning [0, 2] x [0, 1].
fn two_block_mesh() -> (Arc<Connectivity>, BilinearGeometry) {
    let conn = Arc::new(Connectivity::new(6, vec![0, 1, 2, 3, 1, 4, 3, 5]));
    let points = vec![
        [0.0, 0.0, 0.0],
        [1.0, 0.0, 0.0],
        [0.0, 1.0, 0.0],
        [1.0, 1.0, 0.0],
        [2.0, 0.0, 0.0],
        [2.0, 1.0, 0.0],
    ];
    let geometry = BilinearGeometry::new(conn.clone(), points);
    (conn, geometry)
}

// A forest with a hanging interface: block 1 is refined along the shared
// edge, block 0 is not.
fn build_hanging_forest<'f, C: CommunicatorCollectives>(
    comm: &'f C,
    conn: &Arc<Connectivity>,
) -> Forest<'f, C> {
    let mut forest = Forest::new(comm);
    forest.set_connectivity(conn.clone());
    forest.create_trees(1).unwrap();

    let deltas: Vec<i32> = forest
        .cells()
        .iter()
        .map(|c| if c.block == 1 && c.x == 0 { 1 } else { 0 })
        .collect();
    forest.refine(Some(&deltas), 0, MAX_LEVEL).unwrap();
    forest.balance(false).unwrap();
    forest
}

pub fn test_node_numbering<C: CommunicatorCollectives>(comm: &C) {
    let (conn, geometry) = two_block_mesh();
    let mut forest = build_hanging_forest(comm, &conn);

    assert!(matches!(
        forest.create_nodes(4, InterpolationType::GaussLobatto, &geometry),
        Err(ForestError::UnsupportedOrder(4))
    ));

    forest
        .create_nodes(2, InterpolationType::GaussLobatto, &geometry)
        .unwrap();

    // The owned-node ranges tile the global numbering without gaps.
    let range = forest.node_range().unwrap().to_vec();
    let total = *range.last().unwrap();
    assert_eq!(range[0], 0);
    assert!(range.windows(2).all(|w| w[0] <= w[1]));

    // Every element connectivity entry is a valid global number or a
    // dependent-node sentinel.
    let num_dep = forest.num_dep_nodes().unwrap() as i64;
    for &tag in forest.node_conn().unwrap() {
        assert!(tag < total);
        assert!(tag >= -num_dep);
    }

    // This rank references each of its own numbers exactly once.
    let rank = comm.rank() as usize;
    let mut owned: Vec<i64> = forest
        .node_tags()
        .unwrap()
        .iter()
        .copied()
        .filter(|&tag| tag >= range[rank] && tag < range[rank + 1])
        .collect();
    owned.sort_unstable();
    let expected: Vec<i64> = (range[rank]..range[rank + 1]).collect();
    assert_eq!(owned, expected);

    // Physical locations stay inside the mesh extent.
    for p in forest.node_points().unwrap() {
        assert!((0.0..=2.0).contains(&p[0]));
        assert!((0.0..=1.0).contains(&p[1]));
        assert_eq!(p[2], 0.0);
    }

    if comm.rank() == 0 {
        println!("node numbering: ok ({} nodes)", total);
    }
}

pub fn test_dependent_nodes<C: CommunicatorCollectives>(comm: &C) {
    let (conn, geometry) = two_block_mesh();

    for order in [2usize, 3] {
        let mut forest = build_hanging_forest(comm, &conn);
        forest
            .create_nodes(order, InterpolationType::GaussLobatto, &geometry)
            .unwrap();
        forest.create_dep_node_conn().unwrap();

        // The hanging interface produces dependent nodes somewhere.
        let num_dep = forest.num_dep_nodes().unwrap();
        let dep_counts = gather_to_all(&[num_dep as i64], comm);
        assert!(dep_counts.iter().sum::<i64>() > 0);

        // Every constraint row references independent masters and its
        // weights form a partition of unity.
        let dep = forest.dep_node_conn().unwrap();
        for row in 0..num_dep {
            let (start, end) = (dep.ptr()[row], dep.ptr()[row + 1]);
            assert!(end > start);
            for &master in &dep.conn()[start..end] {
                assert!(master >= 0);
            }
            let sum: f64 = dep.weights()[start..end].iter().sum();
            assert!((sum - 1.0).abs() < 1e-10, "row sums to {}", sum);
        }

        if comm.rank() == 0 {
            println!("dependent nodes (order {}): ok", order);
        }
    }
}

pub fn test_interpolation<C: CommunicatorCollectives>(comm: &C) {
    let (conn, geometry) = two_block_mesh();

    let mut fine = Forest::new(comm);
    fine.set_connectivity(conn);
    fine.create_trees(2).unwrap();
    fine.balance(false).unwrap();
    fine.create_nodes(2, InterpolationType::GaussLobatto, &geometry)
        .unwrap();

    let mut coarse = fine.coarsen().unwrap();
    coarse
        .create_nodes(2, InterpolationType::GaussLobatto, &geometry)
        .unwrap();

    let mut op = CsrInterpolation::new();
    fine.create_interpolation(&mut coarse, &mut op).unwrap();

    // Every owned fine node receives a row, and each row's weights sum
    // to one.
    let total_fine = *fine.node_range().unwrap().last().unwrap() as usize;
    assert_eq!(global_size(op.rows(), comm), total_fine);

    for row in 0..op.rows().len() {
        let (start, end) = (op.ptr()[row], op.ptr()[row + 1]);
        assert!(end > start);
        let sum: f64 = op.weights()[start..end].iter().sum();
        assert!((sum - 1.0).abs() < 1e-10, "row sums to {}", sum);
    }

    if comm.rank() == 0 {
        println!("interpolation: ok ({} rows globally)", total_fine);
    }
}

pub fn main() {
    let universe = mpi::initialize().unwrap();
    let comm = universe.world();

    test_node_numbering(&comm);
    test_dependent_nodes(&comm);
    test_interpolation(&comm);
}
