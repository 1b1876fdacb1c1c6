//! Testing the distributed cell lifecycle of the forest.
use std::sync::Arc;

use mpi::traits::CommunicatorCollectives;
use quadforest::cell::Cell;
use quadforest::connectivity::Connectivity;
use quadforest::constants::{MAX_COORD, MAX_LEVEL};
use quadforest::forest::Forest;
use quadforest::transport::{gather_to_all, global_size, seeded_rng};

// Two blocks side by side sharing one vertical edge:
//
//   2 --- 3 --- 5
//   |  0  |  1  |
//   0 --- 1 --- 4
fn two_block_connectivity() -> Arc<Connectivity> {
    Arc::new(Connectivity::new(6, vec![0, 1, 2, 3, 1, 4, 3, 5]))
}

fn gather_cells<C: CommunicatorCollectives>(forest: &Forest<C>, comm: &C) -> Vec<Cell> {
    gather_to_all(forest.cells().as_slice(), comm)
}

// Brute-force check that same-block cells sharing an edge segment differ
// by at most one level.
fn check_face_balance(all: &[Cell]) {
    for a in all {
        let ha = a.side_length();
        for b in all {
            if a.block != b.block {
                continue;
            }
            let hb = b.side_length();
            let x_overlap = a.x < b.x + hb && b.x < a.x + ha;
            let y_overlap = a.y < b.y + hb && b.y < a.y + ha;
            let x_touch = a.x + ha == b.x || b.x + hb == a.x;
            let y_touch = a.y + ha == b.y || b.y + hb == a.y;
            if (x_touch && y_overlap) || (y_touch && x_overlap) {
                assert!(
                    (a.level - b.level).abs() <= 1,
                    "face balance violated between {} and {}",
                    a,
                    b
                );
            }
        }
    }
}

// Check the 2:1 invariant across the shared edge of the two-block mesh.
// Both parameterizations run bottom-up, so y ranges compare directly.
fn check_shared_edge_balance(all: &[Cell]) {
    for a in all
        .iter()
        .filter(|c| c.block == 0 && c.x + c.side_length() == MAX_COORD)
    {
        for b in all.iter().filter(|c| c.block == 1 && c.x == 0) {
            let (a0, a1) = (a.y, a.y + a.side_length());
            let (b0, b1) = (b.y, b.y + b.side_length());
            if a0 < b1 && b0 < a1 {
                assert!(
                    (a.level - b.level).abs() <= 1,
                    "shared edge balance violated between {} and {}",
                    a,
                    b
                );
            }
        }
    }
}

pub fn test_uniform_create<C: CommunicatorCollectives>(comm: &C) {
    let mut forest = Forest::new(comm);
    forest.set_connectivity(Arc::new(Connectivity::single_block()));
    forest.create_trees(2).unwrap();

    let h = 1 << (MAX_LEVEL - 2);
    assert_eq!(global_size(forest.cells().as_slice(), comm), 16);
    for cell in forest.cells().iter() {
        assert_eq!(cell.level, 2);
        assert_eq!(cell.x % h, 0);
        assert_eq!(cell.y % h, 0);
    }

    // The rank partitions are disjoint, complete and globally sorted.
    let all = gather_cells(&forest, comm);
    assert_eq!(all.len(), 16);
    assert!(all.windows(2).all(|w| w[0] < w[1]));

    if comm.rank() == 0 {
        println!("uniform create: ok");
    }
}

pub fn test_balance_across_blocks<C: CommunicatorCollectives>(comm: &C) {
    let mut forest = Forest::new(comm);
    forest.set_connectivity(two_block_connectivity());
    forest.create_trees(1).unwrap();

    // Refine the block-1 cells along the shared edge to level 3, leaving
    // block 0 at level 1.
    let deltas: Vec<i32> = forest
        .cells()
        .iter()
        .map(|c| if c.block == 1 && c.x == 0 { 2 } else { 0 })
        .collect();
    forest.refine(Some(&deltas), 0, MAX_LEVEL).unwrap();
    forest.balance(false).unwrap();

    let all = gather_cells(&forest, comm);
    assert!(all.windows(2).all(|w| w[0] < w[1]));
    check_face_balance(&all);
    check_shared_edge_balance(&all);

    // Balancing a balanced forest is a fixed point.
    forest.balance(false).unwrap();
    let again = gather_cells(&forest, comm);
    assert_eq!(all, again);

    if comm.rank() == 0 {
        println!("balance across blocks: ok ({} cells)", all.len());
    }
}

pub fn test_coarsen_and_duplicate<C: CommunicatorCollectives>(comm: &C) {
    let mut forest = Forest::new(comm);
    forest.set_connectivity(Arc::new(Connectivity::single_block()));
    forest.create_trees(2).unwrap();

    // Coarsening a uniform level-2 forest yields the uniform level-1
    // forest with a quarter of the cells.
    let coarse = forest.coarsen().unwrap();
    assert_eq!(global_size(coarse.cells().as_slice(), comm), 4);
    for cell in coarse.cells().iter() {
        assert_eq!(cell.level, 1);
    }

    // A duplicate is cell-for-cell identical but evolves independently.
    let mut copy = forest.duplicate();
    assert_eq!(copy.cells().as_slice(), forest.cells().as_slice());
    copy.refine(None, 0, MAX_LEVEL).unwrap();
    assert_eq!(global_size(forest.cells().as_slice(), comm), 16);
    assert_eq!(global_size(copy.cells().as_slice(), comm), 64);

    if comm.rank() == 0 {
        println!("coarsen/duplicate: ok");
    }
}

pub fn test_repartition<C: CommunicatorCollectives>(comm: &C) {
    let mut rng = seeded_rng(comm.rank() as usize);

    let mut forest = Forest::new(comm);
    forest.set_connectivity(two_block_connectivity());
    forest.create_random_trees(20, 2, 5, &mut rng).unwrap();
    forest.balance(true).unwrap();

    let total = global_size(forest.cells().as_slice(), comm);
    forest.repartition().unwrap();
    assert_eq!(global_size(forest.cells().as_slice(), comm), total);

    // The cell counts are now even and the global order is preserved.
    let sizes = gather_to_all(&[forest.cells().len() as i64], comm);
    let max = sizes.iter().max().unwrap();
    let min = sizes.iter().min().unwrap();
    assert!(max - min <= 1);

    let all = gather_cells(&forest, comm);
    assert!(all.windows(2).all(|w| w[0] < w[1]));

    if comm.rank() == 0 {
        println!("repartition: ok ({} cells)", total);
    }
}

pub fn main() {
    let universe = mpi::initialize().unwrap();
    let comm = universe.world();

    test_uniform_create(&comm);
    test_balance_across_blocks(&comm);
    test_coarsen_and_duplicate(&comm);
    test_repartition(&comm);
}
