//! Balance a random forest and write each rank's leaves to a VTK file.
use std::path::PathBuf;
use std::sync::Arc;

use mpi::traits::Communicator;
use quadforest::connectivity::Connectivity;
use quadforest::forest::Forest;
use quadforest::geometry::BilinearGeometry;
use quadforest::transport::seeded_rng;
use quadforest::vtk::write_forest;

pub fn main() {
    let universe = mpi::initialize().unwrap();
    let comm = universe.world();
    let rank = comm.rank();

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

    let mut rng = seeded_rng(rank as usize);
    let mut forest = Forest::new(&comm);
    forest.set_connectivity(conn);
    forest.create_random_trees(10, 1, 4, &mut rng).unwrap();
    forest.balance(true).unwrap();

    let path = PathBuf::from(format!("forest_{}.vtk", rank));
    write_forest(&path, &forest, &geometry).unwrap();
    println!(
        "rank {} wrote {} cells to {}",
        rank,
        forest.cells().len(),
        path.display()
    );
}
