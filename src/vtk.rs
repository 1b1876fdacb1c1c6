//! VTK output of the forest leaves.
//!
//! This module is a consumer of the forest's read-only getters; the core
//! itself knows nothing about file formats.

use std::path::Path;

use mpi::traits::CommunicatorCollectives;
use vtkio::model::{
    Attribute, Attributes, ByteOrder, CellType, Cells, DataSet, IOBuffer,
    UnstructuredGridPiece, Version, VertexNumbers, Vtk,
};

use crate::constants::MAX_COORD;
use crate::forest::Forest;
use crate::geometry::BlockGeometry;

/// Write the locally owned leaf cells as an unstructured grid of quads,
/// with the block id attached as cell data.
///
/// Corner locations are evaluated through the geometry; each rank writes
/// its own partition, so pass per-rank file names in parallel runs.
pub fn write_forest<C: CommunicatorCollectives>(
    path: &Path,
    forest: &Forest<C>,
    geometry: &dyn BlockGeometry,
) -> Result<(), vtkio::Error> {
    let cells = forest.cells();

    let mut points = Vec::with_capacity(12 * cells.len());
    let mut blocks = Vec::with_capacity(cells.len());
    for cell in cells.iter() {
        let h = cell.side_length();
        // Counter-clockwise corners of the quad.
        for (ii, jj) in [(0, 0), (1, 0), (1, 1), (0, 1)] {
            let u = (cell.x + ii * h) as f64 / MAX_COORD as f64;
            let v = (cell.y + jj * h) as f64 / MAX_COORD as f64;
            points.extend(geometry.eval_point(cell.block, u, v));
        }
        blocks.push(cell.block as f64);
    }

    let connectivity: Vec<u64> = (0..4 * cells.len() as u64).collect();
    let offsets: Vec<u64> = (1..=cells.len() as u64).map(|k| 4 * k).collect();

    let vtk = Vtk {
        version: Version::new((3, 0)),
        title: String::from("quadforest leaves"),
        byte_order: ByteOrder::BigEndian,
        file_path: None,
        data: DataSet::inline(UnstructuredGridPiece {
            points: IOBuffer::F64(points),
            cells: Cells {
                cell_verts: VertexNumbers::XML {
                    connectivity,
                    offsets,
                },
                types: vec![CellType::Quad; cells.len()],
            },
            data: Attributes {
                point: Vec::new(),
                cell: vec![Attribute::scalars("block", 1).with_data(blocks)],
            },
        }),
    };

    vtk.export_ascii(path)
}
