//! The geometry evaluator boundary.

use std::sync::Arc;

use crate::connectivity::Connectivity;
use crate::constants::MAX_COORD;

/// Map an integer coordinate to its parametric location in `[0, 1]`.
///
/// Node coordinates on a far block boundary are stored truncated by one to
/// keep them inside the block's coordinate range; this mapping restores
/// the exact endpoint.
pub fn coordinate(x: i32) -> f64 {
    if x == 0 {
        0.0
    } else if x == MAX_COORD - 1 {
        1.0
    } else {
        x as f64 / MAX_COORD as f64
    }
}

/// Evaluates physical point locations for parametric block coordinates.
///
/// The forest treats the evaluator as a pure function and calls it exactly
/// once per node while creating nodes. Implementations wrapping a real
/// geometry kernel live outside this crate.
pub trait BlockGeometry {
    /// Evaluate the physical location of parametric `(u, v)` in `[0, 1]^2`
    /// within the given block.
    fn eval_point(&self, block: i32, u: f64, v: f64) -> [f64; 3];
}

/// A geometry interpolating each block bilinearly from the physical
/// locations of its four corner vertices.
pub struct BilinearGeometry {
    conn: Arc<Connectivity>,
    vertex_points: Vec<[f64; 3]>,
}

impl BilinearGeometry {
    /// Create the geometry from one physical point per global vertex.
    pub fn new(conn: Arc<Connectivity>, vertex_points: Vec<[f64; 3]>) -> Self {
        assert_eq!(vertex_points.len(), conn.num_vertices());
        Self {
            conn,
            vertex_points,
        }
    }
}

impl BlockGeometry for BilinearGeometry {
    fn eval_point(&self, block: i32, u: f64, v: f64) -> [f64; 3] {
        let p = |corner: usize| {
            let vertex = self.conn.block_vertex(block, corner);
            self.vertex_points[vertex as usize]
        };
        let (p0, p1, p2, p3) = (p(0), p(1), p(2), p(3));

        let mut point = [0.0; 3];
        for (i, out) in point.iter_mut().enumerate() {
            *out = (1.0 - u) * (1.0 - v) * p0[i]
                + u * (1.0 - v) * p1[i]
                + (1.0 - u) * v * p2[i]
                + u * v * p3[i];
        }
        point
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::{coordinate, BilinearGeometry, BlockGeometry};
    use crate::connectivity::Connectivity;
    use crate::constants::MAX_COORD;

    #[test]
    fn test_coordinate_endpoints() {
        assert_eq!(coordinate(0), 0.0);
        assert_eq!(coordinate(MAX_COORD - 1), 1.0);
        assert_eq!(coordinate(MAX_COORD / 2), 0.5);
        assert_eq!(coordinate(MAX_COORD / 4), 0.25);
    }

    #[test]
    fn test_bilinear_corners_and_center() {
        let conn = Arc::new(Connectivity::single_block());
        let points = vec![
            [0.0, 0.0, 0.0],
            [2.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [2.0, 1.0, 1.0],
        ];
        let geom = BilinearGeometry::new(conn, points.clone());

        assert_eq!(geom.eval_point(0, 0.0, 0.0), points[0]);
        assert_eq!(geom.eval_point(0, 1.0, 0.0), points[1]);
        assert_eq!(geom.eval_point(0, 0.0, 1.0), points[2]);
        assert_eq!(geom.eval_point(0, 1.0, 1.0), points[3]);

        let center = geom.eval_point(0, 0.5, 0.5);
        assert!((center[0] - 1.0).abs() < 1e-15);
        assert!((center[1] - 0.5).abs() < 1e-15);
        assert!((center[2] - 0.25).abs() < 1e-15);
    }
}
