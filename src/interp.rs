//! Interpolation knots, 1-D Lagrange bases and the operator sink.

/// The placement of the interpolation points within an element.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InterpolationType {
    /// Uniformly spaced points.
    Uniform,
    /// Gauss-Lobatto points.
    GaussLobatto,
}

/// The knot locations on `[0, 1]` for the given mesh order.
pub fn interpolation_knots(order: usize, interp_type: InterpolationType) -> Vec<f64> {
    debug_assert!(order >= 2);
    let mut knots = vec![0.0; order];
    knots[order - 1] = 1.0;
    for (i, knot) in knots.iter_mut().enumerate().take(order - 1).skip(1) {
        *knot = match interp_type {
            InterpolationType::Uniform => i as f64 / (order - 1) as f64,
            InterpolationType::GaussLobatto => {
                0.5 * (1.0 - (std::f64::consts::PI * i as f64 / (order - 1) as f64).cos())
            }
        };
    }
    knots
}

/// Evaluate the Lagrange basis through the given knots at `u`.
///
/// The bases satisfy the Kronecker-delta property at the knots; if `u`
/// coincides with a knot the corresponding weight is exactly 1 and all
/// others exactly 0.
pub fn lagrange_weights(knots: &[f64], u: f64) -> Vec<f64> {
    const KNOT_TOL: f64 = 1e-12;

    let mut weights = vec![0.0; knots.len()];

    // Exact short-circuit at coincident knots.
    for (i, &knot) in knots.iter().enumerate() {
        if (u - knot).abs() < KNOT_TOL {
            weights[i] = 1.0;
            return weights;
        }
    }

    for (i, weight) in weights.iter_mut().enumerate() {
        let mut value = 1.0;
        for (j, &knot) in knots.iter().enumerate() {
            if j != i {
                value *= (u - knot) / (knots[i] - knot);
            }
        }
        *weight = value;
    }
    weights
}

/// Merge duplicate master indices in an index/weight list, summing their
/// weights. The list is sorted by index afterwards.
pub fn merge_masters(masters: &mut Vec<(i64, f64)>) {
    masters.sort_unstable_by_key(|&(index, _)| index);
    let mut merged: Vec<(i64, f64)> = Vec::with_capacity(masters.len());
    for &(index, weight) in masters.iter() {
        match merged.last_mut() {
            Some(last) if last.0 == index => last.1 += weight,
            _ => merged.push((index, weight)),
        }
    }
    *masters = merged;
}

/// Receives the rows of a coarse-to-fine interpolation operator.
///
/// This trait is the single coupling point between the mesh core and an
/// external assembler's distributed-vector representation: the forest
/// calls [InterpolationSink::add_row] once per locally owned fine node.
pub trait InterpolationSink {
    /// Add the interpolation row for one fine node. `columns` hold global
    /// independent node numbers of the coarse mesh.
    fn add_row(&mut self, fine_node: i64, columns: &[i64], weights: &[f64]);
}

/// A sink collecting the operator in CSR form.
#[derive(Debug, Default)]
pub struct CsrInterpolation {
    rows: Vec<i64>,
    ptr: Vec<usize>,
    conn: Vec<i64>,
    weights: Vec<f64>,
}

impl CsrInterpolation {
    /// Create an empty operator.
    pub fn new() -> Self {
        Self {
            rows: Vec::new(),
            ptr: vec![0],
            conn: Vec::new(),
            weights: Vec::new(),
        }
    }

    /// The fine node number of each row.
    pub fn rows(&self) -> &[i64] {
        &self.rows
    }

    /// The row pointer array.
    pub fn ptr(&self) -> &[usize] {
        &self.ptr
    }

    /// The column (coarse node) indices.
    pub fn conn(&self) -> &[i64] {
        &self.conn
    }

    /// The interpolation weights.
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }
}

impl InterpolationSink for CsrInterpolation {
    fn add_row(&mut self, fine_node: i64, columns: &[i64], weights: &[f64]) {
        debug_assert_eq!(columns.len(), weights.len());
        self.rows.push(fine_node);
        self.conn.extend_from_slice(columns);
        self.weights.extend_from_slice(weights);
        self.ptr.push(self.conn.len());
    }
}

#[cfg(test)]
mod test {
    use super::{
        interpolation_knots, lagrange_weights, merge_masters, CsrInterpolation,
        InterpolationSink, InterpolationType,
    };

    #[test]
    fn test_knots() {
        let uniform = interpolation_knots(3, InterpolationType::Uniform);
        let lobatto = interpolation_knots(3, InterpolationType::GaussLobatto);
        // For order 3 the interior Lobatto point is the midpoint as well.
        for (a, b) in uniform.iter().zip(lobatto.iter()) {
            assert!((a - b).abs() < 1e-14);
        }
        assert_eq!(uniform, vec![0.0, 0.5, 1.0]);

        let lobatto4 = interpolation_knots(4, InterpolationType::GaussLobatto);
        assert!(lobatto4[1] < 1.0 / 3.0);
        assert!(lobatto4[2] > 2.0 / 3.0);
    }

    #[test]
    fn test_lagrange_partition_of_unity() {
        let knots = interpolation_knots(3, InterpolationType::Uniform);
        for &u in &[0.1, 0.25, 0.625, 0.9] {
            let weights = lagrange_weights(&knots, u);
            let sum: f64 = weights.iter().sum();
            assert!((sum - 1.0).abs() < 1e-12);
        }
        // Quadratic midpoint weights from the quadratic Lagrange basis.
        let weights = lagrange_weights(&knots, 0.25);
        assert!((weights[0] - 0.375).abs() < 1e-12);
        assert!((weights[1] - 0.75).abs() < 1e-12);
        assert!((weights[2] + 0.125).abs() < 1e-12);
    }

    #[test]
    fn test_lagrange_kronecker_delta() {
        let knots = interpolation_knots(3, InterpolationType::Uniform);
        for (i, &knot) in knots.iter().enumerate() {
            let weights = lagrange_weights(&knots, knot);
            for (j, &w) in weights.iter().enumerate() {
                assert_eq!(w, if i == j { 1.0 } else { 0.0 });
            }
        }
    }

    #[test]
    fn test_merge_masters() {
        let mut masters = vec![(7, 0.25), (3, 0.5), (7, 0.25), (3, -0.5), (1, 1.0)];
        merge_masters(&mut masters);
        assert_eq!(masters.len(), 3);
        assert_eq!(masters[0], (1, 1.0));
        assert_eq!(masters[1].0, 3);
        assert!(masters[1].1.abs() < 1e-15);
        assert_eq!(masters[2], (7, 0.5));
    }

    #[test]
    fn test_csr_sink() {
        let mut csr = CsrInterpolation::new();
        csr.add_row(10, &[0, 1], &[0.5, 0.5]);
        csr.add_row(11, &[2], &[1.0]);
        assert_eq!(csr.rows(), &[10, 11]);
        assert_eq!(csr.ptr(), &[0, 2, 3]);
        assert_eq!(csr.conn(), &[0, 1, 2]);
    }
}
