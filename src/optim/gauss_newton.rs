use nalgebra::{ArrayStorage, Cholesky, Const, SMatrix, SVector};
use num::Zero;

/// Accumulator for the Gauss-Newton normal equations of a `DIM`-parameter
/// problem. Residual rows are fed one scalar at a time with their jacobian
/// row; `solve` factors the accumulated system.
pub struct GaussNewton<const DIM: usize> {
    hessian: SMatrix<f64, DIM, DIM>,
    gradient: SVector<f64, DIM>,
    squared_residual_sum: f64,
    count: usize,
}

impl<const DIM: usize> Default for GaussNewton<DIM> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const DIM: usize> GaussNewton<DIM> {
    pub fn new() -> Self {
        Self {
            hessian: SMatrix::zeros(),
            gradient: SVector::zeros(),
            squared_residual_sum: 0.0,
            count: 0,
        }
    }

    pub fn reset(&mut self) {
        self.hessian.set_zero();
        self.gradient.set_zero();
        self.squared_residual_sum = 0.0;
        self.count = 0;
    }

    pub fn step(&mut self, residual: f64, jacobian: &[f64]) {
        self.step_weighted(1.0, residual, jacobian);
    }

    /// Accumulates one scalar residual row with weight `weight`, as used by
    /// iteratively re-weighted least squares.
    pub fn step_weighted(&mut self, weight: f64, residual: f64, jacobian: &[f64]) {
        self.squared_residual_sum += weight * residual * residual;

        let jt_r = SMatrix::from_row_slice(jacobian) * (weight * residual);

        let mut jt_j = [[0.0; DIM]; DIM];
        for i in 0..DIM {
            for j in 0..DIM {
                jt_j[i][j] = weight * jacobian[i] * jacobian[j];
            }
        }

        self.hessian += SMatrix::from_data(ArrayStorage(jt_j));
        self.gradient += jt_r;
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Solves `H x = g` for the accumulated system. The minimizing update of
    /// the residuals is `-x`. Returns `None` when nothing was accumulated or
    /// the hessian is not positive definite.
    pub fn solve(&self) -> Option<SVector<f64, DIM>> {
        if self.count == 0 {
            return None;
        }
        let update = Cholesky::<f64, Const<DIM>>::new(self.hessian)?.solve(&self.gradient);
        Some(update)
    }

    pub fn mean_squared_residual(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.squared_residual_sum / self.count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nshare::ToNalgebra;

    #[test]
    fn test_accumulation() {
        use ndarray::array;

        let mut gn = GaussNewton::<6>::new();
        for residual in [1.0, 2.0, 3.0] {
            gn.step(residual, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        }

        let expected_hessian = array![
            [3.0, 6.0, 9.0, 12.0, 15.0, 18.0],
            [6.0, 12.0, 18.0, 24.0, 30.0, 36.0],
            [9.0, 18.0, 27.0, 36.0, 45.0, 54.0],
            [12.0, 24.0, 36.0, 48.0, 60.0, 72.0],
            [15.0, 30.0, 45.0, 60.0, 75.0, 90.0],
            [18.0, 36.0, 54.0, 72.0, 90.0, 108.0],
        ]
        .into_nalgebra();
        assert_eq!(gn.hessian, expected_hessian);

        let expected_gradient = array![6.0, 12.0, 18.0, 24.0, 30.0, 36.0].into_nalgebra();
        assert_eq!(gn.gradient, expected_gradient);
        assert_relative_eq!(gn.mean_squared_residual(), 14.0 / 3.0);
    }

    #[test]
    fn test_solve_simple_least_squares() {
        // One parameter, two rows: r1 = 1 with J = 1, r2 = 3 with J = 1.
        // H = 2, g = 4 => x = 2, and applying -x zeroes the mean residual.
        let mut gn = GaussNewton::<1>::new();
        gn.step(1.0, &[1.0]);
        gn.step(3.0, &[1.0]);
        let x = gn.solve().unwrap();
        assert_relative_eq!(x[0], 2.0);
    }

    #[test]
    fn test_weighting_shifts_the_solution() {
        let mut gn = GaussNewton::<1>::new();
        gn.step_weighted(1.0, 1.0, &[1.0]);
        gn.step_weighted(0.0, 3.0, &[1.0]);
        let x = gn.solve().unwrap();
        assert_relative_eq!(x[0], 1.0);
    }

    #[test]
    fn test_empty_system_has_no_solution() {
        let gn = GaussNewton::<3>::new();
        assert!(gn.solve().is_none());
    }

    #[test]
    fn test_singular_hessian_has_no_solution() {
        // Both rows constrain the same direction; the second parameter is
        // unobserved and the hessian is rank deficient.
        let mut gn = GaussNewton::<2>::new();
        gn.step(1.0, &[1.0, 0.0]);
        gn.step(2.0, &[2.0, 0.0]);
        assert!(gn.solve().is_none());
    }
}
