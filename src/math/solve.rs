//! Rank-revealing weighted least squares.
//!
//! The variable-projection step repeatedly solves small linear problems of
//! the form:
//!
//! ```text
//! minimize ||A c - y||^2
//! ```
//!
//! where `A` is the weighted design matrix for the current nonlinear
//! parameters. Near-duplicate basis shapes (two lifetimes drifting together
//! during optimization) make `A` rank-deficient, so we factor once with SVD
//! and solve with progressively looser tolerances rather than failing.
//!
//! The retained factorization also provides the two operators the
//! Golub-Pereyra Jacobian needs: projection onto the orthogonal complement
//! of the column space, and application of the transposed pseudoinverse.

use nalgebra::{DMatrix, DVector};

/// Relative singular-value cutoff for the projection operators.
const RANK_TOLERANCE: f64 = 1e-10;

/// SVD factorization of a (weighted) design matrix, retained so the linear
/// solve and the projected-Jacobian operators share one decomposition.
pub struct LsqSolver {
    u: DMatrix<f64>,
    v_t: DMatrix<f64>,
    singular_values: DVector<f64>,
    rank: usize,
}

impl LsqSolver {
    /// Factor `a` (n x l, n >= l). Returns `None` when the decomposition
    /// fails to converge or produces non-finite values.
    pub fn new(a: DMatrix<f64>) -> Option<Self> {
        let svd = a.svd(true, true);
        let u = svd.u?;
        let v_t = svd.v_t?;
        let singular_values = svd.singular_values;
        if singular_values.iter().any(|s| !s.is_finite()) {
            return None;
        }

        let s_max = singular_values.max();
        let cutoff = s_max * RANK_TOLERANCE;
        let rank = singular_values.iter().filter(|&&s| s > cutoff).count();

        Some(Self {
            u,
            v_t,
            singular_values,
            rank,
        })
    }

    /// Effective rank at the projection tolerance.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of linear coefficients.
    pub fn n_cols(&self) -> usize {
        self.v_t.ncols()
    }

    /// Least-squares solution `c = A^+ y`.
    ///
    /// Tries progressively looser tolerances so near-singular systems still
    /// produce a finite solution; returns `None` only when every tolerance
    /// yields non-finite coefficients.
    pub fn solve(&self, y: &DVector<f64>) -> Option<DVector<f64>> {
        let s_max = self.singular_values.max();
        for &tol in &[1e-10, 1e-8, 1e-6] {
            let cutoff = s_max * tol;
            let c = self.pseudo_solve(y, cutoff);
            if c.iter().all(|v| v.is_finite()) {
                return Some(c);
            }
        }
        None
    }

    fn pseudo_solve(&self, y: &DVector<f64>, cutoff: f64) -> DVector<f64> {
        // c = V S^+ U^T y, truncating singular values at the cutoff.
        let mut ut_y = self.u.tr_mul(y);
        for (i, s) in self.singular_values.iter().enumerate() {
            ut_y[i] = if *s > cutoff { ut_y[i] / s } else { 0.0 };
        }
        self.v_t.tr_mul(&ut_y)
    }

    /// Project `v` onto the orthogonal complement of the column space:
    /// `v - U_r (U_r^T v)`.
    pub fn project_out_columns(&self, v: &DVector<f64>) -> DVector<f64> {
        let u_r = self.u.columns(0, self.rank);
        let coeffs = u_r.tr_mul(v);
        v - u_r * coeffs
    }

    /// Apply the transposed pseudoinverse: `(A^+)^T t = U_r S_r^-1 V_r^T t`.
    pub fn pinv_transpose_mul(&self, t: &DVector<f64>) -> DVector<f64> {
        let mut vt_t = &self.v_t * t;
        for i in 0..vt_t.len() {
            vt_t[i] = if i < self.rank {
                vt_t[i] / self.singular_values[i]
            } else {
                0.0
            };
        }
        self.u.columns(0, self.rank) * vt_t.rows(0, self.rank)
    }
}

/// One-shot least squares solve, for callers that do not need the
/// factorization afterwards.
pub fn solve_least_squares(a: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    LsqSolver::new(a.clone())?.solve(y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn least_squares_solves_simple_system() {
        // Fit y = 2 + 3x on x = [0,1,2]
        let a = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0]);
        let y = DVector::from_row_slice(&[2.0, 5.0, 8.0]);

        let c = solve_least_squares(&a, &y).unwrap();
        assert!((c[0] - 2.0).abs() < 1e-10);
        assert!((c[1] - 3.0).abs() < 1e-10);
    }

    #[test]
    fn rank_deficient_system_still_solves() {
        // Second column is a copy of the first.
        let a = DMatrix::from_row_slice(4, 2, &[1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 4.0, 4.0]);
        let y = DVector::from_row_slice(&[2.0, 4.0, 6.0, 8.0]);

        let solver = LsqSolver::new(a.clone()).unwrap();
        assert_eq!(solver.rank(), 1);

        let c = solver.solve(&y).unwrap();
        let fitted = &a * &c;
        for i in 0..4 {
            assert!((fitted[i] - y[i]).abs() < 1e-9);
        }
    }

    #[test]
    fn residual_is_orthogonal_to_column_space() {
        let a = DMatrix::from_row_slice(4, 2, &[1.0, 0.5, 1.0, 1.0, 1.0, 2.0, 1.0, 3.0]);
        let y = DVector::from_row_slice(&[1.0, -2.0, 0.5, 3.0]);

        let solver = LsqSolver::new(a.clone()).unwrap();
        let c = solver.solve(&y).unwrap();
        let r = &y - &a * &c;
        let at_r = a.tr_mul(&r);
        assert!(at_r.norm() < 1e-9, "A^T r = {at_r}");
    }

    #[test]
    fn projection_annihilates_column_space() {
        let a = DMatrix::from_row_slice(4, 2, &[1.0, 0.5, 1.0, 1.0, 1.0, 2.0, 1.0, 3.0]);
        let solver = LsqSolver::new(a.clone()).unwrap();

        // A column of A projects to (numerically) zero.
        let col = DVector::from_iterator(4, a.column(0).iter().copied());
        let p = solver.project_out_columns(&col);
        assert!(p.norm() < 1e-10);

        // A vector orthogonal to both columns is left alone.
        let r = {
            let y = DVector::from_row_slice(&[1.0, -2.0, 0.5, 3.0]);
            let c = solver.solve(&y).unwrap();
            &y - &a * &c
        };
        let pr = solver.project_out_columns(&r);
        assert!((pr - &r).norm() < 1e-10);
    }

    #[test]
    fn pinv_transpose_matches_explicit_pseudoinverse() {
        let a = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0]);
        let solver = LsqSolver::new(a.clone()).unwrap();

        // (A^+)^T t computed directly from the normal equations:
        // A^+ = (A^T A)^-1 A^T for full-rank A.
        let ata = a.tr_mul(&a);
        let pinv = ata.try_inverse().unwrap() * a.transpose();
        let t = DVector::from_row_slice(&[0.3, -1.2]);
        let expected = pinv.transpose() * &t;

        let got = solver.pinv_transpose_mul(&t);
        assert!((got - expected).norm() < 1e-9);
    }
}
