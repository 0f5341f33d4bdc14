//! Separable least-squares core: one variable-projection step.
//!
//! For fixed nonlinear parameters the model is linear in the per-pixel
//! coefficients, so they are eliminated exactly: weight the design matrix,
//! factor it once (rank-revealing, shared by every pixel in the region),
//! back-solve each pixel's coefficients, and hand the outer optimizer the
//! reduced residual together with the Golub-Pereyra projected Jacobian
//!
//! ```text
//! dr/da_k = -[ P (dA/da_k) c  +  (A^+)^T (dA/da_k)^T r ]
//! ```
//!
//! where `P` projects onto the orthogonal complement of the column space.
//! The second term is what makes the gradient exact rather than
//! "coefficients held fixed"; dropping it stalls convergence near the
//! optimum. The incidence matrix keeps both terms sparse: only columns a
//! parameter actually touches are assembled.
//!
//! The constraint penalty enters as one extra residual row with `kap`
//! derivatives as its Jacobian row.

use nalgebra::{DMatrix, DVector};

use crate::data::RegionData;
use crate::domain::{PixelIndex, WeightingMode};
use crate::error::FitError;
use crate::math::lm::LmEval;
use crate::math::solve::LsqSolver;
use crate::model::DecayModel;

/// Per-worker projection engine with private scratch buffers.
pub struct VariableProjector {
    model: DecayModel,
    weighting: WeightingMode,

    a: Vec<f64>,
    b: Vec<f64>,
    kap: Vec<f64>,
    sqrt_w: Vec<f64>,
}

/// Result of one projection step.
pub struct Projection {
    /// Reduced residual and projected Jacobian for the outer optimizer.
    pub eval: LmEval,
    /// Eliminated linear coefficients, one vector per pixel.
    pub coefficients: Vec<DVector<f64>>,
    /// Weighted residual norm squared, excluding the penalty row.
    pub residual_norm_squared: f64,
}

impl VariableProjector {
    pub fn new(model: DecayModel, weighting: WeightingMode) -> Self {
        let n = model.n_meas();
        let n_lin = model.n_linear();
        let n_dcol = model.inc().n_derivative_columns();
        let n_nl = model.n_nonlinear();
        Self {
            model,
            weighting,
            a: vec![0.0; n * n_lin],
            b: vec![0.0; n * n_dcol],
            kap: vec![0.0; 1 + n_nl],
            sqrt_w: vec![1.0; n],
        }
    }

    pub fn model(&self) -> &DecayModel {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut DecayModel {
        &mut self.model
    }

    /// Derive per-sample weights from the region's data.
    ///
    /// Poisson weighting uses the region-averaged decay as the variance
    /// estimate, floored at one count so empty bins do not dominate. The
    /// same weights apply to every pixel of the region, which keeps the
    /// factorization shared.
    pub fn weight_model(&mut self, region: &RegionData) {
        let n = self.model.n_meas();
        match self.weighting {
            WeightingMode::Uniform => self.sqrt_w.iter_mut().for_each(|w| *w = 1.0),
            WeightingMode::Poisson => {
                let mean = region.mean_decay(n);
                for (w, m) in self.sqrt_w.iter_mut().zip(mean.iter()) {
                    *w = 1.0 / m.max(1.0).sqrt();
                }
            }
        }
    }

    /// Representative IRF position for the region. Regions are built so
    /// that all their pixels share an effective instrument response.
    fn irf_position(region: &RegionData) -> PixelIndex {
        region.pixels.first().copied().unwrap_or_default()
    }

    /// One variable-projection step at `alf`.
    ///
    /// Returns `None` when the model cannot be evaluated or the linear
    /// solve produces no finite coefficients; the outer loop treats that
    /// as a rejected step.
    pub fn project(
        &mut self,
        alf: &[f64],
        region: &RegionData,
        want_jacobian: bool,
    ) -> Option<Projection> {
        let n = self.model.n_meas();
        let n_lin = self.model.n_linear();
        let n_nl = self.model.n_nonlinear();

        self.model
            .calculate_model(
                &mut self.a,
                n,
                &mut self.b,
                n,
                &mut self.kap,
                alf,
                Self::irf_position(region),
                want_jacobian,
            )
            .ok()?;

        // Weighted design matrix, shared across the region's pixels.
        let mut aw = DMatrix::zeros(n, n_lin);
        for j in 0..n_lin {
            for t in 0..n {
                aw[(t, j)] = self.sqrt_w[t] * self.a[j * n + t];
            }
        }
        if aw.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let solver = LsqSolver::new(aw.clone())?;

        let n_px = region.n_px;
        let n_rows = n_px * n + 1;
        let mut residual = DVector::zeros(n_rows);
        let mut coefficients = Vec::with_capacity(n_px);
        let mut residuals_px = Vec::with_capacity(n_px);

        let mut residual_norm_squared = 0.0;
        for px in 0..n_px {
            let y = region.decay(px, n);
            let yw = DVector::from_iterator(n, y.iter().zip(&self.sqrt_w).map(|(v, w)| v * w));
            let c = solver.solve(&yw)?;
            let r = &yw - &aw * &c;
            residual_norm_squared += r.norm_squared();
            residual.rows_mut(px * n, n).copy_from(&r);
            coefficients.push(c);
            residuals_px.push(r);
        }
        residual[n_rows - 1] = self.kap[0];

        let jacobian = if want_jacobian {
            let n_dcol = self.model.inc().n_derivative_columns();
            let mut bw = DMatrix::zeros(n, n_dcol);
            for d in 0..n_dcol {
                for t in 0..n {
                    bw[(t, d)] = self.sqrt_w[t] * self.b[d * n + t];
                }
            }

            let mut jac = DMatrix::zeros(n_rows, n_nl);
            for px in 0..n_px {
                let c = &coefficients[px];
                let r = &residuals_px[px];
                for k in 0..n_nl {
                    // dA/da_k applied to c, and its transpose applied to r,
                    // using only the incident columns.
                    let mut v = DVector::zeros(n);
                    let mut t_vec = DVector::zeros(n_lin);
                    for (d, kk, j) in self.model.inc().columns() {
                        if kk != k {
                            continue;
                        }
                        let col = bw.column(d);
                        v.axpy(c[j], &col, 1.0);
                        t_vec[j] += col.dot(r);
                    }
                    let term1 = solver.project_out_columns(&v);
                    let term2 = solver.pinv_transpose_mul(&t_vec);
                    let mut block = jac.view_mut((px * n, k), (n, 1));
                    for t in 0..n {
                        block[(t, 0)] = -(term1[t] + term2[t]);
                    }
                }
            }
            for k in 0..n_nl {
                jac[(n_rows - 1, k)] = self.kap[1 + k];
            }
            jac
        } else {
            DMatrix::zeros(0, 0)
        };

        Some(Projection {
            eval: LmEval { residual, jacobian },
            coefficients,
            residual_norm_squared,
        })
    }

    /// Nonlinear parameter count, for sizing the outer optimizer.
    pub fn n_nonlinear(&self) -> usize {
        self.model.n_nonlinear()
    }

    pub fn validate_region(&self, region: &RegionData) -> Result<(), FitError> {
        if region.n_px == 0 {
            return Err(FitError::data("Region holds no pixels."));
        }
        if region.decays.len() != region.n_px * self.model.n_meas() {
            return Err(FitError::data(format!(
                "Region decay buffer holds {} samples for {} pixels.",
                region.decays.len(),
                region.n_px
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::domain::Acquisition;
    use crate::irf::Irf;
    use crate::model::MultiExponentialGroup;

    fn delta_irf(n_t: usize) -> Arc<Irf> {
        let mut samples = vec![0.0; n_t];
        samples[0] = 1.0;
        Arc::new(Irf::from_histogram(n_t, 1, 0.0, 0.04, &samples).unwrap())
    }

    fn projector(n_exp: usize) -> VariableProjector {
        let acq = Arc::new(Acquisition::new(64, 0.0, 0.04, 1).unwrap());
        let mut model = DecayModel::new(Arc::clone(&acq), delta_irf(64)).unwrap();
        model.push_group(MultiExponentialGroup::new(n_exp, false));
        model.init().unwrap();
        VariableProjector::new(model, WeightingMode::Uniform)
    }

    fn synthetic_region(taus: &[f64], amps: &[f64]) -> RegionData {
        let acq = Acquisition::new(64, 0.0, 0.04, 1).unwrap();
        let decays: Vec<f64> = acq
            .timepoints()
            .iter()
            .map(|t| {
                taus.iter()
                    .zip(amps.iter())
                    .map(|(tau, a)| a * (-t / tau).exp())
                    .sum()
            })
            .collect();
        RegionData {
            image: Some(0),
            label: 1,
            region_index: 0,
            n_px: 1,
            decays,
            pixels: vec![PixelIndex::default()],
        }
    }

    #[test]
    fn exact_data_gives_zero_residual_and_true_coefficients() {
        let mut vp = projector(2);
        let region = synthetic_region(&[2.0, 0.5], &[70.0, 30.0]);
        vp.weight_model(&region);

        let p = vp.project(&[2.0, 0.5], &region, false).unwrap();
        assert!(p.residual_norm_squared < 1e-18);
        let c = &p.coefficients[0];
        assert!((c[0] - 70.0).abs() < 1e-8);
        assert!((c[1] - 30.0).abs() < 1e-8);
    }

    #[test]
    fn residual_is_orthogonal_to_design_columns() {
        let mut vp = projector(1);
        // Data from a different lifetime: nonzero residual.
        let region = synthetic_region(&[1.3], &[100.0]);
        vp.weight_model(&region);

        let p = vp.project(&[2.0], &region, true).unwrap();

        // Rebuild the weighted design column and check a^T r = 0.
        let acq = Acquisition::new(64, 0.0, 0.04, 1).unwrap();
        let mut dot = 0.0;
        for (t, tp) in acq.timepoints().iter().enumerate() {
            dot += (-tp / 2.0).exp() * p.eval.residual[t];
        }
        assert!(dot.abs() < 1e-9, "a^T r = {dot}");
    }

    #[test]
    fn projected_jacobian_matches_finite_difference_of_reduced_residual() {
        let mut vp = projector(2);
        let region = synthetic_region(&[1.8, 0.4], &[60.0, 40.0]);
        vp.weight_model(&region);

        let alf = [2.0, 0.5];
        let p = vp.project(&alf, &region, true).unwrap();

        let eps = 1e-6;
        for k in 0..2 {
            let mut hi_alf = alf;
            let mut lo_alf = alf;
            hi_alf[k] += eps;
            lo_alf[k] -= eps;
            let hi = vp.project(&hi_alf, &region, false).unwrap();
            let lo = vp.project(&lo_alf, &region, false).unwrap();
            for t in 0..hi.eval.residual.len() {
                let fd = (hi.eval.residual[t] - lo.eval.residual[t]) / (2.0 * eps);
                let an = p.eval.jacobian[(t, k)];
                assert!(
                    (fd - an).abs() < 1e-5 * (1.0 + an.abs()),
                    "row {t}, param {k}: analytic {an} vs fd {fd}"
                );
            }
        }
    }

    #[test]
    fn duplicate_lifetimes_are_tolerated() {
        let mut vp = projector(2);
        let region = synthetic_region(&[2.0], &[100.0]);
        vp.weight_model(&region);

        // Identical lifetimes make the two columns equal; the
        // rank-revealing solve must still return finite coefficients.
        let p = vp.project(&[2.0, 2.0], &region, true).unwrap();
        assert!(p.coefficients[0].iter().all(|v| v.is_finite()));
        assert!(p.eval.jacobian.iter().all(|v| v.is_finite()));
        assert!(p.residual_norm_squared < 1e-16);
    }

    #[test]
    fn multi_pixel_region_shares_the_factorization() {
        let mut vp = projector(1);
        let acq = Acquisition::new(64, 0.0, 0.04, 1).unwrap();
        let mut decays = Vec::new();
        for scale in [50.0, 200.0] {
            decays.extend(
                acq.timepoints()
                    .iter()
                    .map(|t| scale * (-t / 2.0).exp()),
            );
        }
        let region = RegionData {
            image: Some(0),
            label: 1,
            region_index: 0,
            n_px: 2,
            decays,
            pixels: vec![PixelIndex::new(0, 0), PixelIndex::new(0, 1)],
        };
        vp.weight_model(&region);

        let p = vp.project(&[2.0], &region, false).unwrap();
        assert_eq!(p.coefficients.len(), 2);
        assert!((p.coefficients[0][0] - 50.0).abs() < 1e-8);
        assert!((p.coefficients[1][0] - 200.0).abs() < 1e-8);
    }
}
