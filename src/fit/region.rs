//! Fitting one unit of work: a pixel or a (possibly multi-pixel) region.
//!
//! Owns the numerical engines and drives the outer Levenberg-Marquardt
//! loop over the reduced problem, then harvests coefficients, normalized
//! outputs, goodness of fit and optional confidence bounds.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::RegionData;
use crate::domain::{CancellationToken, FitAlgorithm, FitOutcome, FitSettings};
use crate::fit::mle::MaximumLikelihoodFitter;
use crate::fit::projector::VariableProjector;
use crate::math::lm::{LmOptions, levenberg_marquardt};
use crate::model::DecayModel;

/// Final state of one fitted work unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitResult {
    pub image: Option<usize>,
    pub label: u16,
    pub region_index: usize,
    /// Pixel index within the region, for pixelwise fits.
    pub pixel: Option<usize>,
    pub outcome: FitOutcome,
    pub iterations: usize,
    /// Final nonlinear parameter vector.
    pub alf: Vec<f64>,
    /// Derived nonlinear outputs (lifetimes, fractions, efficiencies).
    pub nonlinear_outputs: Vec<f64>,
    /// Raw linear coefficients, one vector per pixel.
    pub lin_params: Vec<Vec<f64>>,
    /// Normalized linear outputs (intensity, fractional contributions).
    pub norm_params: Vec<Vec<f64>>,
    pub residual_norm: f64,
    pub chi2: f64,
    /// Per-parameter `(lower, upper)` confidence bounds when enabled.
    pub conf_bounds: Option<Vec<(f64, f64)>>,
}

impl UnitResult {
    fn failed(region: &RegionData) -> Self {
        Self {
            image: region.image,
            label: region.label,
            region_index: region.region_index,
            pixel: None,
            outcome: FitOutcome::Failed,
            iterations: 0,
            alf: Vec::new(),
            nonlinear_outputs: Vec::new(),
            lin_params: Vec::new(),
            norm_params: Vec::new(),
            residual_norm: f64::NAN,
            chi2: f64::NAN,
            conf_bounds: None,
        }
    }
}

/// Per-worker fitting engine.
pub struct RegionFitter {
    projector: VariableProjector,
    mle: MaximumLikelihoodFitter,
    algorithm: FitAlgorithm,
    opts: LmOptions,
    calculate_errors: bool,
    conf_factor: f64,
}

impl RegionFitter {
    pub fn new(model: DecayModel, settings: &FitSettings, conf_factor: f64) -> Self {
        let opts = LmOptions {
            max_iterations: settings.max_iterations,
            tolerance: settings.tolerance,
            ..LmOptions::default()
        };
        Self {
            projector: VariableProjector::new(model.clone(), settings.weighting),
            mle: MaximumLikelihoodFitter::new(model),
            algorithm: settings.algorithm,
            opts,
            calculate_errors: settings.calculate_errors,
            conf_factor,
        }
    }

    /// Fit one work unit. Never panics on numerical trouble: a unit that
    /// cannot be fitted comes back with [`FitOutcome::Failed`] and the run
    /// continues.
    pub fn fit_region(&mut self, region: &RegionData, cancel: &CancellationToken) -> UnitResult {
        if self.projector.validate_region(region).is_err() {
            return UnitResult::failed(region);
        }

        // Maximum likelihood only applies to single-pixel units; joint
        // multi-pixel fits always go through least squares.
        if self.algorithm == FitAlgorithm::MaximumLikelihood && region.n_px == 1 {
            self.fit_maximum_likelihood(region, cancel)
        } else {
            self.fit_least_squares(region, cancel)
        }
    }

    fn fit_least_squares(&mut self, region: &RegionData, cancel: &CancellationToken) -> UnitResult {
        let acq = self.projector.model().acq().clone();
        let mean_arrival = region.mean_arrival_time(&acq);
        let alf0 = self.projector.model_mut().initial_parameters(mean_arrival);

        self.projector.weight_model(region);

        let projector = &mut self.projector;
        let (alf, report) = levenberg_marquardt(
            |x| {
                let alf: Vec<f64> = x.iter().copied().collect();
                projector.project(&alf, region, true).map(|p| p.eval)
            },
            DVector::from_column_slice(&alf0),
            &self.opts,
            cancel,
        );
        let alf: Vec<f64> = alf.iter().copied().collect();

        // Re-project at the solution for coefficients and, when error bars
        // are requested, the Jacobian the covariance comes from.
        let Some(final_proj) = self.projector.project(&alf, region, self.calculate_errors) else {
            return UnitResult::failed(region);
        };

        let n_meas = acq.n_meas();
        let n_lin = self.projector.model().n_linear();
        let n_nl = self.projector.model().n_nonlinear();
        let dof = (region.n_px * n_meas)
            .saturating_sub(region.n_px * n_lin + n_nl)
            .max(1);
        let rss = final_proj.residual_norm_squared;
        let chi2 = rss / (dof as f64 * acq.counts_per_photon);

        let conf_bounds = if self.calculate_errors && report.outcome == FitOutcome::Converged {
            covariance_bounds(&final_proj.eval.jacobian, rss, dof, &alf, self.conf_factor)
        } else {
            None
        };

        let model = self.projector.model();
        let lin_params: Vec<Vec<f64>> = final_proj
            .coefficients
            .iter()
            .map(|c| c.iter().copied().collect())
            .collect();
        let norm_params: Vec<Vec<f64>> = lin_params
            .iter()
            .map(|c| model.normalise_linear_params(c))
            .collect();

        debug!(
            region = region.region_index,
            outcome = ?report.outcome,
            iterations = report.iterations,
            chi2,
            "region fit finished"
        );

        UnitResult {
            image: region.image,
            label: region.label,
            region_index: region.region_index,
            pixel: None,
            outcome: report.outcome,
            iterations: report.iterations,
            nonlinear_outputs: model.get_nonlinear_outputs(),
            alf,
            lin_params,
            norm_params,
            residual_norm: rss.sqrt(),
            chi2,
            conf_bounds,
        }
    }

    fn fit_maximum_likelihood(
        &mut self,
        region: &RegionData,
        cancel: &CancellationToken,
    ) -> UnitResult {
        let acq = self.mle.model().acq().clone();
        let mean_arrival = region.mean_arrival_time(&acq);
        let alf0 = self.mle.model_mut().initial_parameters(mean_arrival);

        let Some(fit) = self.mle.fit(region, &alf0, &self.opts, cancel) else {
            return UnitResult::failed(region);
        };

        let n_meas = acq.n_meas();
        let n_lin = self.mle.model().n_linear();
        let n_nl = self.mle.model().n_nonlinear();
        let dof = n_meas.saturating_sub(n_lin + n_nl).max(1);
        let chi2 = fit.deviance / dof as f64;

        let model = self.mle.model();
        let lin: Vec<f64> = fit.coefficients.iter().copied().collect();
        let norm = model.normalise_linear_params(&lin);

        debug!(
            region = region.region_index,
            outcome = ?fit.report.outcome,
            iterations = fit.report.iterations,
            chi2,
            "maximum-likelihood fit finished"
        );

        UnitResult {
            image: region.image,
            label: region.label,
            region_index: region.region_index,
            pixel: None,
            outcome: fit.report.outcome,
            iterations: fit.report.iterations,
            nonlinear_outputs: model.get_nonlinear_outputs(),
            alf: fit.alf,
            lin_params: vec![lin],
            norm_params: vec![norm],
            residual_norm: fit.deviance.sqrt(),
            chi2,
            conf_bounds: None,
        }
    }
}

/// Confidence bounds from the local quadratic model: the covariance is
/// `s^2 (J^T J)^-1` with `s^2` the reduced residual variance.
fn covariance_bounds(
    jacobian: &nalgebra::DMatrix<f64>,
    rss: f64,
    dof: usize,
    alf: &[f64],
    conf_factor: f64,
) -> Option<Vec<(f64, f64)>> {
    let jtj = jacobian.tr_mul(jacobian);
    let inv = jtj.try_inverse()?;
    let s2 = rss / dof as f64;
    let bounds = alf
        .iter()
        .enumerate()
        .map(|(k, &v)| {
            let sigma = (inv[(k, k)].max(0.0) * s2).sqrt();
            let half = conf_factor * sigma;
            (v - half, v + half)
        })
        .collect();
    Some(bounds)
}
