//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they
//! can be:
//!
//! - used in-memory during fitting
//! - handed to an external persistence or presentation layer unchanged
//!
//! Nothing here owns heavyweight numeric state; the fitting engine keeps its
//! scratch memory private to each worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::FitError;

/// Objective function driven by the outer nonlinear optimizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitAlgorithm {
    /// Weighted least squares with variable projection of the linear
    /// coefficients.
    LevenbergMarquardt,
    /// Poisson maximum likelihood, expressed as signed deviance residuals so
    /// the same trust-region driver applies. Only available for
    /// single-pixel work units; multi-pixel fits fall back to least squares.
    MaximumLikelihood,
}

/// How nonlinear parameters are shared across the spatial extent of the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CouplingMode {
    /// Every masked pixel is an independent fit. All worker threads
    /// cooperatively process one region at a time, in region order.
    Pixelwise,
    /// Each region (one region label within one image) is an independent
    /// fit; regions are handed out to threads on demand.
    Imagewise,
    /// Each region label is fitted jointly across all images; region labels
    /// are statically partitioned across threads.
    Global,
}

/// Per-sample uncertainty model used to weight residuals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightingMode {
    /// Counting statistics: variance equals the expected count. Weights are
    /// derived from the (region-averaged) measured decay.
    Poisson,
    /// Uniform unit weights.
    Uniform,
}

/// Terminal state of a single fitted work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitOutcome {
    /// Tolerances met.
    Converged,
    /// Iteration cap reached before tolerances were met.
    MaxIterations,
    /// The unit could not be fitted (degenerate model, non-finite data).
    /// The run as a whole continues.
    Failed,
    /// Cooperative cancellation was observed mid-fit.
    Terminated,
}

impl FitOutcome {
    pub fn is_converged(self) -> bool {
        matches!(self, FitOutcome::Converged)
    }
}

/// Overall state of a fitting run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Terminated,
}

/// Addresses a pixel within the image stack, for spatially- or
/// frame-varying instrument response lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PixelIndex {
    pub image: usize,
    pub pixel: usize,
}

impl PixelIndex {
    pub fn new(image: usize, pixel: usize) -> Self {
        Self { image, pixel }
    }
}

/// Acquisition geometry shared by the model, convolvers and data source.
///
/// Time bins are uniform; `t(j) = t0 + j * timebin_width`. The optional
/// repetition period enables the incomplete-decay correction for lifetimes
/// comparable to the laser period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acquisition {
    pub n_t: usize,
    pub t0: f64,
    pub timebin_width: f64,
    pub n_chan: usize,
    /// Laser repetition period (same unit as the time axis), if the decay
    /// does not fully relax between pulses.
    pub rep_period: Option<f64>,
    /// Detector counts recorded per detected photon.
    pub counts_per_photon: f64,
    /// Polarisation angle in radians for polarisation-resolved data.
    pub polarisation_angle: f64,
}

impl Acquisition {
    pub fn new(n_t: usize, t0: f64, timebin_width: f64, n_chan: usize) -> Result<Self, FitError> {
        if n_t == 0 || n_chan == 0 {
            return Err(FitError::config(
                "Acquisition needs at least one time bin and one channel.",
            ));
        }
        if !(timebin_width.is_finite() && timebin_width > 0.0) {
            return Err(FitError::config(format!(
                "Invalid time bin width: {timebin_width}."
            )));
        }
        Ok(Self {
            n_t,
            t0,
            timebin_width,
            n_chan,
            rep_period: None,
            counts_per_photon: 1.0,
            polarisation_angle: 0.0,
        })
    }

    /// Bin-centre time axis for one channel.
    pub fn timepoints(&self) -> Vec<f64> {
        (0..self.n_t)
            .map(|j| self.t0 + j as f64 * self.timebin_width)
            .collect()
    }

    /// Samples per decay curve across all channels.
    pub fn n_meas(&self) -> usize {
        self.n_t * self.n_chan
    }
}

/// Configuration surface for a fitting run.
///
/// This is plain data: the external caller (CLI, GUI, bindings) builds one
/// and hands it to the controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitSettings {
    pub algorithm: FitAlgorithm,
    pub coupling: CouplingMode,
    /// Worker thread count. Capped at run time to the number of available
    /// work units.
    pub n_thread: usize,
    /// Intra-fit thread count, used for the inner numeric loops only when
    /// the worker pool resolves to a single fitter.
    pub n_inner_thread: usize,
    pub weighting: WeightingMode,
    /// Outer-iteration cap for the trust-region driver.
    pub max_iterations: usize,
    /// Relative residual-norm change below which the fit is converged.
    pub tolerance: f64,
    /// Two-sided tail mass outside the confidence interval
    /// (0.05 for 95% intervals).
    pub confidence_interval: f64,
    /// Compute per-parameter confidence bounds after convergence.
    pub calculate_errors: bool,
    /// Return from `run_workers` immediately and let callers poll progress.
    pub run_async: bool,
}

impl Default for FitSettings {
    fn default() -> Self {
        Self {
            algorithm: FitAlgorithm::LevenbergMarquardt,
            coupling: CouplingMode::Pixelwise,
            n_thread: 4,
            n_inner_thread: 1,
            weighting: WeightingMode::Poisson,
            max_iterations: 100,
            tolerance: 1e-8,
            confidence_interval: 0.05,
            calculate_errors: false,
            run_async: false,
        }
    }
}

impl FitSettings {
    pub fn validate(&self) -> Result<(), FitError> {
        if self.n_thread == 0 {
            return Err(FitError::config("Thread count must be >= 1."));
        }
        if self.max_iterations == 0 {
            return Err(FitError::config("Iteration cap must be >= 1."));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(FitError::config(format!(
                "Invalid convergence tolerance: {}.",
                self.tolerance
            )));
        }
        if !(self.confidence_interval > 0.0 && self.confidence_interval < 1.0) {
            return Err(FitError::config(format!(
                "Confidence interval tail mass must lie in (0, 1), got {}.",
                self.confidence_interval
            )));
        }
        Ok(())
    }
}

/// Cooperative cancellation flag threaded through every long-running call.
///
/// The flag is the only cancellation primitive: the scheduler polls it in
/// every work loop and the trust-region driver polls it once per outer
/// iteration, so an in-flight fit unwinds promptly but never mid-kernel.
#[derive(Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquisition_rejects_degenerate_axis() {
        assert!(Acquisition::new(0, 0.0, 0.04, 1).is_err());
        assert!(Acquisition::new(256, 0.0, 0.0, 1).is_err());
        assert!(Acquisition::new(256, 0.0, 0.04, 0).is_err());
    }

    #[test]
    fn timepoints_are_uniform() {
        let acq = Acquisition::new(4, 1.0, 0.5, 2).unwrap();
        assert_eq!(acq.timepoints(), vec![1.0, 1.5, 2.0, 2.5]);
        assert_eq!(acq.n_meas(), 8);
    }

    #[test]
    fn settings_validation_catches_bad_values() {
        let mut s = FitSettings::default();
        assert!(s.validate().is_ok());
        s.n_thread = 0;
        assert!(s.validate().is_err());
        s = FitSettings::default();
        s.confidence_interval = 1.5;
        assert!(s.validate().is_err());
    }

    #[test]
    fn cancellation_token_is_shared() {
        let t = CancellationToken::new();
        let t2 = t.clone();
        assert!(!t2.is_cancelled());
        t.cancel();
        assert!(t2.is_cancelled());
    }
}
