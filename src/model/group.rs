//! Polymorphic decay group.
//!
//! The three group kinds share one contract; dispatch is a tagged variant
//! rather than trait objects so groups stay plainly cloneable (each worker
//! thread owns a private copy of the whole model).

use std::sync::Arc;

use crate::domain::{Acquisition, PixelIndex};
use crate::error::FitError;
use crate::irf::Irf;
use crate::model::fret::FretGroup;
use crate::model::inc::IncMatrix;
use crate::model::multi_exponential::MultiExponentialGroup;
use crate::model::pattern::PatternGroup;

/// Evaluation context handed to every group for one model evaluation.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext {
    pub irf_idx: PixelIndex,
    /// Model-level time-origin shift, added to any per-pixel IRF shift.
    pub t0_shift: f64,
    /// Reference-reconvolution lifetime; zero when the IRF is a true
    /// instrument response.
    pub ref_lifetime: f64,
}

#[derive(Debug, Clone)]
pub enum DecayGroup {
    MultiExponential(MultiExponentialGroup),
    Fret(FretGroup),
    Pattern(PatternGroup),
}

impl DecayGroup {
    pub fn attach(&mut self, irf: &Arc<Irf>, acq: &Arc<Acquisition>) -> Result<(), FitError> {
        match self {
            DecayGroup::MultiExponential(g) => g.attach(irf, acq),
            DecayGroup::Fret(g) => g.attach(irf, acq),
            DecayGroup::Pattern(g) => g.attach(irf, acq),
        }
    }

    pub fn n_linear(&self) -> usize {
        match self {
            DecayGroup::MultiExponential(g) => g.n_linear(),
            DecayGroup::Fret(g) => g.n_linear(),
            DecayGroup::Pattern(g) => g.n_linear(),
        }
    }

    pub fn n_nonlinear(&self) -> usize {
        match self {
            DecayGroup::MultiExponential(g) => g.n_nonlinear(),
            DecayGroup::Fret(g) => g.n_nonlinear(),
            DecayGroup::Pattern(g) => g.n_nonlinear(),
        }
    }

    pub fn initial_free_values(&self, out: &mut Vec<f64>) {
        match self {
            DecayGroup::MultiExponential(g) => g.initial_free_values(out),
            DecayGroup::Fret(g) => g.initial_free_values(out),
            DecayGroup::Pattern(_) => {}
        }
    }

    /// Consume this group's free parameters from `alf` and prepare the
    /// convolution caches. Returns the number of values consumed.
    pub fn set_variables(&mut self, alf: &[f64], ctx: &EvalContext) -> usize {
        match self {
            DecayGroup::MultiExponential(g) => g.set_variables(alf, ctx),
            DecayGroup::Fret(g) => g.set_variables(alf, ctx),
            DecayGroup::Pattern(g) => g.set_variables(alf, ctx),
        }
    }

    /// Accumulate this group's basis columns into `a` (column-major with
    /// leading dimension `adim`, starting at the group's first column).
    pub fn calculate_model(&self, a: &mut [f64], adim: usize, kap: &mut f64) -> usize {
        match self {
            DecayGroup::MultiExponential(g) => g.calculate_model(a, adim, kap),
            DecayGroup::Fret(g) => g.calculate_model(a, adim, kap),
            DecayGroup::Pattern(g) => g.calculate_model(a, adim, kap),
        }
    }

    /// Accumulate this group's derivative columns into `b`, in incidence
    /// order, and its constraint-penalty derivatives into `kap_derv`.
    pub fn calculate_derivatives(&self, b: &mut [f64], bdim: usize, kap_derv: &mut [f64]) -> usize {
        match self {
            DecayGroup::MultiExponential(g) => g.calculate_derivatives(b, bdim, kap_derv),
            DecayGroup::Fret(g) => g.calculate_derivatives(b, bdim, kap_derv),
            DecayGroup::Pattern(g) => g.calculate_derivatives(b, bdim, kap_derv),
        }
    }

    pub fn setup_inc_matrix(&self, inc: &mut IncMatrix, row: &mut usize, col: &mut usize) {
        match self {
            DecayGroup::MultiExponential(g) => g.setup_inc_matrix(inc, row, col),
            DecayGroup::Fret(g) => g.setup_inc_matrix(inc, row, col),
            DecayGroup::Pattern(g) => g.setup_inc_matrix(inc, row, col),
        }
    }

    pub fn nonlinear_output_names(&self, names: &mut Vec<String>) {
        match self {
            DecayGroup::MultiExponential(g) => g.nonlinear_output_names(names),
            DecayGroup::Fret(g) => g.nonlinear_output_names(names),
            DecayGroup::Pattern(g) => g.nonlinear_output_names(names),
        }
    }

    pub fn get_nonlinear_outputs(&self, out: &mut Vec<f64>) {
        match self {
            DecayGroup::MultiExponential(g) => g.get_nonlinear_outputs(out),
            DecayGroup::Fret(g) => g.get_nonlinear_outputs(out),
            DecayGroup::Pattern(g) => g.get_nonlinear_outputs(out),
        }
    }

    pub fn linear_output_names(&self, names: &mut Vec<String>) {
        match self {
            DecayGroup::MultiExponential(g) => g.linear_output_names(names),
            DecayGroup::Fret(g) => g.linear_output_names(names),
            DecayGroup::Pattern(g) => g.linear_output_names(names),
        }
    }

    /// Map this group's slice of raw linear coefficients to normalized
    /// outputs. Returns the number of raw coefficients consumed.
    pub fn normalise_linear(&self, lin: &[f64], out: &mut Vec<f64>) -> usize {
        match self {
            DecayGroup::MultiExponential(g) => g.normalise_linear(lin, out),
            DecayGroup::Fret(g) => g.normalise_linear(lin, out),
            DecayGroup::Pattern(g) => g.normalise_linear(lin, out),
        }
    }

    /// Inverse of [`Self::normalise_linear`]. Returns the number of
    /// normalized values consumed.
    pub fn denormalise_linear(&self, norm: &[f64], out: &mut Vec<f64>) -> usize {
        match self {
            DecayGroup::MultiExponential(g) => g.denormalise_linear(norm, out),
            DecayGroup::Fret(g) => g.denormalise_linear(norm, out),
            DecayGroup::Pattern(g) => g.denormalise_linear(norm, out),
        }
    }
}

impl From<MultiExponentialGroup> for DecayGroup {
    fn from(g: MultiExponentialGroup) -> Self {
        DecayGroup::MultiExponential(g)
    }
}

impl From<FretGroup> for DecayGroup {
    fn from(g: FretGroup) -> Self {
        DecayGroup::Fret(g)
    }
}

impl From<PatternGroup> for DecayGroup {
    fn from(g: PatternGroup) -> Self {
        DecayGroup::Pattern(g)
    }
}
