//! Pattern decay group: fixed reference shapes.
//!
//! Each pattern is a frozen multi-exponential decay plus a constant offset,
//! contributing one linear column and no free nonlinear parameters. Used to
//! account for known contaminants (autofluorescence, scattered excitation)
//! whose shape is calibrated ahead of time.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::Acquisition;
use crate::error::FitError;
use crate::irf::{Convolver, Irf};
use crate::model::group::EvalContext;
use crate::model::inc::IncMatrix;

/// One reference decay shape: component lifetimes, amplitudes and a
/// constant offset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub tau: Vec<f64>,
    pub beta: Vec<f64>,
    pub offset: f64,
}

impl Pattern {
    pub fn new(tau: Vec<f64>, beta: Vec<f64>, offset: f64) -> Result<Self, FitError> {
        if tau.len() != beta.len() {
            return Err(FitError::config(
                "Pattern lifetimes and amplitudes must have the same length.",
            ));
        }
        Ok(Self { tau, beta, offset })
    }

    /// Parse the flat form `tau_1 beta_1 ... tau_n beta_n offset`.
    ///
    /// The list length must be odd (`2N + 1`); an even length means a
    /// missing offset or a dangling lifetime and is rejected.
    pub fn from_params(params: &[f64]) -> Result<Self, FitError> {
        if params.len() % 2 == 0 {
            return Err(FitError::config(
                "Pattern parameters should take the form tau_1 beta_1 ... tau_n beta_n offset.",
            ));
        }
        let n_exp = (params.len() - 1) / 2;
        let mut tau = Vec::with_capacity(n_exp);
        let mut beta = Vec::with_capacity(n_exp);
        for i in 0..n_exp {
            tau.push(params[i * 2]);
            beta.push(params[i * 2 + 1]);
        }
        Ok(Self {
            tau,
            beta,
            offset: params[n_exp * 2],
        })
    }
}

#[derive(Debug, Clone)]
pub struct PatternGroup {
    patterns: Vec<Pattern>,
    channel_factors: Vec<f64>,
    convolvers: Vec<Vec<Convolver>>,
    ref_lifetime: f64,
    n_meas: usize,
}

impl PatternGroup {
    pub fn new(patterns: Vec<Pattern>) -> Result<Self, FitError> {
        if patterns.is_empty() {
            return Err(FitError::config("Pattern group needs at least one pattern."));
        }
        Ok(Self {
            patterns,
            channel_factors: Vec::new(),
            convolvers: Vec::new(),
            ref_lifetime: 0.0,
            n_meas: 0,
        })
    }

    pub fn set_channel_factors(&mut self, channel_factors: Vec<f64>) {
        self.channel_factors = channel_factors;
    }

    pub fn attach(&mut self, irf: &Arc<Irf>, acq: &Arc<Acquisition>) -> Result<(), FitError> {
        if self.channel_factors.is_empty() {
            self.channel_factors = vec![1.0; acq.n_chan];
        } else if self.channel_factors.len() != acq.n_chan {
            return Err(FitError::config(format!(
                "Channel factor length {} does not match {} channels.",
                self.channel_factors.len(),
                acq.n_chan
            )));
        }
        self.convolvers = self
            .patterns
            .iter()
            .map(|p| {
                (0..p.tau.len())
                    .map(|_| Convolver::new(Arc::clone(irf), Arc::clone(acq)))
                    .collect()
            })
            .collect();
        self.n_meas = acq.n_meas();
        Ok(())
    }

    pub fn n_linear(&self) -> usize {
        self.patterns.len()
    }

    pub fn n_nonlinear(&self) -> usize {
        0
    }

    pub fn set_variables(&mut self, _alf: &[f64], ctx: &EvalContext) -> usize {
        self.ref_lifetime = ctx.ref_lifetime;
        for (p, pattern) in self.patterns.iter().enumerate() {
            for (i, tau) in pattern.tau.iter().enumerate() {
                self.convolvers[p][i].compute(1.0 / tau.max(1e-10), ctx.irf_idx, ctx.t0_shift);
            }
        }
        0
    }

    pub fn calculate_model(&self, a: &mut [f64], adim: usize, _kap: &mut f64) -> usize {
        for (p, pattern) in self.patterns.iter().enumerate() {
            let off = p * adim;
            let out = &mut a[off..off + self.n_meas];
            for (i, &beta) in pattern.beta.iter().enumerate() {
                self.convolvers[p][i].add_decay(
                    beta,
                    &self.channel_factors,
                    self.ref_lifetime,
                    out,
                );
            }
            for v in out.iter_mut() {
                *v += pattern.offset;
            }
        }
        self.n_linear()
    }

    pub fn calculate_derivatives(
        &self,
        _b: &mut [f64],
        _bdim: usize,
        _kap_derv: &mut [f64],
    ) -> usize {
        0
    }

    pub fn setup_inc_matrix(&self, _inc: &mut IncMatrix, _row: &mut usize, col: &mut usize) {
        *col += self.n_linear();
    }

    pub fn nonlinear_output_names(&self, _names: &mut Vec<String>) {}

    pub fn get_nonlinear_outputs(&self, _out: &mut Vec<f64>) {}

    pub fn linear_output_names(&self, names: &mut Vec<String>) {
        for p in 0..self.patterns.len() {
            names.push(format!("pattern_{}", p + 1));
        }
    }

    pub fn normalise_linear(&self, lin: &[f64], out: &mut Vec<f64>) -> usize {
        let n = self.n_linear();
        out.extend_from_slice(&lin[..n]);
        n
    }

    pub fn denormalise_linear(&self, norm: &[f64], out: &mut Vec<f64>) -> usize {
        let n = self.n_linear();
        out.extend_from_slice(&norm[..n]);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PixelIndex;
    use crate::error::CODE_CONFIG;

    #[test]
    fn even_parameter_list_is_rejected() {
        let err = Pattern::from_params(&[2.0, 0.5, 1.0, 0.5]).unwrap_err();
        assert_eq!(err.code(), CODE_CONFIG);
    }

    #[test]
    fn odd_parameter_list_parses() {
        let p = Pattern::from_params(&[2.0, 0.7, 0.5, 0.3, 0.01]).unwrap();
        assert_eq!(p.tau, vec![2.0, 0.5]);
        assert_eq!(p.beta, vec![0.7, 0.3]);
        assert_eq!(p.offset, 0.01);
    }

    #[test]
    fn mismatched_tau_beta_lengths_are_rejected() {
        assert!(Pattern::new(vec![2.0, 1.0], vec![0.5], 0.0).is_err());
    }

    #[test]
    fn pattern_column_is_frozen_shape_plus_offset() {
        let acq = Arc::new(Acquisition::new(32, 0.0, 0.1, 1).unwrap());
        let mut samples = vec![0.0; 32];
        samples[0] = 1.0;
        let irf = Arc::new(Irf::from_histogram(32, 1, 0.0, 0.1, &samples).unwrap());

        let pattern = Pattern::from_params(&[2.0, 0.6, 0.5, 0.4, 0.05]).unwrap();
        let mut group = PatternGroup::new(vec![pattern]).unwrap();
        group.attach(&irf, &acq).unwrap();

        let ctx = EvalContext {
            irf_idx: PixelIndex::default(),
            t0_shift: 0.0,
            ref_lifetime: 0.0,
        };
        assert_eq!(group.set_variables(&[], &ctx), 0);

        let mut a = vec![0.0; 32];
        let mut kap = 0.0;
        assert_eq!(group.calculate_model(&mut a, 32, &mut kap), 1);

        for (j, t) in acq.timepoints().iter().enumerate() {
            let expected = 0.6 * (-t / 2.0).exp() + 0.4 * (-t / 0.5).exp() + 0.05;
            assert!((a[j] - expected).abs() < 1e-12);
        }
    }
}
