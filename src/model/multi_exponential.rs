//! Multi-exponential decay group.
//!
//! `N` lifetimes, each contributing one convolved exponential basis shape.
//! When contributions are pixel-private each exponential gets its own
//! linear column and the amplitudes come out of the linear solve. When
//! contributions are global the group collapses to a single column whose
//! shape is the beta-weighted sum of the exponentials, and the amplitude
//! fractions become nonlinear parameters via the stick-breaking simplex
//! transform (non-negative, summing to one by construction).
//!
//! Fixed fractions keep their configured value; the free ones are
//! renormalized to share the remainder.

use std::sync::Arc;

use crate::domain::Acquisition;
use crate::error::FitError;
use crate::irf::{Convolver, Irf};
use crate::math::penalty::{ordering_penalty, ordering_penalty_derivative};
use crate::math::simplex::{
    fraction_derivative, fractions_from_variables, variables_from_fractions,
};
use crate::model::group::EvalContext;
use crate::model::inc::IncMatrix;
use crate::model::parameter::{FittingParameter, count_free};

#[derive(Debug, Clone)]
pub struct MultiExponentialGroup {
    n_exponential: usize,
    contributions_global: bool,
    tau_parameters: Vec<FittingParameter>,
    beta_parameters: Vec<FittingParameter>,
    channel_factors: Vec<f64>,

    // Runtime state, rebuilt on every set_variables call.
    tau: Vec<f64>,
    beta: Vec<f64>,
    beta_vars: Vec<f64>,
    convolvers: Vec<Convolver>,
    ref_lifetime: f64,
    n_meas: usize,
}

impl MultiExponentialGroup {
    pub fn new(n_exponential: usize, contributions_global: bool) -> Self {
        let tau_parameters = (0..n_exponential)
            .map(|i| {
                // Spread the defaults over a decade, largest first; the
                // ordering penalty keeps them that way during the fit.
                let initial = 2.0 * 0.5_f64.powi(i as i32);
                FittingParameter::free(format!("tau_{}", i + 1), initial, 1e-3, 1e3)
            })
            .collect();

        let beta_parameters = if contributions_global && n_exponential > 1 {
            (0..n_exponential)
                .map(|i| {
                    FittingParameter::free(
                        format!("beta_{}", i + 1),
                        1.0 / n_exponential as f64,
                        0.0,
                        1.0,
                    )
                })
                .collect()
        } else {
            Vec::new()
        };

        Self {
            n_exponential,
            contributions_global,
            tau_parameters,
            beta_parameters,
            channel_factors: Vec::new(),
            tau: vec![0.0; n_exponential],
            beta: vec![1.0; n_exponential],
            beta_vars: Vec::new(),
            convolvers: Vec::new(),
            ref_lifetime: 0.0,
            n_meas: 0,
        }
    }

    pub fn n_exponential(&self) -> usize {
        self.n_exponential
    }

    pub fn contributions_global(&self) -> bool {
        self.contributions_global
    }

    pub fn tau_parameter_mut(&mut self, i: usize) -> &mut FittingParameter {
        &mut self.tau_parameters[i]
    }

    pub fn beta_parameter_mut(&mut self, i: usize) -> &mut FittingParameter {
        &mut self.beta_parameters[i]
    }

    pub fn set_channel_factors(&mut self, channel_factors: Vec<f64>) {
        self.channel_factors = channel_factors;
    }

    pub fn channel_factors(&self) -> &[f64] {
        &self.channel_factors
    }

    fn n_beta_free(&self) -> usize {
        count_free(&self.beta_parameters)
    }

    fn fixed_beta_sum(&self) -> f64 {
        self.beta_parameters
            .iter()
            .filter(|p| p.is_fixed())
            .map(|p| p.initial_value)
            .sum()
    }

    /// Number of free simplex variables parameterizing the fractions.
    fn n_beta_variables(&self) -> usize {
        self.n_beta_free().saturating_sub(1)
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
        self.convolvers = (0..self.n_exponential)
            .map(|_| Convolver::new(Arc::clone(irf), Arc::clone(acq)))
            .collect();
        self.n_meas = acq.n_meas();
        Ok(())
    }

    pub fn n_linear(&self) -> usize {
        if self.contributions_global {
            1
        } else {
            self.n_exponential
        }
    }

    pub fn n_nonlinear(&self) -> usize {
        count_free(&self.tau_parameters) + self.n_beta_variables()
    }

    pub fn initial_free_values(&self, out: &mut Vec<f64>) {
        for p in &self.tau_parameters {
            if !p.is_fixed() {
                out.push(p.clamped_initial());
            }
        }
        if self.n_beta_variables() > 0 {
            let free_betas: Vec<f64> = self
                .beta_parameters
                .iter()
                .filter(|p| !p.is_fixed())
                .map(|p| p.clamped_initial())
                .collect();
            out.extend(variables_from_fractions(&free_betas));
        }
    }

    pub fn set_variables(&mut self, alf: &[f64], ctx: &EvalContext) -> usize {
        let mut idx = 0;
        for (i, p) in self.tau_parameters.iter().enumerate() {
            self.tau[i] = if p.is_fixed() {
                p.initial_value
            } else {
                let v = alf[idx];
                idx += 1;
                v
            };
        }

        if self.n_beta_variables() > 0 {
            let n_vars = self.n_beta_variables();
            self.beta_vars = alf[idx..idx + n_vars].to_vec();
            idx += n_vars;

            let mut free = vec![0.0; self.n_beta_free()];
            fractions_from_variables(&self.beta_vars, &mut free);
            let scale = 1.0 - self.fixed_beta_sum();
            let mut f = 0;
            for (i, p) in self.beta_parameters.iter().enumerate() {
                self.beta[i] = if p.is_fixed() {
                    p.initial_value
                } else {
                    let v = free[f] * scale;
                    f += 1;
                    v
                };
            }
        } else if self.contributions_global && self.n_exponential > 1 {
            // All fractions fixed: use them as configured.
            for (i, p) in self.beta_parameters.iter().enumerate() {
                self.beta[i] = p.initial_value;
            }
        }

        self.ref_lifetime = ctx.ref_lifetime;
        for (i, conv) in self.convolvers.iter_mut().enumerate() {
            let rate = 1.0 / self.tau[i].max(1e-10);
            conv.compute(rate, ctx.irf_idx, ctx.t0_shift);
        }

        idx
    }

    pub fn calculate_model(&self, a: &mut [f64], adim: usize, kap: &mut f64) -> usize {
        if self.contributions_global {
            let col = &mut a[..self.n_meas];
            for i in 0..self.n_exponential {
                self.convolvers[i].add_decay(
                    self.beta[i],
                    &self.channel_factors,
                    self.ref_lifetime,
                    col,
                );
            }
        } else {
            for i in 0..self.n_exponential {
                let off = i * adim;
                self.convolvers[i].add_decay(
                    1.0,
                    &self.channel_factors,
                    self.ref_lifetime,
                    &mut a[off..off + self.n_meas],
                );
            }
        }

        for i in 1..self.n_exponential {
            *kap += ordering_penalty(self.tau[i], self.tau[i - 1]);
        }

        self.n_linear()
    }

    pub fn calculate_derivatives(&self, b: &mut [f64], bdim: usize, kap_derv: &mut [f64]) -> usize {
        let mut col = 0;
        let mut k = 0;

        for i in 0..self.n_exponential {
            if self.tau_parameters[i].is_fixed() {
                continue;
            }
            let tau = self.tau[i].max(1e-10);
            // d(shape)/d(tau) = d(shape)/d(rate) * (-1 / tau^2)
            let fact = -1.0 / (tau * tau);
            let amplitude = if self.contributions_global {
                self.beta[i]
            } else {
                1.0
            };
            let off = col * bdim;
            self.convolvers[i].add_derivative(
                fact * amplitude,
                &self.channel_factors,
                self.ref_lifetime,
                &mut b[off..off + self.n_meas],
            );

            let mut dk = 0.0;
            if i > 0 {
                dk += ordering_penalty_derivative(self.tau[i], self.tau[i - 1]);
            }
            if i + 1 < self.n_exponential {
                dk -= ordering_penalty_derivative(self.tau[i + 1], self.tau[i]);
            }
            kap_derv[k] = dk;

            col += 1;
            k += 1;
        }

        if self.n_beta_variables() > 0 {
            let scale = 1.0 - self.fixed_beta_sum();
            let free_indices: Vec<usize> = self
                .beta_parameters
                .iter()
                .enumerate()
                .filter(|(_, p)| !p.is_fixed())
                .map(|(i, _)| i)
                .collect();

            for j in 0..self.n_beta_variables() {
                let off = col * bdim;
                let out = &mut b[off..off + self.n_meas];
                for (m, &i) in free_indices.iter().enumerate() {
                    let d = fraction_derivative(&self.beta_vars, m, j) * scale;
                    if d != 0.0 {
                        self.convolvers[i].add_decay(
                            d,
                            &self.channel_factors,
                            self.ref_lifetime,
                            out,
                        );
                    }
                }
                kap_derv[k] = 0.0;
                col += 1;
                k += 1;
            }
        }

        col
    }

    pub fn setup_inc_matrix(&self, inc: &mut IncMatrix, row: &mut usize, col: &mut usize) {
        if self.contributions_global {
            for _ in 0..self.n_nonlinear() {
                inc.set(*row, *col);
                *row += 1;
            }
            *col += 1;
        } else {
            for (i, p) in self.tau_parameters.iter().enumerate() {
                if !p.is_fixed() {
                    inc.set(*row, *col + i);
                    *row += 1;
                }
            }
            *col += self.n_exponential;
        }
    }

    pub fn nonlinear_output_names(&self, names: &mut Vec<String>) {
        for p in &self.tau_parameters {
            names.push(p.name.clone());
        }
        for p in &self.beta_parameters {
            names.push(p.name.clone());
        }
    }

    pub fn get_nonlinear_outputs(&self, out: &mut Vec<f64>) {
        out.extend_from_slice(&self.tau);
        if !self.beta_parameters.is_empty() {
            out.extend_from_slice(&self.beta);
        }
    }

    pub fn linear_output_names(&self, names: &mut Vec<String>) {
        names.push("I".to_string());
        if !self.contributions_global {
            for i in 0..self.n_exponential {
                names.push(format!("beta_{}", i + 1));
            }
        }
    }

    /// Map raw linear coefficients to intensity plus normalized fractions.
    pub fn normalise_linear(&self, lin: &[f64], out: &mut Vec<f64>) -> usize {
        if self.contributions_global {
            out.push(lin[0]);
            1
        } else {
            let intensity: f64 = lin[..self.n_exponential].iter().sum();
            out.push(intensity);
            let denom = if intensity.abs() > 1e-300 {
                intensity
            } else {
                1.0
            };
            for i in 0..self.n_exponential {
                out.push(lin[i] / denom);
            }
            self.n_exponential
        }
    }

    /// Inverse of [`Self::normalise_linear`].
    pub fn denormalise_linear(&self, norm: &[f64], out: &mut Vec<f64>) -> usize {
        if self.contributions_global {
            out.push(norm[0]);
            1
        } else {
            let intensity = norm[0];
            for i in 0..self.n_exponential {
                out.push(norm[1 + i] * intensity);
            }
            self.n_exponential + 1
        }
    }
}
