//! FRET decay group.
//!
//! Donor fluorophores with `N` intrinsic lifetimes transfer energy to an
//! acceptor in one or more FRET populations, each characterized by a
//! transfer lifetime `tauT`. A donor in population `p` decays with total
//! rate `k = 1/tau_D + 1/tauT_p`, so each population contributes one linear
//! column holding the beta-weighted sum of the quenched donor decays.
//!
//! Optionally the group adds a donor-only column (unquenched donors) and an
//! acceptor: sensitized emission is the solution of the acceptor rate
//! equation driven by transfer,
//!
//! ```text
//! A_p(t) = A0 * kT / (kD - kA) * (exp(-kA t) - exp(-kD t))
//! ```
//!
//! folded into each population column with acceptor channel factors, plus a
//! directly excited acceptor column. Derivatives are assembled analytically
//! per contributing species: donor lifetime, transfer lifetime, acceptor
//! intensity and acceptor lifetime.

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
pub struct FretGroup {
    n_donor_exponential: usize,
    n_fret_populations: usize,
    include_donor_only: bool,
    include_acceptor: bool,

    tau_parameters: Vec<FittingParameter>,
    beta_parameters: Vec<FittingParameter>,
    tau_transfer_parameters: Vec<FittingParameter>,
    a0_parameter: FittingParameter,
    tau_acceptor_parameter: FittingParameter,

    donor_channel_factors: Vec<f64>,
    acceptor_channel_factors: Vec<f64>,
    direct_acceptor_channel_factors: Vec<f64>,

    // Runtime state, rebuilt on every set_variables call.
    tau: Vec<f64>,
    beta: Vec<f64>,
    beta_vars: Vec<f64>,
    tau_transfer: Vec<f64>,
    a0: f64,
    tau_a: f64,
    donor_convolvers: Vec<Convolver>,
    fret_convolvers: Vec<Vec<Convolver>>,
    acceptor_convolver: Option<Convolver>,
    /// `kT / (kD - kA)` per population and donor component.
    psi: Vec<Vec<f64>>,
    /// `kD - kA` per population and donor component.
    rate_diff: Vec<Vec<f64>>,
    ref_lifetime: f64,
    n_meas: usize,
}

impl FretGroup {
    pub fn new(
        n_donor_exponential: usize,
        n_fret_populations: usize,
        include_donor_only: bool,
    ) -> Self {
        let tau_parameters = (0..n_donor_exponential)
            .map(|i| {
                let initial = 3.0 * 0.5_f64.powi(i as i32);
                FittingParameter::free(format!("tau_{}", i + 1), initial, 1e-3, 1e3)
            })
            .collect();

        let beta_parameters = if n_donor_exponential > 1 {
            (0..n_donor_exponential)
                .map(|i| {
                    FittingParameter::free(
                        format!("beta_{}", i + 1),
                        1.0 / n_donor_exponential as f64,
                        0.0,
                        1.0,
                    )
                })
                .collect()
        } else {
            Vec::new()
        };

        let tau_transfer_parameters = (0..n_fret_populations)
            .map(|p| {
                let initial = 2.0 * 0.5_f64.powi(p as i32);
                FittingParameter::free(format!("tauT_{}", p + 1), initial, 1e-3, 1e3)
            })
            .collect();

        Self {
            n_donor_exponential,
            n_fret_populations,
            include_donor_only,
            include_acceptor: false,
            tau_parameters,
            beta_parameters,
            tau_transfer_parameters,
            a0_parameter: FittingParameter::free("A0", 1.0, 0.0, 1e3),
            tau_acceptor_parameter: FittingParameter::free("tauA", 4.0, 1e-3, 1e3),
            donor_channel_factors: Vec::new(),
            acceptor_channel_factors: Vec::new(),
            direct_acceptor_channel_factors: Vec::new(),
            tau: vec![0.0; n_donor_exponential],
            beta: vec![1.0; n_donor_exponential],
            beta_vars: Vec::new(),
            tau_transfer: vec![0.0; n_fret_populations],
            a0: 0.0,
            tau_a: 0.0,
            donor_convolvers: Vec::new(),
            fret_convolvers: Vec::new(),
            acceptor_convolver: None,
            psi: Vec::new(),
            rate_diff: Vec::new(),
            ref_lifetime: 0.0,
            n_meas: 0,
        }
    }

    pub fn set_include_acceptor(&mut self, include_acceptor: bool) {
        self.include_acceptor = include_acceptor;
    }

    pub fn tau_parameter_mut(&mut self, i: usize) -> &mut FittingParameter {
        &mut self.tau_parameters[i]
    }

    pub fn tau_transfer_parameter_mut(&mut self, p: usize) -> &mut FittingParameter {
        &mut self.tau_transfer_parameters[p]
    }

    pub fn a0_parameter_mut(&mut self) -> &mut FittingParameter {
        &mut self.a0_parameter
    }

    pub fn tau_acceptor_parameter_mut(&mut self) -> &mut FittingParameter {
        &mut self.tau_acceptor_parameter
    }

    pub fn set_donor_channel_factors(&mut self, factors: Vec<f64>) {
        self.donor_channel_factors = factors;
    }

    pub fn set_acceptor_channel_factors(&mut self, factors: Vec<f64>) {
        self.acceptor_channel_factors = factors;
    }

    pub fn set_direct_acceptor_channel_factors(&mut self, factors: Vec<f64>) {
        self.direct_acceptor_channel_factors = factors;
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

    fn n_beta_variables(&self) -> usize {
        self.n_beta_free().saturating_sub(1)
    }

    fn donor_only_col(&self) -> Option<usize> {
        self.include_donor_only.then_some(0)
    }

    fn population_col(&self, p: usize) -> usize {
        usize::from(self.include_donor_only) + p
    }

    fn direct_acceptor_col(&self) -> Option<usize> {
        self.include_acceptor
            .then(|| usize::from(self.include_donor_only) + self.n_fret_populations)
    }

    pub fn attach(&mut self, irf: &Arc<Irf>, acq: &Arc<Acquisition>) -> Result<(), FitError> {
        for factors in [
            &mut self.donor_channel_factors,
            &mut self.acceptor_channel_factors,
            &mut self.direct_acceptor_channel_factors,
        ] {
            if factors.is_empty() {
                *factors = vec![1.0; acq.n_chan];
            } else if factors.len() != acq.n_chan {
                return Err(FitError::config(format!(
                    "Channel factor length {} does not match {} channels.",
                    factors.len(),
                    acq.n_chan
                )));
            }
        }

        self.donor_convolvers = (0..self.n_donor_exponential)
            .map(|_| Convolver::new(Arc::clone(irf), Arc::clone(acq)))
            .collect();
        self.fret_convolvers = (0..self.n_fret_populations)
            .map(|_| {
                (0..self.n_donor_exponential)
                    .map(|_| Convolver::new(Arc::clone(irf), Arc::clone(acq)))
                    .collect()
            })
            .collect();
        self.acceptor_convolver = self
            .include_acceptor
            .then(|| Convolver::new(Arc::clone(irf), Arc::clone(acq)));
        self.psi = vec![vec![0.0; self.n_donor_exponential]; self.n_fret_populations];
        self.rate_diff = vec![vec![0.0; self.n_donor_exponential]; self.n_fret_populations];
        self.n_meas = acq.n_meas();
        Ok(())
    }

    pub fn n_linear(&self) -> usize {
        usize::from(self.include_donor_only)
            + self.n_fret_populations
            + usize::from(self.include_acceptor)
    }

    pub fn n_nonlinear(&self) -> usize {
        let mut n = count_free(&self.tau_parameters)
            + self.n_beta_variables()
            + count_free(&self.tau_transfer_parameters);
        if self.include_acceptor {
            n += usize::from(!self.a0_parameter.is_fixed());
            n += usize::from(!self.tau_acceptor_parameter.is_fixed());
        }
        n
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
        for p in &self.tau_transfer_parameters {
            if !p.is_fixed() {
                out.push(p.clamped_initial());
            }
        }
        if self.include_acceptor {
            if !self.a0_parameter.is_fixed() {
                out.push(self.a0_parameter.clamped_initial());
            }
            if !self.tau_acceptor_parameter.is_fixed() {
                out.push(self.tau_acceptor_parameter.clamped_initial());
            }
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
        } else if self.n_donor_exponential > 1 {
            for (i, p) in self.beta_parameters.iter().enumerate() {
                self.beta[i] = p.initial_value;
            }
        }

        for (p, param) in self.tau_transfer_parameters.iter().enumerate() {
            self.tau_transfer[p] = if param.is_fixed() {
                param.initial_value
            } else {
                let v = alf[idx];
                idx += 1;
                v
            };
        }

        if self.include_acceptor {
            self.a0 = if self.a0_parameter.is_fixed() {
                self.a0_parameter.initial_value
            } else {
                let v = alf[idx];
                idx += 1;
                v
            };
            self.tau_a = if self.tau_acceptor_parameter.is_fixed() {
                self.tau_acceptor_parameter.initial_value
            } else {
                let v = alf[idx];
                idx += 1;
                v
            };
        }

        self.ref_lifetime = ctx.ref_lifetime;

        for (i, conv) in self.donor_convolvers.iter_mut().enumerate() {
            conv.compute(1.0 / self.tau[i].max(1e-10), ctx.irf_idx, ctx.t0_shift);
        }

        let k_a = if self.include_acceptor {
            1.0 / self.tau_a.max(1e-10)
        } else {
            0.0
        };

        for p in 0..self.n_fret_populations {
            let k_t = 1.0 / self.tau_transfer[p].max(1e-10);
            for i in 0..self.n_donor_exponential {
                let k_d = 1.0 / self.tau[i].max(1e-10) + k_t;
                self.fret_convolvers[p][i].compute(k_d, ctx.irf_idx, ctx.t0_shift);
                if self.include_acceptor {
                    // Guard the sensitized-emission prefactor against a
                    // transfer rate degenerate with the acceptor rate.
                    let mut diff = k_d - k_a;
                    if diff.abs() < 1e-8 {
                        diff = 1e-8_f64.copysign(diff + f64::MIN_POSITIVE);
                    }
                    self.rate_diff[p][i] = diff;
                    self.psi[p][i] = k_t / diff;
                }
            }
        }

        if let Some(conv) = self.acceptor_convolver.as_mut() {
            conv.compute(k_a, ctx.irf_idx, ctx.t0_shift);
        }

        idx
    }

    pub fn calculate_model(&self, a: &mut [f64], adim: usize, kap: &mut f64) -> usize {
        if let Some(col) = self.donor_only_col() {
            let off = col * adim;
            let out = &mut a[off..off + self.n_meas];
            for i in 0..self.n_donor_exponential {
                self.donor_convolvers[i].add_decay(
                    self.beta[i],
                    &self.donor_channel_factors,
                    self.ref_lifetime,
                    out,
                );
            }
        }

        for p in 0..self.n_fret_populations {
            let off = self.population_col(p) * adim;
            let out = &mut a[off..off + self.n_meas];
            for i in 0..self.n_donor_exponential {
                self.fret_convolvers[p][i].add_decay(
                    self.beta[i],
                    &self.donor_channel_factors,
                    self.ref_lifetime,
                    out,
                );
                if self.include_acceptor {
                    let f = self.a0 * self.beta[i] * self.psi[p][i];
                    if let Some(acc) = &self.acceptor_convolver {
                        acc.add_decay(f, &self.acceptor_channel_factors, self.ref_lifetime, out);
                    }
                    self.fret_convolvers[p][i].add_decay(
                        -f,
                        &self.acceptor_channel_factors,
                        self.ref_lifetime,
                        out,
                    );
                }
            }
        }

        if let (Some(col), Some(acc)) = (self.direct_acceptor_col(), &self.acceptor_convolver) {
            let off = col * adim;
            acc.add_decay(
                1.0,
                &self.direct_acceptor_channel_factors,
                self.ref_lifetime,
                &mut a[off..off + self.n_meas],
            );
        }

        for i in 1..self.n_donor_exponential {
            *kap += ordering_penalty(self.tau[i], self.tau[i - 1]);
        }
        for p in 1..self.n_fret_populations {
            *kap += ordering_penalty(self.tau_transfer[p], self.tau_transfer[p - 1]);
        }

        self.n_linear()
    }

    pub fn calculate_derivatives(&self, b: &mut [f64], bdim: usize, kap_derv: &mut [f64]) -> usize {
        let mut col = 0;
        let mut k = 0;

        // Donor lifetimes: each affects the donor-only column and every
        // population column.
        for i in 0..self.n_donor_exponential {
            if self.tau_parameters[i].is_fixed() {
                continue;
            }
            let tau = self.tau[i].max(1e-10);
            let drate = -1.0 / (tau * tau);

            if self.donor_only_col().is_some() {
                let off = col * bdim;
                self.donor_convolvers[i].add_derivative(
                    self.beta[i] * drate,
                    &self.donor_channel_factors,
                    self.ref_lifetime,
                    &mut b[off..off + self.n_meas],
                );
                col += 1;
            }

            for p in 0..self.n_fret_populations {
                let off = col * bdim;
                let out = &mut b[off..off + self.n_meas];
                self.fret_convolvers[p][i].add_derivative(
                    self.beta[i] * drate,
                    &self.donor_channel_factors,
                    self.ref_lifetime,
                    out,
                );
                if self.include_acceptor {
                    let psi = self.psi[p][i];
                    let dpsi = -psi / self.rate_diff[p][i] * drate;
                    let f = self.a0 * self.beta[i];
                    if let Some(acc) = &self.acceptor_convolver {
                        acc.add_decay(
                            f * dpsi,
                            &self.acceptor_channel_factors,
                            self.ref_lifetime,
                            out,
                        );
                    }
                    self.fret_convolvers[p][i].add_decay(
                        -f * dpsi,
                        &self.acceptor_channel_factors,
                        self.ref_lifetime,
                        out,
                    );
                    self.fret_convolvers[p][i].add_derivative(
                        -f * psi * drate,
                        &self.acceptor_channel_factors,
                        self.ref_lifetime,
                        out,
                    );
                }
                col += 1;
            }

            let mut dk = 0.0;
            if i > 0 {
                dk += ordering_penalty_derivative(self.tau[i], self.tau[i - 1]);
            }
            if i + 1 < self.n_donor_exponential {
                dk -= ordering_penalty_derivative(self.tau[i + 1], self.tau[i]);
            }
            kap_derv[k] = dk;
            k += 1;
        }

        // Amplitude fraction variables.
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
                if self.donor_only_col().is_some() {
                    let off = col * bdim;
                    let out = &mut b[off..off + self.n_meas];
                    for (m, &i) in free_indices.iter().enumerate() {
                        let d = fraction_derivative(&self.beta_vars, m, j) * scale;
                        if d != 0.0 {
                            self.donor_convolvers[i].add_decay(
                                d,
                                &self.donor_channel_factors,
                                self.ref_lifetime,
                                out,
                            );
                        }
                    }
                    col += 1;
                }
                for p in 0..self.n_fret_populations {
                    let off = col * bdim;
                    let out = &mut b[off..off + self.n_meas];
                    for (m, &i) in free_indices.iter().enumerate() {
                        let d = fraction_derivative(&self.beta_vars, m, j) * scale;
                        if d == 0.0 {
                            continue;
                        }
                        self.fret_convolvers[p][i].add_decay(
                            d,
                            &self.donor_channel_factors,
                            self.ref_lifetime,
                            out,
                        );
                        if self.include_acceptor {
                            let f = self.a0 * self.psi[p][i] * d;
                            if let Some(acc) = &self.acceptor_convolver {
                                acc.add_decay(
                                    f,
                                    &self.acceptor_channel_factors,
                                    self.ref_lifetime,
                                    out,
                                );
                            }
                            self.fret_convolvers[p][i].add_decay(
                                -f,
                                &self.acceptor_channel_factors,
                                self.ref_lifetime,
                                out,
                            );
                        }
                    }
                    col += 1;
                }
                kap_derv[k] = 0.0;
                k += 1;
            }
        }

        // Transfer lifetimes: population p only.
        for p in 0..self.n_fret_populations {
            if self.tau_transfer_parameters[p].is_fixed() {
                continue;
            }
            let tau_t = self.tau_transfer[p].max(1e-10);
            let k_t = 1.0 / tau_t;
            let drate = -1.0 / (tau_t * tau_t);

            let off = col * bdim;
            let out = &mut b[off..off + self.n_meas];
            for i in 0..self.n_donor_exponential {
                self.fret_convolvers[p][i].add_derivative(
                    self.beta[i] * drate,
                    &self.donor_channel_factors,
                    self.ref_lifetime,
                    out,
                );
                if self.include_acceptor {
                    let psi = self.psi[p][i];
                    let diff = self.rate_diff[p][i];
                    // psi = kT / (kD - kA) with both kT and kD moving.
                    let dpsi = drate * (diff - k_t) / (diff * diff);
                    let f = self.a0 * self.beta[i];
                    if let Some(acc) = &self.acceptor_convolver {
                        acc.add_decay(
                            f * dpsi,
                            &self.acceptor_channel_factors,
                            self.ref_lifetime,
                            out,
                        );
                    }
                    self.fret_convolvers[p][i].add_decay(
                        -f * dpsi,
                        &self.acceptor_channel_factors,
                        self.ref_lifetime,
                        out,
                    );
                    self.fret_convolvers[p][i].add_derivative(
                        -f * psi * drate,
                        &self.acceptor_channel_factors,
                        self.ref_lifetime,
                        out,
                    );
                }
            }

            let mut dk = 0.0;
            if p > 0 {
                dk += ordering_penalty_derivative(self.tau_transfer[p], self.tau_transfer[p - 1]);
            }
            if p + 1 < self.n_fret_populations {
                dk -= ordering_penalty_derivative(self.tau_transfer[p + 1], self.tau_transfer[p]);
            }
            kap_derv[k] = dk;
            k += 1;
            col += 1;
        }

        if self.include_acceptor {
            // Acceptor intensity: every population column.
            if !self.a0_parameter.is_fixed() {
                for p in 0..self.n_fret_populations {
                    let off = col * bdim;
                    let out = &mut b[off..off + self.n_meas];
                    for i in 0..self.n_donor_exponential {
                        let f = self.beta[i] * self.psi[p][i];
                        if let Some(acc) = &self.acceptor_convolver {
                            acc.add_decay(
                                f,
                                &self.acceptor_channel_factors,
                                self.ref_lifetime,
                                out,
                            );
                        }
                        self.fret_convolvers[p][i].add_decay(
                            -f,
                            &self.acceptor_channel_factors,
                            self.ref_lifetime,
                            out,
                        );
                    }
                    col += 1;
                }
                kap_derv[k] = 0.0;
                k += 1;
            }

            // Acceptor lifetime: population columns plus the direct column.
            if !self.tau_acceptor_parameter.is_fixed() {
                let tau_a = self.tau_a.max(1e-10);
                let drate_a = -1.0 / (tau_a * tau_a);

                for p in 0..self.n_fret_populations {
                    let off = col * bdim;
                    let out = &mut b[off..off + self.n_meas];
                    for i in 0..self.n_donor_exponential {
                        let psi = self.psi[p][i];
                        let diff = self.rate_diff[p][i];
                        // d(kD - kA)/d(tauA) = -drate_a
                        let dpsi = psi / diff * drate_a;
                        let f = self.a0 * self.beta[i];
                        if let Some(acc) = &self.acceptor_convolver {
                            acc.add_decay(
                                f * dpsi,
                                &self.acceptor_channel_factors,
                                self.ref_lifetime,
                                out,
                            );
                            acc.add_derivative(
                                f * psi * drate_a,
                                &self.acceptor_channel_factors,
                                self.ref_lifetime,
                                out,
                            );
                        }
                        self.fret_convolvers[p][i].add_decay(
                            -f * dpsi,
                            &self.acceptor_channel_factors,
                            self.ref_lifetime,
                            out,
                        );
                    }
                    col += 1;
                }

                if let (Some(_), Some(acc)) =
                    (self.direct_acceptor_col(), &self.acceptor_convolver)
                {
                    let off = col * bdim;
                    acc.add_derivative(
                        drate_a,
                        &self.direct_acceptor_channel_factors,
                        self.ref_lifetime,
                        &mut b[off..off + self.n_meas],
                    );
                    col += 1;
                }
                kap_derv[k] = 0.0;
                k += 1;
            }
        }

        let _ = k;
        col
    }

    pub fn setup_inc_matrix(&self, inc: &mut IncMatrix, row: &mut usize, col: &mut usize) {
        let donor_only = self.donor_only_col().map(|c| *col + c);
        let pop_cols: Vec<usize> = (0..self.n_fret_populations)
            .map(|p| *col + self.population_col(p))
            .collect();
        let direct = self.direct_acceptor_col().map(|c| *col + c);

        for p in &self.tau_parameters {
            if p.is_fixed() {
                continue;
            }
            if let Some(c) = donor_only {
                inc.set(*row, c);
            }
            for &c in &pop_cols {
                inc.set(*row, c);
            }
            *row += 1;
        }

        for _ in 0..self.n_beta_variables() {
            if let Some(c) = donor_only {
                inc.set(*row, c);
            }
            for &c in &pop_cols {
                inc.set(*row, c);
            }
            *row += 1;
        }

        for (p, param) in self.tau_transfer_parameters.iter().enumerate() {
            if param.is_fixed() {
                continue;
            }
            inc.set(*row, pop_cols[p]);
            *row += 1;
        }

        if self.include_acceptor {
            if !self.a0_parameter.is_fixed() {
                for &c in &pop_cols {
                    inc.set(*row, c);
                }
                *row += 1;
            }
            if !self.tau_acceptor_parameter.is_fixed() {
                for &c in &pop_cols {
                    inc.set(*row, c);
                }
                if let Some(c) = direct {
                    inc.set(*row, c);
                }
                *row += 1;
            }
        }

        *col += self.n_linear();
    }

    pub fn nonlinear_output_names(&self, names: &mut Vec<String>) {
        for p in &self.tau_parameters {
            names.push(p.name.clone());
        }
        for p in &self.beta_parameters {
            names.push(p.name.clone());
        }
        for p in &self.tau_transfer_parameters {
            names.push(p.name.clone());
        }
        for p in 0..self.n_fret_populations {
            names.push(format!("E_{}", p + 1));
        }
        if self.include_acceptor {
            names.push(self.a0_parameter.name.clone());
            names.push(self.tau_acceptor_parameter.name.clone());
        }
    }

    pub fn get_nonlinear_outputs(&self, out: &mut Vec<f64>) {
        out.extend_from_slice(&self.tau);
        if !self.beta_parameters.is_empty() {
            out.extend_from_slice(&self.beta);
        }
        out.extend_from_slice(&self.tau_transfer);

        // FRET efficiency per population from the mean donor lifetime:
        // E = kT / (kT + 1/tau_mean).
        let tau_mean: f64 = self
            .tau
            .iter()
            .zip(self.beta.iter())
            .map(|(t, b)| t * b)
            .sum::<f64>()
            .max(1e-10);
        for p in 0..self.n_fret_populations {
            let k_t = 1.0 / self.tau_transfer[p].max(1e-10);
            out.push(k_t / (k_t + 1.0 / tau_mean));
        }

        if self.include_acceptor {
            out.push(self.a0);
            out.push(self.tau_a);
        }
    }

    pub fn linear_output_names(&self, names: &mut Vec<String>) {
        names.push("I".to_string());
        if self.include_donor_only {
            names.push("gamma_donor_only".to_string());
        }
        for p in 0..self.n_fret_populations {
            names.push(format!("gamma_{}", p + 1));
        }
        if self.include_acceptor {
            names.push("gamma_acceptor".to_string());
        }
    }

    /// Intensity plus normalized population fractions.
    pub fn normalise_linear(&self, lin: &[f64], out: &mut Vec<f64>) -> usize {
        let n = self.n_linear();
        let intensity: f64 = lin[..n].iter().sum();
        out.push(intensity);
        let denom = if intensity.abs() > 1e-300 {
            intensity
        } else {
            1.0
        };
        for v in &lin[..n] {
            out.push(v / denom);
        }
        n
    }

    pub fn denormalise_linear(&self, norm: &[f64], out: &mut Vec<f64>) -> usize {
        let n = self.n_linear();
        let intensity = norm[0];
        for i in 0..n {
            out.push(norm[1 + i] * intensity);
        }
        n + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PixelIndex;

    fn delta_irf(n_t: usize) -> Arc<Irf> {
        let mut samples = vec![0.0; n_t];
        samples[0] = 1.0;
        Arc::new(Irf::from_histogram(n_t, 1, 0.0, 0.04, &samples).unwrap())
    }

    fn ctx() -> EvalContext {
        EvalContext {
            irf_idx: PixelIndex::default(),
            t0_shift: 0.0,
            ref_lifetime: 0.0,
        }
    }

    #[test]
    fn column_layout_follows_configuration() {
        let mut g = FretGroup::new(1, 2, true);
        assert_eq!(g.n_linear(), 3);
        g.set_include_acceptor(true);
        assert_eq!(g.n_linear(), 4);
        assert_eq!(g.donor_only_col(), Some(0));
        assert_eq!(g.population_col(0), 1);
        assert_eq!(g.direct_acceptor_col(), Some(3));
    }

    #[test]
    fn quenched_donor_decays_faster() {
        let acq = Arc::new(Acquisition::new(64, 0.0, 0.05, 1).unwrap());
        let mut g = FretGroup::new(1, 1, true);
        g.attach(&delta_irf(64), &acq).unwrap();

        // tau_D = 2.0, tauT = 1.0 -> quenched rate 1/2 + 1 = 1.5
        g.set_variables(&[2.0, 1.0], &ctx());
        let mut a = vec![0.0; 64 * 2];
        let mut kap = 0.0;
        g.calculate_model(&mut a, 64, &mut kap);

        for (j, t) in acq.timepoints().iter().enumerate() {
            assert!((a[j] - (-t / 2.0).exp()).abs() < 1e-12, "donor-only bin {j}");
            assert!((a[64 + j] - (-1.5 * t).exp()).abs() < 1e-12, "fret bin {j}");
        }
    }

    #[test]
    fn sensitized_acceptor_rises_then_decays() {
        let acq = Arc::new(Acquisition::new(128, 0.0, 0.05, 1).unwrap());
        let mut g = FretGroup::new(1, 1, false);
        g.set_include_acceptor(true);
        // Donor channels dark so the population column is acceptor-only.
        g.set_donor_channel_factors(vec![0.0]);
        g.attach(&delta_irf(128), &acq).unwrap();

        // tau_D = 2.0, tauT = 0.5, A0 = 1.0, tauA = 3.0
        g.set_variables(&[2.0, 0.5, 1.0, 3.0], &ctx());
        let mut a = vec![0.0; 128 * 2];
        let mut kap = 0.0;
        g.calculate_model(&mut a, 128, &mut kap);

        let k_d = 1.0 / 2.0 + 1.0 / 0.5;
        let k_a = 1.0 / 3.0;
        let psi = (1.0 / 0.5) / (k_d - k_a);
        for (j, t) in acq.timepoints().iter().enumerate() {
            let expected = psi * ((-k_a * t).exp() - (-k_d * t).exp());
            assert!(
                (a[j] - expected).abs() < 1e-10,
                "bin {j}: {} vs {expected}",
                a[j]
            );
        }
        // Starts at zero: the acceptor has not been pumped yet.
        assert!(a[0].abs() < 1e-10);
    }

    #[test]
    fn derivatives_match_finite_differences() {
        let acq = Arc::new(Acquisition::new(48, 0.0, 0.06, 1).unwrap());
        let mut g = FretGroup::new(2, 1, true);
        g.set_include_acceptor(true);
        g.attach(&delta_irf(48), &acq).unwrap();

        // [tau_1, tau_2, beta var, tauT, A0, tauA]
        let alf = [3.0, 1.0, 0.6, 0.8, 0.9, 4.0];
        let n_nl = g.n_nonlinear();
        assert_eq!(n_nl, 6);
        let n_lin = g.n_linear();
        let n = acq.n_meas();

        g.set_variables(&alf, &ctx());
        let n_dcol_expected: usize = {
            // tau_1, tau_2, beta: donor_only + pop; tauT: pop; A0: pop;
            // tauA: pop + direct.
            3 * 2 + 1 + 1 + 2
        };
        let mut b = vec![0.0; n * n_dcol_expected];
        let mut kap_derv = vec![0.0; n_nl];
        let n_dcol = g.calculate_derivatives(&mut b, n, &mut kap_derv);
        assert_eq!(n_dcol, n_dcol_expected);

        // Column emission order mirrors the incidence matrix.
        let mut inc = IncMatrix::new(n_nl, n_lin);
        let (mut row, mut c) = (0, 0);
        g.setup_inc_matrix(&mut inc, &mut row, &mut c);
        assert_eq!(inc.n_derivative_columns(), n_dcol_expected);

        let eval = |alf: &[f64]| -> Vec<f64> {
            let mut g2 = g.clone();
            g2.set_variables(alf, &ctx());
            let mut a = vec![0.0; n * n_lin];
            let mut kap = 0.0;
            g2.calculate_model(&mut a, n, &mut kap);
            a
        };

        let eps = 1e-6;
        for (dcol, k, j) in inc.columns() {
            let mut hi_alf = alf;
            let mut lo_alf = alf;
            hi_alf[k] += eps;
            lo_alf[k] -= eps;
            let hi = eval(&hi_alf);
            let lo = eval(&lo_alf);
            for t in 0..n {
                let fd = (hi[j * n + t] - lo[j * n + t]) / (2.0 * eps);
                let an = b[dcol * n + t];
                assert!(
                    (fd - an).abs() < 1e-4 * (1.0 + an.abs()),
                    "dcol {dcol} (param {k}, col {j}) bin {t}: analytic {an} vs fd {fd}"
                );
            }
        }
    }
}
