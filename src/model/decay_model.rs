//! The composed decay model.
//!
//! A model is one or more decay groups plus two model-level parameters: a
//! global time-origin shift `t0` and a reference-reconvolution lifetime
//! (both fixed at zero by default). Given the nonlinear parameter vector it
//! assembles the per-pixel design matrix `a` (one convolved basis shape per
//! linear coefficient) and the derivative block `b` (one column per
//! incidence-matrix entry), which is everything the variable projector
//! needs.
//!
//! The nonlinear vector is laid out group by group in declaration order,
//! followed by `t0` and the reference lifetime when free.

use std::sync::Arc;

use crate::domain::{Acquisition, PixelIndex};
use crate::error::FitError;
use crate::irf::Irf;
use crate::model::group::{DecayGroup, EvalContext};
use crate::model::inc::IncMatrix;
use crate::model::parameter::FittingParameter;

#[derive(Debug, Clone)]
pub struct DecayModel {
    acq: Arc<Acquisition>,
    irf: Arc<Irf>,
    groups: Vec<DecayGroup>,
    t0_parameter: FittingParameter,
    reference_parameter: FittingParameter,

    inc: IncMatrix,
    n_linear: usize,
    n_nonlinear: usize,
    n_group_nonlinear: usize,
    initialised: bool,

    current_t0: f64,
    current_ref: f64,
}

impl DecayModel {
    pub fn new(acq: Arc<Acquisition>, irf: Arc<Irf>) -> Result<Self, FitError> {
        if irf.n_chan() != acq.n_chan {
            return Err(FitError::config(format!(
                "IRF has {} channels but the acquisition has {}.",
                irf.n_chan(),
                acq.n_chan
            )));
        }
        Ok(Self {
            acq,
            irf,
            groups: Vec::new(),
            t0_parameter: FittingParameter::fixed("t0", 0.0),
            reference_parameter: FittingParameter::fixed("tau_ref", 0.0),
            inc: IncMatrix::default(),
            n_linear: 0,
            n_nonlinear: 0,
            n_group_nonlinear: 0,
            initialised: false,
            current_t0: 0.0,
            current_ref: 0.0,
        })
    }

    pub fn push_group(&mut self, group: impl Into<DecayGroup>) {
        self.groups.push(group.into());
        self.initialised = false;
    }

    pub fn t0_parameter_mut(&mut self) -> &mut FittingParameter {
        self.initialised = false;
        &mut self.t0_parameter
    }

    pub fn reference_parameter_mut(&mut self) -> &mut FittingParameter {
        self.initialised = false;
        &mut self.reference_parameter
    }

    pub fn acq(&self) -> &Arc<Acquisition> {
        &self.acq
    }

    pub fn irf(&self) -> &Arc<Irf> {
        &self.irf
    }

    pub fn n_meas(&self) -> usize {
        self.acq.n_meas()
    }

    pub fn n_linear(&self) -> usize {
        self.n_linear
    }

    pub fn n_nonlinear(&self) -> usize {
        self.n_nonlinear
    }

    pub fn inc(&self) -> &IncMatrix {
        &self.inc
    }

    /// Finalize the composition: count parameters and build the incidence
    /// structure. Must be called again whenever the set of free parameters
    /// changes.
    pub fn init(&mut self) -> Result<(), FitError> {
        if self.groups.is_empty() {
            return Err(FitError::config("Decay model has no decay groups."));
        }
        for group in &mut self.groups {
            group.attach(&self.irf, &self.acq)?;
        }

        self.n_linear = self.groups.iter().map(|g| g.n_linear()).sum();
        self.n_group_nonlinear = self.groups.iter().map(|g| g.n_nonlinear()).sum();
        self.n_nonlinear = self.n_group_nonlinear
            + usize::from(!self.t0_parameter.is_fixed())
            + usize::from(!self.reference_parameter.is_fixed());

        if self.n_nonlinear == 0 {
            return Err(FitError::config(
                "Decay model has no free nonlinear parameters.",
            ));
        }

        self.inc = IncMatrix::new(self.n_nonlinear, self.n_linear);
        let mut row = 0;
        let mut col = 0;
        for group in &self.groups {
            group.setup_inc_matrix(&mut self.inc, &mut row, &mut col);
        }
        // Model-level parameters shift or reshape every basis column.
        if !self.t0_parameter.is_fixed() {
            for j in 0..self.n_linear {
                self.inc.set(row, j);
            }
            row += 1;
        }
        if !self.reference_parameter.is_fixed() {
            for j in 0..self.n_linear {
                self.inc.set(row, j);
            }
        }

        self.initialised = true;
        Ok(())
    }

    /// Initial free-parameter vector, optionally re-seeding lifetimes from
    /// an estimated mean photon arrival time.
    pub fn initial_parameters(&mut self, mean_arrival: Option<f64>) -> Vec<f64> {
        if let Some(tau_mean) = mean_arrival {
            if tau_mean.is_finite() && tau_mean > 0.0 {
                for group in &mut self.groups {
                    group.seed_lifetimes(tau_mean);
                }
            }
        }
        let mut out = Vec::with_capacity(self.n_nonlinear);
        for group in &self.groups {
            group.initial_free_values(&mut out);
        }
        if !self.t0_parameter.is_fixed() {
            out.push(self.t0_parameter.clamped_initial());
        }
        if !self.reference_parameter.is_fixed() {
            out.push(self.reference_parameter.clamped_initial());
        }
        out
    }

    fn model_level_values(&self, alf: &[f64]) -> (f64, f64) {
        let mut idx = self.n_group_nonlinear;
        let t0 = if self.t0_parameter.is_fixed() {
            self.t0_parameter.initial_value
        } else {
            let v = alf[idx];
            idx += 1;
            v
        };
        let reference = if self.reference_parameter.is_fixed() {
            self.reference_parameter.initial_value
        } else {
            alf[idx]
        };
        (t0, reference)
    }

    fn fill_a(
        &mut self,
        alf: &[f64],
        ctx: &EvalContext,
        a: &mut [f64],
        adim: usize,
        kap: &mut f64,
    ) {
        a[..adim * self.n_linear].fill(0.0);
        let mut used = 0;
        let mut col = 0;
        for group in &mut self.groups {
            used += group.set_variables(&alf[used..], ctx);
            col += group.calculate_model(&mut a[col * adim..], adim, kap);
        }
    }

    /// Evaluate the design matrix `a` and, when `derivatives` is set, the
    /// derivative block `b` and the constraint penalty vector `kap`
    /// (`kap[0]` is the penalty value, `kap[1 + k]` its derivative with
    /// respect to nonlinear parameter `k`).
    #[allow(clippy::too_many_arguments)]
    pub fn calculate_model(
        &mut self,
        a: &mut [f64],
        adim: usize,
        b: &mut [f64],
        bdim: usize,
        kap: &mut [f64],
        alf: &[f64],
        irf_idx: PixelIndex,
        derivatives: bool,
    ) -> Result<(), FitError> {
        if !self.initialised {
            return Err(FitError::not_initialised());
        }
        if alf.len() != self.n_nonlinear {
            return Err(FitError::config(format!(
                "Expected {} nonlinear parameters, got {}.",
                self.n_nonlinear,
                alf.len()
            )));
        }

        let (t0, reference) = self.model_level_values(alf);
        self.current_t0 = t0;
        self.current_ref = reference;
        let ctx = EvalContext {
            irf_idx,
            t0_shift: t0,
            ref_lifetime: reference,
        };

        kap.fill(0.0);
        let mut kap_value = 0.0;
        self.fill_a(alf, &ctx, a, adim, &mut kap_value);
        kap[0] = kap_value;

        if !derivatives {
            return Ok(());
        }

        b[..bdim * self.inc.n_derivative_columns()].fill(0.0);
        let mut col = 0;
        let mut row = 0;
        for gi in 0..self.groups.len() {
            let g_nl = self.groups[gi].n_nonlinear();
            let kap_derv = &mut kap[1 + row..1 + row + g_nl];
            col += self.groups[gi].calculate_derivatives(&mut b[col * bdim..], bdim, kap_derv);
            row += g_nl;
        }

        // Model-level parameters reshape every column at once; their
        // derivative columns come from a central difference of the full
        // design matrix.
        let n_meas = self.n_meas();
        if !self.t0_parameter.is_fixed() {
            let eps = self.acq.timebin_width * 1e-3;
            let mut hi = vec![0.0; n_meas * self.n_linear];
            let mut lo = vec![0.0; n_meas * self.n_linear];
            let mut scratch_kap = 0.0;
            let ctx_hi = EvalContext {
                t0_shift: t0 + eps,
                ..ctx
            };
            let ctx_lo = EvalContext {
                t0_shift: t0 - eps,
                ..ctx
            };
            self.fill_a(alf, &ctx_hi, &mut hi, n_meas, &mut scratch_kap);
            self.fill_a(alf, &ctx_lo, &mut lo, n_meas, &mut scratch_kap);
            for j in 0..self.n_linear {
                let off = col * bdim;
                for t in 0..n_meas {
                    b[off + t] = (hi[j * n_meas + t] - lo[j * n_meas + t]) / (2.0 * eps);
                }
                col += 1;
            }
            // Restore the convolution caches to the nominal point.
            self.fill_a(alf, &ctx, &mut hi, n_meas, &mut scratch_kap);
        }
        if !self.reference_parameter.is_fixed() {
            let eps = (reference.abs() * 1e-4).max(1e-6);
            let mut hi = vec![0.0; n_meas * self.n_linear];
            let mut lo = vec![0.0; n_meas * self.n_linear];
            let mut scratch_kap = 0.0;
            let ctx_hi = EvalContext {
                ref_lifetime: reference + eps,
                ..ctx
            };
            let ctx_lo = EvalContext {
                ref_lifetime: reference - eps,
                ..ctx
            };
            self.fill_a(alf, &ctx_hi, &mut hi, n_meas, &mut scratch_kap);
            self.fill_a(alf, &ctx_lo, &mut lo, n_meas, &mut scratch_kap);
            for j in 0..self.n_linear {
                let off = col * bdim;
                for t in 0..n_meas {
                    b[off + t] = (hi[j * n_meas + t] - lo[j * n_meas + t]) / (2.0 * eps);
                }
                col += 1;
            }
            self.fill_a(alf, &ctx, &mut hi, n_meas, &mut scratch_kap);
        }

        Ok(())
    }

    /// Map raw per-pixel linear coefficients to physically meaningful
    /// outputs (total intensity and fractional contributions).
    pub fn normalise_linear_params(&self, lin: &[f64]) -> Vec<f64> {
        let mut out = Vec::new();
        let mut used = 0;
        for group in &self.groups {
            used += group.normalise_linear(&lin[used..], &mut out);
        }
        out
    }

    /// Inverse of [`Self::normalise_linear_params`].
    pub fn denormalise_linear_params(&self, norm: &[f64]) -> Vec<f64> {
        let mut out = Vec::new();
        let mut used = 0;
        for group in &self.groups {
            used += group.denormalise_linear(&norm[used..], &mut out);
        }
        out
    }

    pub fn nonlinear_output_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for group in &self.groups {
            group.nonlinear_output_names(&mut names);
        }
        if !self.t0_parameter.is_fixed() {
            names.push(self.t0_parameter.name.clone());
        }
        if !self.reference_parameter.is_fixed() {
            names.push(self.reference_parameter.name.clone());
        }
        names
    }

    /// Current nonlinear outputs, valid after the last `calculate_model`.
    pub fn get_nonlinear_outputs(&self) -> Vec<f64> {
        let mut out = Vec::new();
        for group in &self.groups {
            group.get_nonlinear_outputs(&mut out);
        }
        if !self.t0_parameter.is_fixed() {
            out.push(self.current_t0);
        }
        if !self.reference_parameter.is_fixed() {
            out.push(self.current_ref);
        }
        out
    }

    pub fn linear_output_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        for group in &self.groups {
            group.linear_output_names(&mut names);
        }
        names
    }
}

impl DecayGroup {
    /// Re-seed free lifetime initial values from an estimated mean arrival
    /// time, spreading components around it in decreasing order.
    pub(crate) fn seed_lifetimes(&mut self, tau_mean: f64) {
        match self {
            DecayGroup::MultiExponential(g) => {
                let n = g.n_exponential();
                for i in 0..n {
                    let p = g.tau_parameter_mut(i);
                    if !p.is_fixed() {
                        p.initial_value = tau_mean * 2.0 * (n - i) as f64 / (n + 1) as f64;
                    }
                }
            }
            DecayGroup::Fret(_) | DecayGroup::Pattern(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::multi_exponential::MultiExponentialGroup;
    use crate::model::pattern::{Pattern, PatternGroup};

    fn delta_irf(n_t: usize, n_chan: usize) -> Arc<Irf> {
        let mut samples = vec![0.0; n_t * n_chan];
        for c in 0..n_chan {
            samples[c * n_t] = 1.0;
        }
        Arc::new(Irf::from_histogram(n_t, n_chan, 0.0, 0.04, &samples).unwrap())
    }

    fn simple_model(n_exp: usize, global: bool) -> DecayModel {
        let acq = Arc::new(Acquisition::new(64, 0.0, 0.04, 1).unwrap());
        let mut model = DecayModel::new(Arc::clone(&acq), delta_irf(64, 1)).unwrap();
        model.push_group(MultiExponentialGroup::new(n_exp, global));
        model
    }

    #[test]
    fn init_requires_groups_and_free_parameters() {
        let acq = Arc::new(Acquisition::new(64, 0.0, 0.04, 1).unwrap());
        let mut empty = DecayModel::new(Arc::clone(&acq), delta_irf(64, 1)).unwrap();
        assert!(empty.init().is_err());

        let mut frozen = simple_model(1, false);
        if let DecayGroup::MultiExponential(g) = &mut frozen.groups[0] {
            g.tau_parameter_mut(0).fixed = true;
        }
        assert!(frozen.init().is_err());
    }

    #[test]
    fn channel_count_mismatch_is_rejected() {
        let acq = Arc::new(Acquisition::new(64, 0.0, 0.04, 2).unwrap());
        assert!(DecayModel::new(acq, delta_irf(64, 1)).is_err());
    }

    #[test]
    fn alf_length_matches_free_parameter_count() {
        let mut model = simple_model(2, false);
        model.init().unwrap();
        assert_eq!(model.n_nonlinear(), 2);
        assert_eq!(model.n_linear(), 2);

        let mut a = vec![0.0; 64 * 2];
        let mut b = vec![0.0; 64 * 2];
        let mut kap = vec![0.0; 3];
        let err = model
            .calculate_model(
                &mut a,
                64,
                &mut b,
                64,
                &mut kap,
                &[2.0],
                PixelIndex::default(),
                false,
            )
            .unwrap_err();
        assert_eq!(err.code(), crate::error::CODE_CONFIG);
    }

    #[test]
    fn delta_irf_model_reduces_to_sampled_exponentials() {
        let mut model = simple_model(2, false);
        model.init().unwrap();

        let mut a = vec![0.0; 64 * 2];
        let mut b = vec![0.0; 64 * 2];
        let mut kap = vec![0.0; 3];
        model
            .calculate_model(
                &mut a,
                64,
                &mut b,
                64,
                &mut kap,
                &[2.0, 0.5],
                PixelIndex::default(),
                true,
            )
            .unwrap();

        let acq = Acquisition::new(64, 0.0, 0.04, 1).unwrap();
        for (j, t) in acq.timepoints().iter().enumerate() {
            assert!((a[j] - (-t / 2.0).exp()).abs() < 1e-12);
            assert!((a[64 + j] - (-t / 0.5).exp()).abs() < 1e-12);
        }
    }

    #[test]
    fn inc_matrix_spans_groups_and_model_parameters() {
        let acq = Arc::new(Acquisition::new(32, 0.0, 0.04, 1).unwrap());
        let mut model = DecayModel::new(Arc::clone(&acq), delta_irf(32, 1)).unwrap();
        model.push_group(MultiExponentialGroup::new(2, false));
        model.push_group(PatternGroup::new(vec![Pattern::from_params(&[1.0, 1.0, 0.0]).unwrap()]).unwrap());
        *model.t0_parameter_mut() = FittingParameter::free("t0", 0.0, -1.0, 1.0);
        model.init().unwrap();

        // 2 free taus + t0; 2 exponential columns + 1 pattern column.
        assert_eq!(model.n_nonlinear(), 3);
        assert_eq!(model.n_linear(), 3);

        let inc = model.inc();
        assert!(inc.get(0, 0) && !inc.get(0, 1) && !inc.get(0, 2));
        assert!(!inc.get(1, 0) && inc.get(1, 1) && !inc.get(1, 2));
        // t0 touches every column.
        assert!(inc.get(2, 0) && inc.get(2, 1) && inc.get(2, 2));
    }

    #[test]
    fn t0_derivative_matches_finite_difference() {
        let mut model = simple_model(1, false);
        *model.t0_parameter_mut() = FittingParameter::free("t0", 0.0, -1.0, 1.0);
        model.init().unwrap();

        let alf = [2.0, 0.1];
        let mut a = vec![0.0; 64];
        let mut b = vec![0.0; 64 * 2];
        let mut kap = vec![0.0; 3];
        model
            .calculate_model(&mut a, 64, &mut b, 64, &mut kap, &alf, PixelIndex::default(), true)
            .unwrap();

        let eval = |t0: f64| -> Vec<f64> {
            let mut m = simple_model(1, false);
            *m.t0_parameter_mut() = FittingParameter::free("t0", 0.0, -1.0, 1.0);
            m.init().unwrap();
            let mut a = vec![0.0; 64];
            let mut b2 = vec![0.0; 64 * 2];
            let mut k = vec![0.0; 3];
            m.calculate_model(&mut a, 64, &mut b2, 64, &mut k, &[2.0, t0], PixelIndex::default(), false)
                .unwrap();
            a
        };
        let eps = 1e-5;
        let hi = eval(0.1 + eps);
        let lo = eval(0.1 - eps);
        // Away from the histogram edges the FD column should agree.
        for t in 8..56 {
            let fd = (hi[t] - lo[t]) / (2.0 * eps);
            let an = b[64 + t];
            assert!(
                (fd - an).abs() < 1e-3 * (1.0 + an.abs()),
                "bin {t}: analytic {an} vs fd {fd}"
            );
        }
    }

    #[test]
    fn normalised_fractions_sum_to_one() {
        let mut model = simple_model(3, false);
        model.init().unwrap();

        let lin = [30.0, 50.0, 20.0];
        let norm = model.normalise_linear_params(&lin);
        assert_eq!(norm.len(), 4);
        assert!((norm[0] - 100.0).abs() < 1e-12);
        let frac_sum: f64 = norm[1..].iter().sum();
        assert!((frac_sum - 1.0).abs() < 1e-9);
        assert!(norm[1..].iter().all(|&f| f >= 0.0));

        let back = model.denormalise_linear_params(&norm);
        for (a, b) in lin.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1e-9);
        }
    }
}
