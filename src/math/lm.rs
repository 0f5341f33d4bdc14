//! Levenberg-Marquardt driver for the outer nonlinear loop.
//!
//! Minimizes `0.5 * ||r(x)||^2` where the caller supplies residuals and the
//! Jacobian at each iterate (for variable projection these are the reduced
//! residual and projected Jacobian). Damping follows Nielsen's update: the
//! gain ratio of actual to predicted reduction drives acceptance, shrinking
//! the damping smoothly on good steps and growing it geometrically on
//! rejected ones.
//!
//! Cancellation is cooperative: the token is polled once per outer
//! iteration, so an in-flight fit unwinds at iteration granularity.

use nalgebra::{DMatrix, DVector};
use tracing::trace;

use crate::domain::{CancellationToken, FitOutcome};

/// Tuning knobs for the trust-region loop.
#[derive(Debug, Clone)]
pub struct LmOptions {
    pub max_iterations: usize,
    /// Relative cost-change and step-size tolerance.
    pub tolerance: f64,
    /// Infinity-norm gradient threshold for convergence.
    pub gradient_tolerance: f64,
    /// Initial damping as a fraction of `max diag(J^T J)`.
    pub initial_damping: f64,
}

impl Default for LmOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-8,
            gradient_tolerance: 1e-10,
            initial_damping: 1e-3,
        }
    }
}

/// Outcome of one optimization run.
#[derive(Debug, Clone)]
pub struct LmReport {
    pub outcome: FitOutcome,
    pub iterations: usize,
    /// Final cost `0.5 * ||r||^2`.
    pub cost: f64,
}

/// An evaluation of the least-squares system at one iterate.
pub struct LmEval {
    pub residual: DVector<f64>,
    pub jacobian: DMatrix<f64>,
}

/// Run the optimizer from `x0`.
///
/// `eval` returns `None` when the model cannot be evaluated at a trial
/// point (non-finite shapes, failed factorization); a failed evaluation at
/// the start aborts the fit, while a failed trial step is treated as a
/// rejected step.
pub fn levenberg_marquardt<F>(
    mut eval: F,
    x0: DVector<f64>,
    opts: &LmOptions,
    cancel: &CancellationToken,
) -> (DVector<f64>, LmReport)
where
    F: FnMut(&DVector<f64>) -> Option<LmEval>,
{
    let mut x = x0;
    let n = x.len();

    let Some(mut current) = eval(&x) else {
        return (
            x,
            LmReport {
                outcome: FitOutcome::Failed,
                iterations: 0,
                cost: f64::INFINITY,
            },
        );
    };
    let mut cost = 0.5 * current.residual.norm_squared();

    let mut hessian = current.jacobian.tr_mul(&current.jacobian);
    let max_diag = (0..n).map(|i| hessian[(i, i)]).fold(0.0, f64::max);
    let mut mu = opts.initial_damping * max_diag.max(f64::MIN_POSITIVE);
    let mut nu = 2.0;

    let mut outcome = FitOutcome::MaxIterations;
    let mut iterations = 0;

    for iter in 0..opts.max_iterations {
        iterations = iter + 1;

        if cancel.is_cancelled() {
            outcome = FitOutcome::Terminated;
            break;
        }

        // g = J^T r; we step by solving (H + mu I) delta = -g.
        let gradient = current.jacobian.tr_mul(&current.residual);
        if gradient.amax() <= opts.gradient_tolerance {
            outcome = FitOutcome::Converged;
            break;
        }

        let mut damped = hessian.clone();
        for i in 0..n {
            damped[(i, i)] += mu;
        }

        let delta = match nalgebra::Cholesky::new(damped) {
            Some(chol) => -chol.solve(&gradient),
            None => {
                // Indefinite despite damping; grow mu and retry next round.
                mu *= nu;
                nu *= 2.0;
                continue;
            }
        };

        if !delta.iter().all(|v| v.is_finite()) {
            outcome = FitOutcome::Failed;
            break;
        }

        if delta.norm() <= opts.tolerance * (x.norm() + opts.tolerance) {
            outcome = FitOutcome::Converged;
            break;
        }

        let x_new = &x + &delta;
        let accepted = match eval(&x_new) {
            Some(trial) => {
                let trial_cost = 0.5 * trial.residual.norm_squared();
                // Nielsen gain ratio: actual reduction over the reduction
                // the quadratic model predicts for this step.
                let predicted = 0.5 * delta.dot(&(&delta * mu - &gradient));
                let rho = if predicted > 0.0 {
                    (cost - trial_cost) / predicted
                } else {
                    -1.0
                };

                if rho > 0.0 && trial_cost.is_finite() {
                    let cost_change = (cost - trial_cost).abs();
                    x = x_new;
                    current = trial;
                    cost = trial_cost;
                    hessian = current.jacobian.tr_mul(&current.jacobian);

                    let shrink: f64 = 1.0 - (2.0 * rho - 1.0).powi(3);
                    mu *= shrink.max(1.0 / 3.0);
                    nu = 2.0;

                    trace!(iter, cost, rho, "accepted step");

                    if cost_change <= opts.tolerance * cost.max(opts.tolerance) {
                        outcome = FitOutcome::Converged;
                        break;
                    }
                    true
                } else {
                    false
                }
            }
            None => false,
        };

        if !accepted {
            mu *= nu;
            nu *= 2.0;
            trace!(iter, "rejected step");
            if !mu.is_finite() {
                outcome = FitOutcome::Failed;
                break;
            }
        }
    }

    (
        x,
        LmReport {
            outcome,
            iterations,
            cost,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Residuals for fitting y = exp(-k t) to samples of exp(-2 t).
    fn exp_problem(x: &DVector<f64>) -> Option<LmEval> {
        let k = x[0];
        let ts: Vec<f64> = (0..20).map(|i| i as f64 * 0.1).collect();
        let mut r = DVector::zeros(ts.len());
        let mut j = DMatrix::zeros(ts.len(), 1);
        for (i, &t) in ts.iter().enumerate() {
            let model = (-k * t).exp();
            r[i] = model - (-2.0 * t).exp();
            j[(i, 0)] = -t * model;
        }
        Some(LmEval {
            residual: r,
            jacobian: j,
        })
    }

    #[test]
    fn recovers_exponential_rate() {
        let cancel = CancellationToken::new();
        let (x, report) = levenberg_marquardt(
            exp_problem,
            DVector::from_row_slice(&[0.5]),
            &LmOptions::default(),
            &cancel,
        );
        assert_eq!(report.outcome, FitOutcome::Converged);
        assert!((x[0] - 2.0).abs() < 1e-6, "k = {}", x[0]);
        assert!(report.cost < 1e-12);
    }

    #[test]
    fn cancelled_fit_reports_terminated() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (_, report) = levenberg_marquardt(
            exp_problem,
            DVector::from_row_slice(&[0.5]),
            &LmOptions::default(),
            &cancel,
        );
        assert_eq!(report.outcome, FitOutcome::Terminated);
    }

    #[test]
    fn unevaluable_start_reports_failed() {
        let cancel = CancellationToken::new();
        let (_, report) = levenberg_marquardt(
            |_| None,
            DVector::from_row_slice(&[0.5]),
            &LmOptions::default(),
            &cancel,
        );
        assert_eq!(report.outcome, FitOutcome::Failed);
    }
}
