//! Smooth constraint penalties accumulated into the fit residual.
//!
//! Hard constraints (parameter bounds, lifetime ordering) are enforced
//! softly: each violated constraint contributes a steeply growing penalty
//! value and derivative, appended to the residual vector as one extra row.
//! Inside the feasible set the penalty is exactly zero, so a converged fit
//! that respects its constraints is unaffected by them.

/// Steepness of the penalty walls, in inverse parameter units.
const STEEPNESS: f64 = 100.0;

/// Penalty for `x` exceeding `limit` (zero when `x <= limit`).
pub fn upper_penalty(x: f64, limit: f64) -> f64 {
    if x > limit {
        let d = STEEPNESS * (x - limit);
        d * d
    } else {
        0.0
    }
}

/// Derivative of [`upper_penalty`] with respect to `x`.
pub fn upper_penalty_derivative(x: f64, limit: f64) -> f64 {
    if x > limit {
        2.0 * STEEPNESS * STEEPNESS * (x - limit)
    } else {
        0.0
    }
}

/// Penalty for `x` falling below `limit` (zero when `x >= limit`).
pub fn lower_penalty(x: f64, limit: f64) -> f64 {
    if x < limit {
        let d = STEEPNESS * (limit - x);
        d * d
    } else {
        0.0
    }
}

/// Derivative of [`lower_penalty`] with respect to `x`.
pub fn lower_penalty_derivative(x: f64, limit: f64) -> f64 {
    if x < limit {
        -2.0 * STEEPNESS * STEEPNESS * (limit - x)
    } else {
        0.0
    }
}

/// Penalty keeping `a` below `b`, used to hold lifetimes in declared order.
pub fn ordering_penalty(a: f64, b: f64) -> f64 {
    upper_penalty(a, b)
}

/// Derivative of [`ordering_penalty`] with respect to `a`; the derivative
/// with respect to `b` is its negation.
pub fn ordering_penalty_derivative(a: f64, b: f64) -> f64 {
    upper_penalty_derivative(a, b)
}

/// Penalty for `x` outside `[lower, upper]`.
pub fn bound_penalty(x: f64, lower: f64, upper: f64) -> f64 {
    lower_penalty(x, lower) + upper_penalty(x, upper)
}

/// Derivative of [`bound_penalty`] with respect to `x`.
pub fn bound_penalty_derivative(x: f64, lower: f64, upper: f64) -> f64 {
    lower_penalty_derivative(x, lower) + upper_penalty_derivative(x, upper)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn penalty_is_zero_inside_bounds() {
        assert_eq!(bound_penalty(0.5, 0.0, 1.0), 0.0);
        assert_eq!(bound_penalty_derivative(0.5, 0.0, 1.0), 0.0);
        assert_eq!(ordering_penalty(1.0, 2.0), 0.0);
    }

    #[test]
    fn penalty_grows_with_violation() {
        let near = bound_penalty(1.1, 0.0, 1.0);
        let far = bound_penalty(1.5, 0.0, 1.0);
        assert!(near > 0.0);
        assert!(far > near);
    }

    #[test]
    fn derivatives_match_finite_differences() {
        let eps = 1e-7;
        for x in [-0.3, 0.2, 1.4] {
            let fd = (bound_penalty(x + eps, 0.0, 1.0) - bound_penalty(x - eps, 0.0, 1.0))
                / (2.0 * eps);
            let an = bound_penalty_derivative(x, 0.0, 1.0);
            assert!((fd - an).abs() < 1e-2 * (1.0 + an.abs()), "x={x}: {an} vs {fd}");
        }
    }
}
