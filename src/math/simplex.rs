//! Stick-breaking transform between unconstrained optimizer variables and
//! amplitude fractions.
//!
//! `n` fractions are parameterized by `n - 1` variables in `[0, 1]`:
//!
//! ```text
//! beta_i = x_i * prod_{j<i} (1 - x_j)      for i < n-1
//! beta_{n-1} = prod_j (1 - x_j)
//! ```
//!
//! The fractions sum to 1 exactly by construction, and are non-negative
//! whenever the variables stay inside the unit interval; the optimizer is
//! kept there by the bound penalty, with a hard clamp as backstop.

/// Map `n - 1` simplex variables to `n` fractions summing to one.
///
/// `beta` must have length `x.len() + 1`.
pub fn fractions_from_variables(x: &[f64], beta: &mut [f64]) {
    debug_assert_eq!(beta.len(), x.len() + 1);
    let mut rem = 1.0;
    for (i, &xi) in x.iter().enumerate() {
        let xi = xi.clamp(0.0, 1.0);
        beta[i] = xi * rem;
        rem *= 1.0 - xi;
    }
    beta[x.len()] = rem;
}

/// Invert the transform: recover the `n - 1` variables reproducing `beta`.
///
/// `beta` is normalized internally, so any non-negative vector with a
/// positive sum is accepted.
pub fn variables_from_fractions(beta: &[f64]) -> Vec<f64> {
    let sum: f64 = beta.iter().sum();
    let mut rem = 1.0;
    let mut x = Vec::with_capacity(beta.len().saturating_sub(1));
    for &b in &beta[..beta.len().saturating_sub(1)] {
        let f = if sum > 0.0 { b / sum } else { 0.0 };
        let xi = if rem > 1e-300 { f / rem } else { 0.0 };
        x.push(xi.clamp(0.0, 1.0));
        rem -= f;
    }
    x
}

/// Partial derivative of fraction `i` with respect to variable `j`.
pub fn fraction_derivative(x: &[f64], i: usize, j: usize) -> f64 {
    let n = x.len() + 1;
    debug_assert!(i < n && j < n - 1);

    if i < n - 1 && j > i {
        return 0.0;
    }

    let mut d = if i == n - 1 || j < i { -1.0 } else { 1.0 };
    for (k, &xk) in x.iter().enumerate() {
        let xk = xk.clamp(0.0, 1.0);
        if i < n - 1 && k >= i {
            break;
        }
        if k != j {
            d *= 1.0 - xk;
        }
    }
    if i < n - 1 && j < i {
        d *= x[i].clamp(0.0, 1.0);
    }
    d
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fractions(x: &[f64]) -> Vec<f64> {
        let mut beta = vec![0.0; x.len() + 1];
        fractions_from_variables(x, &mut beta);
        beta
    }

    #[test]
    fn fractions_sum_to_one() {
        for x in [vec![0.3], vec![0.2, 0.7], vec![0.9, 0.1, 0.5, 0.25]] {
            let beta = fractions(&x);
            let sum: f64 = beta.iter().sum();
            assert!((sum - 1.0).abs() < 1e-12);
            assert!(beta.iter().all(|&b| b >= 0.0));
        }
    }

    #[test]
    fn out_of_range_variables_are_clamped() {
        let beta = fractions(&[1.7, -0.3]);
        assert!((beta[0] - 1.0).abs() < 1e-12);
        assert!(beta.iter().all(|&b| (0.0..=1.0).contains(&b)));
        let sum: f64 = beta.iter().sum();
        assert!((sum - 1.0).abs() < 1e-12);
    }

    #[test]
    fn inversion_round_trips() {
        let beta = [0.5, 0.3, 0.2];
        let x = variables_from_fractions(&beta);
        let back = fractions(&x);
        for (a, b) in beta.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn derivatives_match_finite_differences() {
        let x = [0.4, 0.3, 0.6];
        let n = x.len() + 1;
        let eps = 1e-7;
        for j in 0..x.len() {
            let mut hi = x;
            let mut lo = x;
            hi[j] += eps;
            lo[j] -= eps;
            let bh = fractions(&hi);
            let bl = fractions(&lo);
            for i in 0..n {
                let fd = (bh[i] - bl[i]) / (2.0 * eps);
                let an = fraction_derivative(&x, i, j);
                assert!(
                    (fd - an).abs() < 1e-6,
                    "d beta[{i}]/d x[{j}]: analytic {an} vs fd {fd}"
                );
            }
        }
    }
}
