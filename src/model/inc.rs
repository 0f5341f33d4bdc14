//! Incidence structure linking linear columns to nonlinear parameters.
//!
//! `inc(k, j) = 1` means linear column `j` of the design matrix depends on
//! nonlinear parameter `k`, so the model emits a derivative column for the
//! pair. The structure is built once per model configuration and read-only
//! afterwards; the variable projector uses it to touch only the Jacobian
//! blocks a parameter actually affects.
//!
//! Derivative columns are ordered parameter-major: for each nonlinear
//! parameter in sequence, one column per dependent linear column in
//! ascending order. Decay groups emit their derivative columns in exactly
//! this order.

#[derive(Debug, Clone, Default)]
pub struct IncMatrix {
    n_nonlinear: usize,
    n_linear: usize,
    flags: Vec<bool>,
}

impl IncMatrix {
    pub fn new(n_nonlinear: usize, n_linear: usize) -> Self {
        Self {
            n_nonlinear,
            n_linear,
            flags: vec![false; n_nonlinear * n_linear],
        }
    }

    pub fn n_nonlinear(&self) -> usize {
        self.n_nonlinear
    }

    pub fn n_linear(&self) -> usize {
        self.n_linear
    }

    pub fn set(&mut self, k: usize, j: usize) {
        self.flags[k * self.n_linear + j] = true;
    }

    pub fn get(&self, k: usize, j: usize) -> bool {
        self.flags[k * self.n_linear + j]
    }

    /// Number of derivative columns the model emits.
    pub fn n_derivative_columns(&self) -> usize {
        self.flags.iter().filter(|&&f| f).count()
    }

    /// Derivative columns in emission order: `(column index, k, j)`.
    pub fn columns(&self) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        self.flags
            .iter()
            .enumerate()
            .filter(|&(_, &f)| f)
            .enumerate()
            .map(|(col, (flat, _))| (col, flat / self.n_linear, flat % self.n_linear))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_enumeration_is_parameter_major() {
        let mut inc = IncMatrix::new(2, 3);
        inc.set(0, 1);
        inc.set(1, 0);
        inc.set(1, 2);

        let cols: Vec<_> = inc.columns().collect();
        assert_eq!(cols, vec![(0, 0, 1), (1, 1, 0), (2, 1, 2)]);
        assert_eq!(inc.n_derivative_columns(), 3);
    }
}
