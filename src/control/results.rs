//! Aggregated fit results.
//!
//! One write-once slot per work unit (per region, or per pixel in
//! pixelwise mode). Workers own disjoint slot ranges, so writes never
//! contend; `OnceLock` makes the write-once discipline explicit and keeps
//! concurrent reads lock-free.

use std::sync::OnceLock;

use crate::fit::UnitResult;

pub struct FitResults {
    slots: Vec<OnceLock<UnitResult>>,
    nonlinear_names: Vec<String>,
    linear_names: Vec<String>,
}

impl FitResults {
    pub fn new(n_slots: usize, nonlinear_names: Vec<String>, linear_names: Vec<String>) -> Self {
        Self {
            slots: (0..n_slots).map(|_| OnceLock::new()).collect(),
            nonlinear_names,
            linear_names,
        }
    }

    pub fn n_slots(&self) -> usize {
        self.slots.len()
    }

    /// Store a unit result. Returns `false` when the slot was already
    /// written (which indicates a scheduling bug, not a data race).
    pub fn set(&self, slot: usize, result: UnitResult) -> bool {
        self.slots[slot].set(result).is_ok()
    }

    pub fn get(&self, slot: usize) -> Option<&UnitResult> {
        self.slots.get(slot).and_then(|s| s.get())
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<&UnitResult>> {
        self.slots.iter().map(|s| s.get())
    }

    pub fn completed_count(&self) -> usize {
        self.slots.iter().filter(|s| s.get().is_some()).count()
    }

    /// Names of the nonlinear output parameters, matching
    /// `UnitResult::nonlinear_outputs`.
    pub fn nonlinear_names(&self) -> &[String] {
        &self.nonlinear_names
    }

    /// Names of the normalized linear outputs, matching
    /// `UnitResult::norm_params`.
    pub fn linear_names(&self) -> &[String] {
        &self.linear_names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FitOutcome;

    fn dummy(region_index: usize) -> UnitResult {
        UnitResult {
            image: Some(0),
            label: 1,
            region_index,
            pixel: None,
            outcome: FitOutcome::Converged,
            iterations: 1,
            alf: vec![2.0],
            nonlinear_outputs: vec![2.0],
            lin_params: vec![vec![1.0]],
            norm_params: vec![vec![1.0]],
            residual_norm: 0.0,
            chi2: 1.0,
            conf_bounds: None,
        }
    }

    #[test]
    fn slots_are_write_once() {
        let results = FitResults::new(2, vec!["tau_1".into()], vec!["I".into()]);
        assert!(results.set(0, dummy(0)));
        assert!(!results.set(0, dummy(0)));
        assert_eq!(results.completed_count(), 1);
        assert_eq!(results.get(0).unwrap().region_index, 0);
        assert!(results.get(1).is_none());
    }
}
