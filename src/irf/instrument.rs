//! Instrument response function storage.
//!
//! Two interchangeable representations:
//!
//! - a measured histogram, padded and normalisation-checked at load time,
//!   with cubic-interpolated fractional time shifting
//! - a per-channel Gaussian parameter set evaluated in closed form by the
//!   Gaussian convolver
//!
//! The IRF is loaded once and shared read-only by every convolver for the
//! duration of a fit. Time-origin variation across frames or pixels is
//! stored here and resolved through [`Irf::t0_shift`].

use serde::{Deserialize, Serialize};

use crate::domain::PixelIndex;
use crate::error::FitError;

/// Maximum deviation of a measured channel histogram sum from 1.0.
const NORMALISATION_TOLERANCE: f64 = 0.1;

/// Gaussian instrument response for one channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GaussianParams {
    /// Centre of the Gaussian pulse.
    pub mu: f64,
    /// Pulse width (standard deviation).
    pub sigma: f64,
    /// Additional per-channel timing offset added to `mu`.
    pub offset: f64,
}

impl GaussianParams {
    pub fn new(mu: f64, sigma: f64, offset: f64) -> Self {
        Self { mu, sigma, offset }
    }
}

#[derive(Debug, Clone)]
pub enum IrfKind {
    Measured {
        /// Channel-major histogram, padded to an even per-channel length.
        histogram: Vec<f64>,
        /// Padded per-channel length.
        n_irf: usize,
        timebin_t0: f64,
        timebin_width: f64,
    },
    Gaussian {
        /// One parameter set per channel.
        params: Vec<GaussianParams>,
    },
}

/// The loaded instrument response shared by all convolvers.
#[derive(Debug, Clone)]
pub struct Irf {
    kind: IrfKind,
    n_chan: usize,
    g_factor: Vec<f64>,
    /// Per-image time-origin offsets (empty = none).
    frame_t0: Vec<f64>,
    /// Per-image, per-pixel time-origin offsets (empty = none).
    spatial_t0: Vec<Vec<f64>>,
}

impl Irf {
    /// Load a measured IRF histogram.
    ///
    /// `samples` is channel-major (`n_chan` blocks of `n_t` bins). Each
    /// channel must sum to 1 within the normalisation tolerance; the
    /// histogram is padded to an even per-channel length.
    pub fn from_histogram(
        n_t: usize,
        n_chan: usize,
        timebin_t0: f64,
        timebin_width: f64,
        samples: &[f64],
    ) -> Result<Self, FitError> {
        if n_t == 0 || n_chan == 0 {
            return Err(FitError::irf("IRF needs at least one bin and one channel."));
        }
        if samples.len() != n_t * n_chan {
            return Err(FitError::irf(format!(
                "IRF sample count {} does not match {} bins x {} channels.",
                samples.len(),
                n_t,
                n_chan
            )));
        }
        if !(timebin_width.is_finite() && timebin_width > 0.0) {
            return Err(FitError::irf(format!(
                "Invalid IRF time bin width: {timebin_width}."
            )));
        }
        for c in 0..n_chan {
            let sum: f64 = samples[c * n_t..(c + 1) * n_t].iter().sum();
            if (sum - 1.0).abs() > NORMALISATION_TOLERANCE {
                return Err(FitError::irf(format!(
                    "IRF is not correctly normalised: channel {c} sums to {sum:.4}."
                )));
            }
        }

        // Pad to an even per-channel length.
        let n_irf = n_t.div_ceil(2) * 2;
        let mut histogram = vec![0.0; n_irf * n_chan];
        for c in 0..n_chan {
            histogram[c * n_irf..c * n_irf + n_t].copy_from_slice(&samples[c * n_t..(c + 1) * n_t]);
        }

        Ok(Self {
            kind: IrfKind::Measured {
                histogram,
                n_irf,
                timebin_t0,
                timebin_width,
            },
            n_chan,
            g_factor: vec![1.0; n_chan],
            frame_t0: Vec::new(),
            spatial_t0: Vec::new(),
        })
    }

    /// Use a closed-form Gaussian IRF, one parameter set per channel.
    pub fn from_gaussian(params: Vec<GaussianParams>) -> Result<Self, FitError> {
        if params.is_empty() {
            return Err(FitError::irf("Gaussian IRF needs at least one channel."));
        }
        for (c, p) in params.iter().enumerate() {
            if !(p.sigma.is_finite() && p.sigma > 0.0) {
                return Err(FitError::irf(format!(
                    "Gaussian IRF channel {c} has invalid sigma {}.",
                    p.sigma
                )));
            }
        }
        let n_chan = params.len();
        Ok(Self {
            kind: IrfKind::Gaussian { params },
            n_chan,
            g_factor: vec![1.0; n_chan],
            frame_t0: Vec::new(),
            spatial_t0: Vec::new(),
        })
    }

    pub fn kind(&self) -> &IrfKind {
        &self.kind
    }

    pub fn n_chan(&self) -> usize {
        self.n_chan
    }

    pub fn is_gaussian(&self) -> bool {
        matches!(self.kind, IrfKind::Gaussian { .. })
    }

    /// Relative detector sensitivity per channel.
    pub fn g_factor(&self) -> &[f64] {
        &self.g_factor
    }

    pub fn set_g_factor(&mut self, g_factor: Vec<f64>) -> Result<(), FitError> {
        if g_factor.len() != self.n_chan {
            return Err(FitError::irf(format!(
                "g-factor length {} does not match {} channels.",
                g_factor.len(),
                self.n_chan
            )));
        }
        self.g_factor = g_factor;
        Ok(())
    }

    /// Per-frame time-origin offsets, indexed by image.
    pub fn set_frame_t0(&mut self, frame_t0: Vec<f64>) {
        self.frame_t0 = frame_t0;
    }

    /// Per-pixel time-origin offsets, one page per image.
    pub fn set_spatial_t0(&mut self, spatial_t0: Vec<Vec<f64>>) {
        self.spatial_t0 = spatial_t0;
    }

    pub fn is_spatially_variant(&self) -> bool {
        !self.frame_t0.is_empty() || !self.spatial_t0.is_empty()
    }

    /// Whether two pixels see the same effective instrument response.
    pub fn positions_equivalent(&self, a: PixelIndex, b: PixelIndex) -> bool {
        !self.is_spatially_variant() || self.t0_shift(a) == self.t0_shift(b)
    }

    /// Resolve the time-origin shift for a pixel.
    pub fn t0_shift(&self, idx: PixelIndex) -> f64 {
        let mut shift = 0.0;
        if let Some(&f) = self.frame_t0.get(idx.image) {
            shift += f;
        }
        if let Some(page) = self.spatial_t0.get(idx.image) {
            if let Some(&s) = page.get(idx.pixel) {
                shift += s;
            }
        }
        shift
    }

    /// The measured histogram, shifted by `shift` time units.
    ///
    /// Returns the stored histogram directly when no shift is needed,
    /// otherwise fills `storage` with the cubic-interpolated shift and
    /// returns that. Only meaningful for measured IRFs; a Gaussian IRF
    /// shifts analytically inside its convolver.
    pub fn shifted_histogram<'a>(&'a self, shift: f64, storage: &'a mut Vec<f64>) -> &'a [f64] {
        let IrfKind::Measured {
            histogram,
            n_irf,
            timebin_width,
            ..
        } = &self.kind
        else {
            return &[];
        };

        let n_irf = *n_irf;
        if shift == 0.0 || n_irf < 4 {
            return histogram;
        }

        storage.resize(histogram.len(), 0.0);

        // Fractional shift in bins; the integer part moves the read window,
        // the fractional part is interpolated. Shifts beyond the histogram
        // window are clamped so the interpolation stencil stays in bounds.
        let shift = -shift / timebin_width;
        let c_shift = shift.floor();
        let f_shift = shift - c_shift;
        let n = n_irf as i64;
        let c_shift = (c_shift as i64).clamp(-(n - 4), n);

        let start = (1 - c_shift).max(0).min(n - 1) as usize;
        let end = (n - c_shift - 3).min(n).max(1) as usize;

        for c in 0..self.n_chan {
            let offset = n_irf * c;
            for i in 0..start {
                storage[offset + i] = histogram[offset];
            }
            for i in start..end {
                let base = (i as i64 + c_shift - 1) as usize;
                storage[offset + i] =
                    cubic_interpolate(&histogram[offset + base..offset + base + 4], f_shift);
            }
            for i in end..n_irf {
                storage[offset + i] = histogram[offset + n_irf - 1];
            }
        }
        storage
    }
}

/// Catmull-Rom style cubic interpolation between `y[1]` and `y[2]`.
fn cubic_interpolate(y: &[f64], mu: f64) -> f64 {
    let mu2 = mu * mu;
    let a0 = -0.5 * y[0] + 1.5 * y[1] - 1.5 * y[2] + 0.5 * y[3];
    let a1 = y[0] - 2.5 * y[1] + 2.0 * y[2] - 0.5 * y[3];
    let a2 = -0.5 * y[0] + 0.5 * y[2];
    let a3 = y[1];

    a0 * mu * mu2 + a1 * mu2 + a2 * mu + a3
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta_samples(n_t: usize, peak: usize) -> Vec<f64> {
        let mut v = vec![0.0; n_t];
        v[peak] = 1.0;
        v
    }

    #[test]
    fn normalised_histogram_is_accepted() {
        let irf = Irf::from_histogram(8, 1, 0.0, 0.04, &delta_samples(8, 1)).unwrap();
        assert_eq!(irf.n_chan(), 1);
        assert!(!irf.is_gaussian());
    }

    #[test]
    fn half_normalised_histogram_is_rejected() {
        let mut samples = delta_samples(8, 1);
        samples[1] = 0.5;
        let err = Irf::from_histogram(8, 1, 0.0, 0.04, &samples).unwrap_err();
        assert_eq!(err.code(), crate::error::CODE_IRF);
    }

    #[test]
    fn histogram_is_padded_to_even_length() {
        let samples = delta_samples(7, 0);
        let irf = Irf::from_histogram(7, 1, 0.0, 0.04, &samples).unwrap();
        let IrfKind::Measured { n_irf, histogram, .. } = irf.kind() else {
            panic!("expected measured IRF");
        };
        assert_eq!(*n_irf, 8);
        assert_eq!(histogram.len(), 8);
        assert_eq!(histogram[7], 0.0);
    }

    #[test]
    fn t0_shift_combines_frame_and_spatial_offsets() {
        let mut irf = Irf::from_histogram(8, 1, 0.0, 0.04, &delta_samples(8, 1)).unwrap();
        assert!(!irf.is_spatially_variant());
        irf.set_frame_t0(vec![0.1, 0.2]);
        irf.set_spatial_t0(vec![vec![0.0, 0.01], vec![0.0, 0.0]]);
        assert!(irf.is_spatially_variant());
        let a = PixelIndex::new(0, 1);
        let b = PixelIndex::new(1, 0);
        assert!((irf.t0_shift(a) - 0.11).abs() < 1e-12);
        assert!((irf.t0_shift(b) - 0.2).abs() < 1e-12);
        assert!(!irf.positions_equivalent(a, b));
    }

    #[test]
    fn integer_bin_shift_moves_the_peak() {
        // A peak at bin 4 shifted by exactly +2 bins should land at bin 6.
        let n_t = 16;
        let samples = delta_samples(n_t, 4);
        let irf = Irf::from_histogram(n_t, 1, 0.0, 1.0, &samples).unwrap();
        let mut storage = Vec::new();
        let shifted = irf.shifted_histogram(2.0, &mut storage).to_vec();
        let peak = shifted
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 6);
    }

    #[test]
    fn gaussian_irf_requires_positive_sigma() {
        let err = Irf::from_gaussian(vec![GaussianParams::new(1.0, 0.0, 0.0)]).unwrap_err();
        assert_eq!(err.code(), crate::error::CODE_IRF);
        assert!(Irf::from_gaussian(vec![GaussianParams::new(1.0, 0.1, 0.0)]).is_ok());
    }
}
