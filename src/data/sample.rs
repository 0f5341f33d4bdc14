//! Synthetic decay generation for tests and benchmarks.
//!
//! Ground-truth multi-exponential decays are convolved with the supplied
//! instrument response, scaled to a target photon count and degraded with
//! Poisson counting noise. Generation is seeded and fully deterministic.

use std::sync::Arc;

use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::Poisson;

use crate::data::image_set::Image;
use crate::domain::{Acquisition, PixelIndex};
use crate::error::FitError;
use crate::irf::{Convolver, Irf};

/// Settings for one synthetic image.
#[derive(Debug, Clone)]
pub struct SyntheticSettings {
    /// Ground-truth components as `(tau, beta)` pairs.
    pub components: Vec<(f64, f64)>,
    /// Expected total photon count per pixel.
    pub total_counts: f64,
    pub n_px: usize,
    pub seed: u64,
    /// Constant background level added per time bin, in counts.
    pub background: f64,
}

impl SyntheticSettings {
    pub fn single_exponential(tau: f64, total_counts: f64, n_px: usize, seed: u64) -> Self {
        Self {
            components: vec![(tau, 1.0)],
            total_counts,
            n_px,
            seed,
            background: 0.0,
        }
    }
}

/// Noise-free decay shape: the beta-weighted sum of IRF-convolved
/// exponentials, normalized to unit area.
pub fn decay_shape(
    acq: &Arc<Acquisition>,
    irf: &Arc<Irf>,
    components: &[(f64, f64)],
) -> Result<Vec<f64>, FitError> {
    if components.is_empty() {
        return Err(FitError::config("Synthetic decay needs at least one component."));
    }
    for &(tau, beta) in components {
        if !(tau.is_finite() && tau > 0.0) {
            return Err(FitError::config(format!("Invalid component lifetime {tau}.")));
        }
        if !(beta.is_finite() && beta >= 0.0) {
            return Err(FitError::config(format!("Invalid component amplitude {beta}.")));
        }
    }

    let n = acq.n_meas();
    let channel_factors = vec![1.0; acq.n_chan];
    let mut shape = vec![0.0; n];
    let mut conv = Convolver::new(Arc::clone(irf), Arc::clone(acq));
    for &(tau, beta) in components {
        conv.compute(1.0 / tau, PixelIndex::default(), 0.0);
        conv.add_decay(beta, &channel_factors, 0.0, &mut shape);
    }

    let total: f64 = shape.iter().sum();
    if total <= 0.0 {
        return Err(FitError::numeric("Synthetic decay shape has no intensity."));
    }
    for v in &mut shape {
        *v /= total;
    }
    Ok(shape)
}

/// Draw one Poisson-noised decay curve from a unit-area shape.
pub fn poisson_decay(
    shape: &[f64],
    total_counts: f64,
    background: f64,
    rng: &mut StdRng,
) -> Vec<f64> {
    shape
        .iter()
        .map(|&s| {
            let mean = s * total_counts + background;
            if mean > 0.0 {
                let poisson = Poisson::new(mean).expect("positive mean");
                poisson.sample(rng)
            } else {
                0.0
            }
        })
        .collect()
}

/// Generate one image of independent noisy pixels, all masked into
/// region 1.
pub fn generate_image(
    acq: &Arc<Acquisition>,
    irf: &Arc<Irf>,
    settings: &SyntheticSettings,
) -> Result<Image, FitError> {
    if settings.n_px == 0 {
        return Err(FitError::config("Synthetic image needs at least one pixel."));
    }
    if !(settings.total_counts.is_finite() && settings.total_counts > 0.0) {
        return Err(FitError::config(format!(
            "Invalid total count target {}.",
            settings.total_counts
        )));
    }

    let shape = decay_shape(acq, irf, &settings.components)?;
    let mut rng = StdRng::seed_from_u64(settings.seed);

    let n_meas = acq.n_meas();
    let mut decays = Vec::with_capacity(settings.n_px * n_meas);
    for _ in 0..settings.n_px {
        decays.extend(poisson_decay(
            &shape,
            settings.total_counts,
            settings.background,
            &mut rng,
        ));
    }

    Image::new(settings.n_px, n_meas, decays, vec![1; settings.n_px])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{FitData, ImageSet, RegionData};
    use crate::domain::CouplingMode;

    fn delta_irf(n_t: usize) -> Arc<Irf> {
        let mut samples = vec![0.0; n_t];
        samples[0] = 1.0;
        Arc::new(Irf::from_histogram(n_t, 1, 0.0, 0.04, &samples).unwrap())
    }

    fn region_of(acq: &Arc<Acquisition>, image: Image) -> RegionData {
        let set = ImageSet::new(Arc::clone(acq), vec![image], CouplingMode::Pixelwise).unwrap();
        let mut buf = RegionData::default();
        set.region_data(0, Some(0), 1, &mut buf).unwrap();
        buf
    }

    #[test]
    fn shape_is_normalised_and_decaying() {
        let acq = Arc::new(Acquisition::new(128, 0.0, 0.04, 1).unwrap());
        let shape = decay_shape(&acq, &delta_irf(128), &[(2.0, 0.7), (0.5, 0.3)]).unwrap();
        let total: f64 = shape.iter().sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert!(shape[0] > shape[64]);
        assert!(shape[64] > shape[127]);
    }

    #[test]
    fn generation_is_deterministic_for_a_seed() {
        let acq = Arc::new(Acquisition::new(64, 0.0, 0.04, 1).unwrap());
        let irf = delta_irf(64);
        let settings = SyntheticSettings::single_exponential(2.0, 5000.0, 3, 7);
        let a = region_of(&acq, generate_image(&acq, &irf, &settings).unwrap());
        let b = region_of(&acq, generate_image(&acq, &irf, &settings).unwrap());
        assert_eq!(a.decays, b.decays);
    }

    #[test]
    fn counts_land_near_the_target() {
        let acq = Arc::new(Acquisition::new(256, 0.0, 0.04, 1).unwrap());
        let irf = delta_irf(256);
        let settings = SyntheticSettings::single_exponential(2.0, 20_000.0, 1, 11);
        let buf = region_of(&acq, generate_image(&acq, &irf, &settings).unwrap());
        let total: f64 = buf.decays.iter().sum();
        assert!((total - 20_000.0).abs() < 1_000.0, "total = {total}");
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let acq = Arc::new(Acquisition::new(64, 0.0, 0.04, 1).unwrap());
        let irf = delta_irf(64);
        assert!(decay_shape(&acq, &irf, &[]).is_err());
        assert!(decay_shape(&acq, &irf, &[(-1.0, 1.0)]).is_err());
        let mut settings = SyntheticSettings::single_exponential(2.0, 1000.0, 1, 0);
        settings.n_px = 0;
        assert!(generate_image(&acq, &irf, &settings).is_err());
    }
}
