//! Pull-based data source consumed by the fit controller.
//!
//! The core never owns image storage; it asks a [`FitData`] implementation
//! for one region's decay curves at a time, keyed by `(image, region
//! label)`. Passing `image = None` requests a region merged across all
//! images, which is how the global coupling mode sees the data.

use crate::domain::{Acquisition, PixelIndex};
use crate::error::FitError;

/// One unit of work: the decay curves of a single region.
#[derive(Debug, Clone, Default)]
pub struct RegionData {
    /// Source image, `None` for a cross-image (global) region.
    pub image: Option<usize>,
    /// Mask label this region was selected by.
    pub label: u16,
    /// Sequential region index as reported by [`FitData::region_index`].
    pub region_index: usize,
    pub n_px: usize,
    /// Pixel-major decay curves, `n_meas` samples each.
    pub decays: Vec<f64>,
    /// Source position of each pixel, for spatially-variant IRF lookups.
    pub pixels: Vec<PixelIndex>,
}

impl RegionData {
    pub fn clear(&mut self) {
        self.image = None;
        self.label = 0;
        self.region_index = 0;
        self.n_px = 0;
        self.decays.clear();
        self.pixels.clear();
    }

    pub fn decay(&self, px: usize, n_meas: usize) -> &[f64] {
        &self.decays[px * n_meas..(px + 1) * n_meas]
    }

    /// Average decay across the region's pixels.
    pub fn mean_decay(&self, n_meas: usize) -> Vec<f64> {
        let mut mean = vec![0.0; n_meas];
        if self.n_px == 0 {
            return mean;
        }
        for px in 0..self.n_px {
            for (m, y) in mean.iter_mut().zip(self.decay(px, n_meas)) {
                *m += y;
            }
        }
        let inv = 1.0 / self.n_px as f64;
        for m in &mut mean {
            *m *= inv;
        }
        mean
    }

    /// Intensity-weighted mean photon arrival time relative to the start
    /// of the time axis, used to seed lifetime estimates. `None` when the
    /// region holds no counts.
    pub fn mean_arrival_time(&self, acq: &Acquisition) -> Option<f64> {
        let mean = self.mean_decay(acq.n_meas());
        let timepoints = acq.timepoints();
        let mut sum_ty = 0.0;
        let mut sum_y = 0.0;
        for c in 0..acq.n_chan {
            for (j, t) in timepoints.iter().enumerate() {
                let y = mean[c * acq.n_t + j];
                sum_ty += t * y;
                sum_y += y;
            }
        }
        if sum_y <= 0.0 {
            return None;
        }
        Some(sum_ty / sum_y - acq.t0)
    }
}

/// The data-access surface the scheduler pulls from.
///
/// Implementations must be shareable across worker threads; everything
/// here is read-only for the duration of a run.
pub trait FitData: Send + Sync {
    /// Sequential index of region `label` in `image`, or `None` when the
    /// region is empty. `image = None` addresses cross-image regions.
    fn region_index(&self, image: Option<usize>, label: u16) -> Option<usize>;

    /// Pixel count of the region.
    fn region_count(&self, image: Option<usize>, label: u16) -> usize;

    /// Fill `buf` with the region's decay curves. `thread` identifies the
    /// requesting worker for implementations that stage per-thread
    /// buffers.
    fn region_data(
        &self,
        thread: usize,
        image: Option<usize>,
        label: u16,
        buf: &mut RegionData,
    ) -> Result<(), FitError>;

    /// Total number of fittable regions under the configured coupling.
    fn n_regions_total(&self) -> usize;

    /// Largest masked pixel count of any single image.
    fn max_px_per_image(&self) -> usize;

    /// Largest pixel count fitted jointly as one unit.
    fn max_fit_size(&self) -> usize;

    /// Largest pixel count of any region.
    fn max_region_size(&self) -> usize;

    /// Number of images contributing data.
    fn n_im_used(&self) -> usize;

    /// Exclusive upper bound on mask labels (labels run `1..max`).
    fn max_region_label(&self) -> u16;

    /// Total masked pixels across all images.
    fn n_masked_px(&self) -> usize;
}
