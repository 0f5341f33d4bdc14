//! In-memory [`FitData`] implementation over a stack of masked images.

use std::sync::Arc;

use crate::domain::{Acquisition, CouplingMode, PixelIndex};
use crate::data::source::{FitData, RegionData};
use crate::error::FitError;

/// One image: per-pixel decay curves plus a region mask.
///
/// Mask label 0 excludes a pixel; labels `1..` assign it to a region.
#[derive(Debug, Clone)]
pub struct Image {
    n_px: usize,
    decays: Vec<f64>,
    mask: Vec<u16>,
}

impl Image {
    pub fn new(n_px: usize, n_meas: usize, decays: Vec<f64>, mask: Vec<u16>) -> Result<Self, FitError> {
        if decays.len() != n_px * n_meas {
            return Err(FitError::data(format!(
                "Image decay buffer holds {} samples, expected {} pixels x {} samples.",
                decays.len(),
                n_px,
                n_meas
            )));
        }
        if mask.len() != n_px {
            return Err(FitError::data(format!(
                "Image mask has {} entries for {} pixels.",
                mask.len(),
                n_px
            )));
        }
        Ok(Self { n_px, decays, mask })
    }

    pub fn n_px(&self) -> usize {
        self.n_px
    }

    pub fn mask(&self) -> &[u16] {
        &self.mask
    }

    fn label_count(&self, label: u16) -> usize {
        self.mask.iter().filter(|&&m| m == label).count()
    }
}

/// A stack of images with region bookkeeping for one coupling mode.
pub struct ImageSet {
    acq: Arc<Acquisition>,
    images: Vec<Image>,
    coupling: CouplingMode,
    max_label: u16,
    /// `[image][label - 1] -> region index` for per-image coupling.
    per_image_index: Vec<Vec<Option<usize>>>,
    /// `[label - 1] -> region index` for cross-image coupling.
    merged_index: Vec<Option<usize>>,
    n_regions_total: usize,
    n_masked_px: usize,
    max_px_per_image: usize,
    max_region_size: usize,
}

impl ImageSet {
    pub fn new(
        acq: Arc<Acquisition>,
        images: Vec<Image>,
        coupling: CouplingMode,
    ) -> Result<Self, FitError> {
        if images.is_empty() {
            return Err(FitError::data("Image set holds no images."));
        }

        let max_label = images
            .iter()
            .flat_map(|im| im.mask.iter().copied())
            .max()
            .unwrap_or(0);

        let mut per_image_index = Vec::with_capacity(images.len());
        let mut next = 0;
        for im in &images {
            let mut row = Vec::with_capacity(max_label as usize);
            for label in 1..=max_label {
                if im.label_count(label) > 0 {
                    row.push(Some(next));
                    next += 1;
                } else {
                    row.push(None);
                }
            }
            per_image_index.push(row);
        }
        let n_per_image_regions = next;

        let mut merged_index = Vec::with_capacity(max_label as usize);
        let mut next = 0;
        for label in 1..=max_label {
            let present = images.iter().any(|im| im.label_count(label) > 0);
            if present {
                merged_index.push(Some(next));
                next += 1;
            } else {
                merged_index.push(None);
            }
        }
        let n_merged_regions = next;

        let n_regions_total = match coupling {
            CouplingMode::Global => n_merged_regions,
            _ => n_per_image_regions,
        };

        let n_masked_px = images
            .iter()
            .map(|im| im.mask.iter().filter(|&&m| m > 0).count())
            .sum();
        let max_px_per_image = images
            .iter()
            .map(|im| im.mask.iter().filter(|&&m| m > 0).count())
            .max()
            .unwrap_or(0);

        let max_region_size = match coupling {
            CouplingMode::Global => (1..=max_label)
                .map(|label| {
                    images
                        .iter()
                        .map(|im| im.label_count(label))
                        .sum::<usize>()
                })
                .max()
                .unwrap_or(0),
            _ => images
                .iter()
                .flat_map(|im| (1..=max_label).map(move |label| im.label_count(label)))
                .max()
                .unwrap_or(0),
        };

        Ok(Self {
            acq,
            images,
            coupling,
            max_label,
            per_image_index,
            merged_index,
            n_regions_total,
            n_masked_px,
            max_px_per_image,
            max_region_size,
        })
    }

    pub fn acq(&self) -> &Arc<Acquisition> {
        &self.acq
    }

    pub fn coupling(&self) -> CouplingMode {
        self.coupling
    }

    fn gather(&self, image: usize, label: u16, buf: &mut RegionData) {
        let n_meas = self.acq.n_meas();
        let im = &self.images[image];
        for px in 0..im.n_px {
            if im.mask[px] == label {
                buf.decays
                    .extend_from_slice(&im.decays[px * n_meas..(px + 1) * n_meas]);
                buf.pixels.push(PixelIndex::new(image, px));
                buf.n_px += 1;
            }
        }
    }
}

impl FitData for ImageSet {
    fn region_index(&self, image: Option<usize>, label: u16) -> Option<usize> {
        if label == 0 || label > self.max_label {
            return None;
        }
        match image {
            Some(im) => *self.per_image_index.get(im)?.get(label as usize - 1)?,
            None => *self.merged_index.get(label as usize - 1)?,
        }
    }

    fn region_count(&self, image: Option<usize>, label: u16) -> usize {
        match image {
            Some(im) => self
                .images
                .get(im)
                .map(|i| i.label_count(label))
                .unwrap_or(0),
            None => self.images.iter().map(|i| i.label_count(label)).sum(),
        }
    }

    fn region_data(
        &self,
        _thread: usize,
        image: Option<usize>,
        label: u16,
        buf: &mut RegionData,
    ) -> Result<(), FitError> {
        let Some(region_index) = self.region_index(image, label) else {
            return Err(FitError::data(format!(
                "Region {label} does not exist in image {image:?}."
            )));
        };

        buf.clear();
        buf.image = image;
        buf.label = label;
        buf.region_index = region_index;

        match image {
            Some(im) => self.gather(im, label, buf),
            None => {
                for im in 0..self.images.len() {
                    self.gather(im, label, buf);
                }
            }
        }
        Ok(())
    }

    fn n_regions_total(&self) -> usize {
        self.n_regions_total
    }

    fn max_px_per_image(&self) -> usize {
        self.max_px_per_image
    }

    fn max_fit_size(&self) -> usize {
        match self.coupling {
            CouplingMode::Pixelwise => 1,
            _ => self.max_region_size,
        }
    }

    fn max_region_size(&self) -> usize {
        self.max_region_size
    }

    fn n_im_used(&self) -> usize {
        self.images.len()
    }

    fn max_region_label(&self) -> u16 {
        self.max_label
    }

    fn n_masked_px(&self) -> usize {
        self.n_masked_px
    }
}
