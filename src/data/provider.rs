use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use crate::data::region::RegionBox;
use crate::error::{Result, UnetError};

/// Number of input modalities: fat, in-phase, water and opposed-phase.
pub const INPUT_CHANNELS: usize = 4;

/// A source of training batches.
pub trait DataProvider<B: Backend> {
    /// Draws the next `n` samples as NHWC tensors on `device`.
    fn next_batch(&mut self, n: usize, device: &B::Device) -> Result<Batch<B>>;

    fn channels(&self) -> usize;

    fn n_class(&self) -> usize;
}

/// One host-side sample before it is stacked into a batch.
#[derive(Debug, Clone)]
pub struct Sample {
    pub height: usize,
    pub width: usize,
    /// Row-major HWC pixels with `INPUT_CHANNELS` values each.
    pub image: Vec<f32>,
    /// Class index per pixel, row-major.
    pub label: Vec<usize>,
    pub region: RegionBox,
}

impl Sample {
    fn check(&self) -> Result<()> {
        let pixels = self.height * self.width;
        if self.image.len() != pixels * INPUT_CHANNELS || self.label.len() != pixels {
            return Err(UnetError::InvalidInput(format!(
                "sample buffers ({} image values, {} labels) do not match {}x{}",
                self.image.len(),
                self.label.len(),
                self.height,
                self.width
            )));
        }
        Ok(())
    }
}

/// Images, one-hot labels and region boxes for one step.
#[derive(Debug, Clone)]
pub struct Batch<B: Backend> {
    /// `[n, h, w, 4]`
    pub images: Tensor<B, 4>,
    /// `[n, h, w, n_class]`, one-hot.
    pub labels: Tensor<B, 4>,
    /// One box per sample; all zero when the source carries no regions.
    pub regions: Vec<RegionBox>,
}

impl<B: Backend> Batch<B> {
    /// Stacks samples of identical size, one-hot encoding their labels.
    pub fn from_samples(samples: &[Sample], n_class: usize, device: &B::Device) -> Result<Self> {
        let first = samples
            .first()
            .ok_or_else(|| UnetError::InvalidInput("cannot build an empty batch".to_string()))?;
        let (height, width) = (first.height, first.width);

        let mut images = Vec::with_capacity(samples.len() * height * width * INPUT_CHANNELS);
        let mut labels = vec![0.0f32; samples.len() * height * width * n_class];
        let mut regions = Vec::with_capacity(samples.len());

        for (index, sample) in samples.iter().enumerate() {
            sample.check()?;
            if (sample.height, sample.width) != (height, width) {
                return Err(UnetError::InvalidInput(format!(
                    "sample {index} is {}x{}, batch is {height}x{width}",
                    sample.height, sample.width
                )));
            }
            images.extend_from_slice(&sample.image);

            let offset = index * height * width;
            for (pixel, &class) in sample.label.iter().enumerate() {
                let class = class.min(n_class - 1);
                labels[(offset + pixel) * n_class + class] = 1.0;
            }
            regions.push(sample.region);
        }

        let n = samples.len();
        Ok(Self {
            images: Tensor::from_data(
                TensorData::new(images, [n, height, width, INPUT_CHANNELS]),
                device,
            ),
            labels: Tensor::from_data(TensorData::new(labels, [n, height, width, n_class]), device),
            regions,
        })
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

impl<B: AutodiffBackend> Batch<B> {
    /// The same batch on the non-differentiable backend.
    pub fn inner(&self) -> Batch<B::InnerBackend> {
        Batch {
            images: self.images.clone().inner(),
            labels: self.labels.clone().inner(),
            regions: self.regions.clone(),
        }
    }
}
