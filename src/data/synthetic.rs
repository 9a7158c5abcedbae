//! Toy provider drawing random bright discs on a noisy background.

use burn::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::data::provider::{Batch, DataProvider, Sample, INPUT_CHANNELS};
use crate::data::region::RegionBox;
use crate::error::{Result, UnetError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleConfig {
    pub count: usize,
    pub r_min: usize,
    pub r_max: usize,
    /// Margin kept free of disc centers; shrunk automatically for small images.
    pub border: usize,
    pub sigma: f64,
}

impl Default for CircleConfig {
    fn default() -> Self {
        Self {
            count: 10,
            r_min: 5,
            r_max: 50,
            border: 92,
            sigma: 20.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Disc {
    row: i64,
    col: i64,
    radius: i64,
}

impl Disc {
    fn contains(&self, row: i64, col: i64) -> bool {
        let (dy, dx) = (row - self.row, col - self.col);
        dy * dy + dx * dx <= self.radius * self.radius
    }

    /// Bounding box clamped into the image, as half-open `(min, max)` pairs.
    fn bounds(&self, height: usize, width: usize) -> ((i64, i64), (i64, i64)) {
        let rows = (
            (self.row - self.radius).max(0),
            (self.row + self.radius + 1).min(height as i64),
        );
        let cols = (
            (self.col - self.radius).max(0),
            (self.col + self.radius + 1).min(width as i64),
        );
        (rows, cols)
    }
}

pub struct SyntheticProvider {
    height: usize,
    width: usize,
    n_class: usize,
    config: CircleConfig,
    rng: StdRng,
}

impl SyntheticProvider {
    pub fn new(height: usize, width: usize, config: CircleConfig) -> Result<Self> {
        if height == 0 || width == 0 {
            return Err(UnetError::InvalidConfiguration(format!(
                "synthetic images must be non-empty, got {height}x{width}"
            )));
        }
        if config.count == 0 || config.r_min >= config.r_max || !(config.sigma >= 0.0) {
            return Err(UnetError::InvalidConfiguration(format!(
                "invalid circle parameters {config:?}"
            )));
        }
        Ok(Self {
            height,
            width,
            n_class: 2,
            config,
            rng: StdRng::from_entropy(),
        })
    }

    /// Reproducible stream for tests and benchmarks.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    fn center(&mut self, extent: usize) -> i64 {
        let border = self.config.border.min(extent.saturating_sub(1) / 2);
        self.rng.gen_range(border..extent - border) as i64
    }

    fn draw_discs(&mut self) -> Vec<(Disc, f32)> {
        (0..self.config.count)
            .map(|_| {
                let row = self.center(self.height);
                let col = self.center(self.width);
                let radius = self.rng.gen_range(self.config.r_min..self.config.r_max) as i64;
                let intensity = self.rng.gen_range(1..255) as f32;
                (Disc { row, col, radius }, intensity)
            })
            .collect()
    }

    /// Adds Gaussian noise and rescales to [0, 1].
    fn noisy_channel(&mut self, clean: &[f32]) -> Result<Vec<f32>> {
        let noise = Normal::new(0.0, self.config.sigma)
            .map_err(|e| UnetError::InvalidConfiguration(e.to_string()))?;
        let mut channel: Vec<f32> = clean
            .iter()
            .map(|&v| v + noise.sample(&mut self.rng) as f32)
            .collect();

        let min = channel.iter().copied().fold(f32::INFINITY, f32::min);
        for v in channel.iter_mut() {
            *v -= min;
        }
        let max = channel.iter().copied().fold(0.0f32, f32::max);
        if max > 0.0 {
            for v in channel.iter_mut() {
                *v /= max;
            }
        }
        Ok(channel)
    }

    fn next_sample(&mut self) -> Result<Sample> {
        let (height, width) = (self.height, self.width);
        let discs = self.draw_discs();

        let mut clean = vec![1.0f32; height * width];
        let mut label = vec![0usize; height * width];
        for row in 0..height {
            for col in 0..width {
                for (disc, intensity) in &discs {
                    if disc.contains(row as i64, col as i64) {
                        clean[row * width + col] = *intensity;
                        label[row * width + col] = 1;
                    }
                }
            }
        }

        let mut channels = Vec::with_capacity(INPUT_CHANNELS);
        for _ in 0..INPUT_CHANNELS {
            channels.push(self.noisy_channel(&clean)?);
        }
        let image = (0..height * width)
            .flat_map(|pixel| channels.iter().map(move |channel| channel[pixel]))
            .collect();

        Ok(Sample {
            height,
            width,
            image,
            label,
            region: region_of(&discs, height, width),
        })
    }
}

/// Union bounding box of all discs, nesting the smallest disc's box.
fn region_of(discs: &[(Disc, f32)], height: usize, width: usize) -> RegionBox {
    let mut region = RegionBox {
        x_min: height as i64,
        y_min: width as i64,
        ..RegionBox::default()
    };
    for (disc, _) in discs {
        let ((row_min, row_max), (col_min, col_max)) = disc.bounds(height, width);
        region.x_min = region.x_min.min(row_min);
        region.x_max = region.x_max.max(row_max);
        region.y_min = region.y_min.min(col_min);
        region.y_max = region.y_max.max(col_max);
    }

    if let Some((smallest, _)) = discs.iter().min_by_key(|(disc, _)| disc.radius) {
        let ((row_min, row_max), (col_min, col_max)) = smallest.bounds(height, width);
        region.sx_min = row_min;
        region.sx_max = row_max;
        region.sy_min = col_min;
        region.sy_max = col_max;
    }
    region
}

impl<B: Backend> DataProvider<B> for SyntheticProvider {
    fn next_batch(&mut self, n: usize, device: &B::Device) -> Result<Batch<B>> {
        let samples = (0..n)
            .map(|_| self.next_sample())
            .collect::<Result<Vec<_>>>()?;
        Batch::from_samples(&samples, self.n_class, device)
    }

    fn channels(&self) -> usize {
        INPUT_CHANNELS
    }

    fn n_class(&self) -> usize {
        self.n_class
    }
}
