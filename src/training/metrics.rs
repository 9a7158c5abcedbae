use burn::prelude::*;

use crate::error::{Result, UnetError};

/// Fraction of pixels whose arg-max class matches the label.
pub fn accuracy<B: Backend>(probabilities: Tensor<B, 4>, labels: Tensor<B, 4>) -> f32 {
    let predicted = probabilities.argmax(3);
    let expected = labels.argmax(3);
    predicted.equal(expected).float().mean().into_scalar().elem::<f32>()
}

/// Percentage of misclassified pixels.
pub fn error_rate<B: Backend>(probabilities: Tensor<B, 4>, labels: Tensor<B, 4>) -> f32 {
    100.0 - 100.0 * accuracy(probabilities, labels)
}

/// Running mean of per-parameter gradients across steps.
#[derive(Debug, Clone)]
pub struct GradientAverage<B: Backend> {
    averages: Vec<Tensor<B, 1>>,
    step: usize,
}

impl<B: Backend> Default for GradientAverage<B> {
    fn default() -> Self {
        Self {
            averages: Vec::new(),
            step: 0,
        }
    }
}

impl<B: Backend> GradientAverage<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// `avg ← avg·(1 - 1/(s+1)) + g/(s+1)`
    pub fn update(&mut self, gradients: Vec<Tensor<B, 1>>) -> Result<()> {
        if self.averages.is_empty() {
            self.averages = gradients;
            self.step = 1;
            return Ok(());
        }
        if gradients.len() != self.averages.len() {
            return Err(UnetError::InvalidInput(format!(
                "expected {} gradients, got {}",
                self.averages.len(),
                gradients.len()
            )));
        }

        let weight = 1.0 / (self.step + 1) as f64;
        self.averages = self
            .averages
            .drain(..)
            .zip(gradients)
            .map(|(avg, g)| avg.mul_scalar(1.0 - weight) + g.mul_scalar(weight))
            .collect();
        self.step += 1;
        Ok(())
    }

    /// L2 norm of each averaged gradient.
    pub fn norms(&self) -> Vec<f32> {
        self.averages
            .iter()
            .map(|avg| avg.clone().powf_scalar(2.0).sum().sqrt().into_scalar().elem::<f32>())
            .collect()
    }

    pub fn steps(&self) -> usize {
        self.step
    }
}
