use burn::prelude::*;

use crate::model::blocks::{Inception, Upsample};
use crate::model::encoder::{level_features, EncoderState, TOWERS};
use crate::model::params::{LearnableParams, ParamRef};
use crate::model::Mode;

/// One decoder level: 2x upsample, average with the towers' encoder maps, inception.
#[derive(Module, Debug)]
pub struct DecoderStage<B: Backend> {
    upsample: Upsample<B>,
    block: Inception<B>,
}

impl<B: Backend> DecoderStage<B> {
    fn new(device: &B::Device, level: usize, features_root: usize) -> Self {
        let features = level_features(level, features_root);
        Self {
            upsample: Upsample::new(device, 2 * features, features),
            block: Inception::new(device, features, features),
        }
    }

    /// Fuses the upsampled map with the encoder maps as an unweighted mean of five tensors.
    fn forward(&self, x: Tensor<B, 4>, skips: &[Tensor<B, 4>], mode: Mode) -> Tensor<B, 4> {
        let up = self.upsample.forward(x);
        let sum = skips.iter().fold(up, |acc, skip| acc + skip.clone());
        let mean = sum.div_scalar((TOWERS + 1) as f64);
        self.block.forward(mean, mode)
    }
}

#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    /// `stages[level]` produces the decoder output at `level`.
    stages: Vec<DecoderStage<B>>,
}

impl<B: Backend> Decoder<B> {
    pub fn new(device: &B::Device, levels: usize, features_root: usize) -> Self {
        Self {
            stages: (0..levels - 1)
                .map(|level| DecoderStage::new(device, level, features_root))
                .collect(),
        }
    }

    /// Returns the decoder outputs indexed by level, level 0 at full resolution.
    pub fn forward(&self, state: &EncoderState<B>, mode: Mode) -> Vec<Tensor<B, 4>> {
        let mut current = state.bottleneck.clone();
        let mut outputs = Vec::with_capacity(self.stages.len());

        for (level, stage) in self.stages.iter().enumerate().rev() {
            let skips: Vec<Tensor<B, 4>> = state.levels[level]
                .towers
                .iter()
                .map(|tower| tower.features.clone())
                .collect();
            current = stage.forward(current, &skips, mode);
            log::debug!("decoder level {}: {:?}", level, current.dims());
            outputs.push(current.clone());
        }

        outputs.reverse();
        outputs
    }
}

impl<B: Backend> LearnableParams<B> for DecoderStage<B> {
    fn collect_params(&self, out: &mut Vec<ParamRef<B>>) {
        self.upsample.collect_params(out);
        self.block.collect_params(out);
    }
}

impl<B: Backend> LearnableParams<B> for Decoder<B> {
    fn collect_params(&self, out: &mut Vec<ParamRef<B>>) {
        self.stages.collect_params(out);
    }
}
