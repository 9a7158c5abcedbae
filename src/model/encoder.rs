use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::prelude::*;

use crate::error::Result;
use crate::model::blocks::{crop_and_concat, Inception};
use crate::model::params::{LearnableParams, ParamRef};
use crate::model::Mode;

/// Number of parallel input towers, one per input channel.
pub const TOWERS: usize = 4;

/// Output channels of every block at `level`: `2^level * features_root`.
pub fn level_features(level: usize, features_root: usize) -> usize {
    (1 << level) * features_root
}

/// Channels entering a tower at `level`.
///
/// Level 0 sees its own single channel. Level 1 sees the four pooled maps of level 0.
/// From level 2 on the previous input is appended as a cropped skip, which gives the
/// 4x, 12x, 28x, 60x `features_root` progression.
pub fn level_input_channels(level: usize, features_root: usize) -> usize {
    match level {
        0 => 1,
        1 => TOWERS * features_root,
        _ => {
            TOWERS * level_features(level - 1, features_root)
                + level_input_channels(level - 1, features_root)
        }
    }
}

/// Feature maps one tower produced at one level.
#[derive(Debug, Clone)]
pub struct TowerLevel<B: Backend> {
    /// Pre-pool output of the level's inception block.
    pub features: Tensor<B, 4>,
    pub pooled: Tensor<B, 4>,
    /// Concatenation fed into the block, kept for the second-order skip.
    pub input: Tensor<B, 4>,
}

#[derive(Debug, Clone)]
pub struct LevelState<B: Backend> {
    pub towers: Vec<TowerLevel<B>>,
}

/// Everything the decoder needs from the encoder, indexed by level then tower.
#[derive(Debug, Clone)]
pub struct EncoderState<B: Backend> {
    pub levels: Vec<LevelState<B>>,
    pub bottleneck: Tensor<B, 4>,
}

#[derive(Module, Debug)]
pub struct Tower<B: Backend> {
    stages: Vec<Inception<B>>,
    pool: MaxPool2d,
}

impl<B: Backend> Tower<B> {
    fn new(device: &B::Device, levels: usize, features_root: usize) -> Self {
        let stages = (0..levels - 1)
            .map(|level| {
                Inception::new(
                    device,
                    level_input_channels(level, features_root),
                    level_features(level, features_root),
                )
            })
            .collect();

        Self {
            stages,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }
}

/// Four towers with cross-tower concatenation at every level, closed by a bottleneck block.
#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    towers: Vec<Tower<B>>,
    bottleneck: Inception<B>,
    levels: usize,
}

impl<B: Backend> Encoder<B> {
    pub fn new(device: &B::Device, levels: usize, features_root: usize) -> Self {
        let towers = (0..TOWERS)
            .map(|_| Tower::new(device, levels, features_root))
            .collect();
        let deepest = levels - 1;

        Self {
            towers,
            bottleneck: Inception::new(
                device,
                level_input_channels(deepest, features_root),
                level_features(deepest, features_root),
            ),
            levels,
        }
    }

    /// Runs all towers level by level. `x` is NCHW with one channel per tower.
    pub fn forward(&self, x: Tensor<B, 4>, mode: Mode) -> Result<EncoderState<B>> {
        let mut levels: Vec<LevelState<B>> = Vec::with_capacity(self.levels - 1);

        for level in 0..self.levels - 1 {
            let mut towers = Vec::with_capacity(TOWERS);
            for (index, tower) in self.towers.iter().enumerate() {
                let input = tower_input(&x, &levels, level, index)?;
                let features = tower.stages[level].forward(input.clone(), mode);
                let pooled = tower.pool.forward(features.clone());
                towers.push(TowerLevel {
                    features,
                    pooled,
                    input,
                });
            }
            log::debug!(
                "encoder level {}: input {:?} -> features {:?}",
                level,
                towers[0].input.dims(),
                towers[0].features.dims()
            );
            levels.push(LevelState { towers });
        }

        let input = tower_input(&x, &levels, self.levels - 1, 0)?;
        let bottleneck = self.bottleneck.forward(input, mode);
        log::debug!("encoder bottleneck: {:?}", bottleneck.dims());

        Ok(EncoderState { levels, bottleneck })
    }
}

/// Builds the input of `tower` at `level`: the pooled maps of the previous level rotated
/// so the tower's own map comes first, plus the cropped previous input from level 2 on.
fn tower_input<B: Backend>(
    x: &Tensor<B, 4>,
    levels: &[LevelState<B>],
    level: usize,
    tower: usize,
) -> Result<Tensor<B, 4>> {
    if level == 0 {
        let [batch, _, height, width] = x.dims();
        return Ok(x.clone().slice([0..batch, tower..tower + 1, 0..height, 0..width]));
    }

    let previous = &levels[level - 1];
    let pooled: Vec<Tensor<B, 4>> = (0..TOWERS)
        .map(|offset| previous.towers[(tower + offset) % TOWERS].pooled.clone())
        .collect();

    if level == 1 {
        return Ok(Tensor::cat(pooled, 1));
    }
    crop_and_concat(pooled, previous.towers[tower].input.clone())
}

impl<B: Backend> LearnableParams<B> for Tower<B> {
    fn collect_params(&self, out: &mut Vec<ParamRef<B>>) {
        self.stages.collect_params(out);
    }
}

impl<B: Backend> LearnableParams<B> for Encoder<B> {
    fn collect_params(&self, out: &mut Vec<ParamRef<B>>) {
        self.towers.collect_params(out);
        self.bottleneck.collect_params(out);
    }
}
