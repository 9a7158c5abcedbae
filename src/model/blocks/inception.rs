use burn::prelude::*;

use super::{ConvBiasRelu, ConvNormRelu, LayerSpec};
use crate::model::Mode;

/// Multi-scale block: a 3x3 stem, five parallel branches (1x1, 3x3, 5x5 and two
/// dilated 3x3), a 1x1 fusion added back onto the stem, and a closing 3x3.
///
/// Spatial size is preserved; the channel count goes from `in_dim` to `out_dim`.
#[derive(Module, Debug)]
pub struct Inception<B: Backend> {
    stem: ConvNormRelu<B>,
    branch_1x1: ConvBiasRelu<B>,
    branch_3x3: ConvBiasRelu<B>,
    branch_5x5: ConvBiasRelu<B>,
    branch_dilated_2: ConvBiasRelu<B>,
    branch_dilated_4: ConvBiasRelu<B>,
    fuse: ConvNormRelu<B>,
    output: ConvNormRelu<B>,
}

impl<B: Backend> Inception<B> {
    pub fn new(device: &B::Device, in_dim: usize, out_dim: usize) -> Self {
        Self {
            stem: ConvNormRelu::new(device, LayerSpec::new(3, in_dim, out_dim)),
            branch_1x1: ConvBiasRelu::new(device, LayerSpec::new(1, out_dim, out_dim)),
            branch_3x3: ConvBiasRelu::new(device, LayerSpec::new(3, out_dim, out_dim)),
            branch_5x5: ConvBiasRelu::new(device, LayerSpec::new(5, out_dim, out_dim)),
            branch_dilated_2: ConvBiasRelu::new(
                device,
                LayerSpec::new(3, out_dim, out_dim).with_dilation(2),
            ),
            branch_dilated_4: ConvBiasRelu::new(
                device,
                LayerSpec::new(3, out_dim, out_dim).with_dilation(4),
            ),
            fuse: ConvNormRelu::new(device, LayerSpec::new(1, 5 * out_dim, out_dim)),
            output: ConvNormRelu::new(device, LayerSpec::new(3, out_dim, out_dim)),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, mode: Mode) -> Tensor<B, 4> {
        let stem = self.stem.forward(x, mode);

        let branches = vec![
            self.branch_1x1.forward(stem.clone()),
            self.branch_3x3.forward(stem.clone()),
            self.branch_5x5.forward(stem.clone()),
            self.branch_dilated_2.forward(stem.clone()),
            self.branch_dilated_4.forward(stem.clone()),
        ];
        let fused = self.fuse.forward(Tensor::cat(branches, 1), mode);

        self.output.forward(fused + stem, mode)
    }

    pub(crate) fn parts(&self) -> [&ConvNormRelu<B>; 3] {
        [&self.stem, &self.fuse, &self.output]
    }

    pub(crate) fn branches(&self) -> [&ConvBiasRelu<B>; 5] {
        [
            &self.branch_1x1,
            &self.branch_3x3,
            &self.branch_5x5,
            &self.branch_dilated_2,
            &self.branch_dilated_4,
        ]
    }
}
