use burn::nn::conv::Conv2d;
use burn::prelude::*;

use crate::model::blocks::{resize_bilinear, LayerSpec, BIAS_INIT};
use crate::model::ops;
use crate::model::params::{LearnableParams, ParamRef};
use crate::model::Mode;

/// Which output a logit tensor comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadKind {
    /// 1x1 fusion over the primary and auxiliary heads.
    Fused,
    /// 3x3 convolution on the full-resolution decoder output.
    Primary,
    /// Deep-supervision head attached at a decoder level.
    Auxiliary { level: usize },
}

/// One output head's logits, NHWC at full resolution.
#[derive(Debug, Clone)]
pub struct Head<B: Backend> {
    pub kind: HeadKind,
    pub logits: Tensor<B, 4>,
}

/// Deep-supervision head: 3x3 projection with dropout, bilinear upsampling by the
/// level's downsampling factor, then a 3x3 refinement.
#[derive(Module, Debug)]
pub struct AuxHead<B: Backend> {
    project: Conv2d<B>,
    refine: Conv2d<B>,
    level: usize,
}

impl<B: Backend> AuxHead<B> {
    pub fn new(device: &B::Device, level: usize, in_channels: usize, n_class: usize) -> Self {
        Self {
            project: LayerSpec::new(3, in_channels, n_class).conv2d(device, Some(BIAS_INIT)),
            refine: LayerSpec::new(3, n_class, n_class).conv2d(device, Some(BIAS_INIT)),
            level,
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    /// `x` is the NCHW decoder output at this head's level.
    pub fn forward(&self, x: Tensor<B, 4>, mode: Mode) -> Tensor<B, 4> {
        let x = self.project.forward(x);
        let x = match mode {
            Mode::Train { keep_prob } => ops::dropout(x, keep_prob),
            Mode::Infer => x,
        };
        let x = resize_bilinear(x, 1 << self.level);
        self.refine.forward(x)
    }
}

impl<B: Backend> LearnableParams<B> for AuxHead<B> {
    fn collect_params(&self, out: &mut Vec<ParamRef<B>>) {
        self.project.collect_params(out);
        self.refine.collect_params(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    #[test]
    fn aux_head_restores_full_resolution() {
        let device = Default::default();
        let head = AuxHead::<TestBackend>::new(&device, 2, 8, 3);
        let x = Tensor::<TestBackend, 4>::random([2, 8, 4, 5], Distribution::Default, &device);

        let out = head.forward(x, Mode::Train { keep_prob: 0.5 });
        assert_eq!(out.dims(), [2, 3, 16, 20]);
    }

    #[test]
    fn aux_head_is_deterministic_in_inference() {
        let device = Default::default();
        let head = AuxHead::<TestBackend>::new(&device, 1, 4, 2);
        let x = Tensor::<TestBackend, 4>::random([1, 4, 4, 4], Distribution::Default, &device);

        let a = head.forward(x.clone(), Mode::Infer);
        let b = head.forward(x, Mode::Infer);
        a.into_data().assert_approx_eq(&b.into_data(), 6);
    }
}
