use burn::nn::conv::ConvTranspose2d;
use burn::prelude::*;
use burn::tensor::activation;
use burn::tensor::module::interpolate;
use burn::tensor::ops::{InterpolateMode, InterpolateOptions};

use super::LayerSpec;

/// Learned 2x upsampling: transposed convolution followed by ReLU.
#[derive(Module, Debug)]
pub struct Upsample<B: Backend> {
    pub deconv: ConvTranspose2d<B>,
}

impl<B: Backend> Upsample<B> {
    pub fn new(device: &B::Device, in_channels: usize, out_channels: usize) -> Self {
        Self {
            deconv: LayerSpec::new(2, in_channels, out_channels).deconv2d(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        activation::relu(self.deconv.forward(x))
    }
}

/// Bilinear resize of an NCHW tensor by an integer scale factor.
pub fn resize_bilinear<B: Backend>(x: Tensor<B, 4>, scale_factor: usize) -> Tensor<B, 4> {
    if scale_factor == 1 {
        return x;
    }
    let [_, _, height, width] = x.dims();
    interpolate(
        x,
        [height * scale_factor, width * scale_factor],
        InterpolateOptions::new(InterpolateMode::Bilinear),
    )
}
