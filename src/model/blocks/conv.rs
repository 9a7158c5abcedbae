use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::{Initializer, PaddingConfig2d};
use burn::prelude::*;
use burn::tensor::activation;

use super::Norm;
use crate::model::Mode;

/// Constant every biased convolution starts from.
pub const BIAS_INIT: f64 = 0.1;

/// Shape of one convolution layer and the He-style init derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerSpec {
    pub kernel: [usize; 2],
    pub in_channels: usize,
    pub out_channels: usize,
    pub dilation: usize,
}

impl LayerSpec {
    pub fn new(kernel: usize, in_channels: usize, out_channels: usize) -> Self {
        Self {
            kernel: [kernel, kernel],
            in_channels,
            out_channels,
            dilation: 1,
        }
    }

    pub fn with_dilation(mut self, dilation: usize) -> Self {
        self.dilation = dilation;
        self
    }

    /// Always `sqrt(2 / (9 * out_channels))`, whatever the kernel size.
    pub fn stddev(&self) -> f64 {
        (2.0 / (9.0 * self.out_channels as f64)).sqrt()
    }

    /// Same-size padding for odd kernels.
    pub fn padding(&self) -> [usize; 2] {
        [
            self.dilation * (self.kernel[0] - 1) / 2,
            self.dilation * (self.kernel[1] - 1) / 2,
        ]
    }

    fn initializer(&self) -> Initializer {
        Initializer::Normal {
            mean: 0.0,
            std: self.stddev(),
        }
    }

    pub fn conv2d<B: Backend>(&self, device: &B::Device, bias: Option<f64>) -> Conv2d<B> {
        let [pad_h, pad_w] = self.padding();
        let mut conv = Conv2dConfig::new([self.in_channels, self.out_channels], self.kernel)
            .with_padding(PaddingConfig2d::Explicit(pad_h, pad_w))
            .with_dilation([self.dilation, self.dilation])
            .with_bias(bias.is_some())
            .with_initializer(self.initializer())
            .init(device);

        if let Some(value) = bias {
            conv.bias = Some(Initializer::Constant { value }.init([self.out_channels], device));
        }
        conv
    }

    /// 2x upsampling transposed convolution (kernel 2, stride 2, no bias).
    pub fn deconv2d<B: Backend>(&self, device: &B::Device) -> ConvTranspose2d<B> {
        ConvTranspose2dConfig::new([self.in_channels, self.out_channels], self.kernel)
            .with_stride(self.kernel)
            .with_bias(false)
            .with_initializer(self.initializer())
            .init(device)
    }
}

/// Convolution + batch norm + ReLU, without bias.
#[derive(Module, Debug)]
pub struct ConvNormRelu<B: Backend> {
    pub conv: Conv2d<B>,
    pub norm: Norm<B>,
}

impl<B: Backend> ConvNormRelu<B> {
    pub fn new(device: &B::Device, spec: LayerSpec) -> Self {
        Self {
            conv: spec.conv2d(device, None),
            norm: Norm::new(device, spec.out_channels),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, mode: Mode) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x, mode);
        activation::relu(x)
    }
}

/// Convolution + bias + ReLU, used by the inception branches.
#[derive(Module, Debug)]
pub struct ConvBiasRelu<B: Backend> {
    pub conv: Conv2d<B>,
}

impl<B: Backend> ConvBiasRelu<B> {
    pub fn new(device: &B::Device, spec: LayerSpec) -> Self {
        Self {
            conv: spec.conv2d(device, Some(BIAS_INIT)),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        activation::relu(self.conv.forward(x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    #[test]
    fn stddev_depends_only_on_out_channels() {
        let narrow = LayerSpec::new(1, 64, 8);
        let wide = LayerSpec::new(5, 3, 8).with_dilation(4);
        assert_eq!(narrow.stddev(), wide.stddev());
        assert!((narrow.stddev() - (2.0f64 / 72.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn padding_keeps_spatial_size() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::random([1, 2, 9, 7], Distribution::Default, &device);
        for spec in [
            LayerSpec::new(1, 2, 3),
            LayerSpec::new(3, 2, 3),
            LayerSpec::new(5, 2, 3),
            LayerSpec::new(3, 2, 3).with_dilation(2),
            LayerSpec::new(3, 2, 3).with_dilation(4),
        ] {
            let conv = spec.conv2d::<TestBackend>(&device, Some(BIAS_INIT));
            assert_eq!(conv.forward(x.clone()).dims(), [1, 3, 9, 7]);
        }
    }

    #[test]
    fn bias_starts_at_constant() {
        let device = Default::default();
        let conv = LayerSpec::new(3, 1, 4).conv2d::<TestBackend>(&device, Some(BIAS_INIT));
        let bias = conv.bias.as_ref().map(|b| b.val()).unwrap();
        for value in bias.into_data().to_vec::<f32>().unwrap() {
            assert!((value - 0.1).abs() < 1e-7);
        }
    }

    #[test]
    fn deconv_doubles_resolution() {
        let device = Default::default();
        let deconv = LayerSpec::new(2, 8, 4).deconv2d::<TestBackend>(&device);
        let x = Tensor::<TestBackend, 4>::zeros([1, 8, 5, 6], &device);
        assert_eq!(deconv.forward(x).dims(), [1, 4, 10, 12]);
    }
}
