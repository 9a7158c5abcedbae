//! Stateless tensor primitives shared by the network and the loss selector.
//!
//! Everything here works on NHWC tensors unless the name says otherwise.

use burn::prelude::*;
use burn::tensor::activation;
use burn::tensor::module::conv2d;
use burn::tensor::ops::ConvOptions;
use burn::tensor::Distribution;

/// Lower bound applied to probabilities before taking their logarithm.
pub const PROBABILITY_FLOOR: f64 = 1e-10;

pub fn nhwc_to_nchw<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    x.swap_dims(1, 3).swap_dims(2, 3)
}

pub fn nchw_to_nhwc<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    x.swap_dims(1, 3).swap_dims(1, 2)
}

/// Softmax over the class axis with max subtraction.
pub fn pixel_wise_softmax<B: Backend>(logits: Tensor<B, 4>) -> Tensor<B, 4> {
    let max = logits.clone().max_dim(3);
    let exponential = (logits - max).exp();
    let normalize = exponential.clone().sum_dim(3);
    exponential / normalize
}

/// Mean cross-entropy between one-hot labels and probabilities, clipped against log(0).
pub fn cross_entropy<B: Backend>(
    labels: Tensor<B, 4>,
    probabilities: Tensor<B, 4>,
) -> Tensor<B, 1> {
    let log = probabilities.clamp(PROBABILITY_FLOOR, 1.0).log();
    (labels * log).mean().neg()
}

/// Per-pixel softmax cross-entropy computed from logits, shape `[n, h, w, 1]`.
pub fn softmax_cross_entropy_map<B: Backend>(
    logits: Tensor<B, 4>,
    labels: Tensor<B, 4>,
) -> Tensor<B, 4> {
    let log_probs = activation::log_softmax(logits, 3);
    (labels * log_probs).sum_dim(3).neg()
}

/// Inverted dropout: keeps each activation with probability `keep_prob`.
pub fn dropout<B: Backend>(x: Tensor<B, 4>, keep_prob: f64) -> Tensor<B, 4> {
    if keep_prob >= 1.0 {
        return x;
    }
    let mask = Tensor::<B, 4>::random(x.shape(), Distribution::Bernoulli(keep_prob), &x.device());
    (x * mask).div_scalar(keep_prob)
}

/// Divides by the tensor maximum; a zero maximum is treated as one.
pub fn normalize_by_max<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let max = x.clone().max();
    let denominator = max.clone() + max.equal_elem(0.0).float();
    x / denominator.reshape([1, 1, 1, 1])
}

/// Sobel responses `(dy, dx)` per channel with reflect padding, same shape as the input.
pub fn sobel_edges<B: Backend>(x: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
    let [batch, height, width, channels] = x.dims();
    let device = x.device();

    let planes = nhwc_to_nchw(x).reshape([batch * channels, 1, height, width]);
    let padded = reflect_pad(planes);

    #[rustfmt::skip]
    let kernels = vec![
        -1.0f32, -2.0, -1.0,
         0.0,     0.0,  0.0,
         1.0,     2.0,  1.0,

        -1.0,     0.0,  1.0,
        -2.0,     0.0,  2.0,
        -1.0,     0.0,  1.0,
    ];
    let weight = Tensor::<B, 4>::from_data(TensorData::new(kernels, [2, 1, 3, 3]), &device);
    let responses = conv2d(padded, weight, None, ConvOptions::new([1, 1], [0, 0], [1, 1], 1));

    let split = |index: usize| {
        let plane = responses
            .clone()
            .slice([0..batch * channels, index..index + 1, 0..height, 0..width])
            .reshape([batch, channels, height, width]);
        nchw_to_nhwc(plane)
    };

    (split(0), split(1))
}

/// Pads height and width by one on each side, mirroring without repeating the edge.
/// Axes of length one fall back to replicating the edge.
fn reflect_pad<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [n, c, h, w] = x.dims();
    let (top, bottom) = if h > 1 { (1..2, h - 2..h - 1) } else { (0..1, 0..1) };
    let x = Tensor::cat(
        vec![
            x.clone().slice([0..n, 0..c, top, 0..w]),
            x.clone(),
            x.slice([0..n, 0..c, bottom, 0..w]),
        ],
        2,
    );

    let h = h + 2;
    let (left, right) = if w > 1 { (1..2, w - 2..w - 1) } else { (0..1, 0..1) };
    Tensor::cat(
        vec![
            x.clone().slice([0..n, 0..c, 0..h, left]),
            x.clone(),
            x.slice([0..n, 0..c, 0..h, right]),
        ],
        3,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn layout_round_trip() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::random([2, 5, 6, 3], Distribution::Default, &device);
        let nchw = nhwc_to_nchw(x.clone());
        assert_eq!(nchw.dims(), [2, 3, 5, 6]);
        let back = nchw_to_nhwc(nchw);
        back.into_data().assert_approx_eq(&x.into_data(), 6);
    }

    #[test]
    fn softmax_sums_to_one_for_extreme_logits() {
        let device = Default::default();
        let data = TensorData::new(
            vec![1.0e30f32, -1.0e30, 0.0, 3.0e38, -3.0e38, 1.0, 0.0, 0.0],
            [1, 2, 2, 2],
        );
        let logits = Tensor::<TestBackend, 4>::from_data(data, &device);
        let sums = pixel_wise_softmax(logits).sum_dim(3);
        let values = sums.into_data().to_vec::<f32>().unwrap();
        for value in values {
            assert!((value - 1.0).abs() < 1e-5, "sum was {value}");
        }
    }

    #[test]
    fn clipped_cross_entropy_is_finite_for_zero_probability() {
        let device = Default::default();
        let labels = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![1.0f32, 0.0], [1, 1, 1, 2]),
            &device,
        );
        let probs = Tensor::<TestBackend, 4>::from_data(
            TensorData::new(vec![0.0f32, 1.0], [1, 1, 1, 2]),
            &device,
        );
        let value = cross_entropy(labels, probs).into_scalar();
        assert!(value.is_finite());
        assert!(value > 0.0);
    }

    #[test]
    fn sobel_of_constant_image_is_zero() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::ones([1, 6, 5, 2], &device);
        let (dy, dx) = sobel_edges(x);
        assert_eq!(dy.dims(), [1, 6, 5, 2]);
        assert_eq!(dx.dims(), [1, 6, 5, 2]);
        assert_eq!(dy.abs().sum().into_scalar(), 0.0);
        assert_eq!(dx.abs().sum().into_scalar(), 0.0);
    }

    #[test]
    fn sobel_detects_vertical_step() {
        let device = Default::default();
        // Columns 0..2 are zero, columns 2..4 are one.
        let mut values = Vec::new();
        for _ in 0..4 {
            values.extend_from_slice(&[0.0f32, 0.0, 1.0, 1.0]);
        }
        let x = Tensor::<TestBackend, 4>::from_data(TensorData::new(values, [1, 4, 4, 1]), &device);
        let (dy, dx) = sobel_edges(x);
        assert_eq!(dy.abs().sum().into_scalar(), 0.0);
        assert!(dx.abs().sum().into_scalar() > 0.0);
    }

    #[test]
    fn normalize_by_max_tolerates_zero_tensor() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::zeros([1, 2, 2, 1], &device);
        let value = normalize_by_max(x).sum().into_scalar();
        assert_eq!(value, 0.0);
    }
}
