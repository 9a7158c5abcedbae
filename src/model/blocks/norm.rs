use burn::module::{Param, RunningState};
use burn::nn::Initializer;
use burn::prelude::*;

use crate::model::Mode;

const MOMENTUM: f64 = 0.1;
const EPSILON: f64 = 1e-5;

/// Batch normalization over the channel axis of an NCHW tensor.
///
/// The mode is passed explicitly instead of being inferred from the backend, so the
/// same autodiff model can be evaluated with running statistics mid-training.
#[derive(Module, Debug)]
pub struct Norm<B: Backend> {
    pub gamma: Param<Tensor<B, 1>>,
    pub beta: Param<Tensor<B, 1>>,
    running_mean: RunningState<Tensor<B, 1>>,
    running_var: RunningState<Tensor<B, 1>>,
    momentum: f64,
    epsilon: f64,
}

impl<B: Backend> Norm<B> {
    pub fn new(device: &B::Device, channels: usize) -> Self {
        Self {
            gamma: Initializer::Ones.init([channels], device),
            beta: Initializer::Zeros.init([channels], device),
            running_mean: RunningState::new(Tensor::zeros([channels], device)),
            running_var: RunningState::new(Tensor::ones([channels], device)),
            momentum: MOMENTUM,
            epsilon: EPSILON,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>, mode: Mode) -> Tensor<B, 4> {
        let [_, channels, _, _] = x.dims();

        let (mean, var) = if mode.is_training() {
            self.batch_statistics(x.clone())
        } else {
            (self.running_mean.value_sync(), self.running_var.value_sync())
        };

        let mean = mean.reshape([1, channels, 1, 1]);
        let std = var.add_scalar(self.epsilon).sqrt().reshape([1, channels, 1, 1]);
        let gamma = self.gamma.val().reshape([1, channels, 1, 1]);
        let beta = self.beta.val().reshape([1, channels, 1, 1]);

        (x - mean) / std * gamma + beta
    }

    fn batch_statistics(&self, x: Tensor<B, 4>) -> (Tensor<B, 1>, Tensor<B, 1>) {
        let [batch, channels, height, width] = x.dims();
        let flat = x.swap_dims(0, 1).reshape([channels, batch * height * width]);

        let mean = flat.clone().mean_dim(1);
        let var = (flat - mean.clone()).powf_scalar(2.0).mean_dim(1);
        let mean = mean.reshape([channels]);
        let var = var.reshape([channels]);

        let running_mean = self.running_mean.value_sync();
        let running_var = self.running_var.value_sync();
        self.running_mean.update(
            running_mean
                .mul_scalar(1.0 - self.momentum)
                .add(mean.clone().detach().mul_scalar(self.momentum))
                .detach(),
        );
        self.running_var.update(
            running_var
                .mul_scalar(1.0 - self.momentum)
                .add(var.clone().detach().mul_scalar(self.momentum))
                .detach(),
        );

        (mean, var)
    }

    pub fn running_mean(&self) -> Tensor<B, 1> {
        self.running_mean.value_sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    #[test]
    fn train_mode_normalizes_each_channel() {
        let device = Default::default();
        let norm = Norm::<TestBackend>::new(&device, 3);
        let x =
            Tensor::<TestBackend, 4>::random([2, 3, 4, 4], Distribution::Normal(5.0, 2.0), &device);

        let y = norm.forward(x, Mode::Train { keep_prob: 1.0 });
        let per_channel = y.swap_dims(0, 1).reshape([3, 32]).mean_dim(1);
        for value in per_channel.into_data().to_vec::<f32>().unwrap() {
            assert!(value.abs() < 1e-4, "channel mean was {value}");
        }
    }

    #[test]
    fn train_mode_moves_running_mean() {
        let device = Default::default();
        let norm = Norm::<TestBackend>::new(&device, 1);
        let x = Tensor::<TestBackend, 4>::full([1, 1, 2, 2], 10.0, &device);

        norm.forward(x, Mode::Train { keep_prob: 1.0 });
        let mean = norm.running_mean().into_scalar();
        assert!((mean - 1.0).abs() < 1e-5);
    }

    #[test]
    fn infer_mode_uses_running_statistics() {
        let device = Default::default();
        let norm = Norm::<TestBackend>::new(&device, 2);
        let x = Tensor::<TestBackend, 4>::full([1, 2, 3, 3], 4.0, &device);

        // Fresh running stats are mean 0, var 1, so inference is close to identity.
        let y = norm.forward(x.clone(), Mode::Infer);
        y.into_data().assert_approx_eq(&x.into_data(), 3);
    }
}
