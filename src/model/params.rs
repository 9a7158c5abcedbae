use burn::nn::conv::{Conv2d, ConvTranspose2d};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;

use super::blocks::{ConvBiasRelu, ConvNormRelu, Inception, Norm, Upsample};

/// Borrowed view of one learnable tensor, used for L2 regularization and gradient tracking.
#[derive(Debug, Clone)]
pub enum ParamRef<B: Backend> {
    Kernel(Tensor<B, 4>),
    Vector(Tensor<B, 1>),
}

impl<B: Backend> ParamRef<B> {
    /// `‖w‖²`
    pub fn squared_norm(&self) -> Tensor<B, 1> {
        match self {
            ParamRef::Kernel(t) => t.clone().powf_scalar(2.0).sum(),
            ParamRef::Vector(t) => t.clone().powf_scalar(2.0).sum(),
        }
    }

    pub fn num_elements(&self) -> usize {
        match self {
            ParamRef::Kernel(t) => t.shape().num_elements(),
            ParamRef::Vector(t) => t.shape().num_elements(),
        }
    }
}

impl<B: AutodiffBackend> ParamRef<B> {
    /// Flattened gradient of this tensor, if it took part in the backward pass.
    pub fn grad(&self, grads: &B::Gradients) -> Option<Tensor<B::InnerBackend, 1>> {
        match self {
            ParamRef::Kernel(t) => t.grad(grads).map(|g| {
                let n = g.shape().num_elements();
                g.reshape([n])
            }),
            ParamRef::Vector(t) => t.grad(grads),
        }
    }
}

/// Enumerates every learnable tensor of a module in a stable order.
pub trait LearnableParams<B: Backend> {
    fn collect_params(&self, out: &mut Vec<ParamRef<B>>);

    fn params(&self) -> Vec<ParamRef<B>> {
        let mut out = Vec::new();
        self.collect_params(&mut out);
        out
    }
}

impl<B: Backend> LearnableParams<B> for Conv2d<B> {
    fn collect_params(&self, out: &mut Vec<ParamRef<B>>) {
        out.push(ParamRef::Kernel(self.weight.val()));
        if let Some(bias) = &self.bias {
            out.push(ParamRef::Vector(bias.val()));
        }
    }
}

impl<B: Backend> LearnableParams<B> for ConvTranspose2d<B> {
    fn collect_params(&self, out: &mut Vec<ParamRef<B>>) {
        out.push(ParamRef::Kernel(self.weight.val()));
        if let Some(bias) = &self.bias {
            out.push(ParamRef::Vector(bias.val()));
        }
    }
}

impl<B: Backend> LearnableParams<B> for Norm<B> {
    fn collect_params(&self, out: &mut Vec<ParamRef<B>>) {
        out.push(ParamRef::Vector(self.gamma.val()));
        out.push(ParamRef::Vector(self.beta.val()));
    }
}

impl<B: Backend> LearnableParams<B> for ConvNormRelu<B> {
    fn collect_params(&self, out: &mut Vec<ParamRef<B>>) {
        self.conv.collect_params(out);
        self.norm.collect_params(out);
    }
}

impl<B: Backend> LearnableParams<B> for ConvBiasRelu<B> {
    fn collect_params(&self, out: &mut Vec<ParamRef<B>>) {
        self.conv.collect_params(out);
    }
}

impl<B: Backend> LearnableParams<B> for Upsample<B> {
    fn collect_params(&self, out: &mut Vec<ParamRef<B>>) {
        self.deconv.collect_params(out);
    }
}

impl<B: Backend> LearnableParams<B> for Inception<B> {
    fn collect_params(&self, out: &mut Vec<ParamRef<B>>) {
        for part in self.parts() {
            part.collect_params(out);
        }
        for branch in self.branches() {
            branch.collect_params(out);
        }
    }
}

impl<B: Backend, M: LearnableParams<B>> LearnableParams<B> for Vec<M> {
    fn collect_params(&self, out: &mut Vec<ParamRef<B>>) {
        for module in self {
            module.collect_params(out);
        }
    }
}

impl<B: Backend, M: LearnableParams<B>> LearnableParams<B> for Option<M> {
    fn collect_params(&self, out: &mut Vec<ParamRef<B>>) {
        if let Some(module) = self {
            module.collect_params(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn inception_params_cover_every_learnable_element() {
        let device = Default::default();
        let block = Inception::<TestBackend>::new(&device, 2, 4);
        let counted: usize = block.params().iter().map(ParamRef::num_elements).sum();
        // stem 72+8, branches 20+148+404+148+148, fuse 80+8, output 144+8
        assert_eq!(counted, 1188);
    }

    #[test]
    fn squared_norm_of_ones() {
        let device = Default::default();
        let param = ParamRef::Kernel(Tensor::<TestBackend, 4>::ones([2, 3, 1, 1], &device));
        assert_eq!(param.squared_norm().into_scalar(), 6.0);
    }
}
