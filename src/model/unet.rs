use burn::nn::conv::Conv2d;
use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Result, UnetError};
use crate::model::blocks::{LayerSpec, BIAS_INIT};
use crate::model::decoder::Decoder;
use crate::model::encoder::{level_features, Encoder, TOWERS};
use crate::model::head::{AuxHead, Head, HeadKind};
use crate::model::ops;
use crate::model::params::{LearnableParams, ParamRef};
use crate::model::Mode;

pub const MIN_LEVELS: usize = 2;
pub const MAX_LEVELS: usize = 5;

/// Shape of the network. Head layout covers the plain and deep-supervised variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub levels: usize,
    pub features_root: usize,
    pub n_class: usize,
    /// Deep-supervision heads at decoder levels `1..=aux_heads`.
    #[serde(default)]
    pub aux_heads: usize,
    /// Adds a 1x1 convolution over all heads concatenated.
    #[serde(default)]
    pub fuse_heads: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            levels: 5,
            features_root: 16,
            n_class: 2,
            aux_heads: 0,
            fuse_heads: false,
        }
    }
}

impl NetworkConfig {
    pub fn new(levels: usize, features_root: usize, n_class: usize) -> Self {
        Self {
            levels,
            features_root,
            n_class,
            aux_heads: 0,
            fuse_heads: false,
        }
    }

    pub fn with_aux_heads(mut self, aux_heads: usize) -> Self {
        self.aux_heads = aux_heads;
        self
    }

    pub fn with_fuse_heads(mut self, fuse_heads: bool) -> Self {
        self.fuse_heads = fuse_heads;
        self
    }

    /// Three deep-supervision heads, no fusion.
    pub fn edge_net(features_root: usize, n_class: usize) -> Self {
        Self::new(5, features_root, n_class).with_aux_heads(3)
    }

    /// Two deep-supervision heads fused with the primary head.
    pub fn edge_net_3(features_root: usize, n_class: usize) -> Self {
        Self::new(5, features_root, n_class)
            .with_aux_heads(2)
            .with_fuse_heads(true)
    }

    /// One deep-supervision head fused with the primary head.
    pub fn edge_net_4(levels: usize, features_root: usize, n_class: usize) -> Self {
        Self::new(levels, features_root, n_class)
            .with_aux_heads(1)
            .with_fuse_heads(true)
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_LEVELS..=MAX_LEVELS).contains(&self.levels) {
            return Err(UnetError::InvalidConfiguration(format!(
                "levels must be within {MIN_LEVELS}..={MAX_LEVELS}, got {}",
                self.levels
            )));
        }
        if self.features_root == 0 {
            return Err(UnetError::InvalidConfiguration(
                "features_root must be positive".to_string(),
            ));
        }
        if self.n_class < 2 {
            return Err(UnetError::InvalidConfiguration(format!(
                "n_class must be at least 2, got {}",
                self.n_class
            )));
        }
        if self.aux_heads > self.levels - 2 {
            return Err(UnetError::InvalidConfiguration(format!(
                "{} levels support at most {} auxiliary heads, got {}",
                self.levels,
                self.levels - 2,
                self.aux_heads
            )));
        }
        Ok(())
    }

    /// Total downsampling between the input and the bottleneck.
    pub fn downsampling(&self) -> usize {
        1 << (self.levels - 1)
    }

    pub fn has_fusion(&self) -> bool {
        self.fuse_heads && self.aux_heads > 0
    }

    pub fn num_heads(&self) -> usize {
        1 + self.aux_heads + usize::from(self.has_fusion())
    }
}

/// All heads of one forward pass, prediction head first.
#[derive(Debug, Clone)]
pub struct ModelOutput<B: Backend> {
    pub heads: Vec<Head<B>>,
}

impl<B: Backend> ModelOutput<B> {
    /// Logits of the head used for prediction (the fused head when present).
    pub fn prediction_logits(&self) -> Tensor<B, 4> {
        self.heads[0].logits.clone()
    }

    pub fn logits(&self) -> Vec<Tensor<B, 4>> {
        self.heads.iter().map(|head| head.logits.clone()).collect()
    }

    pub fn head(&self, kind: HeadKind) -> Option<&Head<B>> {
        self.heads.iter().find(|head| head.kind == kind)
    }
}

/// Multi-tower inception U-Net taking NHWC input with one channel per tower.
#[derive(Module, Debug)]
pub struct Unet<B: Backend> {
    encoder: Encoder<B>,
    decoder: Decoder<B>,
    output: Conv2d<B>,
    aux_heads: Vec<AuxHead<B>>,
    fuse: Option<Conv2d<B>>,
    levels: usize,
    features_root: usize,
    n_class: usize,
    fuse_heads: bool,
}

impl<B: Backend> Unet<B> {
    pub fn new(device: &B::Device, config: &NetworkConfig) -> Result<Self> {
        config.validate()?;
        let NetworkConfig {
            levels,
            features_root,
            n_class,
            aux_heads,
            fuse_heads,
        } = config.clone();

        let fuse = config.has_fusion().then(|| {
            LayerSpec::new(1, (1 + aux_heads) * n_class, n_class).conv2d(device, Some(BIAS_INIT))
        });
        let aux_heads: Vec<AuxHead<B>> = (1..=aux_heads)
            .map(|level| AuxHead::new(device, level, level_features(level, features_root), n_class))
            .collect();

        log::info!(
            "Unet: levels={}, features_root={}, n_class={}, aux_heads={}, fused={}",
            levels,
            features_root,
            n_class,
            aux_heads.len(),
            fuse.is_some()
        );

        Ok(Self {
            encoder: Encoder::new(device, levels, features_root),
            decoder: Decoder::new(device, levels, features_root),
            output: LayerSpec::new(3, features_root, n_class).conv2d(device, Some(BIAS_INIT)),
            aux_heads,
            fuse,
            levels,
            features_root,
            n_class,
            fuse_heads,
        })
    }

    pub fn config(&self) -> NetworkConfig {
        NetworkConfig {
            levels: self.levels,
            features_root: self.features_root,
            n_class: self.n_class,
            aux_heads: self.aux_heads.len(),
            fuse_heads: self.fuse_heads,
        }
    }

    pub fn n_class(&self) -> usize {
        self.n_class
    }

    /// Rejects inputs whose channel count or spatial size the graph cannot handle.
    pub fn check_input(&self, dims: [usize; 4]) -> Result<()> {
        let [batch, height, width, channels] = dims;
        let factor = self.config().downsampling();
        if batch == 0 {
            return Err(UnetError::InvalidInput("empty batch".to_string()));
        }
        if channels != TOWERS {
            return Err(UnetError::InvalidInput(format!(
                "expected {TOWERS} input channels, got {channels}"
            )));
        }
        if height == 0 || width == 0 || height % factor != 0 || width % factor != 0 {
            return Err(UnetError::InvalidInput(format!(
                "spatial size {height}x{width} must be a positive multiple of {factor}"
            )));
        }
        Ok(())
    }

    /// `x` is NHWC. Heads come back NHWC: fused (if any), primary, then auxiliary by level.
    pub fn forward(&self, x: Tensor<B, 4>, mode: Mode) -> Result<ModelOutput<B>> {
        self.check_input(x.dims())?;

        let state = self.encoder.forward(ops::nhwc_to_nchw(x), mode)?;
        let decoded = self.decoder.forward(&state, mode);

        let primary = self.output.forward(decoded[0].clone());
        let auxiliary: Vec<(usize, Tensor<B, 4>)> = self
            .aux_heads
            .iter()
            .map(|head| (head.level(), head.forward(decoded[head.level()].clone(), mode)))
            .collect();

        let mut heads = Vec::with_capacity(2 + auxiliary.len());
        if let Some(fuse) = &self.fuse {
            let mut stacked = vec![primary.clone()];
            stacked.extend(auxiliary.iter().map(|(_, logits)| logits.clone()));
            heads.push(Head {
                kind: HeadKind::Fused,
                logits: ops::nchw_to_nhwc(fuse.forward(Tensor::cat(stacked, 1))),
            });
        }
        heads.push(Head {
            kind: HeadKind::Primary,
            logits: ops::nchw_to_nhwc(primary),
        });
        heads.extend(auxiliary.into_iter().map(|(level, logits)| Head {
            kind: HeadKind::Auxiliary { level },
            logits: ops::nchw_to_nhwc(logits),
        }));

        Ok(ModelOutput { heads })
    }

    /// Class probabilities of the prediction head, NHWC, computed with running statistics.
    pub fn predict(&self, x: Tensor<B, 4>) -> Result<Tensor<B, 4>> {
        let output = self.forward(x, Mode::Infer)?;
        Ok(ops::pixel_wise_softmax(output.prediction_logits()))
    }

    /// Number of learnable scalars, excluding normalization running statistics.
    pub fn num_learnable(&self) -> usize {
        self.params().iter().map(ParamRef::num_elements).sum()
    }
}

impl<B: Backend> LearnableParams<B> for Unet<B> {
    fn collect_params(&self, out: &mut Vec<ParamRef<B>>) {
        self.encoder.collect_params(out);
        self.decoder.collect_params(out);
        self.output.collect_params(out);
        self.aux_heads.collect_params(out);
        self.fuse.collect_params(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    #[test]
    fn rejects_out_of_range_configuration() {
        let device = Default::default();
        for config in [
            NetworkConfig::new(1, 4, 2),
            NetworkConfig::new(6, 4, 2),
            NetworkConfig::new(3, 0, 2),
            NetworkConfig::new(3, 4, 1),
            NetworkConfig::new(3, 4, 2).with_aux_heads(2),
        ] {
            assert!(matches!(
                Unet::<TestBackend>::new(&device, &config),
                Err(UnetError::InvalidConfiguration(_))
            ));
        }
    }

    #[test]
    fn rejects_indivisible_input() {
        let device = Default::default();
        let model = Unet::<TestBackend>::new(&device, &NetworkConfig::new(3, 2, 2)).unwrap();
        let x = Tensor::<TestBackend, 4>::zeros([1, 10, 12, 4], &device);
        assert!(matches!(model.forward(x, Mode::Infer), Err(UnetError::InvalidInput(_))));

        let x = Tensor::<TestBackend, 4>::zeros([1, 12, 12, 3], &device);
        assert!(matches!(model.forward(x, Mode::Infer), Err(UnetError::InvalidInput(_))));
    }

    #[test]
    fn fused_variant_orders_heads() {
        let device = Default::default();
        let config = NetworkConfig::new(3, 2, 3).with_aux_heads(1).with_fuse_heads(true);
        let model = Unet::<TestBackend>::new(&device, &config).unwrap();
        let x = Tensor::<TestBackend, 4>::random([2, 8, 8, 4], Distribution::Default, &device);

        let output = model.forward(x, Mode::Train { keep_prob: 0.75 }).unwrap();
        let kinds: Vec<HeadKind> = output.heads.iter().map(|head| head.kind).collect();
        assert_eq!(
            kinds,
            vec![HeadKind::Fused, HeadKind::Primary, HeadKind::Auxiliary { level: 1 }]
        );
        for head in &output.heads {
            assert_eq!(head.logits.dims(), [2, 8, 8, 3]);
        }
    }

    #[test]
    fn unfused_deep_supervision_keeps_primary_first() {
        let device = Default::default();
        let config = NetworkConfig::new(4, 1, 2).with_aux_heads(2);
        let model = Unet::<TestBackend>::new(&device, &config).unwrap();
        let x = Tensor::<TestBackend, 4>::zeros([1, 16, 16, 4], &device);

        let output = model.forward(x, Mode::Infer).unwrap();
        assert_eq!(output.heads.len(), config.num_heads());
        assert_eq!(output.heads[0].kind, HeadKind::Primary);
        assert!(output.head(HeadKind::Auxiliary { level: 2 }).is_some());
    }

    #[test]
    fn prediction_is_a_distribution() {
        let device = Default::default();
        let model = Unet::<TestBackend>::new(&device, &NetworkConfig::new(2, 2, 2)).unwrap();
        let x = Tensor::<TestBackend, 4>::random([1, 4, 6, 4], Distribution::Default, &device);

        let probs = model.predict(x).unwrap();
        assert_eq!(probs.dims(), [1, 4, 6, 2]);
        let sums = probs.sum_dim(3).into_data().to_vec::<f32>().unwrap();
        assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
    }

    #[test]
    fn config_round_trips_through_model() {
        let device = Default::default();
        let config = NetworkConfig::edge_net_4(3, 2, 2);
        let model = Unet::<TestBackend>::new(&device, &config).unwrap();
        assert_eq!(model.config(), config);
    }
}
