use burn::backend::NdArray;
use burn::prelude::*;

use ivd_net::model::{HeadKind, LossConfig, Mode, NetworkConfig, SegmentationLoss, Unet};
use ivd_net::UnetError;

type TestBackend = NdArray;

fn one_hot_background(
    shape: [usize; 3],
    device: &<TestBackend as Backend>::Device,
) -> Tensor<TestBackend, 4> {
    let [n, h, w] = shape;
    let background = Tensor::<TestBackend, 4>::ones([n, h, w, 1], device);
    let foreground = Tensor::<TestBackend, 4>::zeros([n, h, w, 1], device);
    Tensor::cat(vec![background, foreground], 3)
}

#[test]
fn small_network_forward_and_cross_entropy() {
    let device = Default::default();
    let model = Unet::<TestBackend>::new(&device, &NetworkConfig::new(2, 4, 2)).unwrap();

    let x = Tensor::<TestBackend, 4>::zeros([1, 32, 32, 4], &device);
    let output = model.forward(x, Mode::Infer).unwrap();
    assert_eq!(output.heads.len(), 1);
    assert_eq!(output.prediction_logits().dims(), [1, 32, 32, 2]);

    let loss = SegmentationLoss::new(&LossConfig::new("cross_entropy"), 2).unwrap();
    let value: f32 = loss
        .compute(&output.logits(), one_hot_background([1, 32, 32], &device), &[], &model)
        .unwrap()
        .into_scalar();
    assert!(value.is_finite());
    assert!(value >= 0.0);
}

#[test]
fn predictions_are_probabilities() {
    let device = Default::default();
    let model = Unet::<TestBackend>::new(&device, &NetworkConfig::new(2, 4, 2)).unwrap();
    let x = Tensor::<TestBackend, 4>::random(
        [2, 16, 16, 4],
        burn::tensor::Distribution::Default,
        &device,
    );

    let probabilities = model.predict(x).unwrap();
    assert_eq!(probabilities.dims(), [2, 16, 16, 2]);
    let sums: Vec<f32> = probabilities.sum_dim(3).into_data().to_vec().unwrap();
    assert!(sums.iter().all(|s| (s - 1.0).abs() < 1e-5));
}

#[test]
fn deep_supervision_heads_share_full_resolution() {
    let device = Default::default();
    let config = NetworkConfig::edge_net_4(3, 2, 2);
    let model = Unet::<TestBackend>::new(&device, &config).unwrap();

    let x = Tensor::<TestBackend, 4>::zeros([1, 16, 16, 4], &device);
    let output = model.forward(x, Mode::Train { keep_prob: 0.75 }).unwrap();

    let kinds: Vec<HeadKind> = output.heads.iter().map(|head| head.kind).collect();
    assert_eq!(
        kinds,
        vec![HeadKind::Fused, HeadKind::Primary, HeadKind::Auxiliary { level: 1 }]
    );
    for head in &output.heads {
        assert_eq!(head.logits.dims(), [1, 16, 16, 2]);
    }

    let loss = SegmentationLoss::new(&LossConfig::new("dice+ce"), 2).unwrap();
    let value: f32 = loss
        .compute(&output.logits(), one_hot_background([1, 16, 16], &device), &[], &model)
        .unwrap()
        .into_scalar();
    assert!(value.is_finite());
}

#[test]
fn invalid_inputs_are_rejected() {
    let device = Default::default();
    let model = Unet::<TestBackend>::new(&device, &NetworkConfig::new(3, 2, 2)).unwrap();

    let wrong_channels = Tensor::<TestBackend, 4>::zeros([1, 16, 16, 3], &device);
    assert!(matches!(model.forward(wrong_channels, Mode::Infer), Err(UnetError::InvalidInput(_))));

    let not_divisible = Tensor::<TestBackend, 4>::zeros([1, 18, 16, 4], &device);
    assert!(matches!(model.forward(not_divisible, Mode::Infer), Err(UnetError::InvalidInput(_))));
}

#[test]
fn loss_selector_errors() {
    assert!(matches!(
        SegmentationLoss::new(&LossConfig::new("bogus"), 2),
        Err(UnetError::InvalidConfiguration(_))
    ));
    assert!(matches!(
        SegmentationLoss::new(&LossConfig::new("each_IVD"), 2),
        Err(UnetError::UnsupportedLoss(_))
    ));
    assert!(matches!(
        Unet::<TestBackend>::new(&Default::default(), &NetworkConfig::new(6, 2, 2)),
        Err(UnetError::InvalidConfiguration(_))
    ));
}
