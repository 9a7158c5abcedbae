use burn::backend::NdArray;
use burn::prelude::*;

use ivd_net::model::{NetworkConfig, Unet};
use ivd_net::training::checkpoint;
use ivd_net::UnetError;

type TestBackend = NdArray;

#[test]
fn round_trip_restores_identical_predictions() {
    let dir = tempfile::tempdir().unwrap();
    let device = Default::default();
    let config = NetworkConfig::new(2, 2, 2);

    let model = Unet::<TestBackend>::new(&device, &config).unwrap();
    let path = checkpoint::save(&model, 12, dir.path()).unwrap();
    assert!(path.is_file());

    let (restored, manifest) = checkpoint::load::<TestBackend>(dir.path(), &device).unwrap();
    assert_eq!(manifest.step, 12);
    assert_eq!(manifest.network, config);
    assert_eq!(manifest.num_params, model.num_learnable());

    let x = Tensor::<TestBackend, 4>::random(
        [1, 8, 8, 4],
        burn::tensor::Distribution::Default,
        &device,
    );
    let expected = model.predict(x.clone()).unwrap();
    let actual = restored.predict(x).unwrap();
    expected.into_data().assert_approx_eq(&actual.into_data(), 5);
}

#[test]
fn mismatched_network_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let device = Default::default();

    let model = Unet::<TestBackend>::new(&device, &NetworkConfig::new(2, 2, 2)).unwrap();
    checkpoint::save(&model, 1, dir.path()).unwrap();

    let other = Unet::<TestBackend>::new(&device, &NetworkConfig::new(2, 4, 2)).unwrap();
    assert!(matches!(
        checkpoint::restore(other, dir.path(), &device),
        Err(UnetError::CheckpointMismatch(_))
    ));
}

#[test]
fn missing_manifest_is_a_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let device = Default::default();
    let model = Unet::<TestBackend>::new(&device, &NetworkConfig::new(2, 2, 2)).unwrap();

    assert!(matches!(
        checkpoint::restore(model, dir.path(), &device),
        Err(UnetError::CheckpointMismatch(_))
    ));
}
