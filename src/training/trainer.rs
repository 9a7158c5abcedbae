use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::module::AutodiffModule;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{AdamConfig, GradientsParams, Optimizer, SgdConfig};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use indicatif::{ProgressBar, ProgressStyle};

use crate::data::{Batch, DataProvider};
use crate::error::Result;
use crate::model::{ops, LearnableParams, Mode, SegmentationLoss, Unet};
use crate::training::checkpoint;
use crate::training::config::{OptimizerConfig, TrainingConfig};
use crate::training::metrics::{self, GradientAverage};
use crate::training::optimizer::LearningRateSchedule;
use crate::training::snapshot;

const ADAM_EPSILON: f32 = 1e-8;

/// Result of one optimization step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub loss: f32,
    pub learning_rate: f64,
    /// Norms of the running-mean gradients, when gradient tracking is enabled.
    pub gradient_norms: Option<Vec<f32>>,
}

/// Loss and pixel metrics of the prediction head in inference mode.
#[derive(Debug, Clone)]
pub struct Evaluation<B: Backend> {
    pub loss: f32,
    pub accuracy: f32,
    pub error_rate: f32,
    pub probabilities: Tensor<B, 4>,
}

pub struct Trainer<B: AutodiffBackend, O: Optimizer<Unet<B>, B>> {
    pub model: Unet<B>,
    optimizer: O,
    loss: SegmentationLoss,
    schedule: LearningRateSchedule,
    config: TrainingConfig,
    device: B::Device,
    global_step: usize,
    gradients: Option<GradientAverage<B::InnerBackend>>,
}

impl<B: AutodiffBackend, O: Optimizer<Unet<B>, B>> Trainer<B, O> {
    pub fn new(
        config: TrainingConfig,
        model: Unet<B>,
        optimizer: O,
        device: B::Device,
    ) -> Result<Self> {
        config.validate()?;
        let loss = SegmentationLoss::new(&config.loss, model.n_class())?;
        let schedule = LearningRateSchedule::from_config(&config);
        let gradients = config.norm_grads.then(GradientAverage::new);

        Ok(Self {
            model,
            optimizer,
            loss,
            schedule,
            config,
            device,
            global_step: 0,
            gradients,
        })
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn learning_rate(&self) -> f64 {
        self.schedule.at(self.global_step)
    }

    /// Forward in training mode, backpropagate and apply one optimizer update.
    pub fn step(&mut self, batch: &Batch<B>, keep_prob: f64) -> Result<StepOutput> {
        let output = self
            .model
            .forward(batch.images.clone(), Mode::Train { keep_prob })?;
        let loss = self
            .loss
            .compute(&output.logits(), batch.labels.clone(), &batch.regions, &self.model)?;

        let loss_value = loss.clone().into_scalar().elem::<f32>();
        if !loss_value.is_finite() {
            log::warn!("non-finite loss {} at step {}", loss_value, self.global_step);
        }

        let learning_rate = self.schedule.at(self.global_step);
        let grads = loss.backward();

        let gradient_norms = match &mut self.gradients {
            Some(average) => {
                let current = self
                    .model
                    .params()
                    .iter()
                    .filter_map(|param| param.grad(&grads))
                    .collect();
                average.update(current)?;
                Some(average.norms())
            }
            None => None,
        };

        let grads = GradientsParams::from_grads(grads, &self.model);
        self.model = self.optimizer.step(learning_rate, self.model.clone(), grads);
        self.global_step += 1;

        Ok(StepOutput {
            loss: loss_value,
            learning_rate,
            gradient_norms,
        })
    }

    /// Scores a batch without dropout and without touching running statistics.
    pub fn evaluate(&self, batch: &Batch<B>) -> Result<Evaluation<B::InnerBackend>> {
        let model = self.model.valid();
        let batch = batch.inner();

        let output = model.forward(batch.images.clone(), Mode::Infer)?;
        let loss = self
            .loss
            .compute(&output.logits(), batch.labels.clone(), &batch.regions, &model)?
            .into_scalar()
            .elem::<f32>();
        let probabilities = ops::pixel_wise_softmax(output.prediction_logits());

        Ok(Evaluation {
            loss,
            accuracy: metrics::accuracy(probabilities.clone(), batch.labels.clone()),
            error_rate: metrics::error_rate(probabilities.clone(), batch.labels),
            probabilities,
        })
    }

    /// Restores parameters and step counter from `dir`.
    pub fn restore(&mut self, dir: &Path) -> Result<()> {
        let (model, step) = checkpoint::restore(self.model.clone(), dir, &self.device)?;
        self.model = model;
        self.global_step = step;
        Ok(())
    }

    fn store_prediction(
        &self,
        batch: &Batch<B>,
        name: &str,
    ) -> Result<Evaluation<B::InnerBackend>> {
        let evaluation = self.evaluate(batch)?;
        let batch = batch.inner();
        snapshot::store_prediction(
            batch.images,
            batch.labels,
            evaluation.probabilities.clone(),
            Path::new(&self.config.prediction_path),
            name,
        )?;
        Ok(evaluation)
    }

    fn prepare_directories(&self) -> Result<()> {
        for dir in [&self.config.prediction_path, &self.config.output_path] {
            let path = Path::new(dir);
            if !self.config.restore && path.exists() {
                log::info!("removing '{}'", path.display());
                fs::remove_dir_all(path)?;
            }
            if !path.exists() {
                log::info!("allocating '{}'", path.display());
                fs::create_dir_all(path)?;
            }
        }
        Ok(())
    }

    /// Runs the full training schedule and returns the checkpoint path.
    pub fn fit<P: DataProvider<B>>(&mut self, provider: &mut P) -> Result<PathBuf> {
        let output_path = PathBuf::from(&self.config.output_path);
        let mut save_path = checkpoint::model_path(&output_path);
        if self.config.epochs == 0 {
            return Ok(save_path);
        }

        self.prepare_directories()?;
        if self.config.restore {
            if save_path.exists() {
                self.restore(&output_path)?;
            } else {
                log::info!("nothing to restore in {}", output_path.display());
            }
        }

        let verification = provider.next_batch(self.config.verification_batch_size, &self.device)?;
        let initial = self.store_prediction(&verification, "_init")?;
        log::info!(
            "verification error {:.2}%, loss {:.6}",
            initial.error_rate,
            initial.loss
        );

        log::info!("start optimization");
        let training_iters = self.config.training_iters;
        for epoch in 0..self.config.epochs {
            let epoch_start = Instant::now();
            let progress = ProgressBar::new(training_iters as u64);
            progress.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );

            let mut total_loss = 0.0f32;
            let mut learning_rate = self.learning_rate();
            for _ in 0..training_iters {
                let batch = provider.next_batch(self.config.batch_size, &self.device)?;
                let step = self.global_step;
                let output = self.step(&batch, self.config.keep_prob)?;
                total_loss += output.loss;
                learning_rate = output.learning_rate;

                if let Some(norms) = &output.gradient_norms {
                    log::debug!("step {} gradient norms {:?}", step, norms);
                }
                if step % self.config.display_step == 0 {
                    let stats = self.evaluate(&batch)?;
                    log::info!(
                        "iter {}, minibatch loss {:.6}, accuracy {:.6}, error {:.2}%",
                        step,
                        stats.loss,
                        stats.accuracy,
                        stats.error_rate
                    );
                }
                progress.set_message(format!("loss={:.4}", output.loss));
                progress.inc(1);
            }
            progress.finish_and_clear();

            log::info!(
                "epoch {}, average loss {:.6}, learning rate {:.5} ({:.1}s)",
                epoch,
                total_loss / training_iters as f32,
                learning_rate,
                epoch_start.elapsed().as_secs_f32()
            );
            self.store_prediction(&verification, &format!("epoch_{epoch}"))?;
            save_path = checkpoint::save(&self.model, self.global_step, &output_path)?;
        }

        log::info!("optimization finished");
        Ok(save_path)
    }
}

fn adam_config(beta_1: f32, beta_2: f32) -> AdamConfig {
    AdamConfig::new()
        .with_beta_1(beta_1)
        .with_beta_2(beta_2)
        .with_epsilon(ADAM_EPSILON)
}

/// Builds the network and the configured optimizer, then trains.
pub fn train<B: AutodiffBackend, P: DataProvider<B>>(
    config: TrainingConfig,
    provider: &mut P,
    device: B::Device,
) -> Result<PathBuf> {
    config.validate()?;
    let model = Unet::<B>::new(&device, &config.network)?;

    match config.optimizer.clone() {
        OptimizerConfig::Momentum { momentum, .. } => {
            let optimizer = SgdConfig::new()
                .with_momentum(Some(
                    MomentumConfig::new()
                        .with_momentum(momentum)
                        .with_dampening(0.0),
                ))
                .init::<B, Unet<B>>();
            Trainer::new(config, model, optimizer, device)?.fit(provider)
        }
        OptimizerConfig::Adam { beta_1, beta_2, .. } => {
            let optimizer = adam_config(beta_1, beta_2).init::<B, Unet<B>>();
            Trainer::new(config, model, optimizer, device)?.fit(provider)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{CircleConfig, SyntheticProvider};
    use crate::model::{LossConfig, NetworkConfig};
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = Autodiff<NdArray>;

    fn small_config(dir: &Path) -> TrainingConfig {
        TrainingConfig {
            network: NetworkConfig::new(2, 2, 2),
            loss: LossConfig::new("cross_entropy"),
            batch_size: 1,
            verification_batch_size: 1,
            epochs: 1,
            training_iters: 2,
            norm_grads: true,
            output_path: dir.join("model").display().to_string(),
            prediction_path: dir.join("prediction").display().to_string(),
            ..TrainingConfig::default()
        }
    }

    fn provider() -> SyntheticProvider {
        SyntheticProvider::new(8, 8, CircleConfig::default())
            .unwrap()
            .with_seed(1)
    }

    #[test]
    fn step_advances_and_tracks_gradients() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let config = small_config(dir.path());
        let model = Unet::<TestBackend>::new(&device, &config.network).unwrap();
        let optimizer = AdamConfig::new().init::<TestBackend, Unet<TestBackend>>();
        let mut trainer = Trainer::new(config, model, optimizer, device).unwrap();

        let batch = DataProvider::<TestBackend>::next_batch(&mut provider(), 1, &device).unwrap();
        let first = trainer.step(&batch, 0.75).unwrap();
        let second = trainer.step(&batch, 0.75).unwrap();

        assert!(first.loss.is_finite());
        assert_eq!(trainer.global_step(), 2);
        assert_eq!(second.learning_rate, 0.2);
        let norms = second.gradient_norms.unwrap();
        assert!(!norms.is_empty());
        assert!(norms.len() <= trainer.model.params().len());
        assert!(norms.iter().all(|n| n.is_finite()));
    }

    #[test]
    fn adam_uses_small_epsilon() {
        let config = serde_json::to_value(adam_config(0.9, 0.999)).unwrap();
        assert_eq!(config["epsilon"].as_f64().unwrap() as f32, 1e-8);
        assert_eq!(config["beta_2"].as_f64().unwrap() as f32, 0.999);
    }

    #[test]
    fn zero_epochs_returns_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingConfig {
            epochs: 0,
            ..small_config(dir.path())
        };
        let path = train::<TestBackend, _>(config, &mut provider(), Default::default()).unwrap();
        assert_eq!(path, dir.path().join("model").join("model.bin"));
        assert!(!dir.path().join("prediction").exists());
    }

    #[test]
    fn fit_writes_snapshots_and_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(dir.path());
        let path = train::<TestBackend, _>(config, &mut provider(), Default::default()).unwrap();

        assert!(path.is_file());
        assert!(dir.path().join("model").join("checkpoint.json").is_file());
        assert!(dir.path().join("prediction").join("_init.jpg").is_file());
        assert!(dir.path().join("prediction").join("epoch_0.jpg").is_file());
    }
}
