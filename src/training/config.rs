use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UnetError};
use crate::model::{LossConfig, NetworkConfig};

/// Optimizer choice with its learning-rate schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizerConfig {
    Momentum {
        learning_rate: f64,
        decay_rate: f64,
        momentum: f64,
    },
    Adam {
        learning_rate: f64,
        decay_rate: f64,
        decay_epochs: usize,
        beta_1: f32,
        beta_2: f32,
    },
}

impl OptimizerConfig {
    pub fn momentum() -> Self {
        OptimizerConfig::Momentum {
            learning_rate: 0.2,
            decay_rate: 0.95,
            momentum: 0.2,
        }
    }

    pub fn adam() -> Self {
        OptimizerConfig::Adam {
            learning_rate: 0.001,
            decay_rate: 1.0,
            decay_epochs: 1,
            beta_1: 0.9,
            beta_2: 0.99,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            OptimizerConfig::Momentum { learning_rate, .. }
            | OptimizerConfig::Adam { learning_rate, .. } => *learning_rate,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let (learning_rate, decay_rate) = match self {
            OptimizerConfig::Momentum {
                learning_rate,
                decay_rate,
                momentum,
            } => {
                if !(0.0..1.0).contains(momentum) {
                    return Err(UnetError::InvalidConfiguration(format!(
                        "momentum must be in [0, 1), got {momentum}"
                    )));
                }
                (*learning_rate, *decay_rate)
            }
            OptimizerConfig::Adam {
                learning_rate,
                decay_rate,
                decay_epochs,
                ..
            } => {
                if *decay_epochs == 0 {
                    return Err(UnetError::InvalidConfiguration(
                        "decay_epochs must be at least 1".to_string(),
                    ));
                }
                (*learning_rate, *decay_rate)
            }
        };
        if !(learning_rate > 0.0 && learning_rate.is_finite()) {
            return Err(UnetError::InvalidConfiguration(format!(
                "learning_rate must be positive, got {learning_rate}"
            )));
        }
        if !(decay_rate > 0.0 && decay_rate.is_finite()) {
            return Err(UnetError::InvalidConfiguration(format!(
                "decay_rate must be positive, got {decay_rate}"
            )));
        }
        Ok(())
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::momentum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    // Model
    pub network: NetworkConfig,
    pub loss: LossConfig,
    pub optimizer: OptimizerConfig,

    // Training
    pub batch_size: usize,
    pub verification_batch_size: usize,
    pub keep_prob: f64,
    pub epochs: usize,
    pub training_iters: usize,
    pub display_step: usize,
    pub norm_grads: bool,

    // Checkpointing
    pub restore: bool,
    pub output_path: String,
    pub prediction_path: String,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            loss: LossConfig::default(),
            optimizer: OptimizerConfig::default(),
            batch_size: 4,
            verification_batch_size: 4,
            keep_prob: 0.75,
            epochs: 100,
            training_iters: 10,
            display_step: 1,
            norm_grads: false,
            restore: false,
            output_path: "runs/unet".to_string(),
            prediction_path: "prediction".to_string(),
        }
    }
}

impl TrainingConfig {
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TrainingConfig = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.network.validate()?;
        self.optimizer.validate()?;
        if !(self.keep_prob > 0.0 && self.keep_prob <= 1.0) {
            return Err(UnetError::InvalidConfiguration(format!(
                "keep_prob must be in (0, 1], got {}",
                self.keep_prob
            )));
        }
        for (name, value) in [
            ("batch_size", self.batch_size),
            ("verification_batch_size", self.verification_batch_size),
            ("training_iters", self.training_iters),
            ("display_step", self.display_step),
        ] {
            if value == 0 {
                return Err(UnetError::InvalidConfiguration(format!(
                    "{name} must be at least 1"
                )));
            }
        }
        Ok(())
    }

    /// Steps between two learning-rate decays.
    pub fn decay_steps(&self) -> usize {
        match &self.optimizer {
            OptimizerConfig::Momentum { .. } => self.training_iters,
            OptimizerConfig::Adam { decay_epochs, .. } => self.training_iters * decay_epochs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TrainingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.batch_size, 4);
        assert_eq!(config.decay_steps(), 10);
    }

    #[test]
    fn yaml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.yaml");

        let config = TrainingConfig {
            optimizer: OptimizerConfig::adam(),
            epochs: 3,
            loss: LossConfig::new("dice"),
            ..TrainingConfig::default()
        };
        config.save(&path).unwrap();
        let loaded = TrainingConfig::from_yaml(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn partial_yaml_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.yaml");
        let yaml = "epochs: 7
optimizer:
  type: adam
  learning_rate: 0.01
  decay_rate: 0.5
  decay_epochs: 2
  beta_1: 0.9
  beta_2: 0.99
";
        std::fs::write(&path, yaml).unwrap();

        let loaded = TrainingConfig::from_yaml(&path).unwrap();
        assert_eq!(loaded.epochs, 7);
        assert_eq!(loaded.training_iters, 10);
        assert_eq!(loaded.decay_steps(), 20);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let config = TrainingConfig {
            keep_prob: 0.0,
            ..TrainingConfig::default()
        };
        assert!(matches!(config.validate(), Err(UnetError::InvalidConfiguration(_))));

        let config = TrainingConfig {
            batch_size: 0,
            ..TrainingConfig::default()
        };
        assert!(matches!(config.validate(), Err(UnetError::InvalidConfiguration(_))));
    }
}
