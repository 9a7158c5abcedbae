use crate::training::config::{OptimizerConfig, TrainingConfig};

/// Staircase exponential decay: `lr0 · rate^floor(step / decay_steps)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LearningRateSchedule {
    initial: f64,
    decay_rate: f64,
    decay_steps: usize,
}

impl LearningRateSchedule {
    pub fn new(initial: f64, decay_rate: f64, decay_steps: usize) -> Self {
        Self {
            initial,
            decay_rate,
            decay_steps: decay_steps.max(1),
        }
    }

    pub fn from_config(config: &TrainingConfig) -> Self {
        let decay_rate = match &config.optimizer {
            OptimizerConfig::Momentum { decay_rate, .. }
            | OptimizerConfig::Adam { decay_rate, .. } => *decay_rate,
        };
        Self::new(
            config.optimizer.learning_rate(),
            decay_rate,
            config.decay_steps(),
        )
    }

    pub fn at(&self, step: usize) -> f64 {
        let exponent = (step / self.decay_steps) as i32;
        self.initial * self.decay_rate.powi(exponent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decays_in_stairs() {
        let schedule = LearningRateSchedule::new(0.2, 0.5, 10);
        assert_eq!(schedule.at(0), 0.2);
        assert_eq!(schedule.at(9), 0.2);
        assert_eq!(schedule.at(10), 0.1);
        assert_eq!(schedule.at(25), 0.05);
    }

    #[test]
    fn adam_decays_per_decay_epochs() {
        let config = TrainingConfig {
            optimizer: OptimizerConfig::Adam {
                learning_rate: 0.001,
                decay_rate: 0.5,
                decay_epochs: 3,
                beta_1: 0.9,
                beta_2: 0.99,
            },
            training_iters: 4,
            ..TrainingConfig::default()
        };
        let schedule = LearningRateSchedule::from_config(&config);
        assert_eq!(schedule.at(11), 0.001);
        assert_eq!(schedule.at(12), 0.0005);
    }

    #[test]
    fn default_momentum_schedule() {
        let schedule = LearningRateSchedule::from_config(&TrainingConfig::default());
        assert!((schedule.at(10) - 0.2 * 0.95).abs() < 1e-12);
    }
}
