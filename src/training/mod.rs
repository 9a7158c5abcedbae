pub mod checkpoint;
pub mod config;
pub mod metrics;
pub mod optimizer;
pub mod snapshot;
pub mod trainer;

pub use checkpoint::CheckpointManifest;
pub use config::{OptimizerConfig, TrainingConfig};
pub use metrics::{accuracy, error_rate, GradientAverage};
pub use optimizer::LearningRateSchedule;
pub use trainer::{train, Evaluation, StepOutput, Trainer};
