pub mod data;
pub mod error;
pub mod model;
pub mod training;

// Re-exports for convenience
pub use data::{Batch, DataProvider, FileProvider, RegionBox, SyntheticProvider};
pub use error::{Result, UnetError};
pub use model::{LossConfig, LossKind, Mode, ModelOutput, NetworkConfig, SegmentationLoss, Unet};
pub use training::{Trainer, TrainingConfig};
