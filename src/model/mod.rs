pub mod blocks;
pub mod decoder;
pub mod encoder;
pub mod head;
pub mod loss;
pub mod mode;
pub mod ops;
pub mod params;
pub mod unet;

pub use decoder::Decoder;
pub use encoder::{Encoder, EncoderState, TOWERS};
pub use head::{Head, HeadKind};
pub use loss::{LossConfig, LossKind, SegmentationLoss};
pub use mode::Mode;
pub use params::{LearnableParams, ParamRef};
pub use unet::{ModelOutput, NetworkConfig, Unet};
