pub mod concat;
pub mod conv;
pub mod inception;
pub mod norm;
pub mod upsample;

pub use concat::{center_crop, crop_and_concat, crop_trims};
pub use conv::{ConvBiasRelu, ConvNormRelu, LayerSpec, BIAS_INIT};
pub use inception::Inception;
pub use norm::Norm;
pub use upsample::{resize_bilinear, Upsample};
