pub mod dataset;
pub mod provider;
pub mod region;
pub mod synthetic;

pub use dataset::{FileProvider, SampleFiles};
pub use provider::{Batch, DataProvider, Sample, INPUT_CHANNELS};
pub use region::RegionBox;
pub use synthetic::{CircleConfig, SyntheticProvider};
