//! Directory-backed provider for the four-modality scans.
//!
//! Expected layout, anywhere below the search root:
//! ```text
//! subject_07/
//! ├── slice_12_fat.png
//! ├── slice_12_inn.png
//! ├── slice_12_wat.png
//! ├── slice_12_opp.png
//! ├── slice_12_label.png
//! └── slice_12_region.txt   (optional)
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use burn::prelude::*;
use image::{GrayImage, ImageBuffer, Luma};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use walkdir::WalkDir;

use crate::data::provider::{Batch, DataProvider, Sample, INPUT_CHANNELS};
use crate::data::region::RegionBox;
use crate::error::{Result, UnetError};

const DATA_SUFFIX: &str = "_fat.png";
const MODALITIES: [&str; INPUT_CHANNELS] = ["fat", "inn", "wat", "opp"];
const LABEL_SUFFIX: &str = "label";
const REGION_SUFFIX: &str = "region";

/// Paths of one complete sample.
#[derive(Debug, Clone)]
pub struct SampleFiles {
    pub channels: [PathBuf; INPUT_CHANNELS],
    pub label: PathBuf,
    pub region: Option<PathBuf>,
}

impl SampleFiles {
    /// Resolves the sibling files of a `*_fat.png`; `None` when any required file is missing.
    fn from_fat_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let stem = name.strip_suffix(DATA_SUFFIX)?;
        let sibling =
            |suffix: &str, ext: &str| path.with_file_name(format!("{stem}_{suffix}.{ext}"));

        let channels = MODALITIES.map(|modality| sibling(modality, "png"));
        let label = sibling(LABEL_SUFFIX, "png");
        if !channels.iter().chain(std::iter::once(&label)).all(|p| p.is_file()) {
            return None;
        }

        let region = Some(sibling(REGION_SUFFIX, "txt")).filter(|p| p.is_file());
        Some(Self {
            channels,
            label,
            region,
        })
    }
}

pub struct FileProvider {
    root: PathBuf,
    samples: Vec<SampleFiles>,
    n_class: usize,
    shuffle: bool,
    cursor: usize,
    rng: StdRng,
}

impl FileProvider {
    pub fn new(root: impl AsRef<Path>, n_class: usize) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if n_class < 2 {
            return Err(UnetError::InvalidConfiguration(format!(
                "n_class must be at least 2, got {n_class}"
            )));
        }

        let mut samples = Vec::new();
        let mut incomplete = 0usize;
        for entry in WalkDir::new(&root).follow_links(true).sort_by_file_name() {
            let entry = entry.map_err(|e| UnetError::Io(e.into()))?;
            let path = entry.path();
            let is_data = entry.file_type().is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(DATA_SUFFIX));
            if !is_data {
                continue;
            }
            match SampleFiles::from_fat_path(path) {
                Some(files) => samples.push(files),
                None => {
                    incomplete += 1;
                    log::warn!("skipping incomplete sample {}", path.display());
                }
            }
        }

        if samples.is_empty() {
            return Err(UnetError::NoTrainingData(root.display().to_string()));
        }
        log::info!(
            "found {} samples under {} ({} incomplete skipped)",
            samples.len(),
            root.display(),
            incomplete
        );

        let mut provider = Self {
            root,
            samples,
            n_class,
            shuffle: true,
            cursor: 0,
            rng: StdRng::from_entropy(),
        };
        provider.reshuffle();
        Ok(provider)
    }

    /// Keeps file order stable; used for prediction.
    pub fn without_shuffle(mut self) -> Self {
        self.shuffle = false;
        self.samples.sort_by(|a, b| a.label.cmp(&b.label));
        self.cursor = 0;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self.reshuffle();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn reshuffle(&mut self) {
        if self.shuffle {
            self.samples.shuffle(&mut self.rng);
        }
    }

    /// Next file set, reshuffling after each full pass.
    fn cycle(&mut self) -> SampleFiles {
        if self.cursor >= self.samples.len() {
            self.cursor = 0;
            self.reshuffle();
        }
        let files = self.samples[self.cursor].clone();
        self.cursor += 1;
        files
    }

    pub fn load(&self, files: &SampleFiles) -> Result<Sample> {
        let channels = files
            .channels
            .iter()
            .map(|path| load_channel(path))
            .collect::<Result<Vec<_>>>()?;
        let (width, height) = channels[0].dimensions();
        if let Some((path, _)) = files
            .channels
            .iter()
            .zip(&channels)
            .find(|(_, channel)| channel.dimensions() != (width, height))
        {
            return Err(UnetError::InvalidInput(format!(
                "{} does not match the {width}x{height} fat image",
                path.display()
            )));
        }

        let label_image = image::open(&files.label)?.to_luma8();
        if label_image.dimensions() != (width, height) {
            return Err(UnetError::InvalidInput(format!(
                "{} does not match the {width}x{height} fat image",
                files.label.display()
            )));
        }
        let label = decode_label(&label_image, self.n_class);

        let region = match &files.region {
            Some(path) => fs::read_to_string(path)?.parse::<RegionBox>()?,
            None => RegionBox::default(),
        };

        let normalized: Vec<Vec<f32>> = channels.iter().map(normalize_channel).collect();
        let pixels = (width * height) as usize;
        let image = (0..pixels)
            .flat_map(|pixel| normalized.iter().map(move |channel| channel[pixel]))
            .collect();

        Ok(Sample {
            height: height as usize,
            width: width as usize,
            image,
            label,
            region,
        })
    }
}

fn load_channel(path: &Path) -> Result<ImageBuffer<Luma<f32>, Vec<f32>>> {
    Ok(image::open(path)?.to_luma32f())
}

/// Min-max rescale into [0, 1]; constant channels map to zero.
fn normalize_channel(channel: &ImageBuffer<Luma<f32>, Vec<f32>>) -> Vec<f32> {
    let values = channel.as_raw();
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    values
        .iter()
        .map(|&v| if range > 0.0 { (v - min) / range } else { 0.0 })
        .collect()
}

/// Binary masks treat any non-zero pixel as foreground; otherwise the pixel is the class index.
fn decode_label(label: &GrayImage, n_class: usize) -> Vec<usize> {
    label
        .as_raw()
        .iter()
        .map(|&v| {
            if n_class == 2 {
                usize::from(v > 0)
            } else {
                (v as usize).min(n_class - 1)
            }
        })
        .collect()
}

impl<B: Backend> DataProvider<B> for FileProvider {
    fn next_batch(&mut self, n: usize, device: &B::Device) -> Result<Batch<B>> {
        let samples = (0..n)
            .map(|_| {
                let files = self.cycle();
                self.load(&files)
            })
            .collect::<Result<Vec<_>>>()?;
        Batch::from_samples(&samples, self.n_class, device)
    }

    fn channels(&self) -> usize {
        INPUT_CHANNELS
    }

    fn n_class(&self) -> usize {
        self.n_class
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    fn write_gray(path: &Path, width: u32, height: u32, f: impl Fn(u32, u32) -> u8) {
        GrayImage::from_fn(width, height, |x, y| Luma([f(x, y)]))
            .save(path)
            .unwrap();
    }

    fn write_sample(dir: &Path, stem: &str, with_region: bool) {
        for (i, modality) in MODALITIES.iter().enumerate() {
            write_gray(&dir.join(format!("{stem}_{modality}.png")), 8, 6, |x, y| {
                (x * 10 + y + i as u32) as u8
            });
        }
        write_gray(&dir.join(format!("{stem}_label.png")), 8, 6, |x, _| {
            if x >= 4 {
                255
            } else {
                0
            }
        });
        if with_region {
            fs::write(dir.join(format!("{stem}_region.txt")), "1 5 2 6 2 3 3 4\n").unwrap();
        }
    }

    #[test]
    fn empty_directory_has_no_training_data() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            FileProvider::new(dir.path(), 2),
            Err(UnetError::NoTrainingData(_))
        ));
    }

    #[test]
    fn incomplete_samples_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_gray(&dir.path().join("a_fat.png"), 4, 4, |_, _| 1);
        assert!(matches!(
            FileProvider::new(dir.path(), 2),
            Err(UnetError::NoTrainingData(_))
        ));
    }

    #[test]
    fn loads_and_cycles_samples() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("subject");
        fs::create_dir_all(&nested).unwrap();
        write_sample(&nested, "slice_1", true);
        write_sample(&nested, "slice_2", false);

        let mut provider = FileProvider::new(dir.path(), 2).unwrap().with_seed(5);
        assert_eq!(provider.len(), 2);

        let device = Default::default();
        let batch = DataProvider::<TestBackend>::next_batch(&mut provider, 3, &device).unwrap();
        assert_eq!(batch.images.dims(), [3, 6, 8, 4]);
        assert_eq!(batch.labels.dims(), [3, 6, 8, 2]);

        let pixels: Vec<f32> = batch.images.into_data().to_vec().unwrap();
        assert!(pixels.iter().all(|v| (0.0..=1.0).contains(v)));

        let foreground: f32 = batch
            .labels
            .slice([0..1, 0..6, 0..8, 1..2])
            .sum()
            .into_scalar();
        assert_eq!(foreground, 24.0);

        assert!(batch
            .regions
            .iter()
            .any(|r| r.to_array() == [1, 5, 2, 6, 2, 3, 3, 4]));
    }

    #[test]
    fn multi_class_labels_are_clamped() {
        let label = GrayImage::from_fn(3, 1, |x, _| Luma([[0u8, 2, 9][x as usize]]));
        assert_eq!(decode_label(&label, 3), vec![0, 2, 2]);
        assert_eq!(decode_label(&label, 2), vec![0, 1, 1]);
    }
}
