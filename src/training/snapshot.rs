use std::path::Path;

use burn::prelude::*;
use image::{GrayImage, Luma};

use crate::error::{Result, UnetError};

fn host_values<B: Backend>(tensor: Tensor<B, 4>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| UnetError::InvalidInput(format!("{e:?}")))
}

/// Min-max scale into 0..=255; constant inputs map to black.
fn to_gray(values: &[f32]) -> Vec<u8> {
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    values
        .iter()
        .map(|&v| {
            if range > 0.0 {
                ((v - min) / range * 255.0).round() as u8
            } else {
                0
            }
        })
        .collect()
}

/// Input channel 0, label class 1 and predicted class-1 probability side by side,
/// one row per sample.
pub fn combine_prediction<B: Backend>(
    images: Tensor<B, 4>,
    labels: Tensor<B, 4>,
    probabilities: Tensor<B, 4>,
) -> Result<GrayImage> {
    let [batch, height, width, _] = images.dims();
    let leading = |[n, h, w, _]: [usize; 4]| [n, h, w];
    if leading(labels.dims()) != [batch, height, width]
        || leading(probabilities.dims()) != [batch, height, width]
    {
        return Err(UnetError::InvalidInput(format!(
            "snapshot tensors disagree: {:?}, {:?}, {:?}",
            images.dims(),
            labels.dims(),
            probabilities.dims()
        )));
    }

    let foreground = |t: Tensor<B, 4>| {
        let channels = t.dims()[3];
        let class = 1.min(channels - 1);
        t.slice([0..batch, 0..height, 0..width, class..class + 1])
    };
    let input = host_values(images.slice([0..batch, 0..height, 0..width, 0..1]))?;
    let label = host_values(foreground(labels))?;
    let prediction = host_values(foreground(probabilities))?;

    let pixels = height * width;
    let mut canvas = GrayImage::new((3 * width) as u32, (batch * height) as u32);
    for sample in 0..batch {
        let span = sample * pixels..(sample + 1) * pixels;
        let panels = [
            to_gray(&input[span.clone()]),
            label[span.clone()]
                .iter()
                .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
                .collect(),
            prediction[span]
                .iter()
                .map(|v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
                .collect(),
        ];
        for (panel, values) in panels.iter().enumerate() {
            for row in 0..height {
                for col in 0..width {
                    let x = (panel * width + col) as u32;
                    let y = (sample * height + row) as u32;
                    canvas.put_pixel(x, y, Luma([values[row * width + col]]));
                }
            }
        }
    }
    Ok(canvas)
}

/// Writes the combined snapshot to `{dir}/{name}.jpg`.
pub fn store_prediction<B: Backend>(
    images: Tensor<B, 4>,
    labels: Tensor<B, 4>,
    probabilities: Tensor<B, 4>,
    dir: &Path,
    name: &str,
) -> Result<()> {
    let canvas = combine_prediction(images, labels, probabilities)?;
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{name}.jpg"));
    canvas.save(&path)?;
    log::debug!("snapshot written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    type TestBackend = NdArray;

    #[test]
    fn panels_are_laid_out_per_sample() {
        let device = Default::default();
        let images = Tensor::<TestBackend, 4>::random([2, 4, 5, 4], Distribution::Default, &device);
        let labels = Tensor::<TestBackend, 4>::ones([2, 4, 5, 2], &device);
        let probabilities = Tensor::<TestBackend, 4>::zeros([2, 4, 5, 2], &device);

        let canvas = combine_prediction(images, labels, probabilities).unwrap();
        assert_eq!(canvas.dimensions(), (15, 8));
        assert_eq!(canvas.get_pixel(5, 0)[0], 255);
        assert_eq!(canvas.get_pixel(10, 7)[0], 0);
    }

    #[test]
    fn writes_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let device = Default::default();
        let images = Tensor::<TestBackend, 4>::random([1, 8, 8, 4], Distribution::Default, &device);
        let labels = Tensor::<TestBackend, 4>::zeros([1, 8, 8, 2], &device);

        store_prediction(images, labels.clone(), labels, dir.path(), "_init").unwrap();
        assert!(dir.path().join("_init.jpg").is_file());
    }
}
