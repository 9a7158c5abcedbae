use burn::prelude::*;

use crate::error::{Result, UnetError};

/// Low and high trim for a size difference `d`: `(d / 2, d - d / 2)`.
pub fn crop_trims(difference: usize) -> (usize, usize) {
    let low = difference / 2;
    (low, difference - low)
}

/// Crops the spatial axes of an NCHW tensor around the center down to `[height, width]`.
pub fn center_crop<B: Backend>(
    x: Tensor<B, 4>,
    [height, width]: [usize; 2],
) -> Result<Tensor<B, 4>> {
    let [batch, channels, source_h, source_w] = x.dims();
    if source_h < height || source_w < width {
        return Err(UnetError::InvalidInput(format!(
            "cannot crop {source_h}x{source_w} to the larger {height}x{width}"
        )));
    }

    let (top, _) = crop_trims(source_h - height);
    let (left, _) = crop_trims(source_w - width);
    Ok(x.slice([
        0..batch,
        0..channels,
        top..top + height,
        left..left + width,
    ]))
}

/// Channel concatenation of `tensors` followed by `skip` center-cropped to their size.
pub fn crop_and_concat<B: Backend>(
    mut tensors: Vec<Tensor<B, 4>>,
    skip: Tensor<B, 4>,
) -> Result<Tensor<B, 4>> {
    let [_, _, height, width] = tensors
        .first()
        .map(|t| t.dims())
        .ok_or_else(|| UnetError::InvalidInput("nothing to concatenate".to_string()))?;
    tensors.push(center_crop(skip, [height, width])?);
    Ok(Tensor::cat(tensors, 1))
}
