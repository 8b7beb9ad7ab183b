//! Image <-> tensor conversion for the pipeline handlers.
//!
//! Pipelines operate on `(3, H, W)` f32 tensors in `[0, 1]`; the HTTP
//! surface speaks PNG/JPEG bytes.

use std::io::Cursor;

use candle_core::{Device, Tensor};
use image::{DynamicImage, ImageFormat, RgbImage};

use super::error::ApiError;

/// Decode PNG/JPEG bytes into a `(3, H, W)` f32 tensor.
pub fn decode_image(bytes: &[u8]) -> Result<Tensor, ApiError> {
    let img = image::load_from_memory(bytes)
        .map_err(|e| ApiError::InvalidRequest(format!("could not decode image: {e}")))?;
    image_to_tensor(&img).map_err(|e| ApiError::Internal(e.to_string()))
}

fn image_to_tensor(img: &DynamicImage) -> candle_core::Result<Tensor> {
    let rgb = img.to_rgb8();
    let (w, h) = rgb.dimensions();
    let data: Vec<f32> = rgb.as_raw().iter().map(|&b| b as f32 / 255.0).collect();
    let hwc = Tensor::from_vec(data, (h as usize, w as usize, 3), &Device::Cpu)?;
    hwc.permute((2, 0, 1))
}

/// Encode a `(3, H, W)` f32 tensor as PNG bytes, clamping to `[0, 1]`.
pub fn encode_png(tensor: &Tensor) -> Result<Vec<u8>, ApiError> {
    let (channels, h, w) = tensor
        .dims3()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if channels != 3 {
        return Err(ApiError::Internal(format!(
            "expected a 3-channel output tensor, got {channels} channels"
        )));
    }

    let pixels: Vec<f32> = tensor
        .permute((1, 2, 0))
        .and_then(|t| t.contiguous())
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1())
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let bytes: Vec<u8> = pixels
        .iter()
        .map(|&v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
        .collect();

    let img = RgbImage::from_raw(w as u32, h as u32, bytes)
        .ok_or_else(|| ApiError::Internal("pixel buffer size mismatch".to_string()))?;
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(out.into_inner())
}
