//! Mask editor: decode an edited mask layer and reconcile it to the volume
//!
//! Masks carry label values, so resampling is strictly nearest-neighbour and
//! never introduces a value that was not present in the edited mask.

use base64::{engine::general_purpose, Engine as _};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
use ndarray::Array2;
use thiserror::Error;
use tracing::debug;

use crate::volume::{Volume, VolumeError};

#[derive(Debug, Error)]
pub enum MaskError {
    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error("Invalid mask payload: {0}")]
    Payload(String),
}

impl From<MaskError> for eht_common::Error {
    fn from(err: MaskError) -> Self {
        match err {
            MaskError::Volume(VolumeError::Layout(_)) => eht_common::Error::Internal(err.to_string()),
            _ => eht_common::Error::InvalidInput(err.to_string()),
        }
    }
}

/// 16-bit labels are clamped into the 8-bit range, never rescaled
fn clamp_labels(labels: &ImageBuffer<Luma<u16>, Vec<u16>>) -> GrayImage {
    let (width, height) = labels.dimensions();
    GrayImage::from_fn(width, height, |x, y| {
        Luma([labels.get_pixel(x, y)[0].min(u16::from(u8::MAX)) as u8])
    })
}

/// Decode a base64 image payload, with or without a `data:` URI prefix,
/// into an 8-bit grayscale image
pub fn decode_mask_payload(encoded: &str) -> Result<GrayImage, MaskError> {
    let data = match encoded.split_once(',') {
        Some((_, rest)) => rest,
        None => encoded,
    };

    let bytes = general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| MaskError::Payload(e.to_string()))?;
    let img = image::load_from_memory(&bytes).map_err(|e| MaskError::Payload(e.to_string()))?;
    Ok(match &img {
        DynamicImage::ImageLuma16(labels) => clamp_labels(labels),
        DynamicImage::ImageLumaA16(_) => clamp_labels(&img.to_luma16()),
        other => other.to_luma8(),
    })
}

/// Resample to (height, width) with nearest-neighbour, a no-op when the shape already matches
pub fn reconcile(mask: GrayImage, expected: (usize, usize)) -> Result<Array2<u8>, MaskError> {
    let (height, width) = expected;
    let (found_w, found_h) = mask.dimensions();

    let mask = if (found_h as usize, found_w as usize) == expected {
        mask
    } else {
        debug!(
            found_height = found_h,
            found_width = found_w,
            height,
            width,
            "Resampling mask to frame shape"
        );
        imageops::resize(&mask, width as u32, height as u32, FilterType::Nearest)
    };

    Array2::from_shape_vec((height, width), mask.into_raw())
        .map_err(|e| MaskError::Volume(VolumeError::Layout(e.to_string())))
}

/// Validate an edit against the volume and produce the mask layer to store
///
/// Checks run in order: the volume must carry masks, the index must be in
/// range, then the payload is decoded and reconciled.
pub fn prepare_edit(volume: &Volume, layer_index: usize, encoded: &str) -> Result<Array2<u8>, MaskError> {
    if !volume.has_masks() {
        return Err(VolumeError::NoMaskVolume.into());
    }
    if layer_index >= volume.num_slices() {
        return Err(VolumeError::IndexOutOfRange {
            index: layer_index,
            len: volume.num_slices(),
        }
        .into());
    }

    let decoded = decode_mask_payload(encoded)?;
    reconcile(decoded, volume.frame_shape())
}
