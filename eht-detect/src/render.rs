//! Render pipeline: frame → 8-bit → optional CLAHE → PNG payload

use std::fmt;
use std::io::Cursor;

use base64::{engine::general_purpose, Engine as _};
use image::{GrayImage, ImageFormat};
use ndarray::Array2;
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::volume::{Frame, Volume, VolumeError};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error("Failed to encode frame: {0}")]
    Encode(String),
}

impl From<RenderError> for eht_common::Error {
    fn from(err: RenderError) -> Self {
        match err {
            RenderError::Volume(VolumeError::IndexOutOfRange { .. }) => {
                eht_common::Error::InvalidInput(err.to_string())
            }
            _ => eht_common::Error::Internal(err.to_string()),
        }
    }
}

/// Rescale a frame to 8 bits
///
/// 8-bit frames pass through untouched. Otherwise the maximum sample maps
/// to 255 and values are clipped to [0, 255]; a frame whose maximum is not
/// positive maps to all zeros.
pub fn to_u8(frame: &Frame) -> Array2<u8> {
    let values = match frame {
        Frame::Gray8(a) => return a.clone(),
        Frame::Gray16(a) => a.mapv(f32::from),
        Frame::Float(a) => a.clone(),
    };

    let max = values
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    if max <= 0.0 {
        return Array2::zeros(values.dim());
    }

    values.mapv(|v| {
        if v.is_finite() {
            (v / max * 255.0).clamp(0.0, 255.0) as u8
        } else {
            0
        }
    })
}

/// Contrast-limited adaptive histogram equalization
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Clahe {
    /// Relative clip limit; non-positive disables clipping
    pub clip_limit: f64,
    /// Tiles per axis
    pub tiles: usize,
}

impl Default for Clahe {
    fn default() -> Self {
        Self {
            clip_limit: 2.0,
            tiles: 8,
        }
    }
}

const BINS: usize = 256;

impl Clahe {
    pub fn new(clip_limit: f64, tiles: usize) -> Self {
        Self {
            clip_limit,
            tiles: tiles.max(1),
        }
    }

    pub fn apply(&self, image: &Array2<u8>) -> Array2<u8> {
        let (height, width) = image.dim();
        if height == 0 || width == 0 {
            return image.clone();
        }

        let tile_h = height.div_ceil(self.tiles.clamp(1, height));
        let tile_w = width.div_ceil(self.tiles.clamp(1, width));
        let tiles_y = height.div_ceil(tile_h);
        let tiles_x = width.div_ceil(tile_w);

        let mut luts = Vec::with_capacity(tiles_y * tiles_x);
        for ty in 0..tiles_y {
            for tx in 0..tiles_x {
                let y0 = ty * tile_h;
                let x0 = tx * tile_w;
                let y1 = (y0 + tile_h).min(height);
                let x1 = (x0 + tile_w).min(width);
                luts.push(self.tile_lut(image, y0..y1, x0..x1));
            }
        }

        // Bilinear blend of the four nearest tile mappings
        let lut_at = |ty: usize, tx: usize, v: u8| f64::from(luts[ty * tiles_x + tx][v as usize]);
        Array2::from_shape_fn((height, width), |(y, x)| {
            let v = image[[y, x]];

            let fy = y as f64 / tile_h as f64 - 0.5;
            let ty1 = fy.floor();
            let wy = fy - ty1;
            let ty2 = ((ty1 as i64 + 1).min(tiles_y as i64 - 1)).max(0) as usize;
            let ty1 = ty1.max(0.0) as usize;

            let fx = x as f64 / tile_w as f64 - 0.5;
            let tx1 = fx.floor();
            let wx = fx - tx1;
            let tx2 = ((tx1 as i64 + 1).min(tiles_x as i64 - 1)).max(0) as usize;
            let tx1 = tx1.max(0.0) as usize;

            let top = lut_at(ty1, tx1, v) * (1.0 - wx) + lut_at(ty1, tx2, v) * wx;
            let bottom = lut_at(ty2, tx1, v) * (1.0 - wx) + lut_at(ty2, tx2, v) * wx;
            (top * (1.0 - wy) + bottom * wy).round().clamp(0.0, 255.0) as u8
        })
    }

    fn tile_lut(
        &self,
        image: &Array2<u8>,
        rows: std::ops::Range<usize>,
        cols: std::ops::Range<usize>,
    ) -> [u8; BINS] {
        let mut hist = [0usize; BINS];
        for y in rows.clone() {
            for x in cols.clone() {
                hist[image[[y, x]] as usize] += 1;
            }
        }
        let pixels = rows.len() * cols.len();

        if self.clip_limit > 0.0 {
            let limit = ((self.clip_limit * pixels as f64 / BINS as f64) as usize).max(1);
            let mut excess = 0;
            for count in hist.iter_mut() {
                if *count > limit {
                    excess += *count - limit;
                    *count = limit;
                }
            }

            let uniform = excess / BINS;
            let mut residual = excess % BINS;
            for count in hist.iter_mut() {
                *count += uniform;
            }
            if residual > 0 {
                let step = (BINS / residual).max(1);
                let mut bin = 0;
                while bin < BINS && residual > 0 {
                    hist[bin] += 1;
                    residual -= 1;
                    bin += step;
                }
            }
        }

        let scale = 255.0 / pixels as f64;
        let mut lut = [0u8; BINS];
        let mut cumulative = 0usize;
        for (bin, count) in hist.iter().enumerate() {
            cumulative += count;
            lut[bin] = (cumulative as f64 * scale).round().clamp(0.0, 255.0) as u8;
        }
        lut
    }
}

/// Encoding of a render payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Png,
}

impl PayloadFormat {
    pub fn mime_type(&self) -> &'static str {
        match self {
            PayloadFormat::Png => "image/png",
        }
    }
}

/// Encoded display-ready bytes tagged with their format
///
/// Serializes as a `data:` URI string.
#[derive(Clone, PartialEq, Eq)]
pub struct RenderPayload {
    pub format: PayloadFormat,
    pub bytes: Vec<u8>,
}

impl RenderPayload {
    pub fn png(bytes: Vec<u8>) -> Self {
        Self {
            format: PayloadFormat::Png,
            bytes,
        }
    }

    pub fn to_data_uri(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.format.mime_type(),
            general_purpose::STANDARD.encode(&self.bytes)
        )
    }
}

impl fmt::Debug for RenderPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderPayload")
            .field("format", &self.format)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

impl Serialize for RenderPayload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_data_uri())
    }
}

/// Rendered image and mask for one layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedLayer {
    pub image: RenderPayload,
    pub mask: Option<RenderPayload>,
}

/// Encode an 8-bit grid as PNG
pub fn encode_png(pixels: &Array2<u8>) -> Result<RenderPayload, RenderError> {
    let (height, width) = pixels.dim();
    let img = GrayImage::from_raw(width as u32, height as u32, pixels.iter().copied().collect())
        .ok_or_else(|| RenderError::Encode("buffer size mismatch".to_string()))?;

    let mut bytes = Cursor::new(Vec::new());
    img.write_to(&mut bytes, ImageFormat::Png)
        .map_err(|e| RenderError::Encode(e.to_string()))?;
    Ok(RenderPayload::png(bytes.into_inner()))
}

/// Render one layer of a volume
///
/// The image is normalized to 8 bits and, when `enhance` is set, passed
/// through CLAHE. The mask (if any) is normalized but never enhanced.
pub fn render_layer(
    volume: &Volume,
    index: usize,
    enhance: bool,
    clahe: &Clahe,
) -> Result<RenderedLayer, RenderError> {
    let frame = volume.frame(index)?;
    let mut pixels = to_u8(&frame);
    if enhance {
        pixels = clahe.apply(&pixels);
    }
    let image = encode_png(&pixels)?;

    let mask = match volume.mask(index)? {
        Some(mask) => Some(encode_png(&to_u8(&mask))?),
        None => None,
    };

    Ok(RenderedLayer { image, mask })
}
