//! On-disk dataset fixtures

use std::io::Cursor;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::{GrayImage, ImageFormat, Luma};
use ndarray::Array3;
use ndarray_npy::write_npy;
use tempfile::TempDir;

/// Temporary directory holding fixture files
///
/// Must be kept alive for the duration of the test.
pub struct DatasetDir {
    pub dir: TempDir,
}

impl DatasetDir {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp dir"),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Absolute path string for a request body
    pub fn arg(&self, name: &str) -> String {
        self.path(name).to_string_lossy().into_owned()
    }

    /// Create a subdirectory and return its path
    pub fn subdir(&self, name: &str) -> PathBuf {
        let path = self.path(name);
        std::fs::create_dir_all(&path).expect("Failed to create subdirectory");
        path
    }
}

/// 8-bit grayscale PNG with a deterministic gradient
pub fn write_gray_png(path: &Path, width: u32, height: u32, seed: u8) {
    let img = GrayImage::from_fn(width, height, |x, y| {
        Luma([seed.wrapping_add((x * 7 + y * 3) as u8)])
    });
    img.save(path).expect("Failed to write PNG");
}

/// `(layers, height, width)` u8 stack written as `.npy`
///
/// `fill` sets every value; otherwise each layer gets its own gradient.
pub fn write_npy_stack(path: &Path, layers: usize, height: usize, width: usize, fill: Option<u8>) {
    let stack = Array3::from_shape_fn((layers, height, width), |(z, y, x)| {
        fill.unwrap_or((z * 40 + y * width + x) as u8)
    });
    write_npy(path, &stack).expect("Failed to write npy");
}

/// PNG data URI whose left half is `left` and right half is `right`
pub fn label_png_base64(width: u32, height: u32, left: u8, right: u8) -> String {
    let img = GrayImage::from_fn(width, height, |x, _| {
        Luma([if x < width / 2 { left } else { right }])
    });
    let mut bytes = Cursor::new(Vec::new());
    img.write_to(&mut bytes, ImageFormat::Png)
        .expect("Failed to encode PNG");
    format!("data:image/png;base64,{}", STANDARD.encode(bytes.into_inner()))
}
