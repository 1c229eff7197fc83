//! Format adapter: on-disk datasets to normalized volumes
//!
//! Accepted sources:
//! - a multi-page TIFF (`.tif`/`.tiff`) or NumPy array (`.npy`) stack file
//! - a single PNG/JPEG/BMP image
//! - a directory or glob pattern of single-frame images, ordered by path
//!
//! The same module persists edited mask layers back to whichever source
//! the mask stack was loaded from.

use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, Write};
use std::path::{Component, Path, PathBuf};

use image::{DynamicImage, ImageBuffer, ImageFormat, Luma};
use ndarray::{Array2, Array3, ArrayD, Axis, Ix2, Ix3, IxDyn};
use ndarray_npy::{ReadNpyExt, WriteNpyExt};
use serde::Serialize;
use thiserror::Error;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::ColorType;
use tracing::{debug, info, warn};

use crate::volume::{ensure_grayscale_2d, Frame, Sample, Stack, Volume, VolumeError};

/// Extensions picked up from directory listings (matched case-insensitively)
pub const IMAGE_EXTENSIONS: &[&str] = &["tif", "tiff", "png", "jpg", "jpeg"];

/// Format adapter failures
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("Path not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("No image files found at: {0}")]
    NoFiles(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error("Failed to decode {}: {message}", .path.display())]
    Decode { path: PathBuf, message: String },

    #[error("Failed to write {}: {message}", .path.display())]
    Encode { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FormatError> for eht_common::Error {
    fn from(err: FormatError) -> Self {
        use eht_common::Error;
        match err {
            FormatError::NotFound(_) => Error::NotFound(err.to_string()),
            FormatError::NoFiles(_) | FormatError::InvalidPath(_) => {
                Error::InvalidInput(err.to_string())
            }
            FormatError::Volume(VolumeError::Layout(_)) => Error::Internal(err.to_string()),
            FormatError::Volume(_) => Error::InvalidInput(err.to_string()),
            FormatError::Decode { .. } | FormatError::Encode { .. } | FormatError::Io(_) => {
                Error::Internal(err.to_string())
            }
        }
    }
}

fn decode_error(path: &Path, err: impl std::fmt::Display) -> FormatError {
    FormatError::Decode {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

fn encode_error(path: &Path, err: impl std::fmt::Display) -> FormatError {
    FormatError::Encode {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// Summary of a loaded dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DatasetInfo {
    pub total_layers: usize,
    pub is_3d: bool,
    /// (height, width) of every layer
    pub image_shape: (usize, usize),
    pub has_masks: bool,
}

impl DatasetInfo {
    pub fn of(volume: &Volume) -> Self {
        Self {
            total_layers: volume.num_slices(),
            is_3d: volume.is_stack(),
            image_shape: volume.frame_shape(),
            has_masks: volume.has_masks(),
        }
    }
}

/// What a dataset path points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    TiffStack(PathBuf),
    NpyStack(PathBuf),
    ImageFile(PathBuf),
    /// Sorted single-frame image files
    Listing(Vec<PathBuf>),
}

/// Lexically normalize a user-supplied dataset or mask path
///
/// `.` components are dropped. Any `..` component is rejected outright, and
/// a relative path must lie under `uploads_dir`. Absolute paths are
/// accepted as-is.
pub fn validate_dataset_path(path: &str, uploads_dir: &Path) -> Result<String, FormatError> {
    if path.trim().is_empty() {
        return Err(FormatError::InvalidPath("Path must not be empty".to_string()));
    }

    let mut normalized = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(FormatError::InvalidPath(
                    "Path cannot contain '..' (directory traversal not allowed)".to_string(),
                ));
            }
            other => normalized.push(other.as_os_str()),
        }
    }

    if normalized.is_relative() && !normalized.starts_with(uploads_dir) {
        return Err(FormatError::InvalidPath(format!(
            "Relative paths must be within '{}/' directory",
            uploads_dir.display()
        )));
    }

    Ok(normalized.to_string_lossy().into_owned())
}

fn lowercase_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}

fn is_tiff(path: &Path) -> bool {
    matches!(lowercase_extension(path).as_deref(), Some("tif") | Some("tiff"))
}

fn is_listed_image(path: &Path) -> bool {
    lowercase_extension(path)
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

fn is_pattern(path: &str) -> bool {
    path.contains('*') || path.contains('?')
}

/// Classify a dataset path without decoding any pixels
pub fn resolve_source(path: &str) -> Result<Source, FormatError> {
    let path_obj = Path::new(path);

    if path_obj.is_file() {
        return Ok(match lowercase_extension(path_obj).as_deref() {
            Some("tif") | Some("tiff") => Source::TiffStack(path_obj.to_path_buf()),
            Some("npy") => Source::NpyStack(path_obj.to_path_buf()),
            _ => Source::ImageFile(path_obj.to_path_buf()),
        });
    }

    if path_obj.is_dir() || is_pattern(path) {
        let files = list_source_files(path)?;
        if files.is_empty() {
            return Err(FormatError::NoFiles(path.to_string()));
        }
        return Ok(Source::Listing(files));
    }

    Err(FormatError::NotFound(path_obj.to_path_buf()))
}

/// Sorted image files of a directory or glob pattern
///
/// This listing defines layer order both when loading and when writing a
/// single edited layer back.
pub fn list_source_files(path: &str) -> Result<Vec<PathBuf>, FormatError> {
    let path_obj = Path::new(path);

    let mut files: Vec<PathBuf> = if path_obj.is_dir() {
        std::fs::read_dir(path_obj)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.is_file() && is_listed_image(p))
            .collect()
    } else {
        glob::glob(path)
            .map_err(|e| FormatError::InvalidPath(format!("{}: {}", path, e)))?
            .filter_map(|entry| entry.ok())
            .filter(|p| p.is_file())
            .collect()
    };

    files.sort();
    Ok(files)
}

/// Load an image dataset and optional mask dataset into one volume
///
/// The mask is validated against the image: equal layer count first, then
/// equal (height, width).
pub fn load_volume(dataset_path: &str, mask_path: Option<&str>) -> Result<Volume, FormatError> {
    let frames = load_stack(dataset_path)?;
    let masks = match mask_path {
        Some(path) => Some(load_stack(path)?),
        None => None,
    };

    let volume = Volume::new(frames, masks)?;
    info!(
        dataset = dataset_path,
        layers = volume.num_slices(),
        height = volume.frame_shape().0,
        width = volume.frame_shape().1,
        has_masks = volume.has_masks(),
        "Loaded volume"
    );
    Ok(volume)
}

/// Load one path as a stack of grayscale layers
pub fn load_stack(path: &str) -> Result<Stack, FormatError> {
    match resolve_source(path)? {
        Source::TiffStack(file) => Ok(Stack::from_frames(read_tiff_pages(&file)?)?),
        Source::NpyStack(file) => read_npy_stack(&file),
        Source::ImageFile(file) => Ok(Stack::from_frame(read_image_frame(&file)?)),
        Source::Listing(files) => {
            debug!(count = files.len(), "Reading image listing");
            let frames = files
                .iter()
                .map(|file| read_image_frame(file))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Stack::from_frames(frames)?)
        }
    }
}

fn grid<T: Sample>(
    height: usize,
    width: usize,
    channels: usize,
    raw: Vec<T>,
) -> Result<Array2<T>, VolumeError> {
    let shape = if channels == 1 {
        IxDyn(&[height, width])
    } else {
        IxDyn(&[height, width, channels])
    };
    let array = ArrayD::from_shape_vec(shape, raw).map_err(|e| VolumeError::Layout(e.to_string()))?;
    ensure_grayscale_2d(array)
}

fn widen<T: Copy>(raw: Vec<T>, to_f32: impl Fn(T) -> f32) -> Vec<f32> {
    raw.into_iter().map(to_f32).collect()
}

/// Decode one single-frame image file
pub fn read_image_frame(path: &Path) -> Result<Frame, FormatError> {
    if is_tiff(path) {
        let mut pages = read_tiff_pages(path)?;
        if pages.len() > 1 {
            warn!(
                path = %path.display(),
                pages = pages.len(),
                "Multi-page TIFF in image listing, using first page"
            );
        }
        pages.truncate(1);
        return pages.pop().ok_or(FormatError::Volume(VolumeError::Empty));
    }

    let img = image::open(path).map_err(|e| decode_error(path, e))?;
    Ok(dynamic_to_frame(img)?)
}

/// Convert a decoded image into a grayscale frame, keeping its sample depth
pub fn dynamic_to_frame(img: DynamicImage) -> Result<Frame, VolumeError> {
    let height = img.height() as usize;
    let width = img.width() as usize;

    let frame = match img {
        DynamicImage::ImageLuma8(buf) => Frame::Gray8(grid(height, width, 1, buf.into_raw())?),
        DynamicImage::ImageLumaA8(buf) => Frame::Gray8(grid(height, width, 2, buf.into_raw())?),
        DynamicImage::ImageRgb8(buf) => Frame::Gray8(grid(height, width, 3, buf.into_raw())?),
        DynamicImage::ImageRgba8(buf) => Frame::Gray8(grid(height, width, 4, buf.into_raw())?),
        DynamicImage::ImageLuma16(buf) => Frame::Gray16(grid(height, width, 1, buf.into_raw())?),
        DynamicImage::ImageLumaA16(buf) => Frame::Gray16(grid(height, width, 2, buf.into_raw())?),
        DynamicImage::ImageRgb16(buf) => Frame::Gray16(grid(height, width, 3, buf.into_raw())?),
        DynamicImage::ImageRgba16(buf) => Frame::Gray16(grid(height, width, 4, buf.into_raw())?),
        DynamicImage::ImageRgb32F(buf) => Frame::Float(grid(height, width, 3, buf.into_raw())?),
        DynamicImage::ImageRgba32F(buf) => Frame::Float(grid(height, width, 4, buf.into_raw())?),
        other => Frame::Gray8(grid(height, width, 4, other.to_rgba8().into_raw())?),
    };
    Ok(frame)
}

/// Decode every page of a TIFF file
pub fn read_tiff_pages(path: &Path) -> Result<Vec<Frame>, FormatError> {
    let file = File::open(path)?;
    let mut decoder = Decoder::new(BufReader::new(file))
        .map_err(|e| decode_error(path, e))?
        .with_limits(Limits::unlimited());

    let mut frames = Vec::new();
    loop {
        frames.push(decode_tiff_page(&mut decoder, path)?);
        if !decoder.more_images() {
            break;
        }
        decoder.next_image().map_err(|e| decode_error(path, e))?;
    }

    debug!(path = %path.display(), pages = frames.len(), "Decoded TIFF");
    Ok(frames)
}

fn decode_tiff_page<R: Read + Seek>(
    decoder: &mut Decoder<R>,
    path: &Path,
) -> Result<Frame, FormatError> {
    let (width, height) = decoder.dimensions().map_err(|e| decode_error(path, e))?;
    let (width, height) = (width as usize, height as usize);

    let channels = match decoder.colortype().map_err(|e| decode_error(path, e))? {
        ColorType::Gray(_) => 1,
        ColorType::GrayA(_) => 2,
        ColorType::RGB(_) => 3,
        ColorType::RGBA(_) => 4,
        other => {
            return Err(decode_error(path, format!("unsupported TIFF color type {:?}", other)));
        }
    };

    let image = decoder.read_image().map_err(|e| decode_error(path, e))?;

    #[allow(unreachable_patterns)]
    let frame = match image {
        DecodingResult::U8(raw) => Frame::Gray8(grid(height, width, channels, raw)?),
        DecodingResult::U16(raw) => Frame::Gray16(grid(height, width, channels, raw)?),
        DecodingResult::F32(raw) => Frame::Float(grid(height, width, channels, raw)?),
        DecodingResult::F64(raw) => {
            Frame::Float(grid(height, width, channels, widen(raw, |v| v as f32))?)
        }
        DecodingResult::U32(raw) => {
            Frame::Float(grid(height, width, channels, widen(raw, |v| v as f32))?)
        }
        DecodingResult::U64(raw) => {
            Frame::Float(grid(height, width, channels, widen(raw, |v| v as f32))?)
        }
        DecodingResult::I8(raw) => {
            Frame::Float(grid(height, width, channels, widen(raw, f32::from))?)
        }
        DecodingResult::I16(raw) => {
            Frame::Float(grid(height, width, channels, widen(raw, f32::from))?)
        }
        DecodingResult::I32(raw) => {
            Frame::Float(grid(height, width, channels, widen(raw, |v| v as f32))?)
        }
        DecodingResult::I64(raw) => {
            Frame::Float(grid(height, width, channels, widen(raw, |v| v as f32))?)
        }
        _ => return Err(decode_error(path, "unsupported TIFF sample format")),
    };
    Ok(frame)
}

fn npy_layers<T>(array: ArrayD<T>) -> Result<Array3<T>, VolumeError> {
    match array.ndim() {
        2 => array
            .into_dimensionality::<Ix2>()
            .map(|a| a.insert_axis(Axis(0)))
            .map_err(|e| VolumeError::Layout(e.to_string())),
        3 => array
            .into_dimensionality::<Ix3>()
            .map_err(|e| VolumeError::Layout(e.to_string())),
        other => Err(VolumeError::UnsupportedRank(other)),
    }
}

/// Read a NumPy array as a stack: 2 axes is one layer, 3 axes is (layers, height, width)
pub fn read_npy_stack(path: &Path) -> Result<Stack, FormatError> {
    let bytes = std::fs::read(path)?;
    let mut cursor = Cursor::new(bytes.as_slice());

    // Try the common image dtypes first
    if let Ok(array) = ArrayD::<u8>::read_npy(&mut cursor) {
        return Ok(Stack::Gray8(npy_layers(array)?));
    }
    cursor.set_position(0);
    if let Ok(array) = ArrayD::<u16>::read_npy(&mut cursor) {
        return Ok(Stack::Gray16(npy_layers(array)?));
    }
    cursor.set_position(0);
    if let Ok(array) = ArrayD::<f32>::read_npy(&mut cursor) {
        return Ok(Stack::Float(npy_layers(array)?));
    }
    cursor.set_position(0);
    if let Ok(array) = ArrayD::<f64>::read_npy(&mut cursor) {
        return Ok(Stack::Float(npy_layers(array.mapv(|v| v as f32))?));
    }
    cursor.set_position(0);
    if let Ok(array) = ArrayD::<i16>::read_npy(&mut cursor) {
        return Ok(Stack::Float(npy_layers(array.mapv(f32::from))?));
    }
    cursor.set_position(0);
    if let Ok(array) = ArrayD::<i32>::read_npy(&mut cursor) {
        return Ok(Stack::Float(npy_layers(array.mapv(|v| v as f32))?));
    }
    cursor.set_position(0);
    if let Ok(array) = ArrayD::<u32>::read_npy(&mut cursor) {
        return Ok(Stack::Float(npy_layers(array.mapv(|v| v as f32))?));
    }

    Err(decode_error(path, "unsupported dtype or invalid NumPy file"))
}

// ============================================================================
// Mask write-through
// ============================================================================

/// Persist an edited mask layer to the mask's durable location
///
/// - Stack files (TIFF, NumPy) are rewritten whole.
/// - A single 2-D image file is rewritten in place.
/// - A directory or pattern overwrites only the file at `layer_index` in
///   the sorted listing.
pub fn save_mask_layer(mask_path: &str, masks: &Stack, layer_index: usize) -> Result<(), FormatError> {
    match resolve_source(mask_path)? {
        Source::TiffStack(file) => write_atomically(&file, &encode_tiff_stack(&file, masks)?),
        Source::NpyStack(file) => write_atomically(&file, &encode_npy_stack(&file, masks)?),
        Source::ImageFile(file) => {
            if masks.len() != 1 {
                return Err(FormatError::InvalidPath(format!(
                    "{} holds one layer but the mask stack has {}",
                    file.display(),
                    masks.len()
                )));
            }
            write_frame_file(&file, &masks.frame(0)?)
        }
        Source::Listing(files) => {
            let target = files.get(layer_index).ok_or(VolumeError::IndexOutOfRange {
                index: layer_index,
                len: files.len(),
            })?;
            write_frame_file(target, &masks.frame(layer_index)?)
        }
    }?;

    info!(mask_path, layer_index, "Persisted mask layer");
    Ok(())
}

/// Write one frame to an image file, format chosen by extension
pub fn write_frame_file(path: &Path, frame: &Frame) -> Result<(), FormatError> {
    if is_tiff(path) {
        return write_atomically(path, &encode_tiff_stack(path, &Stack::from_frame(frame.clone()))?);
    }

    let format = ImageFormat::from_path(path).map_err(|e| encode_error(path, e))?;
    let (height, width) = frame.shape();
    let (width, height) = (width as u32, height as u32);

    let mut bytes = Cursor::new(Vec::new());
    match frame {
        Frame::Gray8(a) => {
            let buf: ImageBuffer<Luma<u8>, Vec<u8>> =
                ImageBuffer::from_raw(width, height, a.iter().copied().collect())
                    .ok_or_else(|| encode_error(path, "buffer size mismatch"))?;
            buf.write_to(&mut bytes, format).map_err(|e| encode_error(path, e))?;
        }
        Frame::Gray16(a) => {
            let buf: ImageBuffer<Luma<u16>, Vec<u16>> =
                ImageBuffer::from_raw(width, height, a.iter().copied().collect())
                    .ok_or_else(|| encode_error(path, "buffer size mismatch"))?;
            buf.write_to(&mut bytes, format).map_err(|e| encode_error(path, e))?;
        }
        Frame::Float(a) => {
            // Mask labels: clamp into the 8-bit range
            let raw: Vec<u8> = a.iter().map(|v| v.clamp(0.0, 255.0) as u8).collect();
            let buf: ImageBuffer<Luma<u8>, Vec<u8>> = ImageBuffer::from_raw(width, height, raw)
                .ok_or_else(|| encode_error(path, "buffer size mismatch"))?;
            buf.write_to(&mut bytes, format).map_err(|e| encode_error(path, e))?;
        }
    }

    write_atomically(path, &bytes.into_inner())
}

fn encode_tiff_stack(path: &Path, stack: &Stack) -> Result<Vec<u8>, FormatError> {
    let (height, width) = stack.frame_shape();
    let (width, height) = (width as u32, height as u32);

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut encoder = TiffEncoder::new(&mut cursor).map_err(|e| encode_error(path, e))?;
        for index in 0..stack.len() {
            match stack {
                Stack::Gray8(a) => {
                    let page: Vec<u8> = a.index_axis(Axis(0), index).iter().copied().collect();
                    encoder
                        .write_image::<colortype::Gray8>(width, height, &page)
                        .map_err(|e| encode_error(path, e))?;
                }
                Stack::Gray16(a) => {
                    let page: Vec<u16> = a.index_axis(Axis(0), index).iter().copied().collect();
                    encoder
                        .write_image::<colortype::Gray16>(width, height, &page)
                        .map_err(|e| encode_error(path, e))?;
                }
                Stack::Float(a) => {
                    let page: Vec<f32> = a.index_axis(Axis(0), index).iter().copied().collect();
                    encoder
                        .write_image::<colortype::Gray32Float>(width, height, &page)
                        .map_err(|e| encode_error(path, e))?;
                }
            }
        }
    }
    Ok(cursor.into_inner())
}

fn encode_npy_stack(path: &Path, stack: &Stack) -> Result<Vec<u8>, FormatError> {
    let mut bytes = Vec::new();
    let written = match stack {
        Stack::Gray8(a) => a.write_npy(&mut bytes),
        Stack::Gray16(a) => a.write_npy(&mut bytes),
        Stack::Float(a) => a.write_npy(&mut bytes),
    };
    written.map_err(|e| encode_error(path, e))?;
    Ok(bytes)
}

/// Replace `path` by writing a uniquely named sibling temp file and
/// renaming it over
///
/// Concurrent writers to the same path never share a temp file; the last
/// rename wins whole.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), FormatError> {
    let parent = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };

    let mut temp = tempfile::Builder::new()
        .prefix(".eht-")
        .suffix(".tmp")
        .tempfile_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| FormatError::Io(e.error))?;
    Ok(())
}
