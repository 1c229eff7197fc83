//! Normalized in-memory volumes
//!
//! Every on-disk source (single image, directory of images, multi-page
//! stack) is reduced at the load boundary to a [`Volume`]: an ordered stack
//! of equally-shaped 2-D grayscale frames with an optional mask stack of the
//! same extent. Ranks other than 2 or 3 are rejected here so nothing past
//! this module has to branch on array dimensionality.

use ndarray::{Array2, Array3, ArrayD, ArrayView2, Axis, Ix2, Ix3};
use thiserror::Error;

/// Violations of the volume shape contract
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VolumeError {
    #[error("Volume contains no frames")]
    Empty,

    #[error("Frame {index} has shape {found:?}, expected {expected:?}")]
    FrameShapeMismatch {
        index: usize,
        expected: (usize, usize),
        found: (usize, usize),
    },

    #[error("Mask layer count ({masks}) does not match image layer count ({frames})")]
    LayerCountMismatch { frames: usize, masks: usize },

    #[error("Mask dimensions {mask:?} do not match image dimensions {image:?}")]
    DimensionMismatch {
        image: (usize, usize),
        mask: (usize, usize),
    },

    #[error("Unsupported array dimensions: {0}")]
    UnsupportedRank(usize),

    #[error("Layer index {index} out of range [0, {len})")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("No mask volume loaded")]
    NoMaskVolume,

    #[error("Array layout error: {0}")]
    Layout(String),
}

impl From<VolumeError> for eht_common::Error {
    fn from(err: VolumeError) -> Self {
        match err {
            VolumeError::Layout(_) => eht_common::Error::Internal(err.to_string()),
            _ => eht_common::Error::InvalidInput(err.to_string()),
        }
    }
}

/// Pixel sample types a volume can hold
pub trait Sample: Copy + Default + Send + Sync + 'static {
    fn to_f64(self) -> f64;

    /// Convert back, truncating toward zero like a numeric cast
    fn from_f64(value: f64) -> Self;
}

impl Sample for u8 {
    fn to_f64(self) -> f64 {
        f64::from(self)
    }

    fn from_f64(value: f64) -> Self {
        value as u8
    }
}

impl Sample for u16 {
    fn to_f64(self) -> f64 {
        f64::from(self)
    }

    fn from_f64(value: f64) -> Self {
        value as u16
    }
}

impl Sample for f32 {
    fn to_f64(self) -> f64 {
        f64::from(self)
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }
}

/// Reduce a decoded array to a single 2-D grayscale grid
///
/// - 2 axes: returned as-is.
/// - 3 axes with a trailing channel of size 1: squeezed.
/// - 3 axes with 2 or more trailing channels: unweighted mean of the first
///   (up to) three channels, so RGB and RGBA both average R, G and B.
/// - Any other rank is rejected.
pub fn ensure_grayscale_2d<T: Sample>(array: ArrayD<T>) -> Result<Array2<T>, VolumeError> {
    match array.ndim() {
        2 => array
            .into_dimensionality::<Ix2>()
            .map_err(|e| VolumeError::Layout(e.to_string())),
        3 => {
            let array = array
                .into_dimensionality::<Ix3>()
                .map_err(|e| VolumeError::Layout(e.to_string()))?;
            let (height, width, channels) = array.dim();
            if channels == 1 {
                return Ok(array.index_axis(Axis(2), 0).to_owned());
            }
            let used = channels.min(3);
            Ok(Array2::from_shape_fn((height, width), |(y, x)| {
                let sum: f64 = (0..used).map(|c| array[[y, x, c]].to_f64()).sum();
                T::from_f64(sum / used as f64)
            }))
        }
        other => Err(VolumeError::UnsupportedRank(other)),
    }
}

/// One 2-D grayscale frame, tagged by sample depth
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Gray8(Array2<u8>),
    Gray16(Array2<u16>),
    Float(Array2<f32>),
}

impl Frame {
    /// (height, width)
    pub fn shape(&self) -> (usize, usize) {
        match self {
            Frame::Gray8(a) => a.dim(),
            Frame::Gray16(a) => a.dim(),
            Frame::Float(a) => a.dim(),
        }
    }

    pub fn to_float(&self) -> Array2<f32> {
        match self {
            Frame::Gray8(a) => a.mapv(f32::from),
            Frame::Gray16(a) => a.mapv(f32::from),
            Frame::Float(a) => a.clone(),
        }
    }

    fn depth_rank(&self) -> u8 {
        match self {
            Frame::Gray8(_) => 0,
            Frame::Gray16(_) => 1,
            Frame::Float(_) => 2,
        }
    }
}

/// Ordered stack of frames sharing one shape and sample depth
///
/// Axis 0 is the layer axis; axes 1 and 2 are (height, width).
#[derive(Debug, Clone, PartialEq)]
pub enum Stack {
    Gray8(Array3<u8>),
    Gray16(Array3<u16>),
    Float(Array3<f32>),
}

fn stack_views<T: Clone>(views: &[ArrayView2<'_, T>]) -> Result<Array3<T>, VolumeError> {
    ndarray::stack(Axis(0), views).map_err(|e| VolumeError::Layout(e.to_string()))
}

impl Stack {
    /// Wrap a single frame as a one-layer stack
    pub fn from_frame(frame: Frame) -> Self {
        match frame {
            Frame::Gray8(a) => Stack::Gray8(a.insert_axis(Axis(0))),
            Frame::Gray16(a) => Stack::Gray16(a.insert_axis(Axis(0))),
            Frame::Float(a) => Stack::Float(a.insert_axis(Axis(0))),
        }
    }

    /// Assemble frames in order
    ///
    /// All frames must share one shape. Frames of mixed sample depth are
    /// promoted to float.
    pub fn from_frames(frames: Vec<Frame>) -> Result<Self, VolumeError> {
        let first = frames.first().ok_or(VolumeError::Empty)?;
        let expected = first.shape();
        let depth = first.depth_rank();

        let mut uniform = true;
        for (index, frame) in frames.iter().enumerate() {
            let found = frame.shape();
            if found != expected {
                return Err(VolumeError::FrameShapeMismatch {
                    index,
                    expected,
                    found,
                });
            }
            uniform &= frame.depth_rank() == depth;
        }

        if !uniform {
            let floats: Vec<Array2<f32>> = frames.iter().map(Frame::to_float).collect();
            let views: Vec<_> = floats.iter().map(|a| a.view()).collect();
            return Ok(Stack::Float(stack_views(&views)?));
        }

        let stack = match first {
            Frame::Gray8(_) => {
                let views: Vec<_> = frames
                    .iter()
                    .filter_map(|f| match f {
                        Frame::Gray8(a) => Some(a.view()),
                        _ => None,
                    })
                    .collect();
                Stack::Gray8(stack_views(&views)?)
            }
            Frame::Gray16(_) => {
                let views: Vec<_> = frames
                    .iter()
                    .filter_map(|f| match f {
                        Frame::Gray16(a) => Some(a.view()),
                        _ => None,
                    })
                    .collect();
                Stack::Gray16(stack_views(&views)?)
            }
            Frame::Float(_) => {
                let views: Vec<_> = frames
                    .iter()
                    .filter_map(|f| match f {
                        Frame::Float(a) => Some(a.view()),
                        _ => None,
                    })
                    .collect();
                Stack::Float(stack_views(&views)?)
            }
        };
        Ok(stack)
    }

    /// Number of layers
    pub fn len(&self) -> usize {
        match self {
            Stack::Gray8(a) => a.len_of(Axis(0)),
            Stack::Gray16(a) => a.len_of(Axis(0)),
            Stack::Float(a) => a.len_of(Axis(0)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (height, width) shared by every layer
    pub fn frame_shape(&self) -> (usize, usize) {
        let shape = match self {
            Stack::Gray8(a) => a.dim(),
            Stack::Gray16(a) => a.dim(),
            Stack::Float(a) => a.dim(),
        };
        (shape.1, shape.2)
    }

    /// Copy out one layer
    pub fn frame(&self, index: usize) -> Result<Frame, VolumeError> {
        self.check_index(index)?;
        Ok(match self {
            Stack::Gray8(a) => Frame::Gray8(a.index_axis(Axis(0), index).to_owned()),
            Stack::Gray16(a) => Frame::Gray16(a.index_axis(Axis(0), index).to_owned()),
            Stack::Float(a) => Frame::Float(a.index_axis(Axis(0), index).to_owned()),
        })
    }

    /// Overwrite one layer with 8-bit values, cast to the stack's depth
    pub fn replace_frame_u8(&mut self, index: usize, values: &Array2<u8>) -> Result<(), VolumeError> {
        self.check_index(index)?;
        let expected = self.frame_shape();
        if values.dim() != expected {
            return Err(VolumeError::FrameShapeMismatch {
                index,
                expected,
                found: values.dim(),
            });
        }
        match self {
            Stack::Gray8(a) => a.index_axis_mut(Axis(0), index).assign(values),
            Stack::Gray16(a) => a
                .index_axis_mut(Axis(0), index)
                .assign(&values.mapv(u16::from)),
            Stack::Float(a) => a
                .index_axis_mut(Axis(0), index)
                .assign(&values.mapv(f32::from)),
        }
        Ok(())
    }

    /// Overwrite one layer with a frame of the same sample depth
    pub fn set_frame(&mut self, index: usize, frame: &Frame) -> Result<(), VolumeError> {
        self.check_index(index)?;
        let expected = self.frame_shape();
        if frame.shape() != expected {
            return Err(VolumeError::FrameShapeMismatch {
                index,
                expected,
                found: frame.shape(),
            });
        }
        match (self, frame) {
            (Stack::Gray8(a), Frame::Gray8(f)) => a.index_axis_mut(Axis(0), index).assign(f),
            (Stack::Gray16(a), Frame::Gray16(f)) => a.index_axis_mut(Axis(0), index).assign(f),
            (Stack::Float(a), Frame::Float(f)) => a.index_axis_mut(Axis(0), index).assign(f),
            _ => {
                return Err(VolumeError::Layout(
                    "frame depth does not match stack depth".to_string(),
                ))
            }
        }
        Ok(())
    }

    fn check_index(&self, index: usize) -> Result<(), VolumeError> {
        let len = self.len();
        if index >= len {
            return Err(VolumeError::IndexOutOfRange { index, len });
        }
        Ok(())
    }
}

/// Normalized image volume with an optional paired mask stack
///
/// Invariant: when present, the mask stack has exactly as many layers as the
/// image stack and the same (height, width).
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    frames: Stack,
    masks: Option<Stack>,
}

impl Volume {
    pub fn new(frames: Stack, masks: Option<Stack>) -> Result<Self, VolumeError> {
        if frames.is_empty() {
            return Err(VolumeError::Empty);
        }
        if let Some(masks) = &masks {
            if masks.len() != frames.len() {
                return Err(VolumeError::LayerCountMismatch {
                    frames: frames.len(),
                    masks: masks.len(),
                });
            }
            if masks.frame_shape() != frames.frame_shape() {
                return Err(VolumeError::DimensionMismatch {
                    image: frames.frame_shape(),
                    mask: masks.frame_shape(),
                });
            }
        }
        Ok(Self { frames, masks })
    }

    pub fn num_slices(&self) -> usize {
        self.frames.len()
    }

    /// True when the volume has more than one layer
    pub fn is_stack(&self) -> bool {
        self.frames.len() > 1
    }

    /// Expected (height, width) of every image and mask layer
    pub fn frame_shape(&self) -> (usize, usize) {
        self.frames.frame_shape()
    }

    pub fn has_masks(&self) -> bool {
        self.masks.is_some()
    }

    pub fn frames(&self) -> &Stack {
        &self.frames
    }

    pub fn masks(&self) -> Option<&Stack> {
        self.masks.as_ref()
    }

    pub fn frame(&self, index: usize) -> Result<Frame, VolumeError> {
        self.frames.frame(index)
    }

    /// Mask layer at `index`, `None` when the volume has no masks
    pub fn mask(&self, index: usize) -> Result<Option<Frame>, VolumeError> {
        match &self.masks {
            Some(masks) => masks.frame(index).map(Some),
            None => {
                self.frames.check_index(index)?;
                Ok(None)
            }
        }
    }

    /// Display label for a layer
    pub fn layer_name(&self, index: usize) -> String {
        if self.is_stack() {
            format!("Layer {}", index + 1)
        } else {
            "Image".to_string()
        }
    }

    /// Replace one mask layer in place
    pub fn replace_mask(&mut self, index: usize, mask: &Array2<u8>) -> Result<(), VolumeError> {
        let masks = self.masks.as_mut().ok_or(VolumeError::NoMaskVolume)?;
        masks.replace_frame_u8(index, mask)
    }

    /// Put back a mask layer previously read with [`Volume::mask`]
    pub fn restore_mask(&mut self, index: usize, frame: &Frame) -> Result<(), VolumeError> {
        let masks = self.masks.as_mut().ok_or(VolumeError::NoMaskVolume)?;
        masks.set_frame(index, frame)
    }
}
