use std::fs::File;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use image::ColorType;
use memmap2::Mmap;
use ndarray::Array2;

use crate::dataset::{kept_frames, ImagingDataset, RawDtype, RawSource};
use crate::error::{CnmfError, Result};

/// Random-access source of raw frames, decoded to `f32` counts.
///
/// Values keep the instrument's scale (no normalization); only the
/// precision changes.
pub trait FrameSource: Sync {
    fn frame_count(&self) -> usize;

    /// (height, width) shared by every frame.
    fn dims(&self) -> (usize, usize);

    fn read_frame(&self, index: usize) -> Result<Array2<f32>>;
}

/// Open the frame source for a dataset: the raw binary when it exists,
/// otherwise the explicit frame-file list. `mask` only decides which file
/// sets the frame size of an image sequence.
pub fn open_frame_source(
    dataset: &ImagingDataset,
    mask: Option<&[bool]>,
) -> Result<Box<dyn FrameSource>> {
    match &dataset.raw {
        Some(raw) if raw.path.exists() => Ok(Box::new(RawFrameReader::open(raw)?)),
        _ => Ok(Box::new(ImageSequence::open(dataset.frames.clone(), mask)?)),
    }
}

/// Memory-mapped reader over a contiguous raw recording.
pub struct RawFrameReader {
    mmap: Mmap,
    source: RawSource,
    frame_count: usize,
}

impl RawFrameReader {
    pub fn open(source: &RawSource) -> Result<Self> {
        let frame_bytes = source.frame_byte_size();
        if frame_bytes == 0 {
            return Err(CnmfError::InvalidParameter(format!(
                "raw source {} has zero-sized frames ({}x{})",
                source.path.display(),
                source.height,
                source.width
            )));
        }
        let file = File::open(&source.path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        // Trailing bytes that do not form a whole frame are ignored.
        let frame_count = mmap.len() / frame_bytes;
        Ok(Self {
            mmap,
            source: source.clone(),
            frame_count,
        })
    }

    /// Raw bytes of one frame (zero-copy from the mmap).
    fn frame_raw(&self, index: usize) -> Result<&[u8]> {
        if index >= self.frame_count {
            return Err(CnmfError::InvalidParameter(format!(
                "frame index {index} out of range (total: {})",
                self.frame_count
            )));
        }
        let size = self.source.frame_byte_size();
        let offset = index * size;
        Ok(&self.mmap[offset..offset + size])
    }
}

impl FrameSource for RawFrameReader {
    fn frame_count(&self) -> usize {
        self.frame_count
    }

    fn dims(&self) -> (usize, usize) {
        (self.source.height, self.source.width)
    }

    fn read_frame(&self, index: usize) -> Result<Array2<f32>> {
        let raw = self.frame_raw(index)?;
        let pixels = self.source.height * self.source.width;
        let mut values = vec![0f32; pixels];
        match self.source.dtype {
            RawDtype::U8 => {
                for (dst, &src) in values.iter_mut().zip(raw) {
                    *dst = f32::from(src);
                }
            }
            RawDtype::U16 => {
                let mut samples = vec![0u16; pixels];
                LittleEndian::read_u16_into(raw, &mut samples);
                for (dst, src) in values.iter_mut().zip(samples) {
                    *dst = f32::from(src);
                }
            }
            RawDtype::F32 => LittleEndian::read_f32_into(raw, &mut values),
        }
        Array2::from_shape_vec((self.source.height, self.source.width), values)
            .map_err(|e| CnmfError::DimensionMismatch(e.to_string()))
    }
}

/// Ordered list of single-frame image files (TIFF, PNG, ...).
pub struct ImageSequence {
    paths: Vec<PathBuf>,
    height: usize,
    width: usize,
}

impl ImageSequence {
    /// Frame dimensions come from the header of the first file the mask
    /// keeps; excluded frames are never decoded.
    pub fn open(paths: Vec<PathBuf>, mask: Option<&[bool]>) -> Result<Self> {
        let first = kept_frames(mask, paths.len())
            .first()
            .map(|&i| paths[i].clone())
            .ok_or(CnmfError::EmptySequence)?;
        let (w, h) = image::image_dimensions(&first)?;
        Ok(Self {
            paths,
            height: h as usize,
            width: w as usize,
        })
    }
}

impl FrameSource for ImageSequence {
    fn frame_count(&self) -> usize {
        self.paths.len()
    }

    fn dims(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    fn read_frame(&self, index: usize) -> Result<Array2<f32>> {
        let path = self.paths.get(index).ok_or_else(|| {
            CnmfError::InvalidParameter(format!(
                "frame index {index} out of range (total: {})",
                self.paths.len()
            ))
        })?;
        let frame = load_frame(path)?;
        if frame.dim() != (self.height, self.width) {
            return Err(CnmfError::DimensionMismatch(format!(
                "frame {} is {}x{}, expected {}x{}",
                path.display(),
                frame.nrows(),
                frame.ncols(),
                self.height,
                self.width
            )));
        }
        Ok(frame)
    }
}

/// Load an image file as raw `f32` counts, shape (height, width).
///
/// Colour and alpha channels are reduced to luminance at the file's own bit
/// depth, so an 8-bit value stays in 0..=255 and a 16-bit one in 0..=65535.
/// Float images keep full precision.
pub fn load_frame(path: &Path) -> Result<Array2<f32>> {
    let img = image::open(path)?;
    let (w, h) = (img.width() as usize, img.height() as usize);
    let values: Vec<f32> = match img.color() {
        ColorType::L8 | ColorType::La8 | ColorType::Rgb8 | ColorType::Rgba8 => {
            img.into_luma8().into_raw().into_iter().map(f32::from).collect()
        }
        ColorType::L16 | ColorType::La16 | ColorType::Rgb16 | ColorType::Rgba16 => {
            img.into_luma16().into_raw().into_iter().map(f32::from).collect()
        }
        ColorType::Rgb32F | ColorType::Rgba32F => img.to_luma32f().into_raw(),
        other => {
            return Err(CnmfError::UnsupportedPixelFormat {
                path: path.to_path_buf(),
                format: format!("{other:?}"),
            })
        }
    };
    Array2::from_shape_vec((h, w), values).map_err(|e| CnmfError::DimensionMismatch(e.to_string()))
}
