use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use memmap2::{Mmap, MmapMut};
use ndarray::{Array, ArrayView, ArrayViewD, Dimension, Ix2, Ix3, IxDyn, ShapeBuilder};

use crate::error::{CnmfError, Result};

pub const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";

/// Header blocks are padded so the data starts on this boundary.
const NPY_ALIGNMENT: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NpyDtype {
    F32,
    F64,
}

impl NpyDtype {
    pub fn descr(&self) -> &'static str {
        match self {
            Self::F32 => "<f4",
            Self::F64 => "<f8",
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    fn from_descr(descr: &str) -> Option<Self> {
        match descr {
            "<f4" => Some(Self::F32),
            "<f8" => Some(Self::F64),
            _ => None,
        }
    }
}

/// Parsed `.npy` header dictionary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NpyHeader {
    pub dtype: NpyDtype,
    pub fortran_order: bool,
    pub shape: Vec<usize>,
}

impl NpyHeader {
    pub fn c_order(dtype: NpyDtype, shape: &[usize]) -> Self {
        Self {
            dtype,
            fortran_order: false,
            shape: shape.to_vec(),
        }
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn data_byte_size(&self) -> usize {
        self.element_count() * self.dtype.size()
    }
}

/// Encode a version 1.0 header, padded so the data is 64-byte aligned.
pub fn encode_header(header: &NpyHeader) -> Result<Vec<u8>> {
    let dims: Vec<String> = header.shape.iter().map(|d| d.to_string()).collect();
    let shape = match dims.len() {
        1 => format!("({},)", dims[0]),
        _ => format!("({})", dims.join(", ")),
    };
    let order = if header.fortran_order { "True" } else { "False" };
    let dict = format!(
        "{{'descr': '{}', 'fortran_order': {}, 'shape': {}, }}",
        header.dtype.descr(),
        order,
        shape
    );

    // magic(6) + version(2) + length(2) + dict + '\n'
    let unpadded = NPY_MAGIC.len() + 4 + dict.len() + 1;
    let pad = (NPY_ALIGNMENT - unpadded % NPY_ALIGNMENT) % NPY_ALIGNMENT;
    let text_len = dict.len() + pad + 1;
    let text_len = u16::try_from(text_len).map_err(|_| {
        CnmfError::InvalidParameter(format!("NPY header too long ({text_len} bytes)"))
    })?;

    let mut buf = Vec::with_capacity(unpadded + pad);
    buf.extend_from_slice(NPY_MAGIC);
    buf.extend_from_slice(&[1, 0]);
    buf.extend_from_slice(&text_len.to_le_bytes());
    buf.extend_from_slice(dict.as_bytes());
    buf.resize(buf.len() + pad, b' ');
    buf.push(b'\n');
    Ok(buf)
}

/// Parse the header at the start of `bytes`. Returns the header and the
/// offset at which array data begins.
pub fn parse_header(bytes: &[u8], path: &Path) -> Result<(NpyHeader, usize)> {
    let invalid = |reason: &str| CnmfError::InvalidNpy {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    if bytes.len() < 10 || &bytes[..6] != NPY_MAGIC {
        return Err(invalid("missing NUMPY magic"));
    }
    let (text_len, start) = match bytes[6] {
        1 => (LittleEndian::read_u16(&bytes[8..10]) as usize, 10),
        2 | 3 if bytes.len() >= 12 => (LittleEndian::read_u32(&bytes[8..12]) as usize, 12),
        _ => return Err(invalid("unsupported format version")),
    };
    let end = start + text_len;
    if bytes.len() < end {
        return Err(invalid("truncated header"));
    }
    let text = std::str::from_utf8(&bytes[start..end]).map_err(|_| invalid("header is not UTF-8"))?;

    let descr = dict_field(text, "descr")
        .and_then(|v| v.strip_prefix('\''))
        .and_then(|v| v.split('\'').next())
        .ok_or_else(|| invalid("missing 'descr'"))?;
    let dtype = NpyDtype::from_descr(descr)
        .ok_or_else(|| invalid(&format!("unsupported dtype '{descr}'")))?;
    let fortran_order = dict_field(text, "fortran_order")
        .map(|v| v.starts_with("True"))
        .ok_or_else(|| invalid("missing 'fortran_order'"))?;
    let shape = dict_field(text, "shape")
        .and_then(|v| v.strip_prefix('('))
        .and_then(|v| v.split(')').next())
        .ok_or_else(|| invalid("missing 'shape'"))?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| invalid("malformed 'shape'"))?;

    Ok((
        NpyHeader {
            dtype,
            fortran_order,
            shape,
        },
        end,
    ))
}

/// Text following `'key':` in a header dictionary, leading whitespace trimmed.
fn dict_field<'a>(dict: &'a str, key: &str) -> Option<&'a str> {
    let pattern = format!("'{key}':");
    let at = dict.find(&pattern)?;
    Some(dict[at + pattern.len()..].trim_start())
}

/// Reinterpret little-endian bytes as `f32` without copying.
fn cast_f32(bytes: &[u8]) -> Option<&[f32]> {
    if cfg!(target_endian = "big") {
        return None;
    }
    bytemuck::try_cast_slice(bytes).ok()
}

fn cast_f32_mut(bytes: &mut [u8]) -> Option<&mut [f32]> {
    if cfg!(target_endian = "big") {
        return None;
    }
    bytemuck::try_cast_slice_mut(bytes).ok()
}

/// Read-only memory-mapped `.npy` file.
pub struct NpyFile {
    mmap: Mmap,
    header: NpyHeader,
    data_offset: usize,
    path: PathBuf,
}

impl NpyFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let (header, data_offset) = parse_header(&mmap, path)?;
        if mmap.len() < data_offset + header.data_byte_size() {
            return Err(CnmfError::InvalidNpy {
                path: path.to_path_buf(),
                reason: format!(
                    "file truncated: expected {} data bytes, got {}",
                    header.data_byte_size(),
                    mmap.len() - data_offset
                ),
            });
        }
        Ok(Self {
            mmap,
            header,
            data_offset,
            path: path.to_path_buf(),
        })
    }

    pub fn header(&self) -> &NpyHeader {
        &self.header
    }

    pub fn shape(&self) -> &[usize] {
        &self.header.shape
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Zero-copy view of an `f32` array of any rank.
    pub fn view_dyn(&self) -> Result<ArrayViewD<'_, f32>> {
        if self.header.dtype != NpyDtype::F32 {
            return Err(self.invalid(format!(
                "expected dtype <f4, found {}",
                self.header.dtype.descr()
            )));
        }
        let end = self.data_offset + self.header.data_byte_size();
        let values = cast_f32(&self.mmap[self.data_offset..end])
            .ok_or_else(|| self.invalid("data is not addressable as little-endian f32".into()))?;
        let dim = IxDyn(&self.header.shape);
        let view = if self.header.fortran_order {
            ArrayViewD::from_shape(dim.f(), values)
        } else {
            ArrayViewD::from_shape(dim, values)
        };
        view.map_err(|e| self.invalid(e.to_string()))
    }

    pub fn view2(&self) -> Result<ArrayView<'_, f32, Ix2>> {
        self.view_dyn()?
            .into_dimensionality::<Ix2>()
            .map_err(|_| self.rank_mismatch(2))
    }

    pub fn view3(&self) -> Result<ArrayView<'_, f32, Ix3>> {
        self.view_dyn()?
            .into_dimensionality::<Ix3>()
            .map_err(|_| self.rank_mismatch(3))
    }

    fn invalid(&self, reason: String) -> CnmfError {
        CnmfError::InvalidNpy {
            path: self.path.clone(),
            reason,
        }
    }

    fn rank_mismatch(&self, expected: usize) -> CnmfError {
        CnmfError::DimensionMismatch(format!(
            "{} has shape {:?}, expected rank {expected}",
            self.path.display(),
            self.header.shape
        ))
    }
}

/// Read an `f32` array fully into memory.
pub fn read_npy_f32<D: Dimension>(path: &Path) -> Result<Array<f32, D>> {
    let file = NpyFile::open(path)?;
    let view = file.view_dyn()?;
    let typed = view.into_dimensionality::<D>().map_err(|_| {
        CnmfError::DimensionMismatch(format!(
            "{} has shape {:?}, expected rank {:?}",
            path.display(),
            file.shape(),
            D::NDIM
        ))
    })?;
    Ok(typed.to_owned())
}

/// Write an `f32` array in C order.
pub fn write_npy_f32<D: Dimension>(path: &Path, array: &ArrayView<'_, f32, D>) -> Result<()> {
    let header = NpyHeader::c_order(NpyDtype::F32, array.shape());
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&encode_header(&header)?)?;
    for &value in array.iter() {
        writer.write_f32::<LittleEndian>(value)?;
    }
    writer.flush()?;
    Ok(())
}

/// A pre-sized `.npy` file opened for in-place writes through a mutable
/// memory map. Used to build arrays larger than memory.
pub struct MappedNpyWriter {
    mmap: MmapMut,
    data_offset: usize,
    data_len: usize,
    path: PathBuf,
}

impl MappedNpyWriter {
    /// Create (or truncate) `path` as a zero-filled C-order `f32` array.
    pub fn create(path: &Path, shape: &[usize]) -> Result<Self> {
        let header = NpyHeader::c_order(NpyDtype::F32, shape);
        let header_bytes = encode_header(&header)?;
        let data_len = header.data_byte_size();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len((header_bytes.len() + data_len) as u64)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        mmap[..header_bytes.len()].copy_from_slice(&header_bytes);

        Ok(Self {
            mmap,
            data_offset: header_bytes.len(),
            data_len,
            path: path.to_path_buf(),
        })
    }

    /// Flat C-order element storage.
    pub fn data_mut(&mut self) -> Result<&mut [f32]> {
        let range = self.data_offset..self.data_offset + self.data_len;
        cast_f32_mut(&mut self.mmap[range]).ok_or_else(|| CnmfError::InvalidNpy {
            path: self.path.clone(),
            reason: "data is not addressable as little-endian f32".into(),
        })
    }

    /// Flush dirty pages to disk.
    pub fn finalize(self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}
