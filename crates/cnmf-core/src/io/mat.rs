//! MAT-file level 5 codec for named real matrices.
//!
//! Only what the result bundle and stage snapshots need: uncompressed,
//! little-endian files holding 2-D numeric arrays. Variables are written as
//! `double`, either dense or as a compressed-column sparse matrix; numeric
//! arrays of any storage type, sparse ones included, are read back as dense
//! `f64`. Non-numeric variables (cells, structs, chars) are skipped.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use ndarray::{Array1, Array2, ShapeBuilder};
use tracing::debug;

use crate::error::{CnmfError, Result};

pub const MAT_HEADER_SIZE: usize = 128;
const MAT_TEXT_SIZE: usize = 116;
const MAT_VERSION: u16 = 0x0100;

const MI_INT8: u32 = 1;
const MI_UINT8: u32 = 2;
const MI_INT16: u32 = 3;
const MI_UINT16: u32 = 4;
const MI_INT32: u32 = 5;
const MI_UINT32: u32 = 6;
const MI_SINGLE: u32 = 7;
const MI_DOUBLE: u32 = 9;
const MI_INT64: u32 = 12;
const MI_UINT64: u32 = 13;
const MI_MATRIX: u32 = 14;
const MI_COMPRESSED: u32 = 15;

const MX_SPARSE_CLASS: u32 = 5;
const MX_DOUBLE_CLASS: u32 = 6;
const MX_NUMERIC_CLASSES: Range<u32> = 6..16;
const FLAG_COMPLEX: u32 = 0x0800;

/// On-disk layout of a variable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Storage {
    #[default]
    Dense,
    /// Compressed sparse column (`ir`/`jc`/`pr`); only non-zeros are stored.
    Sparse,
}

#[derive(Clone, Debug, PartialEq)]
struct Variable {
    name: String,
    value: Array2<f64>,
    storage: Storage,
}

/// Ordered collection of named matrices.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MatFile {
    variables: Vec<Variable>,
}

impl MatFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a variable stored densely.
    pub fn insert(&mut self, name: impl Into<String>, value: Array2<f64>) {
        self.insert_with(name, value, Storage::Dense);
    }

    /// Insert or replace a variable stored as a sparse matrix. Suited to
    /// spatial footprints, which are zero outside a small neighbourhood.
    pub fn insert_sparse(&mut self, name: impl Into<String>, value: Array2<f64>) {
        self.insert_with(name, value, Storage::Sparse);
    }

    fn insert_with(&mut self, name: impl Into<String>, value: Array2<f64>, storage: Storage) {
        let name = name.into();
        match self.variables.iter_mut().find(|v| v.name == name) {
            Some(slot) => {
                slot.value = value;
                slot.storage = storage;
            }
            None => self.variables.push(Variable {
                name,
                value,
                storage,
            }),
        }
    }

    /// Vectors are stored as 1×n row matrices.
    pub fn insert_vector(&mut self, name: impl Into<String>, value: &Array1<f64>) {
        let row = value.view().insert_axis(ndarray::Axis(0)).to_owned();
        self.insert(name, row);
    }

    pub fn insert_scalar(&mut self, name: impl Into<String>, value: f64) {
        self.insert(name, Array2::from_elem((1, 1), value));
    }

    pub fn get(&self, name: &str) -> Option<&Array2<f64>> {
        self.variables.iter().find(|v| v.name == name).map(|v| &v.value)
    }

    pub fn storage(&self, name: &str) -> Option<Storage> {
        self.variables.iter().find(|v| v.name == name).map(|v| v.storage)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.variables.iter().map(|v| v.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    /// Remove a variable, returning `None` if absent.
    pub fn take(&mut self, name: &str) -> Option<Array2<f64>> {
        let idx = self.variables.iter().position(|v| v.name == name)?;
        Some(self.variables.remove(idx).value)
    }

    /// Remove a required matrix. `origin` only labels the error.
    pub fn take_matrix(&mut self, name: &str, origin: &Path) -> Result<Array2<f64>> {
        self.take(name).ok_or_else(|| CnmfError::MissingVariable {
            path: origin.to_path_buf(),
            name: name.to_string(),
        })
    }

    /// Remove a required vector; accepts 1×n, n×1 and empty matrices.
    pub fn take_vector(&mut self, name: &str, origin: &Path) -> Result<Array1<f64>> {
        let matrix = self.take_matrix(name, origin)?;
        flatten_vector(matrix, name, origin)
    }

    pub fn take_optional_vector(&mut self, name: &str, origin: &Path) -> Result<Option<Array1<f64>>> {
        self.take(name)
            .map(|m| flatten_vector(m, name, origin))
            .transpose()
    }

    pub fn take_scalar(&mut self, name: &str, origin: &Path) -> Result<f64> {
        let vector = self.take_vector(name, origin)?;
        match vector.len() {
            1 => Ok(vector[0]),
            n => Err(CnmfError::InvalidMat {
                path: origin.to_path_buf(),
                reason: format!("'{name}' should be a scalar, found {n} elements"),
            }),
        }
    }

    /// Write the file next to `path` and rename it into place, so a failed
    /// write never leaves a truncated file under the final name.
    pub fn save(&self, path: &Path) -> Result<()> {
        let partial = partial_path(path);
        let written = self
            .write_to(&partial)
            .and_then(|()| std::fs::rename(&partial, path).map_err(CnmfError::from));
        if written.is_err() {
            if let Err(cleanup) = std::fs::remove_file(&partial) {
                debug!(path = %partial.display(), error = %cleanup, "Could not remove partial MAT file");
            }
        }
        written
    }

    fn write_to(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        write_header(&mut writer)?;
        for var in &self.variables {
            match var.storage {
                Storage::Dense => write_dense(&mut writer, &var.name, &var.value)?,
                Storage::Sparse => write_sparse(&mut writer, &var.name, &var.value)?,
            }
        }
        writer.flush()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes, path)
    }

    pub fn from_bytes(bytes: &[u8], origin: &Path) -> Result<Self> {
        let invalid = |reason: &str| CnmfError::InvalidMat {
            path: origin.to_path_buf(),
            reason: reason.to_string(),
        };

        if bytes.len() < MAT_HEADER_SIZE {
            return Err(invalid("file too small for MAT header"));
        }
        match &bytes[126..128] {
            b"IM" => {}
            b"MI" => return Err(invalid("big-endian MAT files are not supported")),
            _ => return Err(invalid("missing endian indicator")),
        }

        let mut file = MatFile::new();
        let mut pos = MAT_HEADER_SIZE;
        while pos + 8 <= bytes.len() {
            let tag = read_tag(bytes, pos, origin)?;
            match tag.ty {
                MI_MATRIX => {
                    if let Some(var) = parse_matrix(&bytes[tag.data.clone()], origin)? {
                        file.insert_with(var.name, var.value, var.storage);
                    }
                }
                MI_COMPRESSED => return Err(invalid("compressed variables are not supported")),
                other => debug!(element_type = other, "Skipping top-level MAT element"),
            }
            pos = tag.next;
        }
        Ok(file)
    }
}

/// `<file>.mat` becomes `<file>.mat.partial`.
fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

fn flatten_vector(matrix: Array2<f64>, name: &str, origin: &Path) -> Result<Array1<f64>> {
    let (rows, cols) = matrix.dim();
    if rows > 1 && cols > 1 {
        return Err(CnmfError::InvalidMat {
            path: origin.to_path_buf(),
            reason: format!("'{name}' should be a vector, found {rows}x{cols}"),
        });
    }
    Ok(matrix.iter().copied().collect())
}

fn pad8(n: usize) -> usize {
    (n + 7) & !7
}

fn too_large(name: &str) -> CnmfError {
    CnmfError::InvalidParameter(format!("variable '{name}' exceeds 4 GiB"))
}

fn write_header(w: &mut impl Write) -> Result<()> {
    let text = format!(
        "MATLAB 5.0 MAT-file, Platform: {}, Created by: cnmf-core {}",
        std::env::consts::OS,
        env!("CARGO_PKG_VERSION")
    );
    let mut block = [b' '; MAT_TEXT_SIZE];
    let len = text.len().min(MAT_TEXT_SIZE);
    block[..len].copy_from_slice(&text.as_bytes()[..len]);
    w.write_all(&block)?;
    // Subsystem data offset (unused)
    w.write_all(&[0u8; 8])?;
    w.write_u16::<LittleEndian>(MAT_VERSION)?;
    // Endian indicator: 'MI' written little-endian reads back as "IM"
    w.write_all(b"IM")?;
    Ok(())
}

/// Bytes taken by the name sub-element.
fn name_len(name: &str) -> usize {
    match name.len() {
        0..=4 => 8,
        n => 8 + pad8(n),
    }
}

/// miMATRIX tag, array flags, dimensions and name. `body_len` is the size
/// of the data sub-elements that follow.
fn write_array_header(
    w: &mut impl Write,
    name: &str,
    class: u32,
    nzmax: u32,
    (rows, cols): (usize, usize),
    body_len: usize,
) -> Result<()> {
    // flags (16) + dims (16) + name + body
    let total = 16 + 16 + name_len(name) + body_len;
    let total = u32::try_from(total).map_err(|_| too_large(name))?;
    let dim_rows = i32::try_from(rows).map_err(|_| too_large(name))?;
    let dim_cols = i32::try_from(cols).map_err(|_| too_large(name))?;

    w.write_u32::<LittleEndian>(MI_MATRIX)?;
    w.write_u32::<LittleEndian>(total)?;

    // Array flags
    w.write_u32::<LittleEndian>(MI_UINT32)?;
    w.write_u32::<LittleEndian>(8)?;
    w.write_u32::<LittleEndian>(class)?;
    w.write_u32::<LittleEndian>(nzmax)?;

    // Dimensions
    w.write_u32::<LittleEndian>(MI_INT32)?;
    w.write_u32::<LittleEndian>(8)?;
    w.write_i32::<LittleEndian>(dim_rows)?;
    w.write_i32::<LittleEndian>(dim_cols)?;

    // Name
    let name_bytes = name.as_bytes();
    if name_bytes.len() <= 4 {
        w.write_u32::<LittleEndian>(((name_bytes.len() as u32) << 16) | MI_INT8)?;
        w.write_all(name_bytes)?;
        w.write_all(&[0u8; 4][..4 - name_bytes.len()])?;
    } else {
        w.write_u32::<LittleEndian>(MI_INT8)?;
        w.write_u32::<LittleEndian>(name_bytes.len() as u32)?;
        w.write_all(name_bytes)?;
        w.write_all(&[0u8; 8][..pad8(name_bytes.len()) - name_bytes.len()])?;
    }
    Ok(())
}

fn write_padding(w: &mut impl Write, len: usize) -> Result<()> {
    w.write_all(&[0u8; 8][..pad8(len) - len])?;
    Ok(())
}

fn write_dense(w: &mut impl Write, name: &str, value: &Array2<f64>) -> Result<()> {
    let data_len = value.len() * 8;
    write_array_header(w, name, MX_DOUBLE_CLASS, 0, value.dim(), 8 + data_len)?;

    // Real part, column-major
    w.write_u32::<LittleEndian>(MI_DOUBLE)?;
    w.write_u32::<LittleEndian>(data_len as u32)?;
    for &v in value.t().iter() {
        w.write_f64::<LittleEndian>(v)?;
    }
    Ok(())
}

fn write_sparse(w: &mut impl Write, name: &str, value: &Array2<f64>) -> Result<()> {
    let mut ir: Vec<i32> = Vec::new();
    let mut pr: Vec<f64> = Vec::new();
    let mut jc: Vec<i32> = Vec::with_capacity(value.ncols() + 1);
    jc.push(0);
    for column in value.columns() {
        for (row, &v) in column.iter().enumerate() {
            if v != 0.0 {
                ir.push(i32::try_from(row).map_err(|_| too_large(name))?);
                pr.push(v);
            }
        }
        jc.push(i32::try_from(pr.len()).map_err(|_| too_large(name))?);
    }

    let (ir_len, jc_len, pr_len) = (ir.len() * 4, jc.len() * 4, pr.len() * 8);
    let body = 8 + pad8(ir_len) + 8 + pad8(jc_len) + 8 + pr_len;
    // An all-zero matrix still reserves one slot.
    let nzmax = u32::try_from(pr.len().max(1)).map_err(|_| too_large(name))?;
    write_array_header(w, name, MX_SPARSE_CLASS, nzmax, value.dim(), body)?;

    w.write_u32::<LittleEndian>(MI_INT32)?;
    w.write_u32::<LittleEndian>(ir_len as u32)?;
    for &i in &ir {
        w.write_i32::<LittleEndian>(i)?;
    }
    write_padding(w, ir_len)?;

    w.write_u32::<LittleEndian>(MI_INT32)?;
    w.write_u32::<LittleEndian>(jc_len as u32)?;
    for &j in &jc {
        w.write_i32::<LittleEndian>(j)?;
    }
    write_padding(w, jc_len)?;

    w.write_u32::<LittleEndian>(MI_DOUBLE)?;
    w.write_u32::<LittleEndian>(pr_len as u32)?;
    for &v in &pr {
        w.write_f64::<LittleEndian>(v)?;
    }
    Ok(())
}

struct Tag {
    ty: u32,
    data: Range<usize>,
    next: usize,
}

/// Read a data-element tag at `pos`, handling the packed small-element form.
fn read_tag(bytes: &[u8], pos: usize, origin: &Path) -> Result<Tag> {
    let truncated = || CnmfError::InvalidMat {
        path: origin.to_path_buf(),
        reason: format!("truncated data element at byte {pos}"),
    };
    if pos + 8 > bytes.len() {
        return Err(truncated());
    }
    let first = LittleEndian::read_u32(&bytes[pos..pos + 4]);
    let small_len = (first >> 16) as usize;
    let tag = if small_len != 0 {
        if small_len > 4 {
            return Err(truncated());
        }
        Tag {
            ty: first & 0xffff,
            data: pos + 4..pos + 4 + small_len,
            next: pos + 8,
        }
    } else {
        let len = LittleEndian::read_u32(&bytes[pos + 4..pos + 8]) as usize;
        let start = pos + 8;
        // Compressed elements are not padded to 8 bytes.
        let next = if first == MI_COMPRESSED {
            start + len
        } else {
            start + pad8(len)
        };
        Tag {
            ty: first,
            data: start..start + len,
            next,
        }
    };
    if tag.data.end > bytes.len() {
        return Err(truncated());
    }
    Ok(tag)
}

/// Parse the body of an miMATRIX element. Returns `None` for variables
/// that are not real numeric arrays.
fn parse_matrix(body: &[u8], origin: &Path) -> Result<Option<Variable>> {
    let invalid = |reason: String| CnmfError::InvalidMat {
        path: origin.to_path_buf(),
        reason,
    };
    if body.is_empty() {
        return Ok(None);
    }

    let flags_tag = read_tag(body, 0, origin)?;
    if flags_tag.ty != MI_UINT32 || flags_tag.data.len() < 8 {
        return Err(invalid("malformed array flags".into()));
    }
    let flags = LittleEndian::read_u32(&body[flags_tag.data.start..flags_tag.data.start + 4]);
    let class = flags & 0xff;

    let dims_tag = read_tag(body, flags_tag.next, origin)?;
    let dims: Vec<usize> = body[dims_tag.data.clone()]
        .chunks_exact(4)
        .map(|c| LittleEndian::read_i32(c).max(0) as usize)
        .collect();

    let name_tag = read_tag(body, dims_tag.next, origin)?;
    let name = String::from_utf8_lossy(&body[name_tag.data.clone()]).into_owned();

    let storage = match class {
        MX_SPARSE_CLASS => Storage::Sparse,
        c if MX_NUMERIC_CLASSES.contains(&c) => Storage::Dense,
        _ => {
            debug!(name = %name, class, "Skipping non-numeric MAT variable");
            return Ok(None);
        }
    };
    if flags & FLAG_COMPLEX != 0 {
        return Err(invalid(format!("complex variable '{name}' is not supported")));
    }
    if dims.len() != 2 {
        return Err(invalid(format!(
            "variable '{name}' has {} dimensions, expected 2",
            dims.len()
        )));
    }
    let (rows, cols) = (dims[0], dims[1]);

    let element = |pos: usize| -> Result<(Vec<f64>, usize)> {
        let tag = read_tag(body, pos, origin)?;
        let values = decode_numeric(tag.ty, &body[tag.data.clone()])
            .ok_or_else(|| invalid(format!("unsupported storage type {} for '{name}'", tag.ty)))?;
        Ok((values, tag.next))
    };

    let value = match storage {
        Storage::Dense => {
            let (values, _) = element(name_tag.next)?;
            if values.len() != rows * cols {
                return Err(invalid(format!(
                    "variable '{name}' holds {} values for a {rows}x{cols} matrix",
                    values.len()
                )));
            }
            Array2::from_shape_vec((rows, cols).f(), values).map_err(|e| invalid(e.to_string()))?
        }
        Storage::Sparse => {
            let (ir, next) = element(name_tag.next)?;
            let (jc, next) = element(next)?;
            let (pr, _) = element(next)?;
            densify(rows, cols, &ir, &jc, &pr)
                .map_err(|reason| invalid(format!("sparse variable '{name}': {reason}")))?
        }
    };
    Ok(Some(Variable {
        name,
        value,
        storage,
    }))
}

/// Expand compressed-column data to a dense matrix. `ir` and `pr` may hold
/// unused trailing slots (`nzmax` > non-zeros); `jc[cols]` is authoritative.
fn densify(
    rows: usize,
    cols: usize,
    ir: &[f64],
    jc: &[f64],
    pr: &[f64],
) -> std::result::Result<Array2<f64>, String> {
    if jc.len() < cols + 1 {
        return Err(format!("{} column pointers for {cols} columns", jc.len()));
    }
    let as_index = |v: f64| -> std::result::Result<usize, String> {
        if v >= 0.0 && v.fract() == 0.0 {
            Ok(v as usize)
        } else {
            Err(format!("invalid index {v}"))
        }
    };
    let mut dense = Array2::zeros((rows, cols));
    for col in 0..cols {
        let (start, end) = (as_index(jc[col])?, as_index(jc[col + 1])?);
        if start > end || end > ir.len() || end > pr.len() {
            return Err(format!(
                "column {col} spans {start}..{end} of {} entries",
                pr.len().min(ir.len())
            ));
        }
        for (&r, &v) in ir[start..end].iter().zip(&pr[start..end]) {
            let row = as_index(r)?;
            if row >= rows {
                return Err(format!("row index {row} out of range for {rows} rows"));
            }
            dense[[row, col]] = v;
        }
    }
    Ok(dense)
}

fn decode_numeric(ty: u32, data: &[u8]) -> Option<Vec<f64>> {
    let values = match ty {
        MI_DOUBLE => data.chunks_exact(8).map(LittleEndian::read_f64).collect(),
        MI_SINGLE => data
            .chunks_exact(4)
            .map(|c| f64::from(LittleEndian::read_f32(c)))
            .collect(),
        MI_INT8 => data.iter().map(|&b| f64::from(b as i8)).collect(),
        MI_UINT8 => data.iter().map(|&b| f64::from(b)).collect(),
        MI_INT16 => data
            .chunks_exact(2)
            .map(|c| f64::from(LittleEndian::read_i16(c)))
            .collect(),
        MI_UINT16 => data
            .chunks_exact(2)
            .map(|c| f64::from(LittleEndian::read_u16(c)))
            .collect(),
        MI_INT32 => data
            .chunks_exact(4)
            .map(|c| f64::from(LittleEndian::read_i32(c)))
            .collect(),
        MI_UINT32 => data
            .chunks_exact(4)
            .map(|c| f64::from(LittleEndian::read_u32(c)))
            .collect(),
        MI_INT64 => data
            .chunks_exact(8)
            .map(|c| LittleEndian::read_i64(c) as f64)
            .collect(),
        MI_UINT64 => data
            .chunks_exact(8)
            .map(|c| LittleEndian::read_u64(c) as f64)
            .collect(),
        _ => return None,
    };
    Some(values)
}
