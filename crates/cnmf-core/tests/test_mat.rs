use std::path::Path;

use cnmf_core::error::CnmfError;
use cnmf_core::io::mat::{MatFile, Storage, MAT_HEADER_SIZE};
use ndarray::{array, Array1, Array2};

fn header() -> Vec<u8> {
    let mut bytes = vec![b' '; 116];
    bytes[..10].copy_from_slice(b"MATLAB 5.0");
    bytes.extend_from_slice(&[0u8; 8]);
    bytes.extend_from_slice(&0x0100u16.to_le_bytes());
    bytes.extend_from_slice(b"IM");
    bytes
}

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// miMATRIX element with a short (≤ 4 byte) name and the given class,
/// storage type and raw real-part bytes.
fn matrix_element(name: &str, class: u32, rows: i32, cols: i32, storage: u32, data: &[u8]) -> Vec<u8> {
    assert!(name.len() <= 4);
    let mut body = Vec::new();
    // array flags
    push_u32(&mut body, 6);
    push_u32(&mut body, 8);
    push_u32(&mut body, class);
    push_u32(&mut body, 0);
    // dimensions
    push_u32(&mut body, 5);
    push_u32(&mut body, 8);
    body.extend_from_slice(&rows.to_le_bytes());
    body.extend_from_slice(&cols.to_le_bytes());
    // small-element name
    push_u32(&mut body, ((name.len() as u32) << 16) | 1);
    let mut name_bytes = name.as_bytes().to_vec();
    name_bytes.resize(4, 0);
    body.extend_from_slice(&name_bytes);
    // real part
    push_u32(&mut body, storage);
    push_u32(&mut body, data.len() as u32);
    body.extend_from_slice(data);
    while body.len() % 8 != 0 {
        body.push(0);
    }

    let mut element = Vec::new();
    push_u32(&mut element, 14);
    push_u32(&mut element, body.len() as u32);
    element.extend_from_slice(&body);
    element
}

/// Data sub-element, packed into the tag when it fits in four bytes.
fn push_element(buf: &mut Vec<u8>, ty: u32, data: &[u8]) {
    if data.len() <= 4 {
        push_u32(buf, ((data.len() as u32) << 16) | ty);
        let mut packed = data.to_vec();
        packed.resize(4, 0);
        buf.extend_from_slice(&packed);
        return;
    }
    push_u32(buf, ty);
    push_u32(buf, data.len() as u32);
    buf.extend_from_slice(data);
    while buf.len() % 8 != 0 {
        buf.push(0);
    }
}

/// mxSPARSE miMATRIX element laid out like a scipy `savemat` file:
/// int32 row indices and column pointers, double values.
fn sparse_element(name: &str, rows: i32, cols: i32, ir: &[i32], jc: &[i32], pr: &[f64]) -> Vec<u8> {
    assert!(name.len() <= 4);
    let mut body = Vec::new();
    push_u32(&mut body, 6);
    push_u32(&mut body, 8);
    push_u32(&mut body, 5);
    push_u32(&mut body, pr.len().max(1) as u32);
    push_u32(&mut body, 5);
    push_u32(&mut body, 8);
    body.extend_from_slice(&rows.to_le_bytes());
    body.extend_from_slice(&cols.to_le_bytes());
    push_element(&mut body, 1, name.as_bytes());
    let ir: Vec<u8> = ir.iter().flat_map(|v| v.to_le_bytes()).collect();
    let jc: Vec<u8> = jc.iter().flat_map(|v| v.to_le_bytes()).collect();
    let pr: Vec<u8> = pr.iter().flat_map(|v| v.to_le_bytes()).collect();
    push_element(&mut body, 5, &ir);
    push_element(&mut body, 5, &jc);
    push_element(&mut body, 9, &pr);

    let mut element = Vec::new();
    push_u32(&mut element, 14);
    push_u32(&mut element, body.len() as u32);
    element.extend_from_slice(&body);
    element
}

#[test]
fn test_reads_column_major_double() {
    let values: Vec<u8> = [1.0f64, 3.0, 2.0, 4.0]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    let mut bytes = header();
    bytes.extend(matrix_element("A", 6, 2, 2, 9, &values));

    let file = MatFile::from_bytes(&bytes, Path::new("mem")).unwrap();
    assert_eq!(file.get("A").unwrap(), &array![[1.0, 2.0], [3.0, 4.0]]);
}

#[test]
fn test_integer_storage_widened_to_f64() {
    let mut bytes = header();
    bytes.extend(matrix_element("bl", 6, 1, 3, 2, &[0, 7, 255]));
    let mut file = MatFile::from_bytes(&bytes, Path::new("mem")).unwrap();
    let bl = file.take_vector("bl", Path::new("mem")).unwrap();
    assert_eq!(bl.to_vec(), vec![0.0, 7.0, 255.0]);
}

#[test]
fn test_non_numeric_variables_skipped() {
    let mut bytes = header();
    // mxCHAR_CLASS (4) holding "hi" as UTF-16
    bytes.extend(matrix_element("note", 4, 1, 2, 4, &[b'h', 0, b'i', 0]));
    bytes.extend(matrix_element("x", 6, 1, 1, 9, &2.5f64.to_le_bytes()));

    let file = MatFile::from_bytes(&bytes, Path::new("mem")).unwrap();
    assert_eq!(file.names().collect::<Vec<_>>(), vec!["x"]);
}

#[test]
fn test_written_header_fields() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.mat");
    let mut file = MatFile::new();
    file.insert("A", Array2::zeros((2, 2)));
    file.save(&path).unwrap();

    let bytes = std::fs::read(&path).unwrap();
    assert!(bytes.starts_with(b"MATLAB 5.0 MAT-file"));
    assert_eq!(&bytes[124..126], &0x0100u16.to_le_bytes());
    assert_eq!(&bytes[126..128], b"IM");
    assert_eq!(bytes.len() % 8, 0);
    assert!(bytes.len() > MAT_HEADER_SIZE);
}

#[test]
fn test_save_load_keeps_names_and_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vars.mat");
    let mut file = MatFile::new();
    file.insert("YrA", Array2::from_shape_fn((3, 5), |(i, j)| i as f64 - 0.5 * j as f64));
    file.insert_vector("neurons_sn", &Array1::from(vec![0.1, 0.2]));
    file.insert_scalar("k", 7.0);
    file.insert("empty", Array2::zeros((0, 4)));
    file.save(&path).unwrap();

    let mut loaded = MatFile::load(&path).unwrap();
    assert_eq!(loaded.len(), 4);
    assert_eq!(loaded.get("YrA"), file.get("YrA"));
    assert_eq!(loaded.get("empty").unwrap().dim(), (0, 4));
    let origin = Path::new("vars.mat");
    assert_eq!(loaded.take_scalar("k", origin).unwrap(), 7.0);
    assert_eq!(
        loaded.take_vector("neurons_sn", origin).unwrap().to_vec(),
        vec![0.1, 0.2]
    );
}

#[test]
fn test_insert_replaces_existing_variable() {
    let mut file = MatFile::new();
    file.insert_scalar("a", 1.0);
    file.insert_scalar("a", 2.0);
    assert_eq!(file.len(), 1);
    assert_eq!(file.get("a").unwrap()[[0, 0]], 2.0);
}

#[test]
fn test_missing_variable_error_names_it() {
    let mut file = MatFile::new();
    match file.take_matrix("S", Path::new("bundle.mat")) {
        Err(CnmfError::MissingVariable { name, .. }) => assert_eq!(name, "S"),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn test_matrix_is_not_a_vector() {
    let mut file = MatFile::new();
    file.insert("m", Array2::zeros((2, 2)));
    assert!(matches!(
        file.take_vector("m", Path::new("mem")),
        Err(CnmfError::InvalidMat { .. })
    ));
}

#[test]
fn test_compressed_elements_rejected() {
    let mut bytes = header();
    push_u32(&mut bytes, 15);
    push_u32(&mut bytes, 4);
    bytes.extend_from_slice(&[0x78, 0x9c, 0, 0]);
    assert!(matches!(
        MatFile::from_bytes(&bytes, Path::new("mem")),
        Err(CnmfError::InvalidMat { .. })
    ));
}

#[test]
fn test_big_endian_rejected() {
    let mut bytes = header();
    bytes[126..128].copy_from_slice(b"MI");
    assert!(matches!(
        MatFile::from_bytes(&bytes, Path::new("mem")),
        Err(CnmfError::InvalidMat { .. })
    ));
}

#[test]
fn test_short_file_rejected() {
    assert!(matches!(
        MatFile::from_bytes(b"MATLAB", Path::new("mem")),
        Err(CnmfError::InvalidMat { .. })
    ));
}

#[test]
fn test_reads_scipy_sparse_matrix() {
    // [[0, 2.5], [1.5, 0]] in compressed columns
    let mut bytes = header();
    bytes.extend(sparse_element("A", 2, 2, &[1, 0], &[0, 1, 2], &[1.5, 2.5]));
    // A single entry packs its row index into the tag.
    bytes.extend(sparse_element("b", 3, 1, &[2], &[0, 1], &[-4.0]));

    let file = MatFile::from_bytes(&bytes, Path::new("mem")).unwrap();
    assert_eq!(file.get("A").unwrap(), &array![[0.0, 2.5], [1.5, 0.0]]);
    assert_eq!(file.storage("A"), Some(Storage::Sparse));
    assert_eq!(file.get("b").unwrap(), &array![[0.0], [0.0], [-4.0]]);
}

#[test]
fn test_sparse_with_out_of_range_row_rejected() {
    let mut bytes = header();
    bytes.extend(sparse_element("A", 2, 1, &[5], &[0, 1], &[1.0]));
    assert!(matches!(
        MatFile::from_bytes(&bytes, Path::new("mem")),
        Err(CnmfError::InvalidMat { .. })
    ));
}

#[test]
fn test_sparse_save_load_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sparse.mat");
    let footprints = Array2::from_shape_fn((6, 3), |(i, j)| if i / 2 == j { (i + 1) as f64 } else { 0.0 });
    let mut file = MatFile::new();
    file.insert_sparse("A", footprints.clone());
    file.insert_sparse("zero", Array2::zeros((4, 2)));
    file.insert_sparse("none", Array2::zeros((0, 3)));
    file.insert("C", array![[1.0, -2.0]]);
    file.save(&path).unwrap();

    let loaded = MatFile::load(&path).unwrap();
    assert_eq!(loaded, file);
    assert_eq!(loaded.storage("A"), Some(Storage::Sparse));
    assert_eq!(loaded.storage("C"), Some(Storage::Dense));
    assert_eq!(loaded.get("none").unwrap().dim(), (0, 3));
}

#[test]
fn test_sparse_storage_only_pays_for_non_zeros() {
    let dir = tempfile::tempdir().unwrap();
    let footprints = Array2::from_shape_fn((4000, 20), |(i, j)| {
        if i >= j * 200 && i < j * 200 + 5 {
            1.0
        } else {
            0.0
        }
    });
    let mut sparse = MatFile::new();
    sparse.insert_sparse("A", footprints.clone());
    let mut dense = MatFile::new();
    dense.insert("A", footprints);
    sparse.save(&dir.path().join("sparse.mat")).unwrap();
    dense.save(&dir.path().join("dense.mat")).unwrap();

    let size = |name: &str| std::fs::metadata(dir.path().join(name)).unwrap().len();
    assert!(size("sparse.mat") < 2048, "{}", size("sparse.mat"));
    assert!(size("dense.mat") > 640_000);
}

#[test]
fn test_failed_save_leaves_existing_file_intact() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rec_cnmf.mat");
    let mut good = MatFile::new();
    good.insert_scalar("k", 3.0);
    good.save(&path).unwrap();

    // More rows than a MAT dimension can describe; no elements to allocate.
    let mut oversized = MatFile::new();
    oversized.insert_scalar("k", 4.0);
    oversized.insert("A", Array2::zeros((1usize << 31, 0)));
    assert!(matches!(
        oversized.save(&path),
        Err(CnmfError::InvalidParameter(_))
    ));

    assert_eq!(MatFile::load(&path).unwrap(), good);
    let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(leftovers.len(), 1);

    let fresh = dir.path().join("never.mat");
    assert!(oversized.save(&fresh).is_err());
    assert!(!fresh.exists());
}
