// Checkpoint tests: file roundtrip, in-place restore and corrupt files

use std::fs;

use marten::checkpoint;
use marten::prelude::*;
use marten::Error;

fn tensor(data: &[f64], dims: &[usize], dtype: DType) -> CpuTensor {
    CpuTensor::from_f64_slice(data, dims.to_vec(), dtype, &CpuDevice).unwrap()
}

fn named() -> Vec<(String, CpuTensor)> {
    vec![
        ("layer.weight".to_string(), tensor(&[0.5, -1.25, 2.0, 3.75, -0.125, 8.0], &[2, 3], DType::F32)),
        ("layer.bias".to_string(), tensor(&[1.0, -2.0], &[2], DType::F64)),
        ("half".to_string(), tensor(&[0.5, -1.5, 4.0], &[3], DType::F16)),
        ("bhalf".to_string(), tensor(&[2.0, -0.25], &[2, 1], DType::BF16)),
        ("mask".to_string(), tensor(&[0.0, 1.0, 255.0], &[3], DType::U8)),
        ("ids".to_string(), tensor(&[7.0, 70000.0], &[2], DType::U32)),
        ("steps".to_string(), tensor(&[-3.0], &[1], DType::I64)),
        ("scalar".to_string(), tensor(&[42.0], &[], DType::F32)),
    ]
}

#[test]
fn test_save_load_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.mrtn");
    let original = named();
    checkpoint::save(&path, &original).unwrap();

    let loaded = checkpoint::load::<CpuBackend>(&path, &CpuDevice).unwrap();
    assert_eq!(loaded.len(), original.len());
    for ((name_a, a), (name_b, b)) in original.iter().zip(&loaded) {
        assert_eq!(name_a, name_b);
        assert_eq!(a.dims(), b.dims());
        assert_eq!(a.dtype(), b.dtype());
        assert_eq!(a.to_f64_vec().unwrap(), b.to_f64_vec().unwrap());
    }
}

#[test]
fn test_restore_updates_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.mrtn");
    checkpoint::save(&path, &named()).unwrap();

    let weight = CpuTensor::zeros(vec![2, 3], DType::F32, &CpuDevice).unwrap().set_variable();
    let extra = tensor(&[9.0], &[1], DType::F32);
    let params = vec![("layer.weight".to_string(), weight.clone()), ("extra".to_string(), extra.clone())];
    assert_eq!(checkpoint::restore(&path, &params).unwrap(), 1);
    assert_eq!(weight.to_f64_vec().unwrap(), vec![0.5, -1.25, 2.0, 3.75, -0.125, 8.0]);
    assert_eq!(extra.to_f64_vec().unwrap(), vec![9.0]);

    let wrong = vec![("layer.bias".to_string(), tensor(&[0.0; 3], &[3], DType::F64))];
    assert!(matches!(checkpoint::restore(&path, &wrong), Err(Error::ShapeMismatch { .. })));
}

#[test]
fn test_truncated_file_is_an_error() {
    let bytes = checkpoint::to_bytes(&named()).unwrap();
    for cut in [3, 10, 20, bytes.len() - 1] {
        assert!(checkpoint::from_bytes::<CpuBackend>(&bytes[..cut], &CpuDevice).is_err(), "cut at {cut}");
    }
}

#[test]
fn test_bad_magic_and_version() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.mrtn");
    let mut bytes = checkpoint::to_bytes(&named()).unwrap();

    bytes[0] = b'X';
    fs::write(&path, &bytes).unwrap();
    let err = checkpoint::load::<CpuBackend>(&path, &CpuDevice).unwrap_err();
    assert!(err.to_string().contains("magic"));

    bytes[0] = b'M';
    bytes[4] = 9;
    assert!(checkpoint::from_bytes::<CpuBackend>(&bytes, &CpuDevice).is_err());
}

#[test]
fn test_unknown_dtype_code() {
    let mut bytes = checkpoint::to_bytes(&[("x".to_string(), tensor(&[1.0], &[1], DType::F32))]).unwrap();
    // header (12) + name length (4) + name (1)
    bytes[17] = 200;
    assert!(checkpoint::from_bytes::<CpuBackend>(&bytes, &CpuDevice).is_err());
}
