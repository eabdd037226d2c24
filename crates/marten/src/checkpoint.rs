// Checkpoint — save and load named tensors
//
// Binary checkpoint format (.mrtn):
//
//   Header:
//     magic:   [u8; 4]  = b"MRTN"
//     version: u32 LE   = 1
//     count:   u32 LE   = number of tensors
//
//   For each tensor:
//     name_len: u32 LE
//     name:     [u8; name_len]  (UTF-8)
//     dtype:    u8              (DType::code: 0=F16, 1=BF16, 2=F32, 3=F64, 4=U8, 5=U32, 6=I64)
//     rank:     u32 LE
//     dims:     [u64 LE; rank]
//     count:    u64 LE          (elements)
//     data:     count values, little-endian, in the tensor's dtype
//
// Usage:
//   checkpoint::save("model.mrtn", &named)?;
//   let named = checkpoint::load::<CpuBackend>("model.mrtn", &CpuDevice)?;
//   checkpoint::restore("model.mrtn", &params)?;   // update in place

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use marten_core::backend::Backend;
use marten_core::tensor::Tensor;
use marten_core::{DType, Error, Result};

const MAGIC: &[u8; 4] = b"MRTN";
const VERSION: u32 = 1;

fn dtype_from_code(code: u8) -> Result<DType> {
    DType::from_code(code).ok_or_else(|| Error::msg(format!("unknown checkpoint dtype code {code}")))
}

// Values <-> little-endian bytes

fn encode_values(data: &[f64], dtype: DType) -> Vec<u8> {
    match dtype {
        DType::F16 => data.iter().flat_map(|&v| half::f16::from_f64(v).to_le_bytes()).collect(),
        DType::BF16 => data.iter().flat_map(|&v| half::bf16::from_f64(v).to_le_bytes()).collect(),
        DType::F32 => data.iter().flat_map(|&v| (v as f32).to_le_bytes()).collect(),
        DType::F64 => data.iter().flat_map(|&v| v.to_le_bytes()).collect(),
        DType::U8 => data.iter().map(|&v| v as u8).collect(),
        DType::U32 => data.iter().flat_map(|&v| (v as u32).to_le_bytes()).collect(),
        DType::I64 => data.iter().flat_map(|&v| (v as i64).to_le_bytes()).collect(),
    }
}

fn decode_values(bytes: &[u8], dtype: DType) -> Vec<f64> {
    match dtype {
        DType::F16 => bytes
            .chunks_exact(2)
            .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f64())
            .collect(),
        DType::BF16 => bytes
            .chunks_exact(2)
            .map(|c| half::bf16::from_le_bytes([c[0], c[1]]).to_f64())
            .collect(),
        DType::F32 => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
            .collect(),
        DType::F64 => bytes
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect(),
        DType::U8 => bytes.iter().map(|&b| b as f64).collect(),
        DType::U32 => bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64)
            .collect(),
        DType::I64 => bytes
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f64)
            .collect(),
    }
}

// Low-level IO helpers

fn read_u8(r: &mut impl Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(r: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_bytes(r: &mut impl Read, len: usize) -> Result<Vec<u8>> {
    // Grow as data arrives so a corrupt length cannot force a huge allocation.
    let mut buf = Vec::new();
    let read = r.take(len as u64).read_to_end(&mut buf)?;
    if read != len {
        return Err(Error::msg(format!("truncated checkpoint: wanted {len} bytes, got {read}")));
    }
    Ok(buf)
}

// Write / read

pub fn write_checkpoint<B: Backend>(writer: &mut impl Write, tensors: &[(String, Tensor<B>)]) -> Result<()> {
    writer.write_all(MAGIC)?;
    writer.write_all(&VERSION.to_le_bytes())?;
    writer.write_all(&(tensors.len() as u32).to_le_bytes())?;

    for (name, tensor) in tensors {
        let name = name.as_bytes();
        writer.write_all(&(name.len() as u32).to_le_bytes())?;
        writer.write_all(name)?;
        writer.write_all(&[tensor.dtype().code()])?;
        writer.write_all(&(tensor.rank() as u32).to_le_bytes())?;
        for &d in tensor.dims() {
            writer.write_all(&(d as u64).to_le_bytes())?;
        }
        let data = tensor.contiguous()?.to_f64_vec()?;
        writer.write_all(&(data.len() as u64).to_le_bytes())?;
        writer.write_all(&encode_values(&data, tensor.dtype()))?;
    }
    Ok(())
}

pub fn read_checkpoint<B: Backend>(reader: &mut impl Read, device: &B::Device) -> Result<Vec<(String, Tensor<B>)>> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::msg(format!("invalid checkpoint: expected magic {MAGIC:?}, got {magic:?}")));
    }
    let version = read_u32(reader)?;
    if version != VERSION {
        return Err(Error::msg(format!(
            "unsupported checkpoint version {version} (expected {VERSION})"
        )));
    }

    let count = read_u32(reader)? as usize;
    let mut tensors = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let name_len = read_u32(reader)? as usize;
        let name = String::from_utf8(read_bytes(reader, name_len)?)
            .map_err(|e| Error::msg(format!("invalid UTF-8 tensor name: {e}")))?;
        let dtype = dtype_from_code(read_u8(reader)?)?;
        let rank = read_u32(reader)? as usize;
        let dims = (0..rank)
            .map(|_| read_u64(reader).map(|d| d as usize))
            .collect::<Result<Vec<_>>>()?;
        let elems = read_u64(reader)? as usize;
        let expected: usize = dims.iter().product();
        if elems != expected {
            return Err(Error::ElementCountMismatch {
                shape: dims.into(),
                expected,
                got: elems,
            });
        }
        let bytes = read_bytes(reader, elems * dtype.size_in_bytes())?;
        let tensor = Tensor::<B>::from_f64_slice(&decode_values(&bytes, dtype), dims, dtype, device)?;
        tensors.push((name, tensor));
    }
    tracing::debug!(count, "checkpoint read");
    Ok(tensors)
}

// Files

pub fn save<B: Backend>(path: impl AsRef<Path>, tensors: &[(String, Tensor<B>)]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path.as_ref())?);
    write_checkpoint(&mut writer, tensors)?;
    writer.flush()?;
    tracing::info!(path = %path.as_ref().display(), tensors = tensors.len(), "checkpoint saved");
    Ok(())
}

pub fn load<B: Backend>(path: impl AsRef<Path>, device: &B::Device) -> Result<Vec<(String, Tensor<B>)>> {
    let mut reader = BufReader::new(File::open(path.as_ref())?);
    read_checkpoint(&mut reader, device)
}

/// Overwrite `params` in place with the checkpoint's tensors of the same
/// name. Parameters missing from the file keep their values; shape
/// mismatches are errors.
///
/// Returns the number of parameters updated.
pub fn restore<B: Backend>(path: impl AsRef<Path>, params: &[(String, Tensor<B>)]) -> Result<usize> {
    let Some((_, first)) = params.first() else {
        return Ok(0);
    };
    let loaded: HashMap<String, Tensor<B>> = load::<B>(path, first.device())?.into_iter().collect();
    let mut count = 0;
    for (name, param) in params {
        let Some(saved) = loaded.get(name) else {
            continue;
        };
        if saved.dims() != param.dims() {
            return Err(Error::ShapeMismatch {
                expected: param.shape().clone(),
                got: saved.shape().clone(),
            });
        }
        param.update_data_inplace(&saved.to_f64_vec()?)?;
        count += 1;
    }
    Ok(count)
}

// In memory

pub fn to_bytes<B: Backend>(tensors: &[(String, Tensor<B>)]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_checkpoint(&mut buf, tensors)?;
    Ok(buf)
}

pub fn from_bytes<B: Backend>(data: &[u8], device: &B::Device) -> Result<Vec<(String, Tensor<B>)>> {
    read_checkpoint(&mut std::io::Cursor::new(data), device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use marten_cpu::{CpuBackend, CpuDevice};

    #[test]
    fn test_header_layout() {
        let t = Tensor::<CpuBackend>::from_f64_slice(&[1.0, 2.0], vec![2], DType::F64, &CpuDevice).unwrap();
        let bytes = to_bytes(&[("w".to_string(), t)]).unwrap();
        assert_eq!(&bytes[..4], b"MRTN");
        assert_eq!(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 1);
        assert_eq!(u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]), 1);
        // name, dtype, rank, one dim, count, two f64 values
        assert_eq!(bytes.len(), 12 + 4 + 1 + 1 + 4 + 8 + 8 + 16);
    }

    #[test]
    fn test_unknown_dtype_code() {
        assert!(dtype_from_code(9).is_err());
    }
}
