// CPU Backend — host implementation of the Marten Backend trait
//
// ARCHITECTURE:
// - CpuDevice is a unit struct; there is one host device.
// - CpuStorage is an enum over a typed Vec per dtype.
// - Element-wise kernels evaluate through f64 and round back to the storage
//   dtype, so F16/BF16/U8/... share one code path. Work above PAR_THRESHOLD
//   elements is split across the rayon pool.
// - matmul runs natively in f32 or f64 with a blocked i-k-j loop; other
//   dtypes go through f64.
// - Random numbers come from one process-wide StdRng so `set_seed` makes
//   every `rand`/`randn` call reproducible.
//
// USAGE:
//   let x = CpuTensor::randn((2, 3), DType::F32, &CpuDevice)?;
//   let y = x.relu()?.sum_all()?;

mod ops;
pub mod pool;

use std::fmt;
use std::sync::{Mutex, OnceLock};

use half::{bf16, f16};
use rand::rngs::StdRng;
use rand::SeedableRng;

use marten_core::backend::{BackendDevice, BackendStorage};
use marten_core::dtype::{DType, WithDType};
use marten_core::error::{Error, Result};
use marten_core::layout::Layout;
use marten_core::Tensor;

pub use pool::{DynamicMemPool, PoolStats, ALIGN_SIZE};

/// Element count above which kernels fan out to rayon.
pub(crate) const PAR_THRESHOLD: usize = 4096;

/// Tensor on the host.
pub type CpuTensor = Tensor<CpuBackend>;

// CpuBackend / CpuDevice

/// The CPU backend marker type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuBackend;

/// The host device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuDevice;

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        "cpu".to_string()
    }
}

// Random state

fn rng_cell() -> &'static Mutex<StdRng> {
    static RNG: OnceLock<Mutex<StdRng>> = OnceLock::new();
    RNG.get_or_init(|| Mutex::new(StdRng::from_entropy()))
}

/// Reseed the generator behind `rand_uniform` and `rand_normal`.
pub fn set_seed(seed: u64) {
    let mut rng = match rng_cell().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    *rng = StdRng::seed_from_u64(seed);
}

pub(crate) fn with_rng<R>(f: impl FnOnce(&mut StdRng) -> R) -> Result<R> {
    let mut rng = rng_cell()
        .lock()
        .map_err(|_| Error::msg("cpu rng lock poisoned"))?;
    Ok(f(&mut rng))
}

// CpuStorage

/// Host-side storage, one typed vector per dtype.
#[derive(Clone, PartialEq)]
pub enum CpuStorage {
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    U8(Vec<u8>),
    U32(Vec<u32>),
    I64(Vec<i64>),
}

/// Run `$body` with `$v` bound to the typed vector of `$s`.
macro_rules! with_storage {
    ($s:expr, $v:ident => $body:expr) => {
        match $s {
            CpuStorage::F16($v) => $body,
            CpuStorage::BF16($v) => $body,
            CpuStorage::F32($v) => $body,
            CpuStorage::F64($v) => $body,
            CpuStorage::U8($v) => $body,
            CpuStorage::U32($v) => $body,
            CpuStorage::I64($v) => $body,
        }
    };
}
pub(crate) use with_storage;

macro_rules! storage_from_vec {
    ($ty:ty, $variant:ident) => {
        impl From<Vec<$ty>> for CpuStorage {
            fn from(v: Vec<$ty>) -> Self {
                CpuStorage::$variant(v)
            }
        }
    };
}

storage_from_vec!(f16, F16);
storage_from_vec!(bf16, BF16);
storage_from_vec!(f32, F32);
storage_from_vec!(f64, F64);
storage_from_vec!(u8, U8);
storage_from_vec!(u32, U32);
storage_from_vec!(i64, I64);

impl CpuStorage {
    /// Build a storage of `dtype` from f64 values.
    pub fn from_f64_vec(data: Vec<f64>, dtype: DType) -> Self {
        fn conv<T: WithDType>(data: Vec<f64>) -> Vec<T> {
            data.into_iter().map(T::from_f64).collect()
        }
        match dtype {
            DType::F16 => CpuStorage::F16(conv(data)),
            DType::BF16 => CpuStorage::BF16(conv(data)),
            DType::F32 => CpuStorage::F32(conv(data)),
            DType::F64 => CpuStorage::F64(data),
            DType::U8 => CpuStorage::U8(conv(data)),
            DType::U32 => CpuStorage::U32(conv(data)),
            DType::I64 => CpuStorage::I64(conv(data)),
        }
    }

    /// Values in the layout's logical order, as f64.
    pub fn read_f64(&self, layout: &Layout) -> Vec<f64> {
        with_storage!(self, v => layout.strided_indices().map(|i| v[i].to_f64()).collect())
    }

    /// Copy of the elements at `indices`, keeping the dtype.
    pub(crate) fn pick(&self, indices: impl Iterator<Item = usize>) -> CpuStorage {
        with_storage!(self, v => CpuStorage::from(indices.map(|i| v[i]).collect::<Vec<_>>()))
    }

    pub fn as_f32_slice(&self) -> Result<&[f32]> {
        match self {
            CpuStorage::F32(v) => Ok(v),
            other => Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: other.dtype(),
            }),
        }
    }

    pub fn as_f64_slice(&self) -> Result<&[f64]> {
        match self {
            CpuStorage::F64(v) => Ok(v),
            other => Err(Error::DTypeMismatch {
                expected: DType::F64,
                got: other.dtype(),
            }),
        }
    }
}

impl fmt::Debug for CpuStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuStorage::{}(len={})", self.dtype(), self.len())
    }
}

impl BackendStorage for CpuStorage {
    fn dtype(&self) -> DType {
        match self {
            CpuStorage::F16(_) => DType::F16,
            CpuStorage::BF16(_) => DType::BF16,
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F64(_) => DType::F64,
            CpuStorage::U8(_) => DType::U8,
            CpuStorage::U32(_) => DType::U32,
            CpuStorage::I64(_) => DType::I64,
        }
    }

    fn len(&self) -> usize {
        with_storage!(self, v => v.len())
    }
}
