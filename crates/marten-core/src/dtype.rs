use std::fmt;

// DType — element types a tensor can hold
//
//   F16 / BF16 — half precision, widened for arithmetic on the CPU
//   F32        — default float type
//   F64        — reference precision for gradient checks and host kernels
//   U8         — boolean masks produced by comparisons
//   U32 / I64  — indices (gather, one-hot, argmax)

/// Runtime tag for the element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
    U8,
    U32,
    I64,
}

impl DType {
    /// All dtypes, in declaration order.
    pub const ALL: [DType; 7] = [
        DType::F16,
        DType::BF16,
        DType::F32,
        DType::F64,
        DType::U8,
        DType::U32,
        DType::I64,
    ];

    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F16 | DType::BF16 => 2,
            DType::F32 | DType::U32 => 4,
            DType::F64 | DType::I64 => 8,
            DType::U8 => 1,
        }
    }

    /// Floating-point dtypes are the only ones that carry gradients.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16 | DType::F32 | DType::F64)
    }

    pub fn is_half(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16)
    }

    /// The next wider dtype used when no kernel exists for `self`.
    ///
    /// Floats widen toward F64, integers toward I64 and then F64.
    /// Returns `None` for F64, which is the end of every chain.
    pub fn promote(&self) -> Option<DType> {
        match self {
            DType::F16 | DType::BF16 => Some(DType::F32),
            DType::F32 => Some(DType::F64),
            DType::U8 | DType::U32 => Some(DType::I64),
            DType::I64 => Some(DType::F64),
            DType::F64 => None,
        }
    }

    /// Stable one-byte code used by the checkpoint format.
    pub fn code(&self) -> u8 {
        match self {
            DType::F16 => 0,
            DType::BF16 => 1,
            DType::F32 => 2,
            DType::F64 => 3,
            DType::U8 => 4,
            DType::U32 => 5,
            DType::I64 => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<DType> {
        DType::ALL.iter().copied().find(|d| d.code() == code)
    }

    /// Parse the lowercase name printed by `Display` (`"f32"`, `"i64"`, ...).
    pub fn parse(name: &str) -> Option<DType> {
        DType::ALL.iter().copied().find(|d| d.to_string() == name)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F16 => "f16",
            DType::BF16 => "bf16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::U8 => "u8",
            DType::U32 => "u32",
            DType::I64 => "i64",
        };
        f.write_str(s)
    }
}

// WithDType — maps Rust scalar types onto DType
//
// Generic constructors such as `Tensor::from_slice::<T>` use this to pick the
// dtype and to move values through the f64 interchange format that the
// Backend trait speaks.

/// Rust scalar types that can be stored in a tensor.
pub trait WithDType: Copy + Send + Sync + 'static + num_traits::NumCast + fmt::Debug {
    const DTYPE: DType;

    fn to_f64(self) -> f64;

    fn from_f64(v: f64) -> Self;

    fn zero() -> Self {
        Self::from_f64(0.0)
    }

    fn one() -> Self {
        Self::from_f64(1.0)
    }
}

macro_rules! with_dtype_as {
    ($ty:ty, $dtype:ident) => {
        impl WithDType for $ty {
            const DTYPE: DType = DType::$dtype;
            fn to_f64(self) -> f64 {
                self as f64
            }
            fn from_f64(v: f64) -> Self {
                v as $ty
            }
        }
    };
}

with_dtype_as!(f32, F32);
with_dtype_as!(f64, F64);
with_dtype_as!(u8, U8);
with_dtype_as!(u32, U32);
with_dtype_as!(i64, I64);

impl WithDType for half::f16 {
    const DTYPE: DType = DType::F16;
    fn to_f64(self) -> f64 {
        self.to_f64()
    }
    fn from_f64(v: f64) -> Self {
        half::f16::from_f64(v)
    }
}

impl WithDType for half::bf16 {
    const DTYPE: DType = DType::BF16;
    fn to_f64(self) -> f64 {
        self.to_f64()
    }
    fn from_f64(v: f64) -> Self {
        half::bf16::from_f64(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(DType::BF16.size_in_bytes(), 2);
        assert_eq!(DType::U32.size_in_bytes(), 4);
        assert_eq!(DType::I64.size_in_bytes(), 8);
        assert_eq!(DType::U8.size_in_bytes(), 1);
    }

    #[test]
    fn test_promotion_chains_end_at_f64() {
        for dtype in DType::ALL {
            let mut cur = dtype;
            let mut steps = 0;
            while let Some(next) = cur.promote() {
                cur = next;
                steps += 1;
                assert!(steps < 4);
            }
            assert_eq!(cur, DType::F64);
        }
        assert_eq!(DType::BF16.promote(), Some(DType::F32));
        assert_eq!(DType::U8.promote(), Some(DType::I64));
    }

    #[test]
    fn test_codes_and_names() {
        for dtype in DType::ALL {
            assert_eq!(DType::from_code(dtype.code()), Some(dtype));
            assert_eq!(DType::parse(&dtype.to_string()), Some(dtype));
        }
        assert_eq!(DType::from_code(42), None);
        assert_eq!(DType::parse("complex64"), None);
    }

    #[test]
    fn test_with_dtype_conversions() {
        assert_eq!(f32::DTYPE, DType::F32);
        assert_eq!(<i64 as WithDType>::from_f64(-3.0), -3);
        assert_eq!(<half::f16 as WithDType>::from_f64(0.5).to_f64(), 0.5);
    }
}
