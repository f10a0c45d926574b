// DType: element types of tensor descriptions
//
// Every op output carries a DType that fixes its element size (and so the
// byte size of the buffer the memory planner colors) and how a backend
// rounds values when storing them:
//
//   F16  : 16-bit IEEE half float
//   F32  : 32-bit float, the default for computed tensors
//   F64  : 64-bit float
//   I64  : signed 64-bit int, produced by argmax/argmin
//   Bool : one byte, produced by comparisons (stored as 0/1)

use std::fmt;

/// Enum of all supported element data types.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DType {
    F16,
    #[default]
    F32,
    F64,
    I64,
    Bool,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F16 => 2,
            DType::F32 => 4,
            DType::F64 => 8,
            DType::I64 => 8,
            DType::Bool => 1,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::F32 | DType::F64)
    }

    /// Round a value to what a tensor of this dtype can hold.
    ///
    /// Backends that compute in f64 internally call this on every store so
    /// that an F32 tensor reads back exactly like an f32 array would.
    pub fn quantize(&self, v: f64) -> f64 {
        match self {
            DType::F16 => half::f16::from_f64(v).to_f64(),
            DType::F32 => v as f32 as f64,
            DType::F64 => v,
            DType::I64 => (v as i64) as f64,
            DType::Bool => {
                if v != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// The C type name used when generating device code.
    pub fn c_type(&self) -> &'static str {
        match self {
            DType::F16 => "__half",
            DType::F32 => "float",
            DType::F64 => "double",
            DType::I64 => "long long",
            DType::Bool => "unsigned char",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F16 => "f16",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I64 => "i64",
            DType::Bool => "bool",
        };
        write!(f, "{}", s)
    }
}

// WithDType: bridge from Rust element types to DType
//
// Host values handed to a computation (or read back from it) are converted
// through f64. Implementing WithDType for a Rust type lets generic helpers
// such as `HostTensor::from_slice::<T>` pick the matching DType.

/// Trait implemented by Rust types that can be stored in a tensor.
pub trait WithDType: Copy + Send + Sync + 'static + num_traits::NumCast + fmt::Debug {
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Convert this value to f64 (for generic numeric code).
    fn to_f64(self) -> f64;

    /// Create a value of this type from f64.
    fn from_f64(v: f64) -> Self;
}

impl WithDType for f32 {
    const DTYPE: DType = DType::F32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl WithDType for f64 {
    const DTYPE: DType = DType::F64;
    fn to_f64(self) -> f64 {
        self
    }
    fn from_f64(v: f64) -> Self {
        v
    }
}

impl WithDType for half::f16 {
    const DTYPE: DType = DType::F16;
    fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }
    fn from_f64(v: f64) -> Self {
        half::f16::from_f64(v)
    }
}

impl WithDType for i64 {
    const DTYPE: DType = DType::I64;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as i64
    }
}
