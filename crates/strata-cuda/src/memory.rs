// Memory: host images of device buffers
//
// Device buffers are untyped bytes; every view reads and writes its own
// dtype at its own element offsets. Host-side loads (constants, numpy
// tensors, RNG fills, call arguments) and reads copy the whole buffer to
// the host, edit or decode the view there and copy it back.
//
// Elements are little-endian; F16 goes through `half`.

use half::f16;

use strata_core::description::TensorDescription;
use strata_core::dtype::DType;
use strata_core::error::{Error, Result};

fn element(bytes: &[u8], dtype: DType, index: isize) -> Result<&[u8]> {
    let size = dtype.size_in_bytes();
    let start = usize::try_from(index)
        .ok()
        .and_then(|i| i.checked_mul(size))
        .filter(|&s| s + size <= bytes.len())
        .ok_or_else(|| {
            Error::Internal(format!(
                "{} element {} outside a {} byte buffer",
                dtype,
                index,
                bytes.len()
            ))
        })?;
    Ok(&bytes[start..start + size])
}

fn element_mut(bytes: &mut [u8], dtype: DType, index: isize) -> Result<&mut [u8]> {
    let size = dtype.size_in_bytes();
    let len = bytes.len();
    let start = usize::try_from(index)
        .ok()
        .and_then(|i| i.checked_mul(size))
        .filter(|&s| s + size <= len)
        .ok_or_else(|| {
            Error::Internal(format!(
                "{} element {} outside a {} byte buffer",
                dtype, index, len
            ))
        })?;
    Ok(&mut bytes[start..start + size])
}

/// Element `index` (in units of `dtype`) of `bytes`.
pub fn decode(bytes: &[u8], dtype: DType, index: isize) -> Result<f64> {
    let raw = element(bytes, dtype, index)?;
    let bad = |_| Error::Internal(format!("short {} element", dtype));
    Ok(match dtype {
        DType::F16 => f16::from_le_bytes(raw.try_into().map_err(bad)?).to_f64(),
        DType::F32 => f32::from_le_bytes(raw.try_into().map_err(bad)?) as f64,
        DType::F64 => f64::from_le_bytes(raw.try_into().map_err(bad)?),
        DType::I64 => i64::from_le_bytes(raw.try_into().map_err(bad)?) as f64,
        DType::Bool => {
            if raw[0] != 0 {
                1.0
            } else {
                0.0
            }
        }
    })
}

/// Store `v`, rounded to `dtype`, as element `index` of `bytes`.
pub fn encode(bytes: &mut [u8], dtype: DType, index: isize, v: f64) -> Result<()> {
    let raw = element_mut(bytes, dtype, index)?;
    match dtype {
        DType::F16 => raw.copy_from_slice(&f16::from_f64(v).to_le_bytes()),
        DType::F32 => raw.copy_from_slice(&(v as f32).to_le_bytes()),
        DType::F64 => raw.copy_from_slice(&v.to_le_bytes()),
        DType::I64 => raw.copy_from_slice(&(v as i64).to_le_bytes()),
        DType::Bool => raw[0] = u8::from(v != 0.0),
    }
    Ok(())
}

/// Values of the view `td`, row-major.
pub fn read_view(bytes: &[u8], td: &TensorDescription) -> Result<Vec<f64>> {
    td.offsets().map(|i| decode(bytes, td.dtype(), i)).collect()
}

/// Write `values` (row-major) through the view `td`.
pub fn write_view(bytes: &mut [u8], td: &TensorDescription, values: &[f64]) -> Result<()> {
    if values.len() != td.size() {
        return Err(Error::ShapeMismatch {
            expected: td.shape(),
            got: vec![values.len()],
        });
    }
    for (i, &v) in td.offsets().zip(values) {
        encode(bytes, td.dtype(), i, v)?;
    }
    Ok(())
}
