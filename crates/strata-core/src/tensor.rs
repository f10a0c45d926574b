use std::fmt;

use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result};

// HostTensor: a dense row-major array on the host
//
// This is the value type that crosses the boundary between client code and
// a compiled computation: placeholder arguments, numpy_tensor constants and
// returned results. Elements are kept as f64 regardless of dtype; the dtype
// records how the device side stores them.

#[derive(Clone, PartialEq)]
pub struct HostTensor {
    shape: Vec<usize>,
    data: Vec<f64>,
    dtype: DType,
}

impl HostTensor {
    /// Build from f64 data. Fails if `data.len()` is not the shape's
    /// element count.
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(Error::ShapeMismatch {
                expected: shape,
                got: vec![data.len()],
            });
        }
        Ok(HostTensor {
            shape,
            data,
            dtype: DType::F64,
        })
    }

    /// Build from a typed slice, taking the dtype from the element type.
    pub fn from_slice<T: WithDType>(data: &[T], shape: &[usize]) -> Result<Self> {
        let t = Self::new(shape.to_vec(), data.iter().map(|&v| WithDType::to_f64(v)).collect())?;
        Ok(t.with_dtype(T::DTYPE))
    }

    pub fn scalar(value: f64) -> Self {
        HostTensor {
            shape: Vec::new(),
            data: vec![value],
            dtype: DType::F64,
        }
    }

    pub fn full(shape: &[usize], value: f64) -> Self {
        let n = shape.iter().product();
        HostTensor {
            shape: shape.to_vec(),
            data: vec![value; n],
            dtype: DType::F64,
        }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, 0.0)
    }

    /// The value of ops that produce no tensor (fill, set_item, doall).
    pub fn empty() -> Self {
        HostTensor {
            shape: vec![0],
            data: Vec::new(),
            dtype: DType::F64,
        }
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn elem_count(&self) -> usize {
        self.data.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }

    /// The single value of a one-element tensor.
    pub fn to_scalar(&self) -> Result<f64> {
        match self.data.as_slice() {
            [v] => Ok(*v),
            _ => Err(Error::ShapeMismatch {
                expected: vec![],
                got: self.shape.clone(),
            }),
        }
    }

    pub fn to_vec<T: WithDType>(&self) -> Vec<T> {
        self.data.iter().map(|&v| T::from_f64(v)).collect()
    }

    /// Element at a multi-dimensional index.
    pub fn get(&self, index: &[usize]) -> Result<f64> {
        if index.len() != self.shape.len() || index.iter().zip(&self.shape).any(|(i, d)| i >= d) {
            return Err(Error::msg(format!(
                "index {:?} out of bounds for shape {:?}",
                index, self.shape
            )));
        }
        let mut flat = 0;
        for (i, d) in index.iter().zip(&self.shape) {
            flat = flat * d + i;
        }
        Ok(self.data[flat])
    }

    /// Largest elementwise absolute difference; infinite if shapes differ.
    pub fn max_abs_diff(&self, other: &HostTensor) -> f64 {
        if self.shape != other.shape {
            return f64::INFINITY;
        }
        self.data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }
}

impl fmt::Debug for HostTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostTensor({:?}, {}, {:?})", self.shape, self.dtype, self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_checks_len() {
        assert!(HostTensor::new(vec![2, 3], vec![0.0; 6]).is_ok());
        let err = HostTensor::new(vec![2, 3], vec![0.0; 5]).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn test_from_slice_keeps_dtype() {
        let t = HostTensor::from_slice(&[1.5f32, -2.0, 0.25, 4.0], &[2, 2]).unwrap();
        assert_eq!(t.dtype(), DType::F32);
        assert_eq!(t.shape(), &[2, 2]);
        assert_eq!(t.data(), &[1.5, -2.0, 0.25, 4.0]);
        assert!(HostTensor::from_slice(&[1i64, 2, 3], &[2]).is_err());
    }

    #[test]
    fn test_get_row_major() {
        let t = HostTensor::new(vec![2, 3], (0..6).map(|v| v as f64).collect()).unwrap();
        assert_eq!(t.get(&[1, 2]).unwrap(), 5.0);
        assert_eq!(t.get(&[0, 1]).unwrap(), 1.0);
        assert!(t.get(&[2, 0]).is_err());
    }

    #[test]
    fn test_from_slice_sets_dtype() {
        let t = HostTensor::from_slice(&[1.0f32, 2.0], &[2]).unwrap();
        assert_eq!(t.dtype(), DType::F32);
        assert_eq!(t.to_vec::<f32>(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_scalar() {
        assert_eq!(HostTensor::scalar(8.0).to_scalar().unwrap(), 8.0);
        assert!(HostTensor::zeros(&[2]).to_scalar().is_err());
    }
}
