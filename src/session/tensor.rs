use ndarray::{Array2, ArrayD, ArrayView2, Ix2, IxDyn};

use crate::{PolicyErr, Result};

/// A value held or produced by a session.
#[derive(Debug, Clone, PartialEq)]
pub enum Tensor {
    F32(ArrayD<f32>),
    I64(ArrayD<i64>),
}

impl Tensor {
    /// Creates a rank 0 integer tensor.
    pub fn scalar_i64(value: i64) -> Self {
        Tensor::I64(ArrayD::from_elem(IxDyn(&[]), value))
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Tensor::F32(a) => a.shape(),
            Tensor::I64(a) => a.shape(),
        }
    }

    /// Returns the inner float array.
    ///
    /// # Arguments
    /// * `name` - The name of the tensor, used in the error.
    pub fn as_f32(&self, name: &str) -> Result<&ArrayD<f32>> {
        match self {
            Tensor::F32(a) => Ok(a),
            Tensor::I64(_) => Err(type_err(name, "f32")),
        }
    }

    pub fn as_f32_mut(&mut self, name: &str) -> Result<&mut ArrayD<f32>> {
        match self {
            Tensor::F32(a) => Ok(a),
            Tensor::I64(_) => Err(type_err(name, "f32")),
        }
    }

    pub fn as_i64(&self, name: &str) -> Result<&ArrayD<i64>> {
        match self {
            Tensor::I64(a) => Ok(a),
            Tensor::F32(_) => Err(type_err(name, "i64")),
        }
    }

    pub fn as_i64_mut(&mut self, name: &str) -> Result<&mut ArrayD<i64>> {
        match self {
            Tensor::I64(a) => Ok(a),
            Tensor::F32(_) => Err(type_err(name, "i64")),
        }
    }

    /// Views a float tensor as a matrix.
    ///
    /// # Returns
    /// An error if the tensor isn't a rank 2 float tensor.
    pub fn matrix(&self, name: &str) -> Result<ArrayView2<'_, f32>> {
        let a = self.as_f32(name)?;
        a.view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| PolicyErr::ShapeMismatch {
                what: "matrix rank",
                got: a.ndim(),
                expected: 2,
            })
    }

    /// Reads a single integer out of a tensor holding exactly one.
    pub fn to_scalar_i64(&self, name: &str) -> Result<i64> {
        let a = self.as_i64(name)?;
        match a.iter().next() {
            Some(v) if a.len() == 1 => Ok(*v),
            _ => Err(PolicyErr::ShapeMismatch {
                what: "scalar elements",
                got: a.len(),
                expected: 1,
            }),
        }
    }
}

impl From<Array2<f32>> for Tensor {
    fn from(value: Array2<f32>) -> Self {
        Tensor::F32(value.into_dyn())
    }
}

impl From<Array2<i64>> for Tensor {
    fn from(value: Array2<i64>) -> Self {
        Tensor::I64(value.into_dyn())
    }
}

impl From<f32> for Tensor {
    fn from(value: f32) -> Self {
        Tensor::F32(ArrayD::from_elem(IxDyn(&[]), value))
    }
}

fn type_err(name: &str, expected: &'static str) -> PolicyErr {
    PolicyErr::TensorType {
        name: name.to_string(),
        expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn typed_access() {
        let t = Tensor::from(array![[1.0_f32, 2.0], [3.0, 4.0]]);
        assert_eq!(t.shape(), &[2, 2]);
        assert_eq!(t.matrix("x").unwrap()[[1, 0]], 3.0);
        assert!(matches!(
            t.as_i64("x"),
            Err(PolicyErr::TensorType { expected: "i64", .. })
        ));
    }

    #[test]
    fn scalars() {
        let t = Tensor::scalar_i64(41);
        assert_eq!(t.to_scalar_i64("step").unwrap(), 41);
        assert!(t.shape().is_empty());

        let t = Tensor::from(array![[1_i64, 2]]);
        assert!(matches!(
            t.to_scalar_i64("step"),
            Err(PolicyErr::ShapeMismatch { got: 2, .. })
        ));

        let t = Tensor::from(0.5_f32);
        assert!(t.matrix("loss").is_err());
    }
}
