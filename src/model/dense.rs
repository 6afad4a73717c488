use ndarray::{linalg, prelude::*};

use super::Activation;
use crate::{PolicyErr, Result};

/// What a forward pass of a `Dense` layer leaves behind for its backward pass.
#[derive(Debug, Clone)]
pub struct DenseCache {
    x: Array2<f32>,
    z: Array2<f32>,
}

/// A fully connected layer. It doesn't own its parameters, it views a slice of the model's flat
/// parameter vector: the `(inputs, outputs)` weights in row major order followed by the biases.
#[derive(Debug, Clone)]
pub struct Dense {
    dim: (usize, usize),
    act_fn: Option<Activation>,
    use_bias: bool,
}

impl Dense {
    /// Creates a new `Dense` layer.
    ///
    /// # Arguments
    /// * `dim` - The amount of inputs and outputs.
    /// * `act_fn` - The activation applied to the weighted sums, `None` for a linear layer.
    /// * `use_bias` - Whether the layer has biases.
    pub fn new(dim: (usize, usize), act_fn: Option<Activation>, use_bias: bool) -> Self {
        Self {
            dim,
            act_fn,
            use_bias,
        }
    }

    /// Returns the amount of parameters this layer has.
    pub fn size(&self) -> usize {
        let biases = if self.use_bias { self.dim.1 } else { 0 };
        self.dim.0 * self.dim.1 + biases
    }

    pub fn dim(&self) -> (usize, usize) {
        self.dim
    }

    /// Computes the layer's output for a batch of rows.
    ///
    /// # Arguments
    /// * `params` - This layer's slice of parameters.
    /// * `x` - A `[rows, inputs]` batch.
    ///
    /// # Returns
    /// The `[rows, outputs]` activations and the cache for the backward pass.
    pub fn forward(&self, params: &[f32], x: ArrayView2<f32>) -> Result<(Array2<f32>, DenseCache)> {
        if x.ncols() != self.dim.0 {
            return Err(PolicyErr::ShapeMismatch {
                what: "dense layer inputs",
                got: x.ncols(),
                expected: self.dim.0,
            });
        }

        let (w, b) = self.view_params(params)?;
        let mut z = Array2::zeros((x.nrows(), self.dim.1));
        linalg::general_mat_mul(1.0, &x, &w, 0.0, &mut z);

        if let Some(b) = b {
            z += &b;
        }

        let a = match self.act_fn {
            Some(act_fn) => z.mapv(|z| act_fn.f(z)),
            None => z.clone(),
        };

        let cache = DenseCache { x: x.to_owned(), z };
        Ok((a, cache))
    }

    /// Propagates the error of the layer's output back to its input.
    ///
    /// The gradient is *accumulated* into `grad`, so many passes can add up before an update.
    ///
    /// # Arguments
    /// * `params` - This layer's slice of parameters.
    /// * `grad` - This layer's slice of the gradient.
    /// * `cache` - The cache produced by the matching forward pass.
    /// * `d` - The `[rows, outputs]` derivative of the loss with respect to the output.
    ///
    /// # Returns
    /// The `[rows, inputs]` derivative of the loss with respect to the input.
    pub fn backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        cache: &DenseCache,
        mut d: Array2<f32>,
    ) -> Result<Array2<f32>> {
        if let Some(act_fn) = self.act_fn {
            d.zip_mut_with(&cache.z, |d, &z| *d *= act_fn.df(z));
        }

        let (mut dw, db) = self.view_grad(grad)?;
        linalg::general_mat_mul(1.0, &cache.x.t(), &d, 1.0, &mut dw);

        if let Some(mut db) = db {
            db += &d.sum_axis(Axis(0));
        }

        let (w, _) = self.view_params(params)?;
        let mut d_prev = Array2::zeros((d.nrows(), self.dim.0));
        linalg::general_mat_mul(1.0, &d, &w.t(), 0.0, &mut d_prev);

        Ok(d_prev)
    }

    fn check_len(&self, what: &'static str, got: usize) -> Result<()> {
        if got != self.size() {
            return Err(PolicyErr::ShapeMismatch {
                what,
                got,
                expected: self.size(),
            });
        }

        Ok(())
    }

    fn view_params<'a>(
        &self,
        params: &'a [f32],
    ) -> Result<(ArrayView2<'a, f32>, Option<ArrayView1<'a, f32>>)> {
        self.check_len("dense layer params", params.len())?;

        let (w_raw, b_raw) = params.split_at(self.dim.0 * self.dim.1);
        let w = ArrayView2::from_shape(self.dim, w_raw).map_err(|_| self.shape_err())?;
        let b = self.use_bias.then(|| ArrayView1::from(b_raw));
        Ok((w, b))
    }

    fn view_grad<'a>(
        &self,
        grad: &'a mut [f32],
    ) -> Result<(ArrayViewMut2<'a, f32>, Option<ArrayViewMut1<'a, f32>>)> {
        self.check_len("dense layer grad", grad.len())?;

        let (dw_raw, db_raw) = grad.split_at_mut(self.dim.0 * self.dim.1);
        let dw = ArrayViewMut2::from_shape(self.dim, dw_raw).map_err(|_| self.shape_err())?;
        let db = self.use_bias.then(|| ArrayViewMut1::from(db_raw));
        Ok((dw, db))
    }

    fn shape_err(&self) -> PolicyErr {
        PolicyErr::ShapeMismatch {
            what: "dense layer weights",
            got: self.size(),
            expected: self.dim.0 * self.dim.1,
        }
    }
}
