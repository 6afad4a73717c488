mod activation;
mod bc;
mod dense;
mod network;
mod optimizer;

use rand::Rng;
use rand_distr::{Distribution, Uniform};

pub use activation::Activation;
pub use bc::BcModel;
pub use dense::{Dense, DenseCache};
pub use network::{ActionOut, BcNetwork, Head, Trace};
pub use optimizer::{Adam, Optimizer};

use crate::{
    session::{Feeds, OpHandle, Session, Tensor, Variables},
    PolicyErr, Result,
};

/// A trainable model living inside a session.
///
/// Policies reach the model's state only through the handles it exposes.
pub trait Model {
    /// The variable holding the amount of steps the model has been trained for.
    fn global_step(&self) -> &OpHandle;

    /// The operation that advances `global_step` by one.
    fn increment_step(&self) -> &OpHandle;
}

/// A monotonically increasing step counter held by a session.
#[derive(Debug, Clone)]
pub struct StepCounter {
    global_step: OpHandle,
    increment_step: OpHandle,
}

impl StepCounter {
    /// Defines `{scope}/global_step` and `{scope}/increment_step` in a session.
    ///
    /// # Returns
    /// An error if any of those names is already taken.
    pub fn define<S: Session + ?Sized>(sess: &mut S, scope: &str) -> Result<Self> {
        let global_step = sess.define_variable(
            OpHandle::scoped(scope, "global_step"),
            Tensor::scalar_i64(0),
        )?;

        let target = global_step.clone();
        let increment = move |vars: &mut Variables, _: &Feeds| -> Result<Tensor> {
            let step = vars.get_mut(&target)?.as_i64_mut(target.name())?;
            step.mapv_inplace(|s| s + 1);
            Ok(Tensor::I64(step.clone()))
        };

        let increment_step =
            sess.define_op(OpHandle::scoped(scope, "increment_step"), Box::new(increment))?;

        Ok(Self {
            global_step,
            increment_step,
        })
    }

    pub fn global_step(&self) -> &OpHandle {
        &self.global_step
    }

    pub fn increment_step(&self) -> &OpHandle {
        &self.increment_step
    }
}

/// Samples `fan_in * fan_out` weights using Xavier uniform initialization.
///
/// # Arguments
/// * `rng` - A random number generator.
/// * `fan_in` - The number of input units in the weight tensor.
/// * `fan_out` - The number of output units in the weight tensor.
///
/// # Returns
/// An error if the calculated range is invalid.
pub fn xavier_uniform<R: Rng>(rng: &mut R, fan_in: usize, fan_out: usize) -> Result<Vec<f32>> {
    let n = fan_in * fan_out;
    if n == 0 {
        return Ok(Vec::new());
    }

    let range = (6. / (fan_in + fan_out) as f32).sqrt();
    let distribution =
        Uniform::new(-range, range).map_err(|e| PolicyErr::InvalidParameter {
            key: "hidden_units",
            reason: e.to_string(),
        })?;

    Ok((0..n).map(|_| distribution.sample(rng)).collect())
}
