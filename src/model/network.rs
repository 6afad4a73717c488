use ndarray::{concatenate, prelude::*};
use rand::Rng;

use super::{xavier_uniform, Activation, Dense, DenseCache};
use crate::{PolicyErr, Result};

/// The output layer of a behavioral cloning network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Head {
    /// One linear output per action dimension, clipped to `[-1, 1]`.
    Continuous { size: usize },
    /// One softmax per action branch.
    Discrete { branches: Vec<usize> },
}

impl Head {
    /// Returns the amount of logits the head needs.
    pub fn width(&self) -> usize {
        match self {
            Head::Continuous { size } => *size,
            Head::Discrete { branches } => branches.iter().sum(),
        }
    }
}

/// Everything a forward pass leaves behind.
#[derive(Debug, Clone)]
pub struct Trace {
    encoder: Vec<DenseCache>,
    recurrent: Option<DenseCache>,
    head: DenseCache,
    logits: Array2<f32>,
    memory_out: Option<Array2<f32>>,
}

impl Trace {
    pub fn logits(&self) -> &Array2<f32> {
        &self.logits
    }

    pub fn memory_out(&self) -> Option<&Array2<f32>> {
        self.memory_out.as_ref()
    }
}

/// The behavioral cloning network: a swish encoder, an optional tanh recurrent cell and a linear
/// head, all reading one flat parameter vector in that order.
#[derive(Debug, Clone)]
pub struct BcNetwork {
    input_size: usize,
    encoder: Vec<Dense>,
    recurrent: Option<Dense>,
    head: Dense,
    kind: Head,
}

impl BcNetwork {
    /// Creates a new `BcNetwork`.
    ///
    /// # Arguments
    /// * `input_size` - The width of an observation row.
    /// * `hidden_units` - The width of every encoder layer.
    /// * `num_layers` - The amount of encoder layers, zero feeds the observation straight on.
    /// * `memory_size` - The width of the recurrent cell, `None` for a feed forward network.
    /// * `kind` - The output layer.
    pub fn new(
        input_size: usize,
        hidden_units: usize,
        num_layers: usize,
        memory_size: Option<usize>,
        kind: Head,
    ) -> Self {
        let mut width = input_size;
        let encoder = (0..num_layers)
            .map(|_| {
                let layer = Dense::new((width, hidden_units), Some(Activation::Swish), true);
                width = hidden_units;
                layer
            })
            .collect();

        let recurrent = memory_size.map(|m| {
            let layer = Dense::new((width + m, m), Some(Activation::Tanh), true);
            width = m;
            layer
        });

        let head = Dense::new((width, kind.width()), None, false);

        Self {
            input_size,
            encoder,
            recurrent,
            head,
            kind,
        }
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn kind(&self) -> &Head {
        &self.kind
    }

    /// Returns the width of the recurrent memory, zero for a feed forward network.
    pub fn memory_size(&self) -> usize {
        self.recurrent.as_ref().map_or(0, |r| r.dim().1)
    }

    /// Returns the amount of parameters in the network.
    pub fn size(&self) -> usize {
        self.layers().map(Dense::size).sum()
    }

    fn layers(&self) -> impl Iterator<Item = &Dense> {
        self.encoder
            .iter()
            .chain(self.recurrent.as_ref())
            .chain(std::iter::once(&self.head))
    }

    /// Samples a fresh parameter vector: Xavier uniform weights and zero biases.
    pub fn init_params<R: Rng>(&self, rng: &mut R) -> Result<Vec<f32>> {
        let mut params = Vec::with_capacity(self.size());
        for layer in self.layers() {
            let (fan_in, fan_out) = layer.dim();
            params.extend(xavier_uniform(rng, fan_in, fan_out)?);
            params.resize(params.len() + layer.size() - fan_in * fan_out, 0.);
        }

        Ok(params)
    }

    fn chunks<'a>(&self, params: &'a [f32]) -> Result<Vec<&'a [f32]>> {
        self.check_len("network params", params.len())?;

        let mut rest = params;
        let mut chunks = Vec::new();
        for layer in self.layers() {
            let chunk;
            (chunk, rest) = rest.split_at(layer.size());
            chunks.push(chunk);
        }

        Ok(chunks)
    }

    fn chunks_mut<'a>(&self, grad: &'a mut [f32]) -> Result<Vec<&'a mut [f32]>> {
        self.check_len("network grad", grad.len())?;

        let mut rest = grad;
        let mut chunks = Vec::new();
        for layer in self.layers() {
            let chunk;
            (chunk, rest) = std::mem::take(&mut rest).split_at_mut(layer.size());
            chunks.push(chunk);
        }

        Ok(chunks)
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

    /// Makes a forward pass through the network.
    ///
    /// # Arguments
    /// * `params` - The network's parameters.
    /// * `x` - A `[rows, input_size]` batch of observations.
    /// * `memory` - The `[rows, memory_size]` memories, required iff the network is recurrent.
    pub fn forward(
        &self,
        params: &[f32],
        x: ArrayView2<f32>,
        memory: Option<ArrayView2<f32>>,
    ) -> Result<Trace> {
        let chunks = self.chunks(params)?;
        let mut chunks = chunks.into_iter();
        let mut next = || {
            chunks.next().ok_or(PolicyErr::ShapeMismatch {
                what: "network layers",
                got: 0,
                expected: 1,
            })
        };

        let mut h = x.to_owned();
        let mut encoder = Vec::with_capacity(self.encoder.len());
        for layer in &self.encoder {
            let (a, cache) = layer.forward(next()?, h.view())?;
            encoder.push(cache);
            h = a;
        }

        let (recurrent, memory_out) = match (&self.recurrent, memory) {
            (Some(layer), Some(memory)) => {
                if memory.nrows() != h.nrows() {
                    return Err(PolicyErr::ShapeMismatch {
                        what: "memory rows",
                        got: memory.nrows(),
                        expected: h.nrows(),
                    });
                }

                let input = concatenate(Axis(1), &[h.view(), memory]).map_err(|_| {
                    PolicyErr::ShapeMismatch {
                        what: "memory width",
                        got: memory.ncols(),
                        expected: self.memory_size(),
                    }
                })?;

                let (a, cache) = layer.forward(next()?, input.view())?;
                h = a.clone();
                (Some(cache), Some(a))
            }
            (Some(_), None) => {
                return Err(PolicyErr::ShapeMismatch {
                    what: "memory width",
                    got: 0,
                    expected: self.memory_size(),
                })
            }
            (None, _) => (None, None),
        };

        let (logits, head) = self.head.forward(next()?, h.view())?;

        Ok(Trace {
            encoder,
            recurrent,
            head,
            logits,
            memory_out,
        })
    }

    /// Accumulates the gradient of the loss into `grad`.
    ///
    /// The memory input is treated as a constant, so gradients stop at the recurrent cell's
    /// memory columns.
    ///
    /// # Arguments
    /// * `params` - The parameters used in the forward pass.
    /// * `grad` - The gradient buffer, same length as `params`.
    /// * `trace` - The trace of the forward pass.
    /// * `d_logits` - The derivative of the loss with respect to the logits.
    pub fn backward(
        &self,
        params: &[f32],
        grad: &mut [f32],
        trace: &Trace,
        d_logits: Array2<f32>,
    ) -> Result<()> {
        let params = self.chunks(params)?;
        let mut grads = self.chunks_mut(grad)?;
        let mut idx = params.len() - 1;

        let mut d = self
            .head
            .backward(params[idx], &mut *grads[idx], &trace.head, d_logits)?;

        if let (Some(layer), Some(cache)) = (&self.recurrent, &trace.recurrent) {
            idx -= 1;
            let d_input = layer.backward(params[idx], &mut *grads[idx], cache, d)?;
            let hidden = d_input.ncols() - self.memory_size();
            d = d_input.slice(s![.., ..hidden]).to_owned();
        }

        for (layer, cache) in self.encoder.iter().zip(&trace.encoder).rev() {
            idx -= 1;
            d = layer.backward(params[idx], &mut *grads[idx], cache, d)?;
        }

        Ok(())
    }

    /// Computes the loss of some logits against the expert's actions and its derivative.
    ///
    /// # Arguments
    /// * `logits` - The logits of a forward pass.
    /// * `expert` - The expert's actions: one column per action dimension when continuous, one
    ///   index column per branch when discrete.
    /// * `total_rows` - The amount of rows the whole update covers, discrete losses average over it.
    ///
    /// # Returns
    /// The loss contributed by these rows and its derivative with respect to `logits`.
    pub fn loss(
        &self,
        logits: ArrayView2<f32>,
        expert: ArrayView2<f32>,
        total_rows: usize,
    ) -> Result<(f32, Array2<f32>)> {
        if expert.nrows() != logits.nrows() {
            return Err(PolicyErr::ShapeMismatch {
                what: "expert action rows",
                got: expert.nrows(),
                expected: logits.nrows(),
            });
        }

        match &self.kind {
            Head::Continuous { size } => {
                check_cols("expert action width", expert.ncols(), *size)?;

                let action = clip(logits);
                let target = clip(expert);
                let diff = &action - &target;
                let loss = diff.mapv(|x| x.powi(2)).sum();

                let mut d = diff * 2.;
                d.zip_mut_with(&logits, |d, &l| {
                    if !(-1. ..=1.).contains(&l) {
                        *d = 0.;
                    }
                });

                Ok((loss, d))
            }
            Head::Discrete { branches } => {
                check_cols("expert action width", expert.ncols(), branches.len())?;

                let probs = self.probs(logits);
                let onehot = one_hot(expert, branches)?;
                let normalizer = (total_rows * self.kind.width()).max(1) as f32;

                let mut loss = 0.;
                ndarray::Zip::from(&probs)
                    .and(&onehot)
                    .for_each(|&p, &o| loss -= o * (p + 1e-10).ln());

                let d = (&probs - &onehot) / normalizer;
                Ok((loss / normalizer, d))
            }
        }
    }

    /// Turns logits into per branch probabilities. Continuous heads get their clipped actions.
    pub fn probs(&self, logits: ArrayView2<f32>) -> Array2<f32> {
        let Head::Discrete { branches } = &self.kind else {
            return clip(logits);
        };

        let mut probs = logits.to_owned();
        for mut row in probs.rows_mut() {
            let mut start = 0;
            for &size in branches {
                let mut branch = row.slice_mut(s![start..start + size]);
                let max = branch.fold(f32::NEG_INFINITY, |m, &x| m.max(x));
                branch.mapv_inplace(|x| (x - max).exp());
                let sum = branch.sum();
                branch.mapv_inplace(|x| x / sum);
                start += size;
            }
        }

        probs
    }

    /// Picks the actions for a batch of logits: clipped values when continuous, one sampled index
    /// per branch when discrete.
    pub fn act<R: Rng>(&self, logits: ArrayView2<f32>, rng: &mut R) -> ActionOut {
        let Head::Discrete { branches } = &self.kind else {
            return ActionOut::Continuous(clip(logits));
        };

        let probs = self.probs(logits);
        let mut actions = Array2::zeros((probs.nrows(), branches.len()));

        for (row, mut out) in probs.rows().into_iter().zip(actions.rows_mut()) {
            let mut start = 0;
            for (b, &size) in branches.iter().enumerate() {
                let branch = row.slice(s![start..start + size]);
                out[b] = sample_index(branch, rng.random::<f32>()) as i64;
                start += size;
            }
        }

        ActionOut::Discrete(actions)
    }
}

/// The actions picked by `BcNetwork::act`.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOut {
    Continuous(Array2<f32>),
    Discrete(Array2<i64>),
}

fn clip(x: ArrayView2<f32>) -> Array2<f32> {
    x.mapv(|v| v.clamp(-1., 1.))
}

fn check_cols(what: &'static str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(PolicyErr::ShapeMismatch {
            what,
            got,
            expected,
        });
    }

    Ok(())
}

fn one_hot(expert: ArrayView2<f32>, branches: &[usize]) -> Result<Array2<f32>> {
    let width: usize = branches.iter().sum();
    let mut onehot = Array2::zeros((expert.nrows(), width));

    for (row, mut out) in expert.rows().into_iter().zip(onehot.rows_mut()) {
        let mut start = 0;
        for (&action, &size) in row.iter().zip(branches) {
            if action < 0. || action as usize >= size {
                return Err(PolicyErr::ShapeMismatch {
                    what: "discrete action index",
                    got: action as usize,
                    expected: size,
                });
            }

            out[start + action as usize] = 1.;
            start += size;
        }
    }

    Ok(onehot)
}

/// Returns the index where the cumulative probability first exceeds `u`.
fn sample_index(probs: ArrayView1<f32>, u: f32) -> usize {
    let mut acc = 0.;
    for (i, p) in probs.iter().enumerate() {
        acc += p;
        if u < acc {
            return i;
        }
    }

    probs.len().saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn continuous(memory: Option<usize>) -> BcNetwork {
        BcNetwork::new(3, 8, 2, memory, Head::Continuous { size: 2 })
    }

    #[test]
    fn sizes_follow_the_layers() {
        let net = continuous(None);
        // encoder: (3 + 1) * 8 + (8 + 1) * 8, head: 8 * 2 without biases
        assert_eq!(net.size(), 32 + 72 + 16);
        assert_eq!(net.memory_size(), 0);

        let net = continuous(Some(4));
        // recurrent: (8 + 4 + 1) * 4, head: 4 * 2
        assert_eq!(net.size(), 32 + 72 + 52 + 8);
        assert_eq!(net.memory_size(), 4);

        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(net.init_params(&mut rng).unwrap().len(), net.size());
    }

    #[test]
    fn forward_shapes() {
        let net = continuous(Some(4));
        let mut rng = StdRng::seed_from_u64(0);
        let params = net.init_params(&mut rng).unwrap();

        let x = Array2::ones((5, 3));
        let m = Array2::zeros((5, 4));
        let trace = net.forward(&params, x.view(), Some(m.view())).unwrap();
        assert_eq!(trace.logits().dim(), (5, 2));
        assert_eq!(trace.memory_out().unwrap().dim(), (5, 4));

        assert!(net.forward(&params, x.view(), None).is_err());
        let m = Array2::zeros((5, 3));
        assert!(net.forward(&params, x.view(), Some(m.view())).is_err());
    }

    #[test]
    fn backward_matches_finite_differences() {
        let net = BcNetwork::new(2, 3, 1, Some(4), Head::Continuous { size: 1 });
        let mut rng = StdRng::seed_from_u64(7);
        let params: Vec<f32> = net
            .init_params(&mut rng)
            .unwrap()
            .into_iter()
            .map(|p| p * 0.5)
            .collect();

        let x = array![[0.2_f32, -0.4]];
        let m = array![[0.1_f32, 0.0, -0.3, 0.2]];
        let expert = array![[0.3_f32]];

        let loss_at = |p: &[f32]| {
            let trace = net.forward(p, x.view(), Some(m.view())).unwrap();
            net.loss(trace.logits().view(), expert.view(), 1).unwrap().0
        };

        let trace = net.forward(&params, x.view(), Some(m.view())).unwrap();
        let (_, d) = net.loss(trace.logits().view(), expert.view(), 1).unwrap();
        let mut grad = vec![0.; net.size()];
        net.backward(&params, &mut grad, &trace, d).unwrap();

        let h = 1e-2;
        for i in (0..params.len()).step_by(3) {
            let mut plus = params.clone();
            let mut minus = params.clone();
            plus[i] += h;
            minus[i] -= h;
            let numeric = (loss_at(&plus) - loss_at(&minus)) / (2. * h);
            assert!(
                (grad[i] - numeric).abs() < 1e-2,
                "param {i}: {} vs {numeric}",
                grad[i]
            );
        }
    }

    #[test]
    fn softmax_per_branch() {
        let net = BcNetwork::new(1, 2, 0, None, Head::Discrete { branches: vec![2, 3] });
        let logits = array![[0.0_f32, 0.0, 1.0, 1.0, 1.0]];
        let probs = net.probs(logits.view());

        assert!((probs[[0, 0]] - 0.5).abs() < 1e-6);
        assert!((probs[[0, 1]] - 0.5).abs() < 1e-6);
        for j in 2..5 {
            assert!((probs[[0, j]] - 1. / 3.).abs() < 1e-6);
        }
    }

    #[test]
    fn sampling_respects_branches() {
        let net = BcNetwork::new(1, 2, 0, None, Head::Discrete { branches: vec![2, 3] });
        // branch 0 almost surely picks 1, branch 1 almost surely picks 2
        let logits = array![[-50.0_f32, 50.0, -50.0, -50.0, 50.0], [50.0, -50.0, 50.0, -50.0, -50.0]];
        let mut rng = StdRng::seed_from_u64(3);

        let ActionOut::Discrete(actions) = net.act(logits.view(), &mut rng) else {
            panic!("expected discrete actions");
        };
        assert_eq!(actions, array![[1_i64, 2], [0, 0]]);
    }

    #[test]
    fn continuous_actions_are_clipped() {
        let net = continuous(None);
        let mut rng = StdRng::seed_from_u64(3);
        let out = net.act(array![[3.0_f32, -0.5]].view(), &mut rng);
        assert_eq!(out, ActionOut::Continuous(array![[1.0, -0.5]]));
    }

    #[test]
    fn discrete_loss_rejects_bad_indices() {
        let net = BcNetwork::new(1, 2, 0, None, Head::Discrete { branches: vec![2] });
        let logits = array![[0.0_f32, 0.0]];

        let (loss, d) = net.loss(logits.view(), array![[1.0_f32]].view(), 1).unwrap();
        assert!((loss - std::f32::consts::LN_2 / 2.).abs() < 1e-4);
        assert!((d[[0, 0]] - 0.25).abs() < 1e-6);
        assert!((d[[0, 1]] + 0.25).abs() < 1e-6);

        assert!(matches!(
            net.loss(logits.view(), array![[2.0_f32]].view(), 1),
            Err(PolicyErr::ShapeMismatch {
                what: "discrete action index",
                ..
            })
        ));
    }

    #[test]
    fn sample_index_uses_cumulative_probabilities() {
        let probs = array![0.2_f32, 0.5, 0.3];
        assert_eq!(sample_index(probs.view(), 0.1), 0);
        assert_eq!(sample_index(probs.view(), 0.6), 1);
        assert_eq!(sample_index(probs.view(), 0.95), 2);
        assert_eq!(sample_index(probs.view(), 1.0), 2);
    }
}
