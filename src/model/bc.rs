use std::rc::Rc;

use log::debug;
use ndarray::{concatenate, prelude::*};
use rand::{rngs::StdRng, SeedableRng};

use super::{ActionOut, Adam, BcNetwork, Head, Model, Optimizer, StepCounter, Trace};
use crate::{
    brain::{BrainParameters, SpaceType},
    config::{Recurrence, TrainerParameters},
    session::{Feeds, OpHandle, RunCache, Session, Tensor, Variables},
    PolicyErr, Result,
};

/// The placeholders and parameters the graph's operations share.
struct Graph {
    net: BcNetwork,
    params: OpHandle,
    vector_in: Option<OpHandle>,
    visual_in: Vec<(OpHandle, usize)>,
    memory_in: Option<OpHandle>,
    expert_action: OpHandle,
    sequence_length: OpHandle,
    trace: RunCache<Trace>,
}

impl Graph {
    /// Concatenates every fed observation into one `[rows, input_size]` batch.
    fn observations(&self, feeds: &Feeds) -> Result<Array2<f32>> {
        let inputs: Vec<(&OpHandle, usize)> = self
            .vector_in
            .iter()
            .map(|h| (h, self.net.input_size() - self.visual_width()))
            .chain(self.visual_in.iter().map(|(h, w)| (h, *w)))
            .collect();

        let mut views = Vec::with_capacity(inputs.len());
        for (handle, width) in inputs {
            let view = feeds.get(handle)?.matrix(handle.name())?;
            if view.ncols() != width {
                return Err(PolicyErr::ShapeMismatch {
                    what: "observation width",
                    got: view.ncols(),
                    expected: width,
                });
            }
            views.push(view);
        }

        if views.is_empty() {
            return Err(PolicyErr::ShapeMismatch {
                what: "observation inputs",
                got: 0,
                expected: 1,
            });
        }

        concatenate(Axis(1), &views).map_err(|_| PolicyErr::ShapeMismatch {
            what: "observation rows",
            got: views.iter().map(|v| v.nrows()).min().unwrap_or(0),
            expected: views.iter().map(|v| v.nrows()).max().unwrap_or(0),
        })
    }

    fn visual_width(&self) -> usize {
        self.visual_in.iter().map(|(_, w)| w).sum()
    }

    fn memory<'f>(&self, feeds: &'f Feeds) -> Result<Option<ArrayView2<'f, f32>>> {
        self.memory_in
            .as_ref()
            .map(|h| feeds.get(h)?.matrix(h.name()))
            .transpose()
    }

    /// Runs a forward pass over the fed observations and memories, once per session run.
    fn infer(&self, vars: &Variables, feeds: &Feeds) -> Result<Rc<Trace>> {
        self.trace.get_or_try_insert_with(vars.run(), || {
            let params = vars.get(&self.params)?.as_f32(self.params.name())?;
            let params = params.as_slice().ok_or_else(|| self.layout_err())?;
            let x = self.observations(feeds)?;
            self.net.forward(params, x.view(), self.memory(feeds)?)
        })
    }

    /// Computes the loss over a fed batch of experience and, if asked, its gradient.
    ///
    /// Recurrent batches are split in sequences of `sequence_length` consecutive rows, each
    /// sequence starts from a zero memory.
    fn batch_loss(
        &self,
        params: &[f32],
        feeds: &Feeds,
        mut grad: Option<&mut [f32]>,
    ) -> Result<f32> {
        let x = self.observations(feeds)?;
        let expert = feeds
            .get(&self.expert_action)?
            .matrix(self.expert_action.name())?;

        let rows = x.nrows();
        if rows == 0 || expert.nrows() != rows {
            return Err(PolicyErr::ShapeMismatch {
                what: "batch rows",
                got: expert.nrows(),
                expected: rows.max(1),
            });
        }

        if self.memory_in.is_none() {
            let trace = self.net.forward(params, x.view(), None)?;
            let (loss, d) = self.net.loss(trace.logits().view(), expert, rows)?;
            if let Some(grad) = grad {
                self.net.backward(params, grad, &trace, d)?;
            }
            return Ok(loss);
        }

        let seq_len = feeds
            .get(&self.sequence_length)?
            .to_scalar_i64(self.sequence_length.name())?;
        let seq_len = usize::try_from(seq_len).unwrap_or(0);

        if seq_len == 0 || rows % seq_len != 0 {
            return Err(PolicyErr::ShapeMismatch {
                what: "batch rows per sequence",
                got: rows,
                expected: seq_len,
            });
        }

        let n_seq = rows / seq_len;
        let mut memory = Array2::zeros((n_seq, self.net.memory_size()));
        let mut total = 0.;

        for t in 0..seq_len {
            let idx: Vec<usize> = (0..n_seq).map(|s| s * seq_len + t).collect();
            let x_t = x.select(Axis(0), &idx);
            let expert_t = expert.select(Axis(0), &idx);

            let trace = self.net.forward(params, x_t.view(), Some(memory.view()))?;
            let (loss, d) = self.net.loss(trace.logits().view(), expert_t.view(), rows)?;
            total += loss;

            if let Some(grad) = grad.as_deref_mut() {
                self.net.backward(params, grad, &trace, d)?;
            }

            memory = trace
                .memory_out()
                .cloned()
                .ok_or_else(|| self.layout_err())?;
        }

        Ok(total)
    }

    fn layout_err(&self) -> PolicyErr {
        PolicyErr::TensorType {
            name: self.params.name().to_string(),
            expected: "contiguous f32",
        }
    }
}

/// The behavioral cloning model: a network trained to imitate an expert's actions, defined
/// inside a session under the policy's graph scope.
pub struct BcModel {
    step: StepCounter,
    vector_in: Option<OpHandle>,
    visual_in: Vec<OpHandle>,
    memory_in: Option<OpHandle>,
    expert_action: OpHandle,
    sequence_length: OpHandle,
    action: OpHandle,
    action_probs: Option<OpHandle>,
    memory_out: Option<OpHandle>,
    loss: OpHandle,
    update: OpHandle,
}

impl BcModel {
    /// Defines the model's variables and operations in a session.
    ///
    /// # Arguments
    /// * `sess` - The session the model lives in.
    /// * `brain` - The brain whose actions are imitated.
    /// * `trainer` - The trainer parameters holding the hyperparameters.
    /// * `recurrence` - The validated recurrent settings, `None` for a feed forward model.
    /// * `seed` - The seed for the parameter initialization and the action sampling.
    ///
    /// # Returns
    /// An error if any of the model's names is already defined in the session.
    pub fn new<S: Session + ?Sized>(
        sess: &mut S,
        brain: &BrainParameters,
        trainer: &TrainerParameters,
        recurrence: Option<Recurrence>,
        seed: u64,
    ) -> Result<Self> {
        let scope = trainer.graph_scope.as_str();
        let name = |n: &str| OpHandle::scoped(scope, n);

        let kind = match brain.vector_action_space_type {
            SpaceType::Continuous => Head::Continuous {
                size: brain.action_size(),
            },
            SpaceType::Discrete => Head::Discrete {
                branches: brain.vector_action_space_size.clone(),
            },
        };

        let mut nodes = vec![
            "global_step",
            "increment_step",
            "params",
            "action",
            "policy_loss",
            "update_batch",
        ];
        if matches!(kind, Head::Discrete { .. }) {
            nodes.push("action_probs");
        }
        if recurrence.is_some() {
            nodes.push("recurrent_out");
        }

        // nothing is defined unless every name is free
        if let Some(taken) = nodes.into_iter().map(name).find(|h| sess.contains(h)) {
            return Err(PolicyErr::DuplicateNode {
                name: taken.name().to_string(),
            });
        }

        let vector_size = brain.vector_observation_size();
        let visual_sizes: Vec<usize> = brain
            .camera_resolutions
            .iter()
            .map(|c| c.frame_size())
            .collect();
        let input_size = vector_size + visual_sizes.iter().sum::<usize>();

        let net = BcNetwork::new(
            input_size,
            trainer.hidden_units,
            trainer.num_layers,
            recurrence.map(|r| r.memory_size),
            kind,
        );

        let mut rng = StdRng::seed_from_u64(seed);
        let init = net.init_params(&mut rng)?;
        let n_params = init.len();

        debug!(
            "{scope}: behavioral cloning network with {input_size} inputs and {n_params} params"
        );

        let step = StepCounter::define(sess, scope)?;
        let params = sess.define_variable(
            name("params"),
            Tensor::F32(Array1::from(init).into_dyn()),
        )?;

        let vector_in = (vector_size > 0).then(|| name("vector_observation"));
        let visual_in: Vec<_> = visual_sizes
            .iter()
            .enumerate()
            .map(|(i, w)| (name(&format!("visual_observation_{i}")), *w))
            .collect();

        let graph = Rc::new(Graph {
            net,
            params: params.clone(),
            vector_in: vector_in.clone(),
            visual_in: visual_in.clone(),
            memory_in: recurrence.map(|_| name("recurrent_in")),
            expert_action: name("expert_action"),
            sequence_length: name("sequence_length"),
            trace: RunCache::default(),
        });

        let g = Rc::clone(&graph);
        let act = move |vars: &mut Variables, feeds: &Feeds| -> Result<Tensor> {
            let trace = g.infer(vars, feeds)?;
            Ok(match g.net.act(trace.logits().view(), &mut rng) {
                ActionOut::Continuous(a) => a.into(),
                ActionOut::Discrete(a) => a.into(),
            })
        };
        let action = sess.define_op(name("action"), Box::new(act))?;

        let action_probs = match graph.net.kind() {
            Head::Discrete { .. } => {
                let g = Rc::clone(&graph);
                let probs = move |vars: &mut Variables, feeds: &Feeds| -> Result<Tensor> {
                    let trace = g.infer(vars, feeds)?;
                    Ok(g.net.probs(trace.logits().view()).into())
                };
                Some(sess.define_op(name("action_probs"), Box::new(probs))?)
            }
            Head::Continuous { .. } => None,
        };

        let memory_out = match recurrence {
            Some(_) => {
                let g = Rc::clone(&graph);
                let out = move |vars: &mut Variables, feeds: &Feeds| -> Result<Tensor> {
                    let trace = g.infer(vars, feeds)?;
                    let memory = trace.memory_out().cloned().ok_or_else(|| g.layout_err())?;
                    Ok(memory.into())
                };
                Some(sess.define_op(name("recurrent_out"), Box::new(out))?)
            }
            None => None,
        };

        let g = Rc::clone(&graph);
        let loss = move |vars: &mut Variables, feeds: &Feeds| -> Result<Tensor> {
            let params = vars.get(&g.params)?.as_f32(g.params.name())?;
            let params = params.as_slice().ok_or_else(|| g.layout_err())?;
            Ok(g.batch_loss(params, feeds, None)?.into())
        };
        let loss = sess.define_op(name("policy_loss"), Box::new(loss))?;

        let g = Rc::clone(&graph);
        let mut optimizer = Adam::with_learning_rate(n_params, trainer.learning_rate);
        let update = move |vars: &mut Variables, feeds: &Feeds| -> Result<Tensor> {
            let params = vars.get_mut(&g.params)?.as_f32_mut(g.params.name())?;
            let params = params.as_slice_mut().ok_or_else(|| g.layout_err())?;

            let mut grad = vec![0.; params.len()];
            let loss = g.batch_loss(params, feeds, Some(grad.as_mut_slice()))?;
            optimizer.update_params(&grad, params)?;
            g.trace.clear();
            Ok(loss.into())
        };
        let update = sess.define_op(name("update_batch"), Box::new(update))?;

        Ok(Self {
            step,
            vector_in,
            visual_in: visual_in.into_iter().map(|(h, _)| h).collect(),
            memory_in: graph.memory_in.clone(),
            expert_action: graph.expert_action.clone(),
            sequence_length: graph.sequence_length.clone(),
            action,
            action_probs,
            memory_out,
            loss,
            update,
        })
    }

    /// The vector observation placeholder, absent when the brain has no vector observations.
    pub fn vector_in(&self) -> Option<&OpHandle> {
        self.vector_in.as_ref()
    }

    /// One flattened `[rows, height * width * channels]` placeholder per camera.
    pub fn visual_in(&self) -> &[OpHandle] {
        &self.visual_in
    }

    pub fn memory_in(&self) -> Option<&OpHandle> {
        self.memory_in.as_ref()
    }

    pub fn expert_action(&self) -> &OpHandle {
        &self.expert_action
    }

    pub fn sequence_length(&self) -> &OpHandle {
        &self.sequence_length
    }

    pub fn action(&self) -> &OpHandle {
        &self.action
    }

    pub fn action_probs(&self) -> Option<&OpHandle> {
        self.action_probs.as_ref()
    }

    pub fn memory_out(&self) -> Option<&OpHandle> {
        self.memory_out.as_ref()
    }

    pub fn loss(&self) -> &OpHandle {
        &self.loss
    }

    pub fn update(&self) -> &OpHandle {
        &self.update
    }
}

impl Model for BcModel {
    fn global_step(&self) -> &OpHandle {
        self.step.global_step()
    }

    fn increment_step(&self) -> &OpHandle {
        self.step.increment_step()
    }
}
